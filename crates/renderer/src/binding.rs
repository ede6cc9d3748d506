//! Scene binding: which models live in the shared geometry buffers.
//!
//! Every bound model gets a contiguous range of the shared vertex buffer
//! and of the shared index buffer. Ranges are handed out from monotonic
//! cursors and are never reclaimed, so geometry in use by an in-flight
//! frame is never overwritten by a later bind.
//!
//! The bookkeeping lives in [`BindingRegistry`], which the draw compiler
//! reads under a shared lock while the render thread binds and unbinds
//! under the exclusive one.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Mat4;
use lumen_resources::{ModelData, ModelId, PassSet};
use lumen_rhi::{Backend, BufferUsage, MemoryStrategy, Vertex};
use lumen_scene::{Aabb, NodeId, TransformSource};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::allocator::{GpuBuffer, ResourceAllocator};
use crate::error::{RendererError, RendererResult};

const INDEX_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Identifies one bind of a model. Stale after the model is unbound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindHandle {
    index: u32,
    generation: u32,
}

/// Stable identity of one instance. Never reused, so a uid seen in an old
/// visibility snapshot cannot name an instance bound later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceUid(u32);

impl InstanceUid {
    /// The raw id, in bind order.
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub model: ModelId,
    pub node: Option<NodeId>,
    pub world: Mat4,
    pub visible: bool,
    pub material_index: u32,
}

/// One primitive of a bound model, addressed in shared-buffer space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveRef<'a> {
    pub model: ModelId,
    pub handle: BindHandle,
    /// Offset of the first index in the shared index buffer.
    pub first_index: u32,
    pub index_count: u32,
    /// Added to every index to reach the shared vertex buffer.
    pub vertex_offset: i32,
    pub passes: PassSet,
    pub material_index: u32,
    /// Object-space bounds of the vertices the primitive references.
    pub bounds: Option<Aabb>,
    pub instances: &'a [InstanceUid],
}

#[derive(Debug)]
struct BoundPrimitive {
    first_index: u32,
    index_count: u32,
    vertex_offset: i32,
    passes: PassSet,
    material_index: u32,
    bounds: Option<Aabb>,
    instances: Vec<InstanceUid>,
}

#[derive(Debug)]
struct BoundModel {
    id: ModelId,
    first_vertex: u32,
    vertex_count: u32,
    first_index: u32,
    index_count: u32,
    primitives: Vec<BoundPrimitive>,
}

#[derive(Debug, Default)]
struct ArenaEntry {
    generation: u32,
    model: Option<BoundModel>,
}

/// Where a model's geometry will be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub first_vertex: u32,
    pub first_index: u32,
}

/// Bound models and instances, in bind order.
#[derive(Debug)]
pub struct BindingRegistry {
    entries: Vec<ArenaEntry>,
    free: Vec<u32>,
    order: Vec<u32>,
    by_id: HashMap<ModelId, BindHandle>,
    /// Live instances only; unbinding removes them
    instances: HashMap<InstanceUid, InstanceRecord>,
    next_instance: u32,
    vertex_capacity: u32,
    index_capacity: u32,
    vertex_cursor: u32,
    index_cursor: u32,
}

impl BindingRegistry {
    pub fn new(vertex_capacity: u32, index_capacity: u32) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            by_id: HashMap::new(),
            instances: HashMap::new(),
            next_instance: 0,
            vertex_capacity,
            index_capacity,
            vertex_cursor: 0,
            index_cursor: 0,
        }
    }

    /// Check that `model` can be bound and return where its data goes.
    /// Nothing changes until [`commit`](Self::commit).
    ///
    /// # Errors
    ///
    /// - `InvalidModel` if a primitive references data the model lacks.
    /// - `AlreadyBound` if a model with the same id is bound.
    /// - `CapacityExceeded` if the vertices, indices or instance ids would
    ///   run past what is left.
    pub fn reserve(&self, model: &ModelData) -> RendererResult<Reservation> {
        model.validate()?;
        if self.by_id.contains_key(&model.id) {
            return Err(RendererError::AlreadyBound(model.id));
        }

        let vertex_end = u64::from(self.vertex_cursor) + u64::from(model.vertex_count());
        // vertex offsets are signed in indirect commands
        let vertex_limit = u64::from(self.vertex_capacity).min(i32::MAX as u64);
        if vertex_end > vertex_limit {
            return Err(RendererError::CapacityExceeded {
                what: "vertex buffer",
                requested: vertex_end,
                capacity: vertex_limit,
            });
        }
        let index_end = u64::from(self.index_cursor) + u64::from(model.index_count());
        if index_end > u64::from(self.index_capacity) {
            return Err(RendererError::CapacityExceeded {
                what: "index buffer",
                requested: index_end,
                capacity: u64::from(self.index_capacity),
            });
        }
        let uid_end = u64::from(self.next_instance) + model.instance_count() as u64;
        if uid_end > u64::from(u32::MAX) {
            return Err(RendererError::CapacityExceeded {
                what: "instance ids",
                requested: uid_end,
                capacity: u64::from(u32::MAX),
            });
        }

        Ok(Reservation {
            first_vertex: self.vertex_cursor,
            first_index: self.index_cursor,
        })
    }

    /// Register `model` at `reservation`, which must come from
    /// [`reserve`](Self::reserve) with no mutation in between.
    pub fn commit(&mut self, model: &ModelData, reservation: Reservation) -> BindHandle {
        let Reservation {
            first_vertex,
            first_index,
        } = reservation;
        debug_assert_eq!(first_vertex, self.vertex_cursor);
        debug_assert_eq!(first_index, self.index_cursor);

        let mut primitives = Vec::with_capacity(model.primitives.len());
        for prim in &model.primitives {
            let mut uids = Vec::with_capacity(prim.instances.len());
            for instance in &prim.instances {
                let uid = InstanceUid(self.next_instance);
                self.next_instance += 1;
                self.instances.insert(
                    uid,
                    InstanceRecord {
                        model: model.id,
                        node: instance.node,
                        world: instance.world,
                        visible: instance.visible,
                        material_index: prim.material.material_index,
                    },
                );
                uids.push(uid);
            }
            primitives.push(BoundPrimitive {
                first_index: first_index + prim.first_index,
                index_count: prim.index_count,
                vertex_offset: (first_vertex + prim.vertex_offset) as i32,
                passes: prim.material.passes(),
                material_index: prim.material.material_index,
                bounds: model.primitive_bounds(prim),
                instances: uids,
            });
        }

        let bound = BoundModel {
            id: model.id,
            first_vertex,
            vertex_count: model.vertex_count(),
            first_index,
            index_count: model.index_count(),
            primitives,
        };
        self.vertex_cursor += bound.vertex_count;
        self.index_cursor += bound.index_count;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(ArenaEntry::default());
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        entry.model = Some(bound);
        let handle = BindHandle {
            index,
            generation: entry.generation,
        };
        self.order.push(index);
        self.by_id.insert(model.id, handle);
        handle
    }

    /// Reserve and commit in one step, without touching any GPU buffer.
    pub fn insert(&mut self, model: &ModelData) -> RendererResult<BindHandle> {
        let reservation = self.reserve(model)?;
        Ok(self.commit(model, reservation))
    }

    /// Forget a bound model. Its buffer ranges stay allocated; its instance
    /// records are dropped and their uids are never handed out again.
    ///
    /// # Errors
    ///
    /// `NotBound` for a stale or foreign handle.
    pub fn remove(&mut self, handle: BindHandle) -> RendererResult<ModelId> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .ok_or(RendererError::NotBound(handle))?;
        let model = entry.model.take().ok_or(RendererError::NotBound(handle))?;
        entry.generation = entry.generation.wrapping_add(1);

        for prim in &model.primitives {
            for uid in &prim.instances {
                self.instances.remove(uid);
            }
        }
        self.order.retain(|&i| i != handle.index);
        self.by_id.remove(&model.id);
        self.free.push(handle.index);
        Ok(model.id)
    }

    /// Every bound primitive in bind order. Cheap to clone and restart.
    pub fn primitives(&self) -> impl Iterator<Item = PrimitiveRef<'_>> + Clone + '_ {
        self.order.iter().flat_map(move |&index| {
            let entry = &self.entries[index as usize];
            let handle = BindHandle {
                index,
                generation: entry.generation,
            };
            entry.model.iter().flat_map(move |model| {
                model.primitives.iter().map(move |prim| PrimitiveRef {
                    model: model.id,
                    handle,
                    first_index: prim.first_index,
                    index_count: prim.index_count,
                    vertex_offset: prim.vertex_offset,
                    passes: prim.passes,
                    material_index: prim.material_index,
                    bounds: prim.bounds,
                    instances: &prim.instances,
                })
            })
        })
    }

    /// The live record for `uid`, or `None` once its model is unbound.
    pub fn instance(&self, uid: InstanceUid) -> Option<&InstanceRecord> {
        self.instances.get(&uid)
    }

    /// Instances of one bound model, in primitive order.
    pub fn instances_of(&self, handle: BindHandle) -> RendererResult<Vec<InstanceUid>> {
        let model = self.model(handle)?;
        Ok(model
            .primitives
            .iter()
            .flat_map(|prim| prim.instances.iter().copied())
            .collect())
    }

    pub fn set_instance_transform(&mut self, uid: InstanceUid, world: Mat4) -> RendererResult<()> {
        self.instance_mut(uid)?.world = world;
        Ok(())
    }

    pub fn set_instance_visible(&mut self, uid: InstanceUid, visible: bool) -> RendererResult<()> {
        self.instance_mut(uid)?.visible = visible;
        Ok(())
    }

    /// Refresh the world matrix of every node-attached instance.
    /// Returns the number of instances updated.
    pub fn sync_transforms(&mut self, source: &dyn TransformSource) -> usize {
        let mut updated = 0;
        for record in self.instances.values_mut() {
            if let Some(world) = record.node.and_then(|node| source.world_transform(node)) {
                record.world = world;
                updated += 1;
            }
        }
        updated
    }

    pub fn handle_of(&self, id: ModelId) -> Option<BindHandle> {
        self.by_id.get(&id).copied()
    }

    pub fn bound_models(&self) -> usize {
        self.order.len()
    }

    /// Live instances across all bound models. Per-frame visibility work
    /// scales with this, not with how many instances were ever bound.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// The uid the next bound instance will get.
    pub fn next_instance_uid(&self) -> InstanceUid {
        InstanceUid(self.next_instance)
    }

    /// Next free vertex in the shared vertex buffer.
    pub fn vertex_cursor(&self) -> u32 {
        self.vertex_cursor
    }

    pub fn index_cursor(&self) -> u32 {
        self.index_cursor
    }

    /// Shared-buffer ranges of a bound model: `(first_vertex, vertex_count,
    /// first_index, index_count)`.
    pub fn ranges(&self, handle: BindHandle) -> RendererResult<(u32, u32, u32, u32)> {
        let model = self.model(handle)?;
        Ok((
            model.first_vertex,
            model.vertex_count,
            model.first_index,
            model.index_count,
        ))
    }

    fn model(&self, handle: BindHandle) -> RendererResult<&BoundModel> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.model.as_ref())
            .ok_or(RendererError::NotBound(handle))
    }

    fn instance_mut(&mut self, uid: InstanceUid) -> RendererResult<&mut InstanceRecord> {
        self.instances
            .get_mut(&uid)
            .ok_or_else(|| RendererError::InvalidUsage(format!("{:?} is not bound", uid)))
    }
}

/// Shared geometry buffers plus the registry describing their contents.
///
/// # Thread Safety
///
/// The registry sits behind a [`RwLock`]. The render thread takes the write
/// lock to bind, unbind and move instances; the draw compiler thread holds
/// the read lock for the length of one compile. A bind that lands during a
/// compile waits for it, so a compile always sees a consistent registry.
pub struct SceneBindingTable<B: Backend> {
    vertices: GpuBuffer<B>,
    indices: GpuBuffer<B>,
    registry: Arc<RwLock<BindingRegistry>>,
}

impl<B: Backend> SceneBindingTable<B> {
    /// Allocate device-local buffers for `vertex_capacity` vertices and
    /// `index_capacity` 32-bit indices.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if either buffer does not fit in device memory.
    pub fn new(
        allocator: &ResourceAllocator<B>,
        vertex_capacity: u32,
        index_capacity: u32,
    ) -> RendererResult<Self> {
        let vertices = allocator.allocate(
            "scene vertices",
            MemoryStrategy::DeviceLocal,
            BufferUsage::Vertex,
            u64::from(vertex_capacity) * Vertex::SIZE,
            None,
        )?;
        let indices = allocator.allocate(
            "scene indices",
            MemoryStrategy::DeviceLocal,
            BufferUsage::Index,
            u64::from(index_capacity) * INDEX_SIZE,
            None,
        )?;
        info!(
            "Scene binding table created: {} vertices, {} indices",
            vertex_capacity, index_capacity
        );
        Ok(Self {
            vertices,
            indices,
            registry: Arc::new(RwLock::new(BindingRegistry::new(
                vertex_capacity,
                index_capacity,
            ))),
        })
    }

    /// Upload `model` into the shared buffers and register its instances.
    ///
    /// The staging buffers used for the upload are released before this
    /// returns. On error the table is unchanged.
    ///
    /// # Errors
    ///
    /// Everything [`BindingRegistry::reserve`] rejects, plus
    /// `AllocationFailure` if a staging buffer cannot be created.
    pub fn bind(
        &self,
        allocator: &ResourceAllocator<B>,
        model: &ModelData,
    ) -> RendererResult<BindHandle> {
        let mut registry = self.registry.write();
        let reservation = registry.reserve(model)?;

        allocator.upload(
            &self.vertices,
            u64::from(reservation.first_vertex) * Vertex::SIZE,
            bytemuck::cast_slice(&model.vertices),
        )?;
        allocator.upload(
            &self.indices,
            u64::from(reservation.first_index) * INDEX_SIZE,
            bytemuck::cast_slice(&model.indices),
        )?;

        let handle = registry.commit(model, reservation);
        info!(
            "Model {:?} bound: {} vertices at {}, {} indices at {}, {} instances",
            model.id,
            model.vertex_count(),
            reservation.first_vertex,
            model.index_count(),
            reservation.first_index,
            model.instance_count()
        );
        Ok(handle)
    }

    /// Remove a bound model. See [`BindingRegistry::remove`].
    pub fn unbind(&self, handle: BindHandle) -> RendererResult<ModelId> {
        let id = self.registry.write().remove(handle)?;
        debug!("Model {:?} unbound", id);
        Ok(id)
    }

    /// Shared read access to the registry, e.g. to walk
    /// [`BindingRegistry::primitives`].
    pub fn read(&self) -> RwLockReadGuard<'_, BindingRegistry> {
        self.registry.read()
    }

    pub fn set_instance_transform(&self, uid: InstanceUid, world: Mat4) -> RendererResult<()> {
        self.registry.write().set_instance_transform(uid, world)
    }

    pub fn set_instance_visible(&self, uid: InstanceUid, visible: bool) -> RendererResult<()> {
        self.registry.write().set_instance_visible(uid, visible)
    }

    /// Refresh node-attached instances from `source`. Returns how many
    /// were updated.
    pub fn sync_transforms(&self, source: &dyn TransformSource) -> usize {
        self.registry.write().sync_transforms(source)
    }

    /// Next free vertex; only ever grows.
    pub fn vertex_cursor(&self) -> u32 {
        self.registry.read().vertex_cursor()
    }

    pub fn index_cursor(&self) -> u32 {
        self.registry.read().index_cursor()
    }

    pub fn bound_models(&self) -> usize {
        self.registry.read().bound_models()
    }

    /// Live instances across all bound models.
    pub fn instance_count(&self) -> usize {
        self.registry.read().instance_count()
    }

    /// The shared vertex buffer every pass binds.
    pub fn vertices(&self) -> &GpuBuffer<B> {
        &self.vertices
    }

    pub fn indices(&self) -> &GpuBuffer<B> {
        &self.indices
    }

    pub(crate) fn registry(&self) -> &Arc<RwLock<BindingRegistry>> {
        &self.registry
    }
}
