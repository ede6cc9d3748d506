//! CPU-side model data: vertex and index arrays plus primitives.

use glam::{Mat4, Vec2, Vec3};
use lumen_rhi::Vertex;
use lumen_scene::{Aabb, NodeId};

use crate::error::{ResourceError, ResourceResult};
use crate::material::Material;

/// Caller-assigned model identity. Binding the same id twice is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u64);

/// One placement of a primitive in the world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstanceDesc {
    /// Owning scene node. When set, the world matrix is refreshed from the
    /// scene graph every frame.
    pub node: Option<NodeId>,
    pub world: Mat4,
    pub visible: bool,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self::at(Mat4::IDENTITY)
    }
}

impl InstanceDesc {
    /// A free-standing instance with a fixed world matrix.
    pub fn at(world: Mat4) -> Self {
        Self {
            node: None,
            world,
            visible: true,
        }
    }

    /// An instance that follows `node`.
    pub fn attached(node: NodeId) -> Self {
        Self {
            node: Some(node),
            world: Mat4::IDENTITY,
            visible: true,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// A drawable range of a model with one material.
///
/// `first_index`/`index_count` address the model's index array and
/// `vertex_offset` is added to every index, so indices are relative to the
/// primitive's own vertices.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimitiveDesc {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub material: Material,
    pub instances: Vec<InstanceDesc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelData {
    pub id: ModelId,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub primitives: Vec<PrimitiveDesc>,
}

impl ModelData {
    pub fn new(id: ModelId, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            id,
            vertices,
            indices,
            primitives: Vec::new(),
        }
    }

    pub fn with_primitive(mut self, primitive: PrimitiveDesc) -> Self {
        self.primitives.push(primitive);
        self
    }

    /// Add one primitive covering every vertex and index.
    pub fn spanning(self, material: Material, instances: Vec<InstanceDesc>) -> Self {
        let primitive = PrimitiveDesc {
            first_index: 0,
            index_count: self.indices.len() as u32,
            vertex_offset: 0,
            vertex_count: self.vertices.len() as u32,
            material,
            instances,
        };
        self.with_primitive(primitive)
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn instance_count(&self) -> usize {
        self.primitives.iter().map(|p| p.instances.len()).sum()
    }

    /// Check that every primitive addresses valid vertex and index ranges.
    pub fn validate(&self) -> ResourceResult<()> {
        if self.vertices.is_empty() || self.indices.is_empty() || self.primitives.is_empty() {
            return Err(ResourceError::EmptyModel(self.id));
        }
        for (i, prim) in self.primitives.iter().enumerate() {
            let index_range = prim.first_index as usize
                ..prim.first_index as usize + prim.index_count as usize;
            if prim.index_count == 0 || index_range.end > self.indices.len() {
                return Err(ResourceError::PrimitiveRange {
                    model: self.id,
                    primitive: i,
                    what: "index",
                    start: index_range.start,
                    end: index_range.end,
                    len: self.indices.len(),
                });
            }
            let vertex_end = prim.vertex_offset as usize + prim.vertex_count as usize;
            if prim.vertex_count == 0 || vertex_end > self.vertices.len() {
                return Err(ResourceError::PrimitiveRange {
                    model: self.id,
                    primitive: i,
                    what: "vertex",
                    start: prim.vertex_offset as usize,
                    end: vertex_end,
                    len: self.vertices.len(),
                });
            }
            if let Some(&index) = self.indices[index_range]
                .iter()
                .find(|&&index| index >= prim.vertex_count)
            {
                return Err(ResourceError::IndexOutOfRange {
                    model: self.id,
                    primitive: i,
                    index,
                    vertex_count: prim.vertex_count,
                });
            }
        }
        Ok(())
    }

    /// Object-space bounds of the vertices a primitive references.
    pub fn primitive_bounds(&self, primitive: &PrimitiveDesc) -> Option<Aabb> {
        let start = primitive.vertex_offset as usize;
        let end = start + primitive.vertex_count as usize;
        Aabb::from_points(self.vertices.get(start..end)?.iter().map(|v| v.position))
    }

    /// Unit cube centered on the origin: 24 vertices, 36 indices.
    pub fn cube(id: ModelId, material: Material, instances: Vec<InstanceDesc>) -> Self {
        const FACES: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in FACES {
            let base = vertices.len() as u32;
            vertices.extend(face_vertices(normal * 0.5, u * 0.5, v * 0.5, normal));
            indices.extend([0, 1, 2, 2, 3, 0].map(|i| base + i));
        }
        Self::new(id, vertices, indices).spanning(material, instances)
    }

    /// Unit quad in the XY plane facing +Z: 4 vertices, 6 indices.
    pub fn quad(id: ModelId, material: Material, instances: Vec<InstanceDesc>) -> Self {
        let vertices = face_vertices(Vec3::ZERO, Vec3::X * 0.5, Vec3::Y * 0.5, Vec3::Z).to_vec();
        Self::new(id, vertices, vec![0, 1, 2, 2, 3, 0]).spanning(material, instances)
    }
}

/// Four corners of a face, counter-clockwise when viewed from `normal`.
fn face_vertices(center: Vec3, u: Vec3, v: Vec3, normal: Vec3) -> [Vertex; 4] {
    [
        Vertex::new(center - u - v, normal, Vec2::new(0.0, 1.0)),
        Vertex::new(center + u - v, normal, Vec2::new(1.0, 1.0)),
        Vertex::new(center + u + v, normal, Vec2::new(1.0, 0.0)),
        Vertex::new(center - u + v, normal, Vec2::new(0.0, 0.0)),
    ]
}
