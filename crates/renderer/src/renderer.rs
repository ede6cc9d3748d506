//! Frame scheduling and presentation.
//!
//! This module provides the [`Renderer`] that owns every frame-pipeline
//! resource and drives one frame per [`Renderer::draw_frame`] call.
//!
//! # Frame Flow
//!
//! ```text
//! 1. Wait on slot c's fence
//! 2. Acquire a swapchain image (out of date: recreate, skip the frame)
//! 3. Collect slot c's published draw compile
//! 4. Reset slot c's fence, write uniforms, record one indirect draw per pass
//! 5. Submit, then dispatch the compile for slot c + 1
//! 6. Present (suboptimal or out of date: recreate)
//! 7. Advance to slot c + 1
//! ```
//!
//! The draw compiler runs one frame ahead: while the GPU renders frame F,
//! the worker thread fills the buffers of the slot frame F + 1 will use.
//!
//! # Resource Destruction Order
//!
//! Fields are declared in the order they must be destroyed. `Drop` first
//! joins the compiler thread and waits for the device to go idle; the
//! allocation check runs last, after every buffer is gone.

use std::sync::Arc;
use std::time::Duration;

use lumen_core::RendererConfig;
use lumen_resources::{ModelData, ModelId, PASS_COUNT, Pass};
use lumen_rhi::{
    AcquireOutcome, Backend, CullMode, DepthCompare, Extent2D, PipelineDesc,
};
use glam::Mat4;
use lumen_scene::{Camera, TransformSource};
use tracing::{debug, error, info, trace, warn};

use crate::allocator::{AllocationTracker, ResourceAllocator};
use crate::binding::{BindHandle, InstanceUid, SceneBindingTable};
use crate::compiler::{CompileReport, IndirectDrawCompiler, SlotPhase};
use crate::error::{RendererError, RendererResult};
use crate::frame_slots::{FrameSlotTable, SlotCapacities};
use crate::ubo::{FrameUniforms, InstanceData};
use crate::visibility::{AllVisible, VisibilityProducer};

/// Where the scheduler is in the current frame.
///
/// Between frames the state is `AcquireImage`. A frame that fails part way
/// leaves the state where it failed, which is what the error log reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    AcquireImage,
    RecordCommands,
    Submit,
    Present,
    Recreating,
}

/// What [`Renderer::draw_frame`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Nothing was submitted: the surface is zero-sized or the swapchain had
    /// to be recreated before an image could be acquired.
    Skipped,
}

/// Counters kept across the renderer's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub swapchain_recreations: u64,
    /// Frames whose compile dropped draws or instances.
    pub truncated_frames: u64,
    pub last_compile: Option<CompileReport>,
}

/// Fixed-function state of each pass pipeline.
///
/// The depth prepass writes depth only. Opaque and double-sided passes test
/// with `LessOrEqual` so they pass against the prepass depth. The
/// transparent pass blends and leaves depth untouched.
pub fn pass_pipeline_desc(pass: Pass) -> PipelineDesc {
    let (cull, depth_write, depth_compare, color_write, alpha_blend) = match pass {
        Pass::DepthPrepass => (CullMode::Back, true, DepthCompare::Less, false, false),
        Pass::Opaque => (CullMode::Back, true, DepthCompare::LessOrEqual, true, false),
        Pass::DoubleSided => (CullMode::None, true, DepthCompare::LessOrEqual, true, false),
        Pass::Transparent => (CullMode::Back, false, DepthCompare::LessOrEqual, true, true),
    };
    PipelineDesc {
        label: pass.name(),
        cull,
        depth_write,
        depth_compare,
        color_write,
        alpha_blend,
        instance_stride: InstanceData::SIZE as u32,
    }
}

/// Reports leaked buffers once everything else has been dropped.
struct LeakCheck {
    tracker: AllocationTracker,
}

impl Drop for LeakCheck {
    fn drop(&mut self) {
        match self.tracker.assert_no_leaks() {
            Ok(()) => info!("Renderer destroyed"),
            Err(err) => error!("Renderer destroyed with leaks: {}", err),
        }
    }
}

/// Drives the frame pipeline on a [`Backend`].
///
/// The renderer owns the shared geometry buffers, one [`FrameSlotTable`]
/// entry per frame in flight, the swapchain, one pipeline per [`Pass`] and
/// the draw compiler thread. Everything is created in
/// [`with_visibility`](Self::with_visibility) and released in reverse order
/// on drop.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use lumen_core::RendererConfig;
/// use lumen_renderer::{FrameStatus, Renderer};
/// use lumen_resources::{InstanceDesc, Material, ModelData, ModelId};
/// use lumen_rhi::Extent2D;
/// use lumen_rhi::headless::{HeadlessBackend, HeadlessConfig};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default())?);
/// let config = RendererConfig::default();
/// let mut renderer = Renderer::new(backend, &config, Extent2D::new(1280, 720))?;
///
/// renderer.bind_model(&ModelData::cube(
///     ModelId(1),
///     Material::opaque(0),
///     vec![InstanceDesc::default()],
/// ))?;
///
/// loop {
///     match renderer.draw_frame()? {
///         FrameStatus::Presented => {}
///         // Minimized or swapchain recreated: try again next tick
///         FrameStatus::Skipped => {}
///     }
///     # break;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Renderer<B: Backend> {
    compiler: IndirectDrawCompiler,
    /// One per [`Pass`], indexed by [`Pass::index`].
    pipelines: Vec<B::Pipeline>,
    /// One per swapchain image.
    render_complete: Vec<B::Semaphore>,
    swapchain: B::Swapchain,
    slots: FrameSlotTable<B>,
    bindings: SceneBindingTable<B>,
    allocator: ResourceAllocator<B>,
    backend: Arc<B>,
    _leak_check: LeakCheck,

    camera: Camera,
    extent: Extent2D,
    pending_extent: Option<Extent2D>,
    needs_recreate: bool,
    fence_timeout: Duration,
    current_slot: usize,
    frame_index: u64,
    state: SchedulerState,
    stats: FrameStats,
}

impl<B: Backend> Renderer<B> {
    /// Create a renderer that draws every visible instance.
    ///
    /// Same as [`with_visibility`](Self::with_visibility) with
    /// [`AllVisible`].
    ///
    /// # Errors
    ///
    /// See [`with_visibility`](Self::with_visibility).
    pub fn new(backend: Arc<B>, config: &RendererConfig, extent: Extent2D) -> RendererResult<Self> {
        Self::with_visibility(backend, config, extent, Box::new(AllVisible))
    }

    /// Create a renderer whose draw compiler asks `producer` which
    /// instances each frame draws.
    ///
    /// # Errors
    ///
    /// - `Config` if `config` fails validation.
    /// - `InvalidUsage` for a zero-sized initial extent.
    /// - `AllocationFailure` if the shared or per-slot buffers do not fit.
    pub fn with_visibility(
        backend: Arc<B>,
        config: &RendererConfig,
        extent: Extent2D,
        producer: Box<dyn VisibilityProducer>,
    ) -> RendererResult<Self> {
        config.validate()?;
        if extent.is_zero() {
            return Err(RendererError::InvalidUsage(
                "renderer created with a zero-sized surface".into(),
            ));
        }
        info!(
            "Initializing renderer on {} backend ({}x{}, {} frames in flight)",
            backend.name(),
            extent.width,
            extent.height,
            config.frames_in_flight
        );

        let allocator = ResourceAllocator::new(Arc::clone(&backend));
        let leak_check = LeakCheck {
            tracker: allocator.tracker().clone(),
        };
        let capacities = SlotCapacities {
            max_draws: config.max_draws,
            max_instances: config.max_instances,
        };
        let bindings =
            SceneBindingTable::new(&allocator, config.vertex_capacity, config.index_capacity)?;
        let slots = FrameSlotTable::new(&allocator, config.frames_in_flight, capacities)?;

        let swapchain = backend.create_swapchain(extent)?;
        let extent = backend.swapchain_extent(&swapchain);
        let pipelines = create_pipelines(backend.as_ref(), &swapchain)?;
        let render_complete = create_render_complete(backend.as_ref(), &swapchain)?;

        let fence_timeout = config.fence_timeout();
        let compiler = IndirectDrawCompiler::spawn(
            Arc::clone(&backend),
            slots.iter().map(|slot| Arc::clone(slot.shared())).collect(),
            Arc::clone(bindings.registry()),
            producer,
            capacities,
            fence_timeout,
        )?;

        let mut camera = Camera::default();
        camera.set_aspect(extent.aspect());

        info!("Renderer initialized");
        Ok(Self {
            compiler,
            pipelines,
            render_complete,
            swapchain,
            slots,
            bindings,
            allocator,
            backend,
            _leak_check: leak_check,
            camera,
            extent,
            pending_extent: None,
            needs_recreate: false,
            fence_timeout,
            current_slot: 0,
            frame_index: 0,
            state: SchedulerState::AcquireImage,
            stats: FrameStats::default(),
        })
    }

    /// Upload a model into the shared geometry buffers.
    ///
    /// The model's vertices and indices go through a staging buffer into the
    /// next free range of the shared buffers; the staging buffer is released
    /// before this returns. The compile dispatched after the next submit
    /// picks the model up, so it is drawn no later than two frames from now.
    ///
    /// # Errors
    ///
    /// - `AlreadyBound` if a model with the same id is bound.
    /// - `CapacityExceeded` if the shared buffers have no room left. Nothing
    ///   is uploaded in that case.
    /// - `InvalidModel` if the model's primitives reference data it does
    ///   not have.
    /// - `AllocationFailure` if the staging buffer cannot be created.
    pub fn bind_model(&mut self, model: &ModelData) -> RendererResult<BindHandle> {
        self.bindings.bind(&self.allocator, model)
    }

    /// Remove a model and its instances from the scene.
    ///
    /// The model's buffer ranges are not reclaimed. Frames already compiled
    /// may still draw it; it is gone two frames from now.
    ///
    /// # Errors
    ///
    /// `NotBound` if `handle` is stale or was never returned by
    /// [`bind_model`](Self::bind_model).
    pub fn unbind_model(&mut self, handle: BindHandle) -> RendererResult<ModelId> {
        self.bindings.unbind(handle)
    }

    /// Instance ids of a bound model, in primitive order.
    ///
    /// # Errors
    ///
    /// `NotBound` for a stale handle.
    pub fn model_instances(&self, handle: BindHandle) -> RendererResult<Vec<InstanceUid>> {
        self.bindings.read().instances_of(handle)
    }

    /// Move one instance. Node-attached instances are overwritten again by
    /// the next [`sync_transforms`](Self::sync_transforms).
    ///
    /// # Errors
    ///
    /// `InvalidUsage` if the instance's model has been unbound.
    pub fn set_instance_transform(&mut self, uid: InstanceUid, world: Mat4) -> RendererResult<()> {
        self.bindings.set_instance_transform(uid, world)
    }

    /// Pull world matrices for node-attached instances from `source`.
    /// Returns how many instances were updated.
    pub fn sync_transforms(&mut self, source: &dyn TransformSource) -> usize {
        self.bindings.sync_transforms(source)
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Mutable camera access. The aspect ratio is managed by the renderer
    /// and reset on every swapchain recreation.
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Replace the camera, keeping the surface's aspect ratio.
    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
        self.camera.set_aspect(self.extent.aspect());
    }

    /// Handle a surface resize. Takes effect on the next frame; a zero size
    /// pauses rendering until a non-zero size arrives.
    pub fn resize(&mut self, width: u32, height: u32) {
        let extent = Extent2D::new(width, height);
        debug!(
            "Resize requested: {}x{} -> {}x{}",
            self.extent.width, self.extent.height, width, height
        );
        self.pending_extent = Some(extent);
    }

    /// Render and present one frame.
    ///
    /// Waits for the current slot to retire, acquires an image, records one
    /// indirect draw per pass from the slot's compiled buffers, submits and
    /// presents. The compile for the following slot is dispatched between
    /// submit and present.
    ///
    /// Returns [`FrameStatus::Skipped`] without touching the GPU while the
    /// surface is zero-sized. A compile that dropped draws still renders
    /// what fit; it shows up in [`FrameStats::truncated_frames`].
    ///
    /// # Errors
    ///
    /// `SubmissionTimeout` if a slot's fence or compile does not complete
    /// within the configured timeout; backend failures otherwise. An
    /// out-of-date swapchain is handled here and reported as
    /// [`FrameStatus::Skipped`].
    pub fn draw_frame(&mut self) -> RendererResult<FrameStatus> {
        if let Some(extent) = self.pending_extent.take()
            && extent != self.extent
        {
            self.extent = extent;
            self.needs_recreate = !extent.is_zero();
        }
        if self.extent.is_zero() {
            trace!("Surface is zero-sized, skipping frame");
            self.stats.frames_skipped += 1;
            return Ok(FrameStatus::Skipped);
        }
        if self.needs_recreate {
            debug!("Resize pending, recreating swapchain before acquire");
            self.recreate_swapchain()?;
        }

        let slot = self.current_slot;
        self.slots.wait(slot, self.fence_timeout)?;
        self.ensure_compile(slot)?;

        self.state = SchedulerState::AcquireImage;
        let acquired = self
            .backend
            .acquire_image(&self.swapchain, self.slots.slot(slot).image_acquired())?;
        let (image_index, suboptimal) = match acquired {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                debug!("Swapchain out of date, recreating");
                self.recreate_swapchain()?;
                self.state = SchedulerState::AcquireImage;
                self.stats.frames_skipped += 1;
                return Ok(FrameStatus::Skipped);
            }
        };

        let report = self.compiler.wait_published(slot, self.fence_timeout)?;
        if report.is_truncated() {
            self.stats.truncated_frames += 1;
        }

        // Reset only once this frame is certain to submit
        self.slots.reset(slot)?;

        self.state = SchedulerState::RecordCommands;
        let uniforms = FrameUniforms::new(&self.camera.matrices(), self.frame_index);
        self.allocator.write(
            self.slots.slot(slot).uniforms(),
            0,
            bytemuck::bytes_of(&uniforms),
        )?;
        self.record(slot, image_index, &report)?;

        self.state = SchedulerState::Submit;
        let frame_slot = self.slots.slot(slot);
        self.backend.submit(
            frame_slot.command_list(),
            frame_slot.image_acquired(),
            &self.render_complete[image_index as usize],
            frame_slot.fence(),
        )?;

        let next = (slot + 1) % self.slots.len();
        self.ensure_compile(next)?;

        self.state = SchedulerState::Present;
        let outcome = self.backend.present(
            &self.swapchain,
            image_index,
            &self.render_complete[image_index as usize],
        )?;

        self.current_slot = next;
        self.frame_index += 1;
        self.stats.frames_presented += 1;
        self.stats.last_compile = Some(report);

        if suboptimal || outcome.needs_recreate() {
            debug!(
                "Swapchain needs recreation (acquire suboptimal: {}, present: {:?})",
                suboptimal, outcome
            );
            self.recreate_swapchain()?;
        }
        self.state = SchedulerState::AcquireImage;
        Ok(FrameStatus::Presented)
    }

    /// Dispatch a compile for `slot` unless one is already in flight or
    /// published but not yet collected.
    fn ensure_compile(&self, slot: usize) -> RendererResult<()> {
        if self.compiler.phase(slot) == Some(SlotPhase::Idle) {
            self.compiler.dispatch(slot, self.camera.matrices())?;
        }
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32, report: &CompileReport) -> RendererResult<()> {
        let backend = self.backend.as_ref();
        let (cmd, uniforms, shared) = self.slots.slot_mut(slot).recording_parts();

        backend.begin_frame_commands(cmd, &self.swapchain, image_index)?;
        backend.cmd_bind_geometry(
            cmd,
            self.bindings.vertices().raw(),
            self.bindings.indices().raw(),
        );
        for pass in Pass::ALL {
            let range = report.pass_ranges[pass.index()];
            if range.count == 0 {
                continue;
            }
            backend.cmd_bind_pipeline(
                cmd,
                &self.pipelines[pass.index()],
                uniforms.raw(),
                shared.instances.raw(),
            );
            backend.cmd_draw_indexed_indirect_count(
                cmd,
                shared.draw_commands.raw(),
                range.byte_offset(),
                shared.draw_counts.raw(),
                (pass.index() * std::mem::size_of::<u32>()) as u64,
                range.count,
            );
        }
        backend.end_frame_commands(cmd, &self.swapchain, image_index)?;
        Ok(())
    }

    /// Rebuild the swapchain and everything tied to it.
    fn recreate_swapchain(&mut self) -> RendererResult<()> {
        self.state = SchedulerState::Recreating;
        self.backend.wait_idle()?;

        self.backend
            .recreate_swapchain(&mut self.swapchain, self.extent)?;
        self.extent = self.backend.swapchain_extent(&self.swapchain);
        self.pipelines = create_pipelines(self.backend.as_ref(), &self.swapchain)?;
        self.render_complete = create_render_complete(self.backend.as_ref(), &self.swapchain)?;
        self.camera.set_aspect(self.extent.aspect());

        self.needs_recreate = false;
        self.stats.swapchain_recreations += 1;
        info!(
            "Swapchain recreated: {}x{}",
            self.extent.width, self.extent.height
        );
        Ok(())
    }

    /// Frame counters and the most recent compile report.
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Frames presented so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Slot the next frame will use.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Where `slot`'s draw compile is. `None` for an out-of-range slot.
    pub fn compile_phase(&self, slot: usize) -> Option<SlotPhase> {
        self.compiler.phase(slot)
    }

    /// Current surface extent, including a pending resize once applied.
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn swapchain(&self) -> &B::Swapchain {
        &self.swapchain
    }

    pub fn bindings(&self) -> &SceneBindingTable<B> {
        &self.bindings
    }

    pub fn slots(&self) -> &FrameSlotTable<B> {
        &self.slots
    }

    pub fn allocator(&self) -> &ResourceAllocator<B> {
        &self.allocator
    }
}

impl<B: Backend> Drop for Renderer<B> {
    fn drop(&mut self) {
        // The worker writes slot buffers; it must be gone before they are
        self.compiler.shutdown();

        // Wait for all GPU work to complete before destroying resources
        if let Err(e) = self.backend.wait_idle() {
            error!("Failed to wait for device idle during renderer drop: {}", e);
        }
        if self.stats.truncated_frames > 0 {
            warn!(
                "{} of {} frames were truncated by draw or instance capacity",
                self.stats.truncated_frames, self.stats.frames_presented
            );
        }
    }
}

fn create_pipelines<B: Backend>(
    backend: &B,
    swapchain: &B::Swapchain,
) -> RendererResult<Vec<B::Pipeline>> {
    let pipelines = Pass::ALL
        .iter()
        .map(|&pass| backend.create_pipeline(&pass_pipeline_desc(pass), swapchain))
        .collect::<Result<Vec<_>, _>>()?;
    debug_assert_eq!(pipelines.len(), PASS_COUNT);
    debug!("Pass pipelines created");
    Ok(pipelines)
}

fn create_render_complete<B: Backend>(
    backend: &B,
    swapchain: &B::Swapchain,
) -> RendererResult<Vec<B::Semaphore>> {
    let count = backend.swapchain_image_count(swapchain);
    let semaphores = (0..count)
        .map(|_| backend.create_semaphore())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(semaphores)
}
