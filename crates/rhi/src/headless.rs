//! CPU-only backend that simulates a GPU queue.
//!
//! Submissions are executed on a dedicated queue thread after an optional
//! latency, so fences really do signal asynchronously. The backend checks
//! the usage rules a validation layer would check (fence state on submit,
//! semaphore pairing, command lists re-recorded while pending, host writes
//! into buffers the queue is still reading) and exposes counters so tests
//! can assert on them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::{
    AcquireOutcome, Backend, BufferCopy, BufferDesc, BufferUsage, DrawIndexedIndirectCommand,
    Extent2D, MemoryStrategy, PipelineDesc, PresentOutcome,
};
use crate::vertex::Vertex;
use crate::{RhiError, RhiResult};

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Time the queue thread spends on each submission before signaling.
    pub gpu_latency: Duration,
    /// Images per swapchain.
    pub image_count: u32,
    /// Total bytes that may be allocated before `OutOfDeviceMemory`.
    pub memory_budget: Option<u64>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            gpu_latency: Duration::ZERO,
            image_count: 3,
            memory_budget: None,
        }
    }
}

/// Snapshot of the backend's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub live_buffers: usize,
    pub allocated_bytes: u64,
    pub live_swapchains: usize,
    pub live_image_views: usize,
    pub live_pipelines: usize,
    pub swapchain_recreations: u64,
    pub submissions: u64,
    pub presents: u64,
    pub draws_executed: u64,
    pub instances_drawn: u64,
    /// Host writes into a buffer referenced by unretired GPU work.
    pub host_write_hazards: u64,
    pub validation_errors: usize,
}

#[derive(Default)]
struct Counters {
    live_buffers: AtomicUsize,
    allocated_bytes: AtomicU64,
    live_swapchains: AtomicUsize,
    live_image_views: AtomicUsize,
    live_pipelines: AtomicUsize,
    recreations: AtomicU64,
    submissions: AtomicU64,
    presents: AtomicU64,
    draws: AtomicU64,
    instances: AtomicU64,
    hazards: AtomicU64,
}

#[derive(Default)]
struct Faults {
    acquire_out_of_date: u32,
    present: Option<(PresentOutcome, u32)>,
}

struct Shared {
    config: HeadlessConfig,
    counters: Counters,
    faults: Mutex<Faults>,
    surface_extent: Mutex<Option<Extent2D>>,
    stalled: Mutex<bool>,
    stall_cv: Condvar,
    in_flight: Mutex<u64>,
    idle_cv: Condvar,
    validation: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl Shared {
    fn validation_error(&self, message: String) {
        error!("[headless validation] {}", message);
        self.validation.lock().push(message);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn wait_while_stalled(&self) {
        let mut stalled = self.stalled.lock();
        self.stall_cv.wait_while(&mut stalled, |stalled| *stalled);
    }
}

struct BufferCell {
    id: u64,
    label: String,
    usage: BufferUsage,
    strategy: MemoryStrategy,
    size: u64,
    data: Mutex<Vec<u8>>,
    /// Unretired submissions referencing this buffer.
    gpu_refs: AtomicU32,
}

impl BufferCell {
    fn check_range(&self, offset: u64, len: u64) -> RhiResult<std::ops::Range<usize>> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.size)
            .ok_or_else(|| {
                RhiError::InvalidUsage(format!(
                    "range {}..{} out of bounds for buffer '{}' ({} bytes)",
                    offset,
                    offset.saturating_add(len),
                    self.label,
                    self.size
                ))
            })?;
        Ok(offset as usize..end as usize)
    }
}

pub struct HeadlessBuffer {
    cell: Arc<BufferCell>,
    shared: Arc<Shared>,
}

impl HeadlessBuffer {
    pub fn label(&self) -> &str {
        &self.cell.label
    }

    pub fn size(&self) -> u64 {
        self.cell.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.cell.usage
    }
}

impl Drop for HeadlessBuffer {
    fn drop(&mut self) {
        if self.cell.gpu_refs.load(Ordering::Acquire) > 0 {
            self.shared.validation_error(format!(
                "buffer '{}' destroyed while in use by the queue",
                self.cell.label
            ));
        }
        let counters = &self.shared.counters;
        counters.live_buffers.fetch_sub(1, Ordering::Relaxed);
        counters
            .allocated_bytes
            .fetch_sub(self.cell.size, Ordering::Relaxed);
    }
}

struct FenceState {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl FenceState {
    fn signal(&self) {
        *self.signaled.lock() = true;
        self.cv.notify_all();
    }
}

pub struct HeadlessFence {
    state: Arc<FenceState>,
}

pub struct HeadlessSemaphore {
    id: u64,
    signaled: AtomicBool,
}

impl HeadlessSemaphore {
    fn signal(&self, shared: &Shared) {
        if self.signaled.swap(true, Ordering::AcqRel) {
            shared.validation_error(format!("semaphore {} signaled twice", self.id));
        }
    }

    fn consume(&self, shared: &Shared) {
        if !self.signaled.swap(false, Ordering::AcqRel) {
            shared.validation_error(format!(
                "wait on semaphore {} that has no pending signal",
                self.id
            ));
        }
    }
}

pub struct HeadlessSwapchain {
    extent: Extent2D,
    image_count: u32,
    next_image: AtomicU32,
    generation: u64,
    shared: Arc<Shared>,
}

impl HeadlessSwapchain {
    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        let counters = &self.shared.counters;
        counters.live_swapchains.fetch_sub(1, Ordering::Relaxed);
        counters
            .live_image_views
            .fetch_sub(self.image_count as usize, Ordering::Relaxed);
    }
}

pub struct HeadlessPipeline {
    desc: PipelineDesc,
    generation: u64,
    shared: Arc<Shared>,
}

impl HeadlessPipeline {
    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }
}

impl Drop for HeadlessPipeline {
    fn drop(&mut self) {
        self.shared
            .counters
            .live_pipelines
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
enum Op {
    BindGeometry {
        vertices: Arc<BufferCell>,
        indices: Arc<BufferCell>,
    },
    BindPipeline {
        label: &'static str,
        instance_stride: u32,
        uniforms: Arc<BufferCell>,
        instances: Arc<BufferCell>,
    },
    DrawIndirectCount {
        commands: Arc<BufferCell>,
        command_offset: u64,
        counts: Arc<BufferCell>,
        count_offset: u64,
        max_draws: u32,
    },
}

impl Op {
    fn buffers(&self) -> Vec<&Arc<BufferCell>> {
        match self {
            Op::BindGeometry { vertices, indices } => vec![vertices, indices],
            Op::BindPipeline {
                uniforms,
                instances,
                ..
            } => vec![uniforms, instances],
            Op::DrawIndirectCount {
                commands, counts, ..
            } => vec![commands, counts],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Initial,
    Recording,
    Executable,
}

pub struct HeadlessCommandList {
    ops: Vec<Op>,
    state: ListState,
    generation: u64,
    pending: Arc<AtomicBool>,
}

impl HeadlessCommandList {
    /// Number of draw calls recorded in the current contents.
    pub fn recorded_draw_calls(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::DrawIndirectCount { .. }))
            .count()
    }

    fn record(&mut self, shared: &Shared, op: Op) {
        if self.state != ListState::Recording {
            shared.validation_error("command recorded outside begin/end".to_string());
            return;
        }
        self.ops.push(op);
    }
}

struct Submission {
    ops: Vec<Op>,
    buffers: Vec<Arc<BufferCell>>,
    fence: Arc<FenceState>,
    pending: Arc<AtomicBool>,
}

enum Job {
    Execute(Submission),
    Copy {
        src: Arc<BufferCell>,
        dst: Arc<BufferCell>,
        regions: Vec<BufferCopy>,
        done: Sender<()>,
    },
    Shutdown,
}

/// Backend that runs the frame pipeline without a GPU.
pub struct HeadlessBackend {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
    queue_thread: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> RhiResult<Self> {
        if config.image_count == 0 {
            return Err(RhiError::SwapchainError(
                "headless swapchain needs at least one image".into(),
            ));
        }
        let shared = Arc::new(Shared {
            config,
            counters: Counters::default(),
            faults: Mutex::new(Faults::default()),
            surface_extent: Mutex::new(None),
            stalled: Mutex::new(false),
            stall_cv: Condvar::new(),
            in_flight: Mutex::new(0),
            idle_cv: Condvar::new(),
            validation: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let (jobs, receiver) = crossbeam_channel::unbounded();
        let worker_shared = Arc::clone(&shared);
        let queue_thread = std::thread::Builder::new()
            .name("headless-queue".into())
            .spawn(move || run_queue(worker_shared, receiver))
            .map_err(|e| RhiError::DeviceLost(format!("failed to spawn queue thread: {e}")))?;

        info!("Headless backend created");
        Ok(Self {
            shared,
            jobs,
            queue_thread: Mutex::new(Some(queue_thread)),
        })
    }

    pub fn stats(&self) -> HeadlessStats {
        let c = &self.shared.counters;
        HeadlessStats {
            live_buffers: c.live_buffers.load(Ordering::Relaxed),
            allocated_bytes: c.allocated_bytes.load(Ordering::Relaxed),
            live_swapchains: c.live_swapchains.load(Ordering::Relaxed),
            live_image_views: c.live_image_views.load(Ordering::Relaxed),
            live_pipelines: c.live_pipelines.load(Ordering::Relaxed),
            swapchain_recreations: c.recreations.load(Ordering::Relaxed),
            submissions: c.submissions.load(Ordering::Relaxed),
            presents: c.presents.load(Ordering::Relaxed),
            draws_executed: c.draws.load(Ordering::Relaxed),
            instances_drawn: c.instances.load(Ordering::Relaxed),
            host_write_hazards: c.hazards.load(Ordering::Relaxed),
            validation_errors: self.shared.validation.lock().len(),
        }
    }

    pub fn validation_messages(&self) -> Vec<String> {
        self.shared.validation.lock().clone()
    }

    /// Make the next `count` acquires report an out-of-date swapchain.
    pub fn inject_acquire_out_of_date(&self, count: u32) {
        self.shared.faults.lock().acquire_out_of_date += count;
    }

    /// Make the next `count` presents report `outcome`.
    pub fn inject_present(&self, outcome: PresentOutcome, count: u32) {
        self.shared.faults.lock().present = Some((outcome, count));
    }

    /// Simulate a window resize. Swapchains of any other extent report
    /// out-of-date until recreated.
    pub fn set_surface_extent(&self, extent: Extent2D) {
        *self.shared.surface_extent.lock() = Some(extent);
    }

    /// Stop the queue from retiring work, as if the GPU hung.
    pub fn stall(&self) {
        *self.shared.stalled.lock() = true;
    }

    pub fn resume(&self) {
        *self.shared.stalled.lock() = false;
        self.shared.stall_cv.notify_all();
    }

    /// Read any buffer, including device-local ones, bypassing host visibility.
    pub fn debug_read(&self, buffer: &HeadlessBuffer) -> Vec<u8> {
        buffer.cell.data.lock().clone()
    }

    fn surface_mismatch(&self, extent: Extent2D) -> bool {
        matches!(*self.shared.surface_extent.lock(), Some(surface) if surface != extent)
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        self.resume();
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(handle) = self.queue_thread.lock().take()
            && handle.join().is_err()
        {
            error!("Headless queue thread panicked");
        }
        debug!("Headless backend destroyed");
    }
}

impl Backend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Fence = HeadlessFence;
    type Semaphore = HeadlessSemaphore;
    type Swapchain = HeadlessSwapchain;
    type Pipeline = HeadlessPipeline;
    type CommandList = HeadlessCommandList;

    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<HeadlessBuffer> {
        if desc.size == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "buffer '{}' has zero size",
                desc.label
            )));
        }
        let counters = &self.shared.counters;
        if let Some(budget) = self.shared.config.memory_budget {
            let allocated = counters.allocated_bytes.load(Ordering::Relaxed);
            if allocated.saturating_add(desc.size) > budget {
                return Err(RhiError::OutOfDeviceMemory {
                    label: desc.label.clone(),
                    size: desc.size,
                });
            }
        }
        counters.live_buffers.fetch_add(1, Ordering::Relaxed);
        counters
            .allocated_bytes
            .fetch_add(desc.size, Ordering::Relaxed);

        Ok(HeadlessBuffer {
            cell: Arc::new(BufferCell {
                id: self.shared.next_id(),
                label: desc.label.clone(),
                usage: desc.usage,
                strategy: desc.strategy,
                size: desc.size,
                data: Mutex::new(vec![0; desc.size as usize]),
                gpu_refs: AtomicU32::new(0),
            }),
            shared: Arc::clone(&self.shared),
        })
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let cell = &buffer.cell;
        if !cell.strategy.is_host_visible() {
            return Err(RhiError::InvalidUsage(format!(
                "buffer '{}' is not host visible",
                cell.label
            )));
        }
        let range = cell.check_range(offset, data.len() as u64)?;
        if cell.gpu_refs.load(Ordering::Acquire) > 0 {
            self.shared.counters.hazards.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Host write into '{}' while the queue still references it",
                cell.label
            );
        }
        cell.data.lock()[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        let cell = &buffer.cell;
        if !cell.strategy.is_host_visible() {
            return Err(RhiError::InvalidUsage(format!(
                "buffer '{}' is not host visible",
                cell.label
            )));
        }
        let range = cell.check_range(offset, len)?;
        Ok(cell.data.lock()[range].to_vec())
    }

    fn copy_buffer(
        &self,
        src: &HeadlessBuffer,
        dst: &HeadlessBuffer,
        regions: &[BufferCopy],
    ) -> RhiResult<()> {
        if !src.cell.usage.can_copy_to(dst.cell.usage) {
            return Err(RhiError::InvalidUsage(format!(
                "copy from {} buffer '{}' into {} buffer '{}'",
                src.cell.usage.name(),
                src.cell.label,
                dst.cell.usage.name(),
                dst.cell.label
            )));
        }
        for region in regions {
            src.cell.check_range(region.src_offset, region.size)?;
            dst.cell.check_range(region.dst_offset, region.size)?;
        }

        let (done, finished) = crossbeam_channel::bounded(1);
        self.jobs
            .send(Job::Copy {
                src: Arc::clone(&src.cell),
                dst: Arc::clone(&dst.cell),
                regions: regions.to_vec(),
                done,
            })
            .map_err(|_| RhiError::DeviceLost("queue thread stopped".into()))?;
        finished
            .recv()
            .map_err(|_| RhiError::DeviceLost("queue thread stopped during copy".into()))
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<HeadlessFence> {
        Ok(HeadlessFence {
            state: Arc::new(FenceState {
                signaled: Mutex::new(signaled),
                cv: Condvar::new(),
            }),
        })
    }

    fn wait_fence(&self, fence: &HeadlessFence, timeout: Duration) -> RhiResult<bool> {
        let mut signaled = fence.state.signaled.lock();
        if *signaled {
            return Ok(true);
        }
        fence
            .state
            .cv
            .wait_while_for(&mut signaled, |signaled| !*signaled, timeout);
        Ok(*signaled)
    }

    fn reset_fence(&self, fence: &HeadlessFence) -> RhiResult<()> {
        *fence.state.signaled.lock() = false;
        Ok(())
    }

    fn fence_signaled(&self, fence: &HeadlessFence) -> RhiResult<bool> {
        Ok(*fence.state.signaled.lock())
    }

    fn create_semaphore(&self) -> RhiResult<HeadlessSemaphore> {
        Ok(HeadlessSemaphore {
            id: self.shared.next_id(),
            signaled: AtomicBool::new(false),
        })
    }

    fn create_swapchain(&self, extent: Extent2D) -> RhiResult<HeadlessSwapchain> {
        if extent.is_zero() {
            return Err(RhiError::SwapchainError(
                "cannot create a zero-sized swapchain".into(),
            ));
        }
        let image_count = self.shared.config.image_count;
        let counters = &self.shared.counters;
        counters.live_swapchains.fetch_add(1, Ordering::Relaxed);
        counters
            .live_image_views
            .fetch_add(image_count as usize, Ordering::Relaxed);
        debug!(
            "Headless swapchain created: {}x{}, {} images",
            extent.width, extent.height, image_count
        );
        Ok(HeadlessSwapchain {
            extent,
            image_count,
            next_image: AtomicU32::new(0),
            generation: self.shared.next_id(),
            shared: Arc::clone(&self.shared),
        })
    }

    fn recreate_swapchain(
        &self,
        swapchain: &mut HeadlessSwapchain,
        extent: Extent2D,
    ) -> RhiResult<()> {
        if extent.is_zero() {
            return Err(RhiError::SwapchainError(
                "cannot recreate a zero-sized swapchain".into(),
            ));
        }
        if *self.shared.in_flight.lock() > 0 {
            self.shared
                .validation_error("swapchain recreated while submissions are in flight".into());
        }
        let counters = &self.shared.counters;
        let new_count = self.shared.config.image_count;
        // New views exist before the old ones are released, as with oldSwapchain.
        counters
            .live_image_views
            .fetch_add(new_count as usize, Ordering::Relaxed);
        counters
            .live_image_views
            .fetch_sub(swapchain.image_count as usize, Ordering::Relaxed);
        counters.recreations.fetch_add(1, Ordering::Relaxed);

        swapchain.extent = extent;
        swapchain.image_count = new_count;
        swapchain.next_image.store(0, Ordering::Relaxed);
        swapchain.generation = self.shared.next_id();
        debug!(
            "Headless swapchain recreated: {}x{}",
            extent.width, extent.height
        );
        Ok(())
    }

    fn swapchain_extent(&self, swapchain: &HeadlessSwapchain) -> Extent2D {
        swapchain.extent
    }

    fn swapchain_image_count(&self, swapchain: &HeadlessSwapchain) -> u32 {
        swapchain.image_count
    }

    fn acquire_image(
        &self,
        swapchain: &HeadlessSwapchain,
        signal: &HeadlessSemaphore,
    ) -> RhiResult<AcquireOutcome> {
        {
            let mut faults = self.shared.faults.lock();
            if faults.acquire_out_of_date > 0 {
                faults.acquire_out_of_date -= 1;
                return Ok(AcquireOutcome::OutOfDate);
            }
        }
        if self.surface_mismatch(swapchain.extent) {
            return Ok(AcquireOutcome::OutOfDate);
        }
        signal.signal(&self.shared);
        let image_index =
            swapchain.next_image.fetch_add(1, Ordering::Relaxed) % swapchain.image_count;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn present(
        &self,
        swapchain: &HeadlessSwapchain,
        image_index: u32,
        wait: &HeadlessSemaphore,
    ) -> RhiResult<PresentOutcome> {
        if image_index >= swapchain.image_count {
            return Err(RhiError::SwapchainError(format!(
                "present of image {} from a {}-image swapchain",
                image_index, swapchain.image_count
            )));
        }
        wait.consume(&self.shared);
        self.shared.counters.presents.fetch_add(1, Ordering::Relaxed);

        {
            let mut faults = self.shared.faults.lock();
            if let Some((outcome, remaining)) = faults.present.as_mut()
                && *remaining > 0
            {
                *remaining -= 1;
                return Ok(*outcome);
            }
        }
        if self.surface_mismatch(swapchain.extent) {
            return Ok(PresentOutcome::OutOfDate);
        }
        Ok(PresentOutcome::Presented)
    }

    fn create_pipeline(
        &self,
        desc: &PipelineDesc,
        swapchain: &HeadlessSwapchain,
    ) -> RhiResult<HeadlessPipeline> {
        if desc.instance_stride == 0 {
            return Err(RhiError::PipelineError(format!(
                "pipeline '{}' has zero instance stride",
                desc.label
            )));
        }
        self.shared
            .counters
            .live_pipelines
            .fetch_add(1, Ordering::Relaxed);
        Ok(HeadlessPipeline {
            desc: desc.clone(),
            generation: swapchain.generation,
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_command_list(&self) -> RhiResult<HeadlessCommandList> {
        Ok(HeadlessCommandList {
            ops: Vec::new(),
            state: ListState::Initial,
            generation: 0,
            pending: Arc::new(AtomicBool::new(false)),
        })
    }

    fn begin_frame_commands(
        &self,
        cmd: &mut HeadlessCommandList,
        swapchain: &HeadlessSwapchain,
        image_index: u32,
    ) -> RhiResult<()> {
        if cmd.pending.load(Ordering::Acquire) {
            self.shared
                .validation_error("command list reset while pending execution".into());
        }
        if image_index >= swapchain.image_count {
            return Err(RhiError::SwapchainError(format!(
                "image index {} out of range",
                image_index
            )));
        }
        cmd.ops.clear();
        cmd.state = ListState::Recording;
        cmd.generation = swapchain.generation;
        Ok(())
    }

    fn cmd_bind_geometry(
        &self,
        cmd: &mut HeadlessCommandList,
        vertices: &HeadlessBuffer,
        indices: &HeadlessBuffer,
    ) {
        cmd.record(
            &self.shared,
            Op::BindGeometry {
                vertices: Arc::clone(&vertices.cell),
                indices: Arc::clone(&indices.cell),
            },
        );
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: &mut HeadlessCommandList,
        pipeline: &HeadlessPipeline,
        uniforms: &HeadlessBuffer,
        instances: &HeadlessBuffer,
    ) {
        if pipeline.generation != cmd.generation {
            self.shared.validation_error(format!(
                "pipeline '{}' was built for a retired swapchain",
                pipeline.desc.label
            ));
        }
        cmd.record(
            &self.shared,
            Op::BindPipeline {
                label: pipeline.desc.label,
                instance_stride: pipeline.desc.instance_stride,
                uniforms: Arc::clone(&uniforms.cell),
                instances: Arc::clone(&instances.cell),
            },
        );
    }

    fn cmd_draw_indexed_indirect_count(
        &self,
        cmd: &mut HeadlessCommandList,
        commands: &HeadlessBuffer,
        command_offset: u64,
        counts: &HeadlessBuffer,
        count_offset: u64,
        max_draws: u32,
    ) {
        cmd.record(
            &self.shared,
            Op::DrawIndirectCount {
                commands: Arc::clone(&commands.cell),
                command_offset,
                counts: Arc::clone(&counts.cell),
                count_offset,
                max_draws,
            },
        );
    }

    fn end_frame_commands(
        &self,
        cmd: &mut HeadlessCommandList,
        swapchain: &HeadlessSwapchain,
        image_index: u32,
    ) -> RhiResult<()> {
        if cmd.state != ListState::Recording {
            return Err(RhiError::InvalidUsage(
                "end_frame_commands without begin_frame_commands".into(),
            ));
        }
        if cmd.generation != swapchain.generation || image_index >= swapchain.image_count {
            return Err(RhiError::SwapchainError(
                "command list ended against a different swapchain".into(),
            ));
        }
        cmd.state = ListState::Executable;
        Ok(())
    }

    fn submit(
        &self,
        cmd: &HeadlessCommandList,
        wait: &HeadlessSemaphore,
        signal: &HeadlessSemaphore,
        fence: &HeadlessFence,
    ) -> RhiResult<()> {
        if cmd.state != ListState::Executable {
            return Err(RhiError::InvalidUsage(
                "submitted a command list that is not executable".into(),
            ));
        }
        if *fence.state.signaled.lock() {
            self.shared
                .validation_error("submit with a fence that is already signaled".into());
        }
        wait.consume(&self.shared);
        signal.signal(&self.shared);

        let mut buffers: Vec<Arc<BufferCell>> = Vec::new();
        for op in &cmd.ops {
            for cell in op.buffers() {
                if !buffers.iter().any(|b| b.id == cell.id) {
                    buffers.push(Arc::clone(cell));
                }
            }
        }
        for cell in &buffers {
            cell.gpu_refs.fetch_add(1, Ordering::AcqRel);
        }
        cmd.pending.store(true, Ordering::Release);
        *self.shared.in_flight.lock() += 1;
        self.shared
            .counters
            .submissions
            .fetch_add(1, Ordering::Relaxed);

        let submission = Submission {
            ops: cmd.ops.clone(),
            buffers,
            fence: Arc::clone(&fence.state),
            pending: Arc::clone(&cmd.pending),
        };
        self.jobs
            .send(Job::Execute(submission))
            .map_err(|_| RhiError::DeviceLost("queue thread stopped".into()))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut in_flight = self.shared.in_flight.lock();
        self.shared
            .idle_cv
            .wait_while(&mut in_flight, |count| *count > 0);
        Ok(())
    }
}

fn run_queue(shared: Arc<Shared>, jobs: Receiver<Job>) {
    debug!("Headless queue thread started");
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Shutdown => break,
            Job::Copy {
                src,
                dst,
                regions,
                done,
            } => {
                shared.wait_while_stalled();
                for region in &regions {
                    let start = region.src_offset as usize;
                    let bytes = src.data.lock()[start..start + region.size as usize].to_vec();
                    let start = region.dst_offset as usize;
                    dst.data.lock()[start..start + bytes.len()].copy_from_slice(&bytes);
                }
                let _ = done.send(());
            }
            Job::Execute(submission) => {
                shared.wait_while_stalled();
                if !shared.config.gpu_latency.is_zero() {
                    std::thread::sleep(shared.config.gpu_latency);
                }
                execute(&shared, &submission.ops);
                for cell in &submission.buffers {
                    cell.gpu_refs.fetch_sub(1, Ordering::AcqRel);
                }
                submission.pending.store(false, Ordering::Release);
                submission.fence.signal();

                let mut in_flight = shared.in_flight.lock();
                *in_flight = in_flight.saturating_sub(1);
                shared.idle_cv.notify_all();
            }
        }
    }
    debug!("Headless queue thread stopped");
}

struct BoundPipeline<'a> {
    label: &'static str,
    instance_stride: u32,
    instances: &'a BufferCell,
}

/// Replay recorded commands, checking every indirect draw against the
/// buffers it reads.
fn execute(shared: &Shared, ops: &[Op]) {
    let mut geometry: Option<(&BufferCell, &BufferCell)> = None;
    let mut pipeline: Option<BoundPipeline<'_>> = None;

    for op in ops {
        match op {
            Op::BindGeometry { vertices, indices } => {
                geometry = Some((vertices.as_ref(), indices.as_ref()))
            }
            Op::BindPipeline {
                label,
                instance_stride,
                instances,
                ..
            } => {
                pipeline = Some(BoundPipeline {
                    label: *label,
                    instance_stride: *instance_stride,
                    instances: instances.as_ref(),
                })
            }
            Op::DrawIndirectCount {
                commands,
                command_offset,
                counts,
                count_offset,
                max_draws,
            } => {
                let (Some((vertices, indices)), Some(bound)) = (geometry, pipeline.as_ref()) else {
                    shared.validation_error("indirect draw without geometry or pipeline".into());
                    continue;
                };
                let count = {
                    let data = counts.data.lock();
                    let start = *count_offset as usize;
                    match data.get(start..start + 4) {
                        Some(bytes) => bytemuck::pod_read_unaligned::<u32>(bytes),
                        None => {
                            shared.validation_error(format!(
                                "draw count offset {} outside '{}'",
                                count_offset, counts.label
                            ));
                            continue;
                        }
                    }
                };
                let draws = count.min(*max_draws);
                let commands_data = commands.data.lock();
                let index_data = indices.data.lock();
                let vertex_count = vertices.size / Vertex::SIZE;
                let instance_capacity = bound.instances.size / u64::from(bound.instance_stride);

                for k in 0..u64::from(draws) {
                    let start = (*command_offset + k * DrawIndexedIndirectCommand::SIZE) as usize;
                    let Some(bytes) =
                        commands_data.get(start..start + DrawIndexedIndirectCommand::SIZE as usize)
                    else {
                        shared.validation_error(format!(
                            "indirect command {} read past '{}'",
                            k, commands.label
                        ));
                        break;
                    };
                    let draw: DrawIndexedIndirectCommand = bytemuck::pod_read_unaligned(bytes);
                    if let Err(message) =
                        check_draw(&draw, &index_data, vertex_count, instance_capacity)
                    {
                        shared.validation_error(format!("[{}] {}", bound.label, message));
                        continue;
                    }
                    shared.counters.draws.fetch_add(1, Ordering::Relaxed);
                    shared
                        .counters
                        .instances
                        .fetch_add(u64::from(draw.instance_count), Ordering::Relaxed);
                }
            }
        }
    }
}

fn check_draw(
    draw: &DrawIndexedIndirectCommand,
    index_data: &[u8],
    vertex_count: u64,
    instance_capacity: u64,
) -> Result<(), String> {
    let first = draw.first_index as usize * 4;
    let end = first + draw.index_count as usize * 4;
    let Some(indices) = index_data.get(first..end) else {
        return Err(format!(
            "indices {}..{} exceed index buffer",
            draw.first_index,
            draw.first_index + draw.index_count
        ));
    };
    for chunk in indices.chunks_exact(4) {
        let index = bytemuck::pod_read_unaligned::<u32>(chunk);
        let vertex = i64::from(index) + i64::from(draw.vertex_offset);
        if vertex < 0 || vertex as u64 >= vertex_count {
            return Err(format!(
                "vertex {} outside vertex buffer ({} vertices)",
                vertex, vertex_count
            ));
        }
    }
    let last_instance = u64::from(draw.first_instance) + u64::from(draw.instance_count);
    if last_instance > instance_capacity {
        return Err(format!(
            "instances {}..{} exceed instance buffer ({} records)",
            draw.first_instance, last_instance, instance_capacity
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HeadlessBackend {
        HeadlessBackend::new(HeadlessConfig::default()).unwrap()
    }

    fn host_buffer(backend: &HeadlessBackend, size: u64, usage: BufferUsage) -> HeadlessBuffer {
        backend
            .create_buffer(&BufferDesc::new(
                "test",
                size,
                usage,
                MemoryStrategy::CpuVisible,
            ))
            .unwrap()
    }

    #[test]
    fn fence_wait_times_out_when_unsignaled() {
        let backend = backend();
        let fence = backend.create_fence(false).unwrap();
        assert!(!backend.wait_fence(&fence, Duration::from_millis(5)).unwrap());
        let fence = backend.create_fence(true).unwrap();
        assert!(backend.wait_fence(&fence, Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn device_local_buffers_reject_host_writes() {
        let backend = backend();
        let buffer = backend
            .create_buffer(&BufferDesc::new(
                "gpu",
                16,
                BufferUsage::Vertex,
                MemoryStrategy::DeviceLocal,
            ))
            .unwrap();
        let err = backend.write_buffer(&buffer, 0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, RhiError::InvalidUsage(_)));
    }

    #[test]
    fn writes_are_bounds_checked() {
        let backend = backend();
        let buffer = host_buffer(&backend, 8, BufferUsage::Storage);
        assert!(backend.write_buffer(&buffer, 4, &[0; 4]).is_ok());
        assert!(backend.write_buffer(&buffer, 6, &[0; 4]).is_err());
    }

    #[test]
    fn copy_moves_bytes_between_buffers() {
        let backend = backend();
        let staging = backend
            .create_buffer(&BufferDesc::new(
                "staging",
                8,
                BufferUsage::Staging,
                MemoryStrategy::Staging,
            ))
            .unwrap();
        let dst = backend
            .create_buffer(&BufferDesc::new(
                "dst",
                16,
                BufferUsage::Vertex,
                MemoryStrategy::DeviceLocal,
            ))
            .unwrap();
        backend
            .write_buffer(&staging, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        backend
            .copy_buffer(
                &staging,
                &dst,
                &[BufferCopy {
                    src_offset: 0,
                    dst_offset: 8,
                    size: 8,
                }],
            )
            .unwrap();
        assert_eq!(&backend.debug_read(&dst)[8..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn memory_budget_reports_out_of_device_memory() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            memory_budget: Some(64),
            ..Default::default()
        })
        .unwrap();
        let _first = host_buffer(&backend, 48, BufferUsage::Storage);
        let Err(err) = backend.create_buffer(&BufferDesc::new(
            "too-big",
            32,
            BufferUsage::Storage,
            MemoryStrategy::CpuVisible,
        )) else {
            panic!("buffer over budget was created");
        };
        assert!(matches!(err, RhiError::OutOfDeviceMemory { size: 32, .. }));
    }

    #[test]
    fn buffer_drop_releases_accounting() {
        let backend = backend();
        {
            let _buffer = host_buffer(&backend, 100, BufferUsage::Uniform);
            assert_eq!(backend.stats().live_buffers, 1);
            assert_eq!(backend.stats().allocated_bytes, 100);
        }
        assert_eq!(backend.stats().live_buffers, 0);
        assert_eq!(backend.stats().allocated_bytes, 0);
    }

    #[test]
    fn injected_acquire_failure_is_consumed() {
        let backend = backend();
        let swapchain = backend.create_swapchain(Extent2D::new(64, 64)).unwrap();
        let semaphore = backend.create_semaphore().unwrap();
        backend.inject_acquire_out_of_date(1);
        assert_eq!(
            backend.acquire_image(&swapchain, &semaphore).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(matches!(
            backend.acquire_image(&swapchain, &semaphore).unwrap(),
            AcquireOutcome::Acquired { .. }
        ));
    }

    #[test]
    fn recreate_keeps_one_swapchain_alive() {
        let backend = backend();
        let mut swapchain = backend.create_swapchain(Extent2D::new(64, 64)).unwrap();
        backend
            .recreate_swapchain(&mut swapchain, Extent2D::new(32, 32))
            .unwrap();
        backend
            .recreate_swapchain(&mut swapchain, Extent2D::new(16, 16))
            .unwrap();
        let stats = backend.stats();
        assert_eq!(stats.live_swapchains, 1);
        assert_eq!(stats.live_image_views, 3);
        assert_eq!(stats.swapchain_recreations, 2);
        drop(swapchain);
        assert_eq!(backend.stats().live_image_views, 0);
    }

    #[test]
    fn submitting_with_signaled_fence_is_flagged() {
        let backend = backend();
        let swapchain = backend.create_swapchain(Extent2D::new(8, 8)).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let rendered = backend.create_semaphore().unwrap();
        let fence = backend.create_fence(true).unwrap();
        let mut cmd = backend.create_command_list().unwrap();

        backend.acquire_image(&swapchain, &acquired).unwrap();
        backend.begin_frame_commands(&mut cmd, &swapchain, 0).unwrap();
        backend.end_frame_commands(&mut cmd, &swapchain, 0).unwrap();
        backend.submit(&cmd, &acquired, &rendered, &fence).unwrap();
        backend.wait_idle().unwrap();

        assert_eq!(backend.stats().validation_errors, 1);
    }

    #[test]
    fn indirect_draw_is_executed_and_validated() {
        let backend = backend();
        let swapchain = backend.create_swapchain(Extent2D::new(8, 8)).unwrap();
        let vertices = host_buffer(&backend, Vertex::SIZE * 3, BufferUsage::Vertex);
        let indices = host_buffer(&backend, 12, BufferUsage::Index);
        let uniforms = host_buffer(&backend, 64, BufferUsage::Uniform);
        let instances = host_buffer(&backend, 64, BufferUsage::Storage);
        let commands = host_buffer(&backend, 20, BufferUsage::Indirect);
        let counts = host_buffer(&backend, 4, BufferUsage::Indirect);
        backend
            .write_buffer(&indices, 0, bytemuck::cast_slice(&[0u32, 1, 2]))
            .unwrap();
        let draw = DrawIndexedIndirectCommand {
            index_count: 3,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        };
        backend
            .write_buffer(&commands, 0, bytemuck::bytes_of(&draw))
            .unwrap();
        backend
            .write_buffer(&counts, 0, bytemuck::bytes_of(&1u32))
            .unwrap();

        let pipeline = backend
            .create_pipeline(
                &PipelineDesc {
                    label: "opaque",
                    cull: crate::backend::CullMode::Back,
                    depth_write: true,
                    depth_compare: crate::backend::DepthCompare::Less,
                    color_write: true,
                    alpha_blend: false,
                    instance_stride: 64,
                },
                &swapchain,
            )
            .unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let rendered = backend.create_semaphore().unwrap();
        let fence = backend.create_fence(false).unwrap();
        let mut cmd = backend.create_command_list().unwrap();

        backend.acquire_image(&swapchain, &acquired).unwrap();
        backend.begin_frame_commands(&mut cmd, &swapchain, 0).unwrap();
        backend.cmd_bind_geometry(&mut cmd, &vertices, &indices);
        backend.cmd_bind_pipeline(&mut cmd, &pipeline, &uniforms, &instances);
        backend.cmd_draw_indexed_indirect_count(&mut cmd, &commands, 0, &counts, 0, 1);
        backend.end_frame_commands(&mut cmd, &swapchain, 0).unwrap();
        backend.submit(&cmd, &acquired, &rendered, &fence).unwrap();
        assert!(backend.wait_fence(&fence, Duration::from_secs(5)).unwrap());

        let stats = backend.stats();
        assert_eq!(stats.draws_executed, 1);
        assert_eq!(stats.instances_drawn, 1);
        assert_eq!(stats.validation_errors, 0);
    }

    #[test]
    fn host_write_during_execution_counts_as_hazard() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            gpu_latency: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        let swapchain = backend.create_swapchain(Extent2D::new(8, 8)).unwrap();
        let vertices = host_buffer(&backend, Vertex::SIZE, BufferUsage::Vertex);
        let indices = host_buffer(&backend, 4, BufferUsage::Index);
        let acquired = backend.create_semaphore().unwrap();
        let rendered = backend.create_semaphore().unwrap();
        let fence = backend.create_fence(false).unwrap();
        let mut cmd = backend.create_command_list().unwrap();

        backend.acquire_image(&swapchain, &acquired).unwrap();
        backend.begin_frame_commands(&mut cmd, &swapchain, 0).unwrap();
        backend.cmd_bind_geometry(&mut cmd, &vertices, &indices);
        backend.end_frame_commands(&mut cmd, &swapchain, 0).unwrap();
        backend.submit(&cmd, &acquired, &rendered, &fence).unwrap();

        backend.write_buffer(&indices, 0, &[0; 4]).unwrap();
        backend.wait_idle().unwrap();
        assert_eq!(backend.stats().host_write_hazards, 1);

        backend.write_buffer(&indices, 0, &[0; 4]).unwrap();
        assert_eq!(backend.stats().host_write_hazards, 1);
    }
}
