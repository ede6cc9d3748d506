//! Backend abstraction consumed by the frame pipeline.
//!
//! The renderer is written against [`Backend`] so the same frame scheduling
//! code drives the Vulkan backend in the application and the headless
//! backend in tests. Every associated resource type owns its API object and
//! releases it on drop.

use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::RhiResult;

/// What a buffer is used for. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
    Indirect,
    Staging,
}

impl BufferUsage {
    /// Whether a device copy from a buffer of this usage into `dst` is legal.
    ///
    /// Staging buffers feed every copy-destination usage. Geometry and
    /// storage buffers may be copied into a buffer of the same usage.
    pub fn can_copy_to(self, dst: BufferUsage) -> bool {
        use BufferUsage::*;
        matches!(
            (self, dst),
            (Staging, Vertex | Index | Storage)
                | (Vertex, Vertex)
                | (Index, Index)
                | (Storage, Storage)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Indirect => "indirect",
            BufferUsage::Staging => "staging",
        }
    }
}

/// Where a buffer's memory lives and how the host reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryStrategy {
    /// Host-visible, short-lived copy source.
    Staging,
    /// Host-visible and persistently mapped for its whole lifetime.
    CpuVisible,
    /// Device-local; only reachable through copies.
    DeviceLocal,
}

impl MemoryStrategy {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryStrategy::DeviceLocal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub strategy: MemoryStrategy,
}

impl BufferDesc {
    pub fn new(
        label: impl Into<String>,
        size: u64,
        usage: BufferUsage,
        strategy: MemoryStrategy,
    ) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            strategy,
        }
    }
}

/// One region of a buffer-to-buffer copy, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized surface.
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Result of asking the swapchain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and must be recreated.
    /// The semaphore passed to the acquire was not signaled.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_recreate(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthCompare {
    Less,
    LessOrEqual,
    Equal,
}

/// Fixed-function state for one render pass category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    pub label: &'static str,
    pub cull: CullMode,
    pub depth_write: bool,
    pub depth_compare: DepthCompare,
    /// Depth-only passes leave the color attachment untouched.
    pub color_write: bool,
    pub alpha_blend: bool,
    /// Byte stride of one record in the instance-data buffer.
    pub instance_stride: u32,
}

/// GPU layout of one indexed indirect draw.
///
/// Matches `VkDrawIndexedIndirectCommand`: five tightly packed 32-bit
/// fields, 20 bytes per record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

impl DrawIndexedIndirectCommand {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// A graphics device the frame pipeline can drive.
///
/// Command recording takes `&mut` command lists; everything else takes
/// `&self` so one backend can be shared between the render thread and the
/// draw compiler thread.
///
/// # Synchronization Contract
///
/// ```text
/// 1. Host writes to a slot's buffers only after wait_fence(slot fence)
/// 2. acquire_image signals the slot's image-acquired semaphore
/// 3. submit waits on it, signals the image's render-complete semaphore
///    and the slot fence once the GPU is done with the slot
/// 4. present waits on the render-complete semaphore
/// ```
///
/// Implementations may check this contract. The headless backend counts
/// every violation as a validation error.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use lumen_rhi::headless::{HeadlessBackend, HeadlessConfig};
/// use lumen_rhi::{Backend, BufferDesc, BufferUsage, MemoryStrategy};
///
/// # fn example() -> lumen_rhi::RhiResult<()> {
/// let backend = HeadlessBackend::new(HeadlessConfig::default())?;
/// let buffer = backend.create_buffer(&BufferDesc::new(
///     "uniforms",
///     256,
///     BufferUsage::Uniform,
///     MemoryStrategy::CpuVisible,
/// ))?;
///
/// let fence = backend.create_fence(true)?;
/// if backend.wait_fence(&fence, Duration::from_secs(1))? {
///     backend.write_buffer(&buffer, 0, &[0u8; 64])?;
/// }
/// # Ok(())
/// # }
/// ```
pub trait Backend: Send + Sync + 'static {
    type Buffer: Send + Sync + 'static;
    type Fence: Send + Sync + 'static;
    type Semaphore: Send + Sync + 'static;
    type Swapchain: Send + 'static;
    type Pipeline: Send + 'static;
    type CommandList: Send + 'static;

    /// Short name used in log lines, e.g. `"vulkan"`.
    fn name(&self) -> &'static str;

    // Buffers

    /// Creates a buffer and backs it with memory per `desc.strategy`.
    ///
    /// Host-visible strategies map the memory once; the mapping lives as
    /// long as the buffer.
    ///
    /// # Errors
    ///
    /// - `OutOfDeviceMemory` if no heap can hold `desc.size` bytes.
    /// - `InvalidUsage` for a zero-sized buffer.
    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Self::Buffer>;

    /// Write host data into a host-visible buffer.
    ///
    /// The caller must know the GPU is not reading the range, normally by
    /// having waited on the fence of the last submission that used it.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` if the buffer is device-local or the range falls
    /// outside it.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;

    /// Read back a host-visible buffer.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` if the buffer is device-local or the range falls
    /// outside it.
    fn read_buffer(&self, buffer: &Self::Buffer, offset: u64, len: u64) -> RhiResult<Vec<u8>>;

    /// Device copy between buffers. Blocks until the copy has completed.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` if `src` cannot feed `dst` (see
    /// [`BufferUsage::can_copy_to`]) or a region is out of bounds.
    fn copy_buffer(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        regions: &[BufferCopy],
    ) -> RhiResult<()>;

    // Synchronization

    /// Creates a fence. Frame slot fences start signaled so the first wait
    /// on a fresh slot returns at once.
    fn create_fence(&self, signaled: bool) -> RhiResult<Self::Fence>;

    /// Block until the fence is signaled. Returns `Ok(false)` on timeout.
    fn wait_fence(&self, fence: &Self::Fence, timeout: Duration) -> RhiResult<bool>;

    /// Return the fence to the unsignaled state before it is handed to
    /// [`submit`](Self::submit) again.
    fn reset_fence(&self, fence: &Self::Fence) -> RhiResult<()>;

    /// Non-blocking fence query.
    fn fence_signaled(&self, fence: &Self::Fence) -> RhiResult<bool>;

    fn create_semaphore(&self) -> RhiResult<Self::Semaphore>;

    // Presentation

    /// Creates a swapchain for the window surface, clamped to what the
    /// surface supports.
    ///
    /// # Errors
    ///
    /// `SwapchainError` if the surface cannot be presented to, for example
    /// when `extent` is zero.
    fn create_swapchain(&self, extent: Extent2D) -> RhiResult<Self::Swapchain>;

    /// Replace the swapchain in place, retiring the old images and views.
    ///
    /// Pipelines created against the old swapchain must be recreated. The
    /// caller must [`wait_idle`](Self::wait_idle) first; no submission may
    /// still reference the old images.
    fn recreate_swapchain(&self, swapchain: &mut Self::Swapchain, extent: Extent2D)
    -> RhiResult<()>;

    /// The extent the swapchain was actually created with.
    fn swapchain_extent(&self, swapchain: &Self::Swapchain) -> Extent2D;

    /// Number of presentable images. Per-image resources are sized by this.
    fn swapchain_image_count(&self, swapchain: &Self::Swapchain) -> u32;

    /// Acquires the next presentable image and arranges for `signal` to be
    /// signaled once the image can be rendered to.
    ///
    /// `OutOfDate` is an outcome, not an error. In that case `signal` is left
    /// untouched and the swapchain must be recreated before the next acquire.
    fn acquire_image(
        &self,
        swapchain: &Self::Swapchain,
        signal: &Self::Semaphore,
    ) -> RhiResult<AcquireOutcome>;

    /// Queues `image_index` for presentation once `wait` is signaled.
    ///
    /// A [`PresentOutcome`] other than `Presented` asks the caller to
    /// recreate the swapchain; the image was still consumed.
    fn present(
        &self,
        swapchain: &Self::Swapchain,
        image_index: u32,
        wait: &Self::Semaphore,
    ) -> RhiResult<PresentOutcome>;

    // Pipelines

    /// Builds a graphics pipeline for one pass. The pipeline targets the
    /// swapchain's current color format and extent.
    fn create_pipeline(
        &self,
        desc: &PipelineDesc,
        swapchain: &Self::Swapchain,
    ) -> RhiResult<Self::Pipeline>;

    // Command recording

    /// Allocates a primary command list. Each frame slot owns one.
    fn create_command_list(&self) -> RhiResult<Self::CommandList>;

    /// Reset the list and begin rendering into the swapchain image.
    fn begin_frame_commands(
        &self,
        cmd: &mut Self::CommandList,
        swapchain: &Self::Swapchain,
        image_index: u32,
    ) -> RhiResult<()>;

    /// Bind the shared vertex and index buffers for every following draw.
    fn cmd_bind_geometry(
        &self,
        cmd: &mut Self::CommandList,
        vertices: &Self::Buffer,
        indices: &Self::Buffer,
    );

    /// Bind a pass pipeline along with the buffers its shaders read.
    fn cmd_bind_pipeline(
        &self,
        cmd: &mut Self::CommandList,
        pipeline: &Self::Pipeline,
        uniforms: &Self::Buffer,
        instances: &Self::Buffer,
    );

    /// Issue up to `max_draws` draws read from `commands` at `command_offset`,
    /// with the actual count read from `counts` at `count_offset`.
    fn cmd_draw_indexed_indirect_count(
        &self,
        cmd: &mut Self::CommandList,
        commands: &Self::Buffer,
        command_offset: u64,
        counts: &Self::Buffer,
        count_offset: u64,
        max_draws: u32,
    );

    /// End rendering and transition the image for presentation.
    fn end_frame_commands(
        &self,
        cmd: &mut Self::CommandList,
        swapchain: &Self::Swapchain,
        image_index: u32,
    ) -> RhiResult<()>;

    // Queue

    /// Submit a recorded list. Waits on `wait` before color output, signals
    /// `signal` and `fence` when the work retires.
    ///
    /// `fence` must have been reset; submitting a signaled fence breaks the
    /// synchronization contract.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` if `cmd` was never ended.
    fn submit(
        &self,
        cmd: &Self::CommandList,
        wait: &Self::Semaphore,
        signal: &Self::Semaphore,
        fence: &Self::Fence,
    ) -> RhiResult<()>;

    /// Block until every submission has retired.
    fn wait_idle(&self) -> RhiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_command_matches_vulkan_layout() {
        assert_eq!(DrawIndexedIndirectCommand::SIZE, 20);
        assert_eq!(std::mem::align_of::<DrawIndexedIndirectCommand>(), 4);
    }

    #[test]
    fn staging_feeds_geometry_and_storage() {
        assert!(BufferUsage::Staging.can_copy_to(BufferUsage::Vertex));
        assert!(BufferUsage::Staging.can_copy_to(BufferUsage::Index));
        assert!(BufferUsage::Staging.can_copy_to(BufferUsage::Storage));
        assert!(!BufferUsage::Staging.can_copy_to(BufferUsage::Staging));
    }

    #[test]
    fn mismatched_usages_cannot_copy() {
        assert!(!BufferUsage::Vertex.can_copy_to(BufferUsage::Index));
        assert!(!BufferUsage::Uniform.can_copy_to(BufferUsage::Storage));
        assert!(!BufferUsage::Indirect.can_copy_to(BufferUsage::Indirect));
        assert!(!BufferUsage::Vertex.can_copy_to(BufferUsage::Staging));
    }

    #[test]
    fn zero_extent_is_detected() {
        assert!(Extent2D::new(0, 600).is_zero());
        assert!(Extent2D::new(800, 0).is_zero());
        assert!(!Extent2D::new(800, 600).is_zero());
    }

    #[test]
    fn only_presented_skips_recreate() {
        assert!(!PresentOutcome::Presented.needs_recreate());
        assert!(PresentOutcome::Suboptimal.needs_recreate());
        assert!(PresentOutcome::OutOfDate.needs_recreate());
    }
}
