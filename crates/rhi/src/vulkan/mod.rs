//! Vulkan 1.3 implementation of [`Backend`](crate::Backend).

pub mod buffer;
pub mod command;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod swapchain;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{info, warn};

pub use buffer::VulkanBuffer;
pub use command::{UploadContext, VulkanCommandList};
pub use device::Device;
pub use instance::Instance;
pub use pipeline::VulkanPipeline;
pub use swapchain::{Surface, VulkanSwapchain};
pub use sync::{VulkanFence, VulkanSemaphore};

use crate::backend::{
    AcquireOutcome, Backend, BufferCopy, BufferDesc, Extent2D, PipelineDesc, PresentOutcome,
};
use crate::error::{RhiError, RhiResult};

/// Everything needed to bring up a device against a window.
#[derive(Debug, Clone)]
pub struct VulkanBackendDesc {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
    pub validation: bool,
    pub vsync: bool,
    /// Directory holding `pass.vert.spv` and `pass.frag.spv`.
    pub shader_dir: PathBuf,
}

pub struct VulkanBackend {
    upload: UploadContext,
    surface: Arc<Surface>,
    device: Arc<Device>,
    instance: Arc<Instance>,
    vsync: bool,
    shader_dir: PathBuf,
}

impl VulkanBackend {
    /// # Safety
    ///
    /// The window behind `desc.window` must outlive the backend and every
    /// swapchain created from it.
    pub unsafe fn new(desc: VulkanBackendDesc) -> RhiResult<Self> {
        let instance = Arc::new(Instance::new(desc.display, desc.validation)?);
        let surface = Arc::new(unsafe {
            Surface::new(Arc::clone(&instance), desc.display, desc.window)?
        });
        let physical = device::select_physical_device(
            instance.handle(),
            surface.handle(),
            surface.loader(),
        )?;
        let device = Device::new(&instance, &physical)?;
        let upload = UploadContext::new(Arc::clone(&device))?;
        info!(
            "Vulkan backend ready on '{}' (validation: {})",
            physical.device_name(),
            instance.has_validation()
        );
        Ok(Self {
            upload,
            surface,
            device,
            instance,
            vsync: desc.vsync,
            shader_dir: desc.shader_dir,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Backend for VulkanBackend {
    type Buffer = VulkanBuffer;
    type Fence = VulkanFence;
    type Semaphore = VulkanSemaphore;
    type Swapchain = VulkanSwapchain;
    type Pipeline = VulkanPipeline;
    type CommandList = VulkanCommandList;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<VulkanBuffer> {
        VulkanBuffer::new(Arc::clone(&self.device), desc)
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        buffer.write(offset, data)
    }

    fn read_buffer(&self, buffer: &VulkanBuffer, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        buffer.read(offset, len)
    }

    fn copy_buffer(
        &self,
        src: &VulkanBuffer,
        dst: &VulkanBuffer,
        regions: &[BufferCopy],
    ) -> RhiResult<()> {
        if !src.usage().can_copy_to(dst.usage()) {
            return Err(RhiError::InvalidUsage(format!(
                "cannot copy {} buffer '{}' into {} buffer '{}'",
                src.usage().name(),
                src.label(),
                dst.usage().name(),
                dst.label()
            )));
        }
        if regions.is_empty() {
            return Ok(());
        }
        self.upload.copy(src, dst, regions)
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<VulkanFence> {
        VulkanFence::new(Arc::clone(&self.device), signaled)
    }

    fn wait_fence(&self, fence: &VulkanFence, timeout: Duration) -> RhiResult<bool> {
        fence.wait(timeout)
    }

    fn reset_fence(&self, fence: &VulkanFence) -> RhiResult<()> {
        fence.reset()
    }

    fn fence_signaled(&self, fence: &VulkanFence) -> RhiResult<bool> {
        fence.is_signaled()
    }

    fn create_semaphore(&self) -> RhiResult<VulkanSemaphore> {
        VulkanSemaphore::new(Arc::clone(&self.device))
    }

    fn create_swapchain(&self, extent: Extent2D) -> RhiResult<VulkanSwapchain> {
        VulkanSwapchain::new(
            &self.instance,
            Arc::clone(&self.device),
            Arc::clone(&self.surface),
            extent,
            self.vsync,
        )
    }

    fn recreate_swapchain(&self, swapchain: &mut VulkanSwapchain, extent: Extent2D) -> RhiResult<()> {
        self.device.wait_idle()?;
        swapchain.recreate(extent)
    }

    fn swapchain_extent(&self, swapchain: &VulkanSwapchain) -> Extent2D {
        swapchain.extent()
    }

    fn swapchain_image_count(&self, swapchain: &VulkanSwapchain) -> u32 {
        swapchain.image_count()
    }

    fn acquire_image(
        &self,
        swapchain: &VulkanSwapchain,
        signal: &VulkanSemaphore,
    ) -> RhiResult<AcquireOutcome> {
        match swapchain.acquire(signal.handle()) {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn present(
        &self,
        swapchain: &VulkanSwapchain,
        image_index: u32,
        wait: &VulkanSemaphore,
    ) -> RhiResult<PresentOutcome> {
        let queue = self.device.present_queue();
        let result = self
            .device
            .with_queue_lock(|| swapchain.present(queue, image_index, wait.handle()));
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(RhiError::DeviceLost("device lost during present".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_pipeline(
        &self,
        desc: &PipelineDesc,
        swapchain: &VulkanSwapchain,
    ) -> RhiResult<VulkanPipeline> {
        VulkanPipeline::new(
            Arc::clone(&self.device),
            desc,
            swapchain.format(),
            &self.shader_dir,
        )
    }

    fn create_command_list(&self) -> RhiResult<VulkanCommandList> {
        VulkanCommandList::new(Arc::clone(&self.device))
    }

    fn begin_frame_commands(
        &self,
        cmd: &mut VulkanCommandList,
        swapchain: &VulkanSwapchain,
        image_index: u32,
    ) -> RhiResult<()> {
        cmd.begin_frame(swapchain, image_index)
    }

    fn cmd_bind_geometry(
        &self,
        cmd: &mut VulkanCommandList,
        vertices: &VulkanBuffer,
        indices: &VulkanBuffer,
    ) {
        cmd.bind_geometry(vertices, indices);
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: &mut VulkanCommandList,
        pipeline: &VulkanPipeline,
        uniforms: &VulkanBuffer,
        instances: &VulkanBuffer,
    ) {
        cmd.bind_pipeline(pipeline, uniforms, instances);
    }

    fn cmd_draw_indexed_indirect_count(
        &self,
        cmd: &mut VulkanCommandList,
        commands: &VulkanBuffer,
        command_offset: u64,
        counts: &VulkanBuffer,
        count_offset: u64,
        max_draws: u32,
    ) {
        cmd.draw_indexed_indirect_count(commands, command_offset, counts, count_offset, max_draws);
    }

    fn end_frame_commands(
        &self,
        cmd: &mut VulkanCommandList,
        swapchain: &VulkanSwapchain,
        image_index: u32,
    ) -> RhiResult<()> {
        cmd.end_frame(swapchain, image_index)
    }

    fn submit(
        &self,
        cmd: &VulkanCommandList,
        wait: &VulkanSemaphore,
        signal: &VulkanSemaphore,
        fence: &VulkanFence,
    ) -> RhiResult<()> {
        let waits = [vk::SemaphoreSubmitInfo::default()
            .semaphore(wait.handle())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(signal.handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let cmds = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd.handle())];
        let submit = [vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&cmds)
            .signal_semaphore_infos(&signals)];
        self.device.submit_graphics(&submit, fence.handle())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("Failed to wait for device idle: {}", e);
        }
    }
}
