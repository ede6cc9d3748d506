//! Command pools, per-frame command lists and the upload context.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::debug;

use super::buffer::VulkanBuffer;
use super::device::Device;
use super::pipeline::{PassPushConstants, VulkanPipeline};
use super::swapchain::{VulkanSwapchain, subresource_range};
use super::sync::VulkanFence;
use crate::backend::BufferCopy;
use crate::backend::DrawIndexedIndirectCommand;
use crate::error::{RhiError, RhiResult};

const CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.15, 1.0];

/// Owns a `VkCommandPool`.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
}

impl CommandPool {
    pub fn new(device: Arc<Device>, flags: vk::CommandPoolCreateFlags) -> RhiResult<Self> {
        let family = device
            .queue_families()
            .graphics_family
            .ok_or(RhiError::NoSuitableGpu)?;
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(flags)
            .queue_family_index(family);
        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        Ok(Self { device, pool })
    }

    pub fn allocate(&self) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidUsage("no command buffer allocated".into()))
    }

    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?
        };
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
    }
}

/// One primary command buffer with its own pool, recorded once per frame.
pub struct VulkanCommandList {
    device: Arc<Device>,
    cmd: vk::CommandBuffer,
    bound_layout: Option<vk::PipelineLayout>,
    pool: CommandPool,
}

impl VulkanCommandList {
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let pool = CommandPool::new(Arc::clone(&device), vk::CommandPoolCreateFlags::TRANSIENT)?;
        let cmd = pool.allocate()?;
        Ok(Self {
            device,
            cmd,
            bound_layout: None,
            pool,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn begin_frame(&mut self, swapchain: &VulkanSwapchain, image_index: u32) -> RhiResult<()> {
        let (image, view) = swapchain
            .image(image_index)
            .zip(swapchain.view(image_index))
            .ok_or_else(|| RhiError::SwapchainError(format!("no image {image_index}")))?;
        let depth = swapchain
            .depth()
            .ok_or_else(|| RhiError::SwapchainError("swapchain has no depth image".into()))?;

        self.pool.reset()?;
        self.bound_layout = None;
        let device = self.device.handle();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(self.cmd, &begin_info)? };

        let barriers = [
            image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                (vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, vk::AccessFlags2::NONE),
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                ),
            ),
            image_barrier(
                depth.image(),
                vk::ImageAspectFlags::DEPTH,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                (
                    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ),
                (
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ),
            ),
        ];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { device.cmd_pipeline_barrier2(self.cmd, &dependency) };

        let color_attachment = [vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            })];
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(depth.view())
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let extent = swapchain.vk_extent();
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let rendering_info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_attachment)
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            device.cmd_begin_rendering(self.cmd, &rendering_info);
            device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            device.cmd_set_scissor(self.cmd, 0, &[area]);
        }
        Ok(())
    }

    pub fn bind_geometry(&mut self, vertices: &VulkanBuffer, indices: &VulkanBuffer) {
        let device = self.device.handle();
        unsafe {
            device.cmd_bind_vertex_buffers(self.cmd, 0, &[vertices.handle()], &[0]);
            device.cmd_bind_index_buffer(self.cmd, indices.handle(), 0, vk::IndexType::UINT32);
        }
    }

    pub fn bind_pipeline(
        &mut self,
        pipeline: &VulkanPipeline,
        uniforms: &VulkanBuffer,
        instances: &VulkanBuffer,
    ) {
        let constants = PassPushConstants {
            uniforms: uniforms.device_address().unwrap_or_default(),
            instances: instances.device_address().unwrap_or_default(),
        };
        let device = self.device.handle();
        unsafe {
            device.cmd_bind_pipeline(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.handle(),
            );
            device.cmd_push_constants(
                self.cmd,
                pipeline.layout(),
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&constants),
            );
        }
        self.bound_layout = Some(pipeline.layout());
    }

    pub fn draw_indexed_indirect_count(
        &mut self,
        commands: &VulkanBuffer,
        command_offset: u64,
        counts: &VulkanBuffer,
        count_offset: u64,
        max_draws: u32,
    ) {
        if self.bound_layout.is_none() || max_draws == 0 {
            return;
        }
        unsafe {
            self.device.handle().cmd_draw_indexed_indirect_count(
                self.cmd,
                commands.handle(),
                command_offset,
                counts.handle(),
                count_offset,
                max_draws,
                DrawIndexedIndirectCommand::SIZE as u32,
            );
        }
    }

    pub fn end_frame(&mut self, swapchain: &VulkanSwapchain, image_index: u32) -> RhiResult<()> {
        let image = swapchain
            .image(image_index)
            .ok_or_else(|| RhiError::SwapchainError(format!("no image {image_index}")))?;
        let device = self.device.handle();
        let barrier = [image_barrier(
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE),
        )];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barrier);
        unsafe {
            device.cmd_end_rendering(self.cmd);
            device.cmd_pipeline_barrier2(self.cmd, &dependency);
            device.end_command_buffer(self.cmd)?;
        }
        Ok(())
    }
}

fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(aspect))
}

struct UploadState {
    pool: CommandPool,
    cmd: vk::CommandBuffer,
    fence: VulkanFence,
}

/// Blocking buffer copies on the graphics queue.
pub struct UploadContext {
    device: Arc<Device>,
    state: Mutex<UploadState>,
}

impl UploadContext {
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let pool = CommandPool::new(Arc::clone(&device), vk::CommandPoolCreateFlags::TRANSIENT)?;
        let cmd = pool.allocate()?;
        let fence = VulkanFence::new(Arc::clone(&device), false)?;
        Ok(Self {
            device,
            state: Mutex::new(UploadState { pool, cmd, fence }),
        })
    }

    /// Record, submit and wait for one copy. Later submissions observe the
    /// copied data through the trailing memory barrier.
    pub fn copy(
        &self,
        src: &VulkanBuffer,
        dst: &VulkanBuffer,
        regions: &[BufferCopy],
    ) -> RhiResult<()> {
        let state = self.state.lock();
        let device = self.device.handle();
        let copies: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset,
                dst_offset: r.dst_offset,
                size: r.size,
            })
            .collect();

        state.pool.reset()?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let barrier = [vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COPY)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ)];
        let dependency = vk::DependencyInfo::default().memory_barriers(&barrier);
        unsafe {
            device.begin_command_buffer(state.cmd, &begin_info)?;
            device.cmd_copy_buffer(state.cmd, src.handle(), dst.handle(), &copies);
            device.cmd_pipeline_barrier2(state.cmd, &dependency);
            device.end_command_buffer(state.cmd)?;
        }

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(state.cmd)];
        let submit = [vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos)];
        state.fence.reset()?;
        self.device.submit_graphics(&submit, state.fence.handle())?;
        if !state.fence.wait(std::time::Duration::from_secs(10))? {
            return Err(RhiError::DeviceLost(format!(
                "copy into '{}' did not complete",
                dst.label()
            )));
        }
        debug!(
            "Copied {} region(s) from '{}' into '{}'",
            regions.len(),
            src.label(),
            dst.label()
        );
        Ok(())
    }
}
