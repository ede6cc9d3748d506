//! Pass pipelines for dynamic rendering.
//!
//! Every pass shares one shader pair and one layout. Shaders read the frame
//! uniforms and the instance records through buffer device addresses passed
//! as push constants, so no descriptor sets are involved.

use std::ffi::CStr;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};

use super::device::Device;
use super::swapchain::DEPTH_FORMAT;
use crate::backend::{CullMode, DepthCompare, PipelineDesc};
use crate::error::{RhiError, RhiResult};
use crate::vertex::Vertex;

const ENTRY_POINT: &CStr = c"main";
const VERTEX_SHADER: &str = "pass.vert.spv";
const FRAGMENT_SHADER: &str = "pass.frag.spv";

/// Push constant block shared by every pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PassPushConstants {
    pub uniforms: u64,
    pub instances: u64,
}

fn cull_flags(cull: CullMode) -> vk::CullModeFlags {
    match cull {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

fn compare_op(compare: DepthCompare) -> vk::CompareOp {
    match compare {
        DepthCompare::Less => vk::CompareOp::LESS,
        DepthCompare::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        DepthCompare::Equal => vk::CompareOp::EQUAL,
    }
}

fn blend_attachment(desc: &PipelineDesc) -> vk::PipelineColorBlendAttachmentState {
    let write_mask = if desc.color_write {
        vk::ColorComponentFlags::RGBA
    } else {
        vk::ColorComponentFlags::empty()
    };
    let state = vk::PipelineColorBlendAttachmentState::default().color_write_mask(write_mask);
    if desc.alpha_blend {
        state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
    } else {
        state.blend_enable(false)
    }
}

struct ShaderModule<'a> {
    device: &'a Device,
    module: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    fn load(device: &'a Device, path: &Path) -> RhiResult<Self> {
        debug!("Loading shader {:?}", path);
        let mut file = File::open(path)
            .map_err(|e| RhiError::ShaderError(format!("failed to open {:?}: {}", path, e)))?;
        let code = ash::util::read_spv(&mut file)
            .map_err(|e| RhiError::ShaderError(format!("invalid SPIR-V in {:?}: {}", path, e)))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.handle().create_shader_module(&create_info, None)? };
        Ok(Self { device, module })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_shader_module(self.module, None);
        }
    }
}

/// A graphics pipeline and its layout.
pub struct VulkanPipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    label: &'static str,
}

impl VulkanPipeline {
    pub fn new(
        device: Arc<Device>,
        desc: &PipelineDesc,
        color_format: vk::Format,
        shader_dir: &Path,
    ) -> RhiResult<Self> {
        let vertex = ShaderModule::load(&device, &shader_dir.join(VERTEX_SHADER))?;
        let fragment = ShaderModule::load(&device, &shader_dir.join(FRAGMENT_SHADER))?;

        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(size_of::<PassPushConstants>() as u32)];
        let layout_info = vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&push_ranges);
        let layout = unsafe { device.handle().create_pipeline_layout(&layout_info, None)? };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.module)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.module)
                .name(ENTRY_POINT),
        ];

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(cull_flags(desc.cull))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(compare_op(desc.depth_compare));
        let attachments = [blend_attachment(desc)];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [color_format];
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(DEPTH_FORMAT);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .push_next(&mut rendering);

        let created = unsafe {
            device
                .handle()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        let pipeline = match created {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, result)) => {
                unsafe { device.handle().destroy_pipeline_layout(layout, None) };
                return Err(result.into());
            }
        };
        let Some(pipeline) = pipeline else {
            unsafe { device.handle().destroy_pipeline_layout(layout, None) };
            return Err(RhiError::PipelineError(format!(
                "no pipeline returned for '{}'",
                desc.label
            )));
        };

        info!("Created '{}' pipeline", desc.label);
        drop(vertex);
        drop(fragment);
        Ok(Self {
            device,
            pipeline,
            layout,
            label: desc.label,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
        debug!("Destroyed '{}' pipeline", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(color_write: bool, alpha_blend: bool) -> PipelineDesc {
        PipelineDesc {
            label: "test",
            cull: CullMode::Back,
            depth_write: true,
            depth_compare: DepthCompare::Less,
            color_write,
            alpha_blend,
            instance_stride: 80,
        }
    }

    #[test]
    fn push_constants_hold_two_addresses() {
        assert_eq!(size_of::<PassPushConstants>(), 16);
    }

    #[test]
    fn depth_only_pass_masks_color() {
        let state = blend_attachment(&desc(false, false));
        assert!(state.color_write_mask.is_empty());
        assert_eq!(state.blend_enable, vk::FALSE);
    }

    #[test]
    fn transparent_pass_blends_over() {
        let state = blend_attachment(&desc(true, true));
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn state_conversions() {
        assert_eq!(cull_flags(CullMode::None), vk::CullModeFlags::NONE);
        assert_eq!(compare_op(DepthCompare::Equal), vk::CompareOp::EQUAL);
    }
}
