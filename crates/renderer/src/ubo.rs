//! GPU-visible data layouts.
//!
//! These structures must match the GLSL layouts in `shaders/pass.vert`
//! exactly. All use `#[repr(C)]` for predictable memory layout and implement
//! `Pod` and `Zeroable` for safe byte casting.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use lumen_scene::CameraMatrices;

/// Per-frame uniforms, one copy per frame slot.
///
/// # Memory Layout
///
/// - Offset 0: view matrix (64 bytes)
/// - Offset 64: projection matrix (64 bytes)
/// - Offset 128: view-projection matrix (64 bytes)
/// - Offset 192: camera position (12 bytes)
/// - Offset 204: frame index, truncated (4 bytes)
/// - Total size: 208 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub camera_position: Vec3,
    pub frame_index: u32,
}

impl FrameUniforms {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(camera: &CameraMatrices, frame_index: u64) -> Self {
        Self {
            view: camera.view,
            projection: camera.projection,
            view_projection: camera.view_projection,
            camera_position: camera.position,
            frame_index: frame_index as u32,
        }
    }
}

/// One record of the instance-data buffer, addressed by `first_instance`.
///
/// # Memory Layout
///
/// - Offset 0: world matrix (64 bytes)
/// - Offset 64: material index (4 bytes)
/// - Offset 68: padding to a 16-byte stride (12 bytes)
/// - Total size: 80 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub world: Mat4,
    pub material_index: u32,
    pub _padding: [u32; 3],
}

impl InstanceData {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(world: Mat4, material_index: u32) -> Self {
        Self {
            world,
            material_index,
            _padding: [0; 3],
        }
    }
}
