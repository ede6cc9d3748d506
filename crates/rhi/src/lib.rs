//! Render hardware interface.
//!
//! [`Backend`] is the seam between the frame pipeline and the GPU. Two
//! implementations ship here:
//! - [`vulkan::VulkanBackend`] drives a Vulkan 1.3 device through `ash`
//!   with dynamic rendering and `vkCmdDrawIndexedIndirectCount`
//! - [`headless::HeadlessBackend`] simulates a queue on a worker thread and
//!   validates usage, for tests and machines without a GPU

mod backend;
mod error;

pub mod headless;
pub mod vertex;
pub mod vulkan;

pub use backend::*;
pub use error::{RhiError, RhiResult};
pub use vertex::Vertex;

pub use ash::vk;
