//! RHI error types.

use thiserror::Error;

/// Errors raised by a rendering backend.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error other than running out of memory
    #[error("Allocator error: {0}")]
    AllocatorError(gpu_allocator::AllocationError),

    /// The device could not satisfy an allocation
    #[error("out of device memory allocating {size} bytes for '{label}'")]
    OutOfDeviceMemory { label: String, size: u64 },

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    #[error("Shader error: {0}")]
    ShaderError(String),

    #[error("Surface error: {0}")]
    SurfaceError(String),

    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// An operation was requested on a resource whose usage forbids it
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// The device stopped processing work
    #[error("Device lost: {0}")]
    DeviceLost(String),
}

impl From<gpu_allocator::AllocationError> for RhiError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        match err {
            gpu_allocator::AllocationError::OutOfMemory => RhiError::OutOfDeviceMemory {
                label: String::from("<allocator>"),
                size: 0,
            },
            other => RhiError::AllocatorError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
