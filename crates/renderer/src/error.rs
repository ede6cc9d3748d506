//! Renderer error types.

use std::time::Duration;

use lumen_resources::{ModelId, ResourceError};
use lumen_rhi::RhiError;
use thiserror::Error;

use crate::binding::BindHandle;

/// Errors raised by the frame pipeline.
///
/// An out-of-date or suboptimal swapchain is not an error. Those arrive as
/// [`lumen_rhi::AcquireOutcome`] and [`lumen_rhi::PresentOutcome`] values and
/// are handled inside [`crate::Renderer::draw_frame`].
#[derive(Error, Debug)]
pub enum RendererError {
    /// The device could not back a buffer
    #[error("allocation of {size} bytes for '{label}' failed: out of device memory")]
    AllocationFailure { label: String, size: u64 },

    /// A buffer was used in a way its usage or strategy forbids
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("{what} capacity exceeded: requested {requested}, capacity {capacity}")]
    CapacityExceeded {
        what: &'static str,
        requested: u64,
        capacity: u64,
    },

    #[error("model {0:?} is already bound")]
    AlreadyBound(ModelId),

    #[error("{0:?} does not refer to a bound model")]
    NotBound(BindHandle),

    /// A fence did not signal in time; the GPU is considered hung
    #[error("frame slot {slot} did not retire within {waited:?}")]
    SubmissionTimeout { slot: usize, waited: Duration },

    #[error("{buffers} buffers ({bytes} bytes) still alive at shutdown")]
    LeakedBuffers { buffers: usize, bytes: u64 },

    #[error("invalid configuration: {0}")]
    Config(#[from] lumen_core::Error),

    #[error("invalid model: {0}")]
    InvalidModel(#[from] ResourceError),

    /// The draw compiler worker exited
    #[error("draw compiler thread is not running")]
    CompilerDisconnected,

    #[error("failed to start draw compiler thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Rhi(RhiError),
}

impl From<RhiError> for RendererError {
    fn from(err: RhiError) -> Self {
        match err {
            RhiError::OutOfDeviceMemory { label, size } => {
                RendererError::AllocationFailure { label, size }
            }
            RhiError::InvalidUsage(message) => RendererError::InvalidUsage(message),
            other => RendererError::Rhi(other),
        }
    }
}

/// Result type alias for renderer operations.
pub type RendererResult<T> = std::result::Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_becomes_allocation_failure() {
        let err: RendererError = RhiError::OutOfDeviceMemory {
            label: "vertices".into(),
            size: 64,
        }
        .into();
        assert!(matches!(
            err,
            RendererError::AllocationFailure { ref label, size: 64 } if label == "vertices"
        ));
    }

    #[test]
    fn other_backend_errors_pass_through() {
        let err: RendererError = RhiError::DeviceLost("gone".into()).into();
        assert!(matches!(err, RendererError::Rhi(RhiError::DeviceLost(_))));
    }
}
