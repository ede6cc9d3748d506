//! Fences and binary semaphores.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use super::device::Device;
use crate::error::RhiResult;

/// Binary semaphore ordering queue operations.
pub struct VulkanSemaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl VulkanSemaphore {
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Host-observable completion signal for a queue submission.
pub struct VulkanFence {
    device: Arc<Device>,
    fence: vk::Fence,
}

impl VulkanFence {
    /// Create a fence, optionally already signaled so the first wait returns.
    pub fn new(device: Arc<Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.handle().create_fence(&create_info, None)? };
        debug!("Created fence (signaled: {})", signaled);
        Ok(Self { device, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Wait up to `timeout`. Returns `Ok(false)` if the fence did not signal.
    pub fn wait(&self, timeout: Duration) -> RhiResult<bool> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let result = unsafe {
            self.device
                .handle()
                .wait_for_fences(&[self.fence], true, nanos)
        };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Return to the unsignaled state. The fence must not be pending.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe { self.device.handle().reset_fences(&[self.fence])? };
        Ok(())
    }

    pub fn is_signaled(&self) -> RhiResult<bool> {
        Ok(unsafe { self.device.handle().get_fence_status(self.fence)? })
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
    }
}
