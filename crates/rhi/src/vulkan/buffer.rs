//! Buffers backed by gpu-allocator memory.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use super::device::Device;
use crate::backend::{BufferDesc, BufferUsage, MemoryStrategy};
use crate::error::{RhiError, RhiResult};

pub(crate) fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    use vk::BufferUsageFlags as F;
    match usage {
        BufferUsage::Vertex => F::VERTEX_BUFFER | F::TRANSFER_SRC | F::TRANSFER_DST,
        BufferUsage::Index => F::INDEX_BUFFER | F::TRANSFER_SRC | F::TRANSFER_DST,
        BufferUsage::Uniform => F::UNIFORM_BUFFER | F::SHADER_DEVICE_ADDRESS,
        BufferUsage::Storage => {
            F::STORAGE_BUFFER | F::SHADER_DEVICE_ADDRESS | F::TRANSFER_SRC | F::TRANSFER_DST
        }
        BufferUsage::Indirect => F::INDIRECT_BUFFER,
        BufferUsage::Staging => F::TRANSFER_SRC,
    }
}

pub(crate) fn memory_location(strategy: MemoryStrategy) -> MemoryLocation {
    match strategy {
        MemoryStrategy::Staging | MemoryStrategy::CpuVisible => MemoryLocation::CpuToGpu,
        MemoryStrategy::DeviceLocal => MemoryLocation::GpuOnly,
    }
}

/// A VkBuffer and its allocation. Host-visible buffers stay mapped.
pub struct VulkanBuffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    label: String,
    size: vk::DeviceSize,
    usage: BufferUsage,
    strategy: MemoryStrategy,
    device_address: Option<vk::DeviceAddress>,
}

impl VulkanBuffer {
    pub fn new(device: Arc<Device>, desc: &BufferDesc) -> RhiResult<Self> {
        if desc.size == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "buffer '{}' has zero size",
                desc.label
            )));
        }
        let flags = usage_flags(desc.usage);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: &desc.label,
            requirements,
            location: memory_location(desc.strategy),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(match RhiError::from(e) {
                    RhiError::OutOfDeviceMemory { .. } => RhiError::OutOfDeviceMemory {
                        label: desc.label.clone(),
                        size: desc.size,
                    },
                    other => other,
                });
            }
        };

        let bound = unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mut this = Self {
            device,
            buffer,
            allocation: Some(allocation),
            label: desc.label.clone(),
            size: desc.size,
            usage: desc.usage,
            strategy: desc.strategy,
            device_address: None,
        };
        bound?;

        if flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            this.device_address =
                Some(unsafe { this.device.handle().get_buffer_device_address(&info) });
        }

        debug!(
            "Created {} buffer '{}': {} bytes ({:?})",
            desc.usage.name(),
            desc.label,
            desc.size,
            desc.strategy
        );
        Ok(this)
    }

    fn check_range(&self, offset: u64, len: u64) -> RhiResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RhiError::InvalidUsage(format!(
                "range at {} of {} bytes exceeds buffer '{}' ({} bytes)",
                offset, len, self.label, self.size
            ))),
        }
    }

    fn mapped(&self) -> RhiResult<std::ptr::NonNull<std::ffi::c_void>> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| {
                RhiError::InvalidUsage(format!("buffer '{}' is not host visible", self.label))
            })
    }

    /// Copy `data` into the mapped allocation.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_range(offset, data.len() as u64)?;
        let mapped = self.mapped()?;
        // CpuToGpu memory is host coherent; no flush needed.
        unsafe {
            let dst = mapped.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mapped = self.mapped()?;
        let mut out = vec![0u8; len as usize];
        unsafe {
            let src = mapped.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[inline]
    pub fn strategy(&self) -> MemoryStrategy {
        self.strategy
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Address for shader access, present for uniform and storage buffers.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.allocator().lock().free(allocation)
        {
            error!("Failed to free buffer '{}': {:?}", self.label, e);
        }
        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }
        debug!("Destroyed buffer '{}'", self.label);
    }
}

// Mapped pointers are only dereferenced through &self methods whose callers
// uphold frame-slot exclusion.
unsafe impl Send for VulkanBuffer {}
unsafe impl Sync for VulkanBuffer {}
