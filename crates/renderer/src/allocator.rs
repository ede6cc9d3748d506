//! Buffer creation, uploads and leak tracking.
//!
//! [`ResourceAllocator`] is the only place the frame pipeline creates GPU
//! buffers. Each buffer comes back as a [`GpuBuffer`] that releases its
//! memory on drop and reports to a shared [`AllocationTracker`], so shutdown
//! can verify that nothing outlived the renderer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lumen_rhi::{Backend, BufferCopy, BufferDesc, BufferUsage, MemoryStrategy};
use tracing::{debug, warn};

use crate::error::{RendererError, RendererResult};

#[derive(Default)]
struct TrackerCounts {
    live_buffers: AtomicUsize,
    live_bytes: AtomicU64,
    total_allocations: AtomicU64,
}

/// Counts live buffers and bytes. Cheap to clone; clones share counts.
#[derive(Clone, Default)]
pub struct AllocationTracker {
    counts: Arc<TrackerCounts>,
}

impl AllocationTracker {
    fn acquire(&self, size: u64) {
        self.counts.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.counts.live_bytes.fetch_add(size, Ordering::Relaxed);
        self.counts.total_allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, size: u64) {
        self.counts.live_buffers.fetch_sub(1, Ordering::Relaxed);
        self.counts.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    /// Buffers created through the allocator and not yet dropped.
    pub fn live_buffers(&self) -> usize {
        self.counts.live_buffers.load(Ordering::Relaxed)
    }

    /// Sum of the sizes of the live buffers.
    pub fn live_bytes(&self) -> u64 {
        self.counts.live_bytes.load(Ordering::Relaxed)
    }

    /// Buffers created over the tracker's lifetime, including released ones.
    pub fn total_allocations(&self) -> u64 {
        self.counts.total_allocations.load(Ordering::Relaxed)
    }

    /// `Err(LeakedBuffers)` while any tracked buffer is still alive.
    pub fn assert_no_leaks(&self) -> RendererResult<()> {
        match self.live_buffers() {
            0 => Ok(()),
            buffers => Err(RendererError::LeakedBuffers {
                buffers,
                bytes: self.live_bytes(),
            }),
        }
    }
}

/// A backend buffer plus the metadata the allocator validates against.
///
/// Dropping a `GpuBuffer` releases the backend buffer and its memory. The
/// owner must make sure no in-flight submission still reads it; the frame
/// pipeline does this by waiting for the device to go idle before its
/// buffers are dropped.
pub struct GpuBuffer<B: Backend> {
    raw: B::Buffer,
    label: String,
    size: u64,
    usage: BufferUsage,
    strategy: MemoryStrategy,
    tracker: AllocationTracker,
}

impl<B: Backend> GpuBuffer<B> {
    /// The backend object, for binding in command lists.
    #[inline]
    pub fn raw(&self) -> &B::Buffer {
        &self.raw
    }

    /// Debug name given at allocation, used in logs and errors.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Where the memory lives. Only host-visible buffers can be written
    /// with [`ResourceAllocator::write`].
    pub fn strategy(&self) -> MemoryStrategy {
        self.strategy
    }

    fn check_range(&self, offset: u64, len: u64) -> RendererResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RendererError::InvalidUsage(format!(
                "range {}..{} out of bounds for '{}' ({} bytes)",
                offset,
                offset.saturating_add(len),
                self.label,
                self.size
            ))),
        }
    }
}

impl<B: Backend> Drop for GpuBuffer<B> {
    fn drop(&mut self) {
        self.tracker.release(self.size);
        debug!("Buffer released: '{}' ({} bytes)", self.label, self.size);
    }
}

/// Creates every GPU buffer the frame pipeline uses.
///
/// Buffers are validated against their usage and memory strategy before
/// the backend sees them, so misuse surfaces as `InvalidUsage` naming the
/// buffer instead of as a device error.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use lumen_renderer::ResourceAllocator;
/// use lumen_rhi::headless::{HeadlessBackend, HeadlessConfig};
/// use lumen_rhi::{BufferUsage, MemoryStrategy};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default())?);
/// let allocator = ResourceAllocator::new(backend);
///
/// // Device-local with data: filled through a temporary staging buffer
/// let vertices = allocator.allocate(
///     "vertices",
///     MemoryStrategy::DeviceLocal,
///     BufferUsage::Vertex,
///     1024,
///     Some(&[0u8; 1024]),
/// )?;
/// assert_eq!(allocator.live_buffers(), 1);
///
/// drop(vertices);
/// allocator.assert_no_leaks()?;
/// # Ok(())
/// # }
/// ```
pub struct ResourceAllocator<B: Backend> {
    backend: Arc<B>,
    tracker: AllocationTracker,
}

impl<B: Backend> ResourceAllocator<B> {
    /// Creates an allocator with a fresh [`AllocationTracker`].
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            tracker: AllocationTracker::default(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The tracker every buffer from this allocator reports to. Clone it to
    /// check for leaks after the allocator itself is gone.
    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    /// Create a buffer and optionally fill it.
    ///
    /// Host-visible strategies receive `initial_data` through a direct
    /// write. A device-local buffer with data is filled through a temporary
    /// staging buffer that is released before this returns.
    ///
    /// # Errors
    ///
    /// - `InvalidUsage` for a zero size, data larger than the buffer, a
    ///   staging strategy on a non-staging usage (or the reverse), or
    ///   device-local data whose usage cannot be a copy destination.
    /// - `AllocationFailure` when the device is out of memory.
    pub fn allocate(
        &self,
        label: &str,
        strategy: MemoryStrategy,
        usage: BufferUsage,
        size: u64,
        initial_data: Option<&[u8]>,
    ) -> RendererResult<GpuBuffer<B>> {
        if size == 0 {
            return Err(RendererError::InvalidUsage(format!(
                "buffer '{}' has zero size",
                label
            )));
        }
        if (strategy == MemoryStrategy::Staging) != (usage == BufferUsage::Staging) {
            return Err(RendererError::InvalidUsage(format!(
                "buffer '{}': {:?} strategy does not match {} usage",
                label,
                strategy,
                usage.name()
            )));
        }
        if let Some(data) = initial_data {
            if data.len() as u64 > size {
                return Err(RendererError::InvalidUsage(format!(
                    "{} bytes of initial data do not fit buffer '{}' ({} bytes)",
                    data.len(),
                    label,
                    size
                )));
            }
            if strategy == MemoryStrategy::DeviceLocal
                && !BufferUsage::Staging.can_copy_to(usage)
            {
                return Err(RendererError::InvalidUsage(format!(
                    "device-local {} buffer '{}' cannot be filled by an upload",
                    usage.name(),
                    label
                )));
            }
        }

        let buffer = self.create(label, strategy, usage, size)?;
        match initial_data {
            Some(data) if !data.is_empty() => {
                if strategy.is_host_visible() {
                    self.backend.write_buffer(&buffer.raw, 0, data)?;
                } else {
                    self.upload(&buffer, 0, data)?;
                }
            }
            _ => {}
        }
        Ok(buffer)
    }

    /// Copy `data` into `dst` at `offset` through a temporary staging buffer.
    ///
    /// Blocks until the copy has completed; the staging buffer is released
    /// before this returns.
    ///
    /// # Errors
    ///
    /// - `InvalidUsage` if the range falls outside `dst` or `dst`'s usage
    ///   cannot receive a staging copy.
    /// - `AllocationFailure` if the staging buffer does not fit.
    pub fn upload(&self, dst: &GpuBuffer<B>, offset: u64, data: &[u8]) -> RendererResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = data.len() as u64;
        dst.check_range(offset, size)?;
        let staging = self.create(
            &format!("{} (staging)", dst.label),
            MemoryStrategy::Staging,
            BufferUsage::Staging,
            size,
        )?;
        self.backend.write_buffer(&staging.raw, 0, data)?;
        self.copy(
            &staging,
            dst,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size,
            }],
        )
    }

    /// Write host data into a host-visible buffer.
    ///
    /// The caller is responsible for the GPU not reading the range.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` for a device-local buffer or an out-of-bounds range.
    pub fn write(&self, buffer: &GpuBuffer<B>, offset: u64, data: &[u8]) -> RendererResult<()> {
        if !buffer.strategy.is_host_visible() {
            return Err(RendererError::InvalidUsage(format!(
                "buffer '{}' is device local; write through a staging copy",
                buffer.label
            )));
        }
        buffer.check_range(offset, data.len() as u64)?;
        self.backend.write_buffer(&buffer.raw, offset, data)?;
        Ok(())
    }

    /// Read `len` bytes back from a host-visible buffer.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` for a device-local buffer or an out-of-bounds range.
    pub fn read(&self, buffer: &GpuBuffer<B>, offset: u64, len: u64) -> RendererResult<Vec<u8>> {
        if !buffer.strategy.is_host_visible() {
            return Err(RendererError::InvalidUsage(format!(
                "buffer '{}' is device local and cannot be read back",
                buffer.label
            )));
        }
        buffer.check_range(offset, len)?;
        Ok(self.backend.read_buffer(&buffer.raw, offset, len)?)
    }

    /// Device copy between buffers. Blocks until the copy completes.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` when `src.usage` may not feed `dst.usage` or when a
    /// region falls outside either buffer.
    pub fn copy(
        &self,
        src: &GpuBuffer<B>,
        dst: &GpuBuffer<B>,
        regions: &[BufferCopy],
    ) -> RendererResult<()> {
        if !src.usage.can_copy_to(dst.usage) {
            return Err(RendererError::InvalidUsage(format!(
                "cannot copy {} buffer '{}' into {} buffer '{}'",
                src.usage.name(),
                src.label,
                dst.usage.name(),
                dst.label
            )));
        }
        for region in regions {
            src.check_range(region.src_offset, region.size)?;
            dst.check_range(region.dst_offset, region.size)?;
        }
        self.backend.copy_buffer(&src.raw, &dst.raw, regions)?;
        Ok(())
    }

    pub fn live_buffers(&self) -> usize {
        self.tracker.live_buffers()
    }

    pub fn live_bytes(&self) -> u64 {
        self.tracker.live_bytes()
    }

    /// See [`AllocationTracker::assert_no_leaks`].
    pub fn assert_no_leaks(&self) -> RendererResult<()> {
        self.tracker.assert_no_leaks()
    }

    fn create(
        &self,
        label: &str,
        strategy: MemoryStrategy,
        usage: BufferUsage,
        size: u64,
    ) -> RendererResult<GpuBuffer<B>> {
        let desc = BufferDesc::new(label, size, usage, strategy);
        let raw = self.backend.create_buffer(&desc).map_err(|err| {
            warn!("Failed to allocate '{}' ({} bytes): {}", label, size, err);
            match RendererError::from(err) {
                // the backend may not know which buffer it was serving
                RendererError::AllocationFailure { .. } => RendererError::AllocationFailure {
                    label: label.to_string(),
                    size,
                },
                other => other,
            }
        })?;
        self.tracker.acquire(size);
        debug!(
            "Buffer allocated: '{}' ({} bytes, {}, {:?})",
            label,
            size,
            usage.name(),
            strategy
        );
        Ok(GpuBuffer {
            raw,
            label: desc.label,
            size,
            usage,
            strategy,
            tracker: self.tracker.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::headless::{HeadlessBackend, HeadlessConfig};

    use super::*;

    fn allocator() -> ResourceAllocator<HeadlessBackend> {
        ResourceAllocator::new(Arc::new(
            HeadlessBackend::new(HeadlessConfig::default()).unwrap(),
        ))
    }

    #[test]
    fn device_local_upload_goes_through_staging() {
        let allocator = allocator();
        let data: Vec<u8> = (0..32).collect();
        let buffer = allocator
            .allocate(
                "vertices",
                MemoryStrategy::DeviceLocal,
                BufferUsage::Vertex,
                64,
                Some(&data),
            )
            .unwrap();

        // the staging buffer is gone, only the target remains
        assert_eq!(allocator.live_buffers(), 1);
        assert_eq!(allocator.tracker().total_allocations(), 2);
        let bytes = allocator.backend().debug_read(buffer.raw());
        assert_eq!(&bytes[..32], &data[..]);
        assert!(bytes[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn cpu_visible_data_is_written_directly() {
        let allocator = allocator();
        let buffer = allocator
            .allocate(
                "uniforms",
                MemoryStrategy::CpuVisible,
                BufferUsage::Uniform,
                8,
                Some(&[7; 8]),
            )
            .unwrap();
        assert_eq!(allocator.read(&buffer, 0, 8).unwrap(), vec![7; 8]);
        assert_eq!(allocator.tracker().total_allocations(), 1);
    }

    #[test]
    fn forbidden_copy_pairs_are_rejected() {
        let allocator = allocator();
        let vertices = allocator
            .allocate("v", MemoryStrategy::DeviceLocal, BufferUsage::Vertex, 16, None)
            .unwrap();
        let indices = allocator
            .allocate("i", MemoryStrategy::DeviceLocal, BufferUsage::Index, 16, None)
            .unwrap();
        let region = BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 16,
        };
        let err = allocator.copy(&vertices, &indices, &[region]).unwrap_err();
        assert!(matches!(err, RendererError::InvalidUsage(_)));
    }

    #[test]
    fn out_of_range_copy_is_rejected() {
        let allocator = allocator();
        let staging = allocator
            .allocate("s", MemoryStrategy::Staging, BufferUsage::Staging, 16, None)
            .unwrap();
        let storage = allocator
            .allocate("t", MemoryStrategy::DeviceLocal, BufferUsage::Storage, 16, None)
            .unwrap();
        let region = BufferCopy {
            src_offset: 0,
            dst_offset: 8,
            size: 16,
        };
        assert!(matches!(
            allocator.copy(&staging, &storage, &[region]),
            Err(RendererError::InvalidUsage(_))
        ));
    }

    #[test]
    fn mismatched_strategy_and_usage_is_rejected() {
        let allocator = allocator();
        assert!(matches!(
            allocator.allocate("x", MemoryStrategy::Staging, BufferUsage::Vertex, 4, None),
            Err(RendererError::InvalidUsage(_))
        ));
        assert!(matches!(
            allocator.allocate("x", MemoryStrategy::CpuVisible, BufferUsage::Staging, 4, None),
            Err(RendererError::InvalidUsage(_))
        ));
        assert!(matches!(
            allocator.allocate("x", MemoryStrategy::DeviceLocal, BufferUsage::Uniform, 4, Some(&[1])),
            Err(RendererError::InvalidUsage(_))
        ));
    }

    #[test]
    fn budget_exhaustion_reports_label_and_size() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            memory_budget: Some(100),
            ..HeadlessConfig::default()
        })
        .unwrap();
        let allocator = ResourceAllocator::new(Arc::new(backend));
        let Err(err) =
            allocator.allocate("big", MemoryStrategy::CpuVisible, BufferUsage::Storage, 101, None)
        else {
            panic!("allocation over budget succeeded");
        };
        assert!(matches!(
            err,
            RendererError::AllocationFailure { ref label, size: 101 } if label == "big"
        ));
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn leak_check_tracks_drops() {
        let allocator = allocator();
        let buffer = allocator
            .allocate("u", MemoryStrategy::CpuVisible, BufferUsage::Uniform, 32, None)
            .unwrap();
        assert!(matches!(
            allocator.assert_no_leaks(),
            Err(RendererError::LeakedBuffers { buffers: 1, bytes: 32 })
        ));
        drop(buffer);
        allocator.assert_no_leaks().unwrap();
    }
}
