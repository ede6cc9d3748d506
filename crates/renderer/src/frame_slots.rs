//! Frame slots: the per-frame resources that let the CPU run ahead.
//!
//! The table holds `N` slots, one per frame in flight. Slot `i` is used by
//! every frame `F` with `F % N == i`, so before the CPU touches slot `i`
//! again it must see the slot's fence signal, which proves the GPU is done
//! with the previous frame that used it.
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on fence (previous use of this slot has retired)
//! 2. Acquire swapchain image (signals image_acquired)
//! 3. Reset fence, write uniforms, record command_list
//! 4. Submit command_list:
//!    - Wait on image_acquired
//!    - Signal the acquired image's render-complete semaphore
//!    - Signal fence
//! 5. Present (waits on the render-complete semaphore)
//! ```
//!
//! Render-complete semaphores belong to swapchain images, not to slots: a
//! slot's fence says nothing about whether the presentation engine has
//! consumed the semaphore, but an image cannot be acquired again before its
//! previous present has.
//!
//! The draw-count, indirect-command and instance-data buffers are filled by
//! the draw compiler thread, so they live behind an [`Arc`] shared with it.

use std::sync::Arc;
use std::time::Duration;

use lumen_resources::PASS_COUNT;
use lumen_rhi::{Backend, BufferUsage, DrawIndexedIndirectCommand, MemoryStrategy};
use tracing::{debug, info};

use crate::allocator::{GpuBuffer, ResourceAllocator};
use crate::error::{RendererError, RendererResult};
use crate::ubo::{FrameUniforms, InstanceData};

/// Per-slot compile output capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCapacities {
    /// Indirect commands across all passes.
    pub max_draws: u32,
    /// Instance-data records.
    pub max_instances: u32,
}

/// Slot state shared between the render thread and the draw compiler.
pub struct SlotShared<B: Backend> {
    /// Signaled when the last submission that used this slot has retired.
    pub fence: B::Fence,
    /// One `u32` draw count per pass.
    pub draw_counts: GpuBuffer<B>,
    /// `max_draws` indirect commands, one contiguous region per pass.
    pub draw_commands: GpuBuffer<B>,
    /// `max_instances` [`InstanceData`] records, indexed by `first_instance`.
    pub instances: GpuBuffer<B>,
}

/// Everything frame `F` needs when `F % N` selects this slot.
pub struct FrameSlot<B: Backend> {
    index: usize,
    shared: Arc<SlotShared<B>>,
    image_acquired: B::Semaphore,
    command_list: B::CommandList,
    uniforms: GpuBuffer<B>,
}

impl<B: Backend> FrameSlot<B> {
    fn new(
        allocator: &ResourceAllocator<B>,
        index: usize,
        capacities: SlotCapacities,
    ) -> RendererResult<Self> {
        let backend = allocator.backend();
        let host = MemoryStrategy::CpuVisible;

        let draw_counts = allocator.allocate(
            &format!("slot{} draw counts", index),
            host,
            BufferUsage::Indirect,
            (PASS_COUNT * std::mem::size_of::<u32>()) as u64,
            None,
        )?;
        let draw_commands = allocator.allocate(
            &format!("slot{} draw commands", index),
            host,
            BufferUsage::Indirect,
            u64::from(capacities.max_draws) * DrawIndexedIndirectCommand::SIZE,
            None,
        )?;
        let instances = allocator.allocate(
            &format!("slot{} instances", index),
            host,
            BufferUsage::Storage,
            u64::from(capacities.max_instances) * InstanceData::SIZE as u64,
            None,
        )?;
        let uniforms = allocator.allocate(
            &format!("slot{} uniforms", index),
            host,
            BufferUsage::Uniform,
            FrameUniforms::SIZE as u64,
            None,
        )?;

        // Created signaled so the first wait on each slot returns at once
        let fence = backend.create_fence(true)?;

        Ok(Self {
            index,
            shared: Arc::new(SlotShared {
                fence,
                draw_counts,
                draw_commands,
                instances,
            }),
            image_acquired: backend.create_semaphore()?,
            command_list: backend.create_command_list()?,
            uniforms,
        })
    }

    /// Position in the ring.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Signaled once the last submission that used this slot has retired.
    /// Created signaled.
    #[inline]
    pub fn fence(&self) -> &B::Fence {
        &self.shared.fence
    }

    /// The part of the slot the draw compiler writes. Handed to the compiler
    /// thread once at startup.
    pub fn shared(&self) -> &Arc<SlotShared<B>> {
        &self.shared
    }

    /// Per-pass draw counts read by `vkCmdDrawIndexedIndirectCount`.
    pub fn draw_counts(&self) -> &GpuBuffer<B> {
        &self.shared.draw_counts
    }

    pub fn draw_commands(&self) -> &GpuBuffer<B> {
        &self.shared.draw_commands
    }

    pub fn instances(&self) -> &GpuBuffer<B> {
        &self.shared.instances
    }

    /// Camera and frame data, written by the render thread after the
    /// fence wait.
    pub fn uniforms(&self) -> &GpuBuffer<B> {
        &self.uniforms
    }

    /// Signaled by acquire, waited on by the frame's submission.
    pub fn image_acquired(&self) -> &B::Semaphore {
        &self.image_acquired
    }

    pub fn command_list(&self) -> &B::CommandList {
        &self.command_list
    }

    pub fn command_list_mut(&mut self) -> &mut B::CommandList {
        &mut self.command_list
    }

    /// The command list together with the buffers a frame binds.
    pub fn recording_parts(&mut self) -> (&mut B::CommandList, &GpuBuffer<B>, &SlotShared<B>) {
        (&mut self.command_list, &self.uniforms, &self.shared)
    }
}

/// The ring of frame slots.
///
/// # Thread Safety
///
/// The table is owned by the render thread. The draw compiler only sees
/// each slot's [`SlotShared`].
pub struct FrameSlotTable<B: Backend> {
    backend: Arc<B>,
    slots: Vec<FrameSlot<B>>,
    capacities: SlotCapacities,
}

impl<B: Backend> FrameSlotTable<B> {
    /// Allocate `count` slots.
    ///
    /// Each slot gets host-visible draw-count, command, instance and
    /// uniform buffers sized by `capacities`, plus a signaled fence, an
    /// image-acquired semaphore and a command list.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` for a zero count, `AllocationFailure` when the slot
    /// buffers do not fit in device memory.
    pub fn new(
        allocator: &ResourceAllocator<B>,
        count: usize,
        capacities: SlotCapacities,
    ) -> RendererResult<Self> {
        if count == 0 {
            return Err(RendererError::InvalidUsage(
                "a frame slot table needs at least one slot".into(),
            ));
        }
        let slots = (0..count)
            .map(|i| FrameSlot::new(allocator, i, capacities))
            .collect::<RendererResult<Vec<_>>>()?;

        info!(
            "Frame slots created: {} slots, {} draws / {} instances each",
            count, capacities.max_draws, capacities.max_instances
        );
        Ok(Self {
            backend: Arc::clone(allocator.backend()),
            slots,
            capacities,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Capacities every slot was allocated with.
    pub fn capacities(&self) -> SlotCapacities {
        self.capacities
    }

    /// Slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    #[inline]
    pub fn slot(&self, index: usize) -> &FrameSlot<B> {
        &self.slots[index]
    }

    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot<B> {
        &mut self.slots[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot<B>> {
        self.slots.iter()
    }

    /// Block until slot `index`'s last submission has retired.
    ///
    /// # Errors
    ///
    /// `SubmissionTimeout` if the fence does not signal within `timeout`.
    /// The GPU is then considered hung.
    pub fn wait(&self, index: usize, timeout: Duration) -> RendererResult<()> {
        let signaled = self.backend.wait_fence(self.slot(index).fence(), timeout)?;
        if !signaled {
            return Err(RendererError::SubmissionTimeout {
                slot: index,
                waited: timeout,
            });
        }
        Ok(())
    }

    /// Reset slot `index`'s fence ahead of the next submission.
    pub fn reset(&self, index: usize) -> RendererResult<()> {
        self.backend.reset_fence(self.slot(index).fence())?;
        Ok(())
    }

    /// [`wait`](Self::wait) then [`reset`](Self::reset).
    ///
    /// On timeout the fence is left untouched.
    pub fn wait_and_reset(&self, index: usize, timeout: Duration) -> RendererResult<()> {
        self.wait(index, timeout)?;
        self.reset(index)?;
        debug!("Frame slot {} retired and reset", index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::headless::{HeadlessBackend, HeadlessConfig};

    use super::*;

    const CAPS: SlotCapacities = SlotCapacities {
        max_draws: 8,
        max_instances: 16,
    };

    fn allocator() -> ResourceAllocator<HeadlessBackend> {
        ResourceAllocator::new(Arc::new(
            HeadlessBackend::new(HeadlessConfig::default()).unwrap(),
        ))
    }

    #[test]
    fn slots_are_sized_from_capacities() {
        let allocator = allocator();
        let table = FrameSlotTable::new(&allocator, 3, CAPS).unwrap();
        assert_eq!(table.len(), 3);
        let slot = table.slot(2);
        assert_eq!(slot.index(), 2);
        assert_eq!(slot.draw_counts().size(), 16);
        assert_eq!(slot.draw_commands().size(), 8 * 20);
        assert_eq!(slot.instances().size(), 16 * 80);
        assert_eq!(slot.uniforms().size(), 208);
        assert_eq!(allocator.live_buffers(), 12);
    }

    #[test]
    fn fresh_fences_are_signaled() {
        let allocator = allocator();
        let table = FrameSlotTable::new(&allocator, 2, CAPS).unwrap();
        table.wait(0, Duration::from_millis(1)).unwrap();
        table.wait_and_reset(1, Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn reset_fence_times_out() {
        let allocator = allocator();
        let table = FrameSlotTable::new(&allocator, 2, CAPS).unwrap();
        table.wait_and_reset(0, Duration::from_millis(1)).unwrap();
        let err = table.wait_and_reset(0, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, RendererError::SubmissionTimeout { slot: 0, .. }));
        // slot 1 is unaffected
        table.wait(1, Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn zero_slots_are_rejected() {
        let allocator = allocator();
        assert!(matches!(
            FrameSlotTable::new(&allocator, 0, CAPS),
            Err(RendererError::InvalidUsage(_))
        ));
    }

    #[test]
    fn dropping_the_table_releases_every_buffer() {
        let allocator = allocator();
        let table = FrameSlotTable::new(&allocator, 2, CAPS).unwrap();
        drop(table);
        allocator.assert_no_leaks().unwrap();
    }
}
