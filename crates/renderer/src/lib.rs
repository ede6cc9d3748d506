//! The frame pipeline.
//!
//! This crate turns a bound scene into presented frames:
//! - Buffer allocation and upload ([`ResourceAllocator`])
//! - Shared geometry and instance registration ([`SceneBindingTable`])
//! - Per-frame-in-flight resources ([`FrameSlotTable`])
//! - Indirect draw compilation on a worker thread ([`IndirectDrawCompiler`])
//! - Acquire, record, submit and present ([`Renderer`])

pub mod allocator;
pub mod binding;
pub mod compiler;
pub mod error;
pub mod frame_slots;
pub mod renderer;
pub mod ubo;
pub mod visibility;

pub use allocator::{AllocationTracker, GpuBuffer, ResourceAllocator};
pub use binding::{
    BindHandle, BindingRegistry, InstanceRecord, InstanceUid, PrimitiveRef, SceneBindingTable,
};
pub use compiler::{CompileReport, DrawCompiler, IndirectDrawCompiler, PassRange, SlotPhase};
pub use error::{RendererError, RendererResult};
pub use frame_slots::{FrameSlot, FrameSlotTable, SlotCapacities, SlotShared};
pub use renderer::{FrameStats, FrameStatus, Renderer, SchedulerState, pass_pipeline_desc};
pub use ubo::{FrameUniforms, InstanceData};
pub use visibility::{AllVisible, FrustumCuller, IndirectDrawInfo, VisibilityProducer};
