//! Indirect draw compilation.
//!
//! Each frame the compiler turns the bound primitives plus a visibility
//! snapshot into three things in the frame slot's host-visible buffers:
//!
//! - one `u32` draw count per pass,
//! - indirect draw commands, grouped into one contiguous region per pass,
//! - instance data, one record per drawn instance.
//!
//! Regions are laid out by prefix sum of the per-pass counts, in pipeline
//! order, so pass `p` owns commands `[offset_p, offset_p + count_p)`. A
//! primitive that belongs to several passes gets one command in each, and
//! each copy appends its own instance records. Every command's
//! `first_instance` is the index of its first record, which is how the
//! vertex shader finds the instance's world matrix.
//!
//! [`DrawCompiler`] is the pure core. [`IndirectDrawCompiler`] runs it on a
//! worker thread one frame ahead of the render thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use lumen_resources::{PASS_COUNT, Pass};
use lumen_rhi::{Backend, DrawIndexedIndirectCommand};
use lumen_scene::CameraMatrices;
use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::binding::BindingRegistry;
use crate::error::{RendererError, RendererResult};
use crate::frame_slots::{SlotCapacities, SlotShared};
use crate::ubo::InstanceData;
use crate::visibility::{IndirectDrawInfo, VisibilityProducer, describe_counts};

/// The commands one pass reads: `count` draws starting at `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassRange {
    pub offset: u32,
    pub count: u32,
}

impl PassRange {
    #[inline]
    pub fn end(&self) -> u32 {
        self.offset + self.count
    }

    /// Byte offset of the region in the indirect-command buffer.
    pub fn byte_offset(&self) -> u64 {
        u64::from(self.offset) * DrawIndexedIndirectCommand::SIZE
    }
}

/// Outcome of compiling one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub pass_ranges: [PassRange; PASS_COUNT],
    /// Draws the visibility snapshot asked for.
    pub requested_draws: u64,
    pub draws_written: u32,
    pub instances_written: u32,
    /// Draws left out because a region or the command buffer was full.
    pub dropped_draws: u32,
    /// Instances left out because the instance buffer was full.
    pub dropped_instances: u32,
}

impl CompileReport {
    /// The values written to the draw-count buffer.
    pub fn draw_counts(&self) -> [u32; PASS_COUNT] {
        self.pass_ranges.map(|range| range.count)
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped_draws > 0 || self.dropped_instances > 0
    }

    /// `CapacityExceeded` if anything was dropped.
    ///
    /// Truncation is not fatal: the frame still renders what fit.
    pub fn check(&self) -> RendererResult<()> {
        if self.dropped_instances > 0 {
            return Err(RendererError::CapacityExceeded {
                what: "instance data",
                requested: u64::from(self.instances_written) + u64::from(self.dropped_instances),
                capacity: u64::from(self.instances_written),
            });
        }
        if self.dropped_draws > 0 {
            return Err(RendererError::CapacityExceeded {
                what: "indirect draws",
                requested: self.requested_draws,
                capacity: u64::from(self.draws_written),
            });
        }
        Ok(())
    }
}

/// Order in which passes are granted command capacity when the frame asks
/// for more draws than fit. Color passes come before the depth prepass, so a
/// full buffer costs depth-only copies first.
const CAPACITY_PRIORITY: [Pass; PASS_COUNT] = [
    Pass::Opaque,
    Pass::DoubleSided,
    Pass::Transparent,
    Pass::DepthPrepass,
];

/// Split `max_draws` between passes in [`CAPACITY_PRIORITY`] order.
fn grant_capacity(requested: &[u32; PASS_COUNT], max_draws: u64) -> [u32; PASS_COUNT] {
    let mut remaining = max_draws;
    let mut granted = [0u32; PASS_COUNT];
    for pass in CAPACITY_PRIORITY {
        let p = pass.index();
        let take = u64::from(requested[p]).min(remaining);
        granted[p] = take as u32;
        remaining -= take;
    }
    granted
}

/// Builds draw commands and instance data on the CPU.
pub struct DrawCompiler {
    capacities: SlotCapacities,
    commands: Vec<DrawIndexedIndirectCommand>,
    instances: Vec<InstanceData>,
}

impl DrawCompiler {
    /// A compiler whose output never exceeds `capacities`.
    pub fn new(capacities: SlotCapacities) -> Self {
        Self {
            capacities,
            commands: Vec::with_capacity(capacities.max_draws as usize),
            instances: Vec::new(),
        }
    }

    /// Compile one frame. Never writes past either capacity.
    ///
    /// Primitives are visited in bind order. Each one with a visible
    /// instance gets one command per pass it belongs to, and each command
    /// appends its own run of instance records. When the frame asks for
    /// more commands than fit, color passes keep their draws and the depth
    /// prepass gives up its copies first. A command whose instances do not
    /// fit is dropped whole.
    pub fn compile(&mut self, info: &IndirectDrawInfo, registry: &BindingRegistry) -> CompileReport {
        let max_draws = u64::from(self.capacities.max_draws);
        let max_instances = self.capacities.max_instances as usize;

        // Region p is [start[p], end[p]), sized by the capacity granted to p
        let granted = grant_capacity(&info.pass_draw_counts, max_draws);
        let mut start = [0u32; PASS_COUNT];
        let mut end = [0u32; PASS_COUNT];
        let mut total = 0u32;
        for p in 0..PASS_COUNT {
            start[p] = total;
            total += granted[p];
            end[p] = total;
        }

        self.commands.clear();
        self.commands
            .resize(end[PASS_COUNT - 1] as usize, DrawIndexedIndirectCommand::default());
        self.instances.clear();

        let mut cursor = start;
        let mut dropped_draws = 0u32;
        let mut dropped_instances = 0u32;

        for prim in registry.primitives() {
            let visible = prim
                .instances
                .iter()
                .filter(|&&uid| info.is_visible(uid))
                .filter_map(|uid| registry.instance(*uid));
            let instance_count = visible.clone().count();
            if instance_count == 0 {
                continue;
            }

            for pass in prim.passes.iter() {
                let p = pass.index();
                if cursor[p] >= end[p] {
                    dropped_draws += 1;
                    continue;
                }
                let first_instance = self.instances.len();
                if first_instance + instance_count > max_instances {
                    dropped_draws += 1;
                    dropped_instances += instance_count as u32;
                    continue;
                }
                self.instances.extend(
                    visible
                        .clone()
                        .map(|record| InstanceData::new(record.world, record.material_index)),
                );
                self.commands[cursor[p] as usize] = DrawIndexedIndirectCommand {
                    index_count: prim.index_count,
                    instance_count: instance_count as u32,
                    first_index: prim.first_index,
                    vertex_offset: prim.vertex_offset,
                    first_instance: first_instance as u32,
                };
                cursor[p] += 1;
            }
        }

        let mut pass_ranges = [PassRange::default(); PASS_COUNT];
        for p in 0..PASS_COUNT {
            pass_ranges[p] = PassRange {
                offset: start[p],
                count: cursor[p] - start[p],
            };
        }
        CompileReport {
            pass_ranges,
            requested_draws: info.total_draws(),
            draws_written: pass_ranges.iter().map(|r| r.count).sum(),
            instances_written: self.instances.len() as u32,
            dropped_draws,
            dropped_instances,
        }
    }

    /// Commands from the last compile. Unused tail slots of a region are
    /// zeroed and never read, because the draw count stops before them.
    pub fn commands(&self) -> &[DrawIndexedIndirectCommand] {
        &self.commands
    }

    pub fn instances(&self) -> &[InstanceData] {
        &self.instances
    }
}

/// Where a slot is in its compile cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotPhase {
    Idle = 0,
    Compiling = 1,
    Published = 2,
}

impl SlotPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotPhase::Compiling,
            2 => SlotPhase::Published,
            _ => SlotPhase::Idle,
        }
    }
}

enum Job {
    Compile { slot: usize, camera: CameraMatrices },
    Shutdown,
}

type Publication = RendererResult<CompileReport>;

/// Handle to the draw compiler worker thread.
///
/// The render thread calls [`dispatch`](Self::dispatch) for a slot once it
/// has submitted the previous frame, then [`wait_published`](Self::wait_published)
/// for that slot before recording the frame that uses it.
pub struct IndirectDrawCompiler {
    jobs: Sender<Job>,
    published: Vec<Receiver<Publication>>,
    phases: Arc<Vec<AtomicU8>>,
    worker: Option<JoinHandle<()>>,
}

impl IndirectDrawCompiler {
    /// Start the worker thread for `slots`.
    ///
    /// `fence_timeout` bounds the worker's wait for a slot to retire before
    /// it writes into the slot's buffers.
    pub fn spawn<B: Backend>(
        backend: Arc<B>,
        slots: Vec<Arc<SlotShared<B>>>,
        registry: Arc<RwLock<BindingRegistry>>,
        producer: Box<dyn VisibilityProducer>,
        capacities: SlotCapacities,
        fence_timeout: Duration,
    ) -> RendererResult<Self> {
        let (jobs, job_queue) = crossbeam_channel::unbounded();
        let (publishers, published): (Vec<_>, Vec<_>) = slots
            .iter()
            .map(|_| crossbeam_channel::bounded::<Publication>(1))
            .unzip();
        let phases: Arc<Vec<AtomicU8>> = Arc::new(
            slots
                .iter()
                .map(|_| AtomicU8::new(SlotPhase::Idle as u8))
                .collect(),
        );

        let worker = Worker {
            backend,
            slots,
            registry,
            producer,
            compiler: DrawCompiler::new(capacities),
            fence_timeout,
            publishers,
            phases: Arc::clone(&phases),
        };
        let handle = std::thread::Builder::new()
            .name("lumen-draw-compiler".into())
            .spawn(move || worker.run(job_queue))
            .map_err(RendererError::Spawn)?;

        Ok(Self {
            jobs,
            published,
            phases,
            worker: Some(handle),
        })
    }

    /// Queue a compile of `slot` against `camera`.
    ///
    /// # Errors
    ///
    /// `InvalidUsage` if the slot already has a compile that has not been
    /// collected with [`wait_published`](Self::wait_published).
    pub fn dispatch(&self, slot: usize, camera: CameraMatrices) -> RendererResult<()> {
        let phase = self.phase_cell(slot)?;
        phase
            .compare_exchange(
                SlotPhase::Idle as u8,
                SlotPhase::Compiling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| {
                RendererError::InvalidUsage(format!(
                    "slot {} dispatched while {:?}",
                    slot,
                    SlotPhase::from_u8(current)
                ))
            })?;
        if self.jobs.send(Job::Compile { slot, camera }).is_err() {
            phase.store(SlotPhase::Idle as u8, Ordering::Release);
            return Err(RendererError::CompilerDisconnected);
        }
        trace!("Compile dispatched for slot {}", slot);
        Ok(())
    }

    /// Block until `slot`'s compile is published and return its report.
    ///
    /// Returns the slot to [`SlotPhase::Idle`], so the next
    /// [`dispatch`](Self::dispatch) for it is accepted. A report describing
    /// truncation is still `Ok`; see [`CompileReport::check`].
    ///
    /// # Errors
    ///
    /// - `InvalidUsage` if nothing was dispatched for `slot`.
    /// - `SubmissionTimeout` if the worker does not publish within
    ///   `timeout`. The worker blocks on the slot fence, so this usually
    ///   means the GPU is hung.
    /// - `CompilerDisconnected` if the worker thread has exited.
    /// - Whatever the worker hit while writing the slot's buffers.
    pub fn wait_published(&self, slot: usize, timeout: Duration) -> RendererResult<CompileReport> {
        let phase = self.phase_cell(slot)?;
        if SlotPhase::from_u8(phase.load(Ordering::Acquire)) == SlotPhase::Idle {
            return Err(RendererError::InvalidUsage(format!(
                "slot {} has no compile to wait for",
                slot
            )));
        }
        match self.published[slot].recv_timeout(timeout) {
            Ok(publication) => {
                phase.store(SlotPhase::Idle as u8, Ordering::Release);
                publication
            }
            Err(RecvTimeoutError::Timeout) => Err(RendererError::SubmissionTimeout {
                slot,
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(RendererError::CompilerDisconnected),
        }
    }

    /// Current phase of `slot`, or `None` if the slot does not exist.
    pub fn phase(&self, slot: usize) -> Option<SlotPhase> {
        self.phases
            .get(slot)
            .map(|cell| SlotPhase::from_u8(cell.load(Ordering::Acquire)))
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.jobs.send(Job::Shutdown);
        if worker.join().is_err() {
            error!("Draw compiler thread panicked");
        }
    }

    fn phase_cell(&self, slot: usize) -> RendererResult<&AtomicU8> {
        self.phases.get(slot).ok_or_else(|| {
            RendererError::InvalidUsage(format!(
                "slot {} out of range ({} slots)",
                slot,
                self.phases.len()
            ))
        })
    }
}

impl Drop for IndirectDrawCompiler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<B: Backend> {
    backend: Arc<B>,
    slots: Vec<Arc<SlotShared<B>>>,
    registry: Arc<RwLock<BindingRegistry>>,
    producer: Box<dyn VisibilityProducer>,
    compiler: DrawCompiler,
    fence_timeout: Duration,
    publishers: Vec<Sender<Publication>>,
    phases: Arc<Vec<AtomicU8>>,
}

impl<B: Backend> Worker<B> {
    fn run(mut self, jobs: Receiver<Job>) {
        debug!("Draw compiler thread started");
        while let Ok(job) = jobs.recv() {
            match job {
                Job::Shutdown => break,
                Job::Compile { slot, camera } => {
                    let publication = self.compile(slot, &camera);
                    if let Err(err) = &publication {
                        warn!("Compile for slot {} failed: {}", slot, err);
                    }
                    self.phases[slot].store(SlotPhase::Published as u8, Ordering::Release);
                    // the receiver is gone only while the renderer shuts down
                    let _ = self.publishers[slot].send(publication);
                }
            }
        }
        debug!("Draw compiler thread stopped");
    }

    fn compile(&mut self, slot: usize, camera: &CameraMatrices) -> Publication {
        let shared = &self.slots[slot];
        // The slot's buffers are read by its last submission until it retires
        if !self.backend.wait_fence(&shared.fence, self.fence_timeout)? {
            return Err(RendererError::SubmissionTimeout {
                slot,
                waited: self.fence_timeout,
            });
        }

        let report = {
            let registry = self.registry.read();
            let info = self.producer.produce(&registry, camera);
            self.compiler.compile(&info, &registry)
        };

        self.backend.write_buffer(
            shared.draw_counts.raw(),
            0,
            bytemuck::cast_slice(&report.draw_counts()),
        )?;
        let commands = self.compiler.commands();
        if !commands.is_empty() {
            self.backend
                .write_buffer(shared.draw_commands.raw(), 0, bytemuck::cast_slice(commands))?;
        }
        let instances = self.compiler.instances();
        if !instances.is_empty() {
            self.backend
                .write_buffer(shared.instances.raw(), 0, bytemuck::cast_slice(instances))?;
        }

        if let Err(err) = report.check() {
            warn!("Slot {} truncated: {}", slot, err);
        }
        trace!(
            "Slot {} compiled: {} ({} instances)",
            slot,
            describe_counts(&report.draw_counts()),
            report.instances_written
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use lumen_resources::{InstanceDesc, Material, ModelData, ModelId, PassSet};

    use super::*;
    use crate::visibility::AllVisible;

    const CAPS: SlotCapacities = SlotCapacities {
        max_draws: 64,
        max_instances: 64,
    };

    fn cube(id: u64, passes: &[Pass], instances: usize) -> ModelData {
        ModelData::cube(
            ModelId(id),
            Material::opaque(id as u32).with_passes(PassSet::of(passes)),
            vec![InstanceDesc::default(); instances],
        )
    }

    fn compile(registry: &BindingRegistry, caps: SlotCapacities) -> (DrawCompiler, CompileReport) {
        let info = AllVisible.produce(registry, &CameraMatrices::default());
        let mut compiler = DrawCompiler::new(caps);
        let report = compiler.compile(&info, registry);
        (compiler, report)
    }

    #[test]
    fn regions_follow_prefix_sums() {
        let mut registry = BindingRegistry::new(1000, 1000);
        registry.insert(&cube(1, &[Pass::DepthPrepass, Pass::Opaque], 1)).unwrap();
        registry.insert(&cube(2, &[Pass::DepthPrepass, Pass::Transparent], 1)).unwrap();
        registry.insert(&cube(3, &[Pass::DepthPrepass], 1)).unwrap();

        let (compiler, report) = compile(&registry, CAPS);
        assert_eq!(report.draw_counts(), [3, 1, 0, 1]);
        assert_eq!(
            report.pass_ranges,
            [
                PassRange { offset: 0, count: 3 },
                PassRange { offset: 3, count: 1 },
                PassRange { offset: 4, count: 0 },
                PassRange { offset: 4, count: 1 },
            ]
        );
        assert_eq!(compiler.commands().len(), 5);
        report.check().unwrap();

        // prepass commands keep bind order
        let prepass: Vec<i32> = compiler.commands()[..3]
            .iter()
            .map(|c| c.vertex_offset)
            .collect();
        assert_eq!(prepass, vec![0, 24, 48]);
    }

    #[test]
    fn each_pass_copy_gets_its_own_instances() {
        let mut registry = BindingRegistry::new(1000, 1000);
        registry.insert(&cube(1, &[Pass::DepthPrepass, Pass::Opaque], 2)).unwrap();

        let (compiler, report) = compile(&registry, CAPS);
        let commands = compiler.commands();
        assert_eq!(commands[0].first_instance, 0);
        assert_eq!(commands[0].instance_count, 2);
        assert_eq!(commands[1].first_instance, 2);
        assert_eq!(report.instances_written, 4);
        assert_eq!(compiler.instances()[3].material_index, 1);
    }

    #[test]
    fn draws_past_capacity_are_dropped() {
        let mut registry = BindingRegistry::new(1000, 1000);
        for id in 0..3 {
            registry.insert(&cube(id, &[Pass::DepthPrepass, Pass::Opaque], 1)).unwrap();
        }
        let caps = SlotCapacities {
            max_draws: 4,
            max_instances: 64,
        };
        let (compiler, report) = compile(&registry, caps);
        assert_eq!(report.draw_counts(), [1, 3, 0, 0]);
        assert_eq!(report.dropped_draws, 2);
        assert_eq!(compiler.commands().len(), 4);
        assert!(report.pass_ranges.iter().all(|r| r.end() <= 4));
        assert!(matches!(
            report.check(),
            Err(RendererError::CapacityExceeded { what: "indirect draws", requested: 6, capacity: 4 })
        ));
    }

    #[test]
    fn color_passes_get_capacity_before_the_prepass() {
        let mut registry = BindingRegistry::new(1000, 1000);
        for id in 0..4 {
            registry
                .insert(&ModelData::cube(
                    ModelId(id),
                    Material::opaque(0),
                    vec![InstanceDesc::default()],
                ))
                .unwrap();
        }
        let caps = SlotCapacities {
            max_draws: 4,
            max_instances: 64,
        };
        let (compiler, report) = compile(&registry, caps);
        assert_eq!(report.draw_counts(), [0, 4, 0, 0]);
        assert_eq!(report.pass_ranges[1], PassRange { offset: 0, count: 4 });
        assert_eq!(report.dropped_draws, 4);
        assert!(compiler.commands().iter().all(|c| c.instance_count == 1));
    }

    #[test]
    fn capacity_left_over_goes_to_the_prepass() {
        let granted = grant_capacity(&[5, 2, 1, 1], 6);
        assert_eq!(granted, [2, 2, 1, 1]);
        assert_eq!(grant_capacity(&[5, 2, 1, 1], 100), [5, 2, 1, 1]);
        assert_eq!(grant_capacity(&[5, 2, 1, 1], 0), [0; PASS_COUNT]);
    }

    #[test]
    fn instance_overflow_drops_whole_draws() {
        let mut registry = BindingRegistry::new(1000, 1000);
        registry.insert(&cube(1, &[Pass::Opaque], 3)).unwrap();
        registry.insert(&cube(2, &[Pass::Opaque], 2)).unwrap();
        let caps = SlotCapacities {
            max_draws: 64,
            max_instances: 4,
        };
        let (compiler, report) = compile(&registry, caps);
        assert_eq!(report.draw_counts(), [0, 1, 0, 0]);
        assert_eq!(report.instances_written, 3);
        assert_eq!(report.dropped_instances, 2);
        assert_eq!(compiler.instances().len(), 3);
        assert!(report.is_truncated());
    }

    #[test]
    fn empty_scene_compiles_to_nothing() {
        let registry = BindingRegistry::new(16, 16);
        let (compiler, report) = compile(&registry, CAPS);
        assert_eq!(report.draw_counts(), [0; PASS_COUNT]);
        assert!(compiler.commands().is_empty());
        report.check().unwrap();
    }

    #[test]
    fn phase_round_trips_through_u8() {
        for phase in [SlotPhase::Idle, SlotPhase::Compiling, SlotPhase::Published] {
            assert_eq!(SlotPhase::from_u8(phase as u8), phase);
        }
    }
}
