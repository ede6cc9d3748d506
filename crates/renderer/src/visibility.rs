//! Per-frame visibility snapshots consumed by the draw compiler.

use std::collections::HashSet;

use lumen_resources::{PASS_COUNT, Pass};
use lumen_scene::{CameraMatrices, Frustum};

use crate::binding::{BindingRegistry, InstanceUid, PrimitiveRef};

/// What the compiler needs to know about one frame before it writes draws.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndirectDrawInfo {
    /// Draws each pass needs: primitives with at least one visible instance.
    pub pass_draw_counts: [u32; PASS_COUNT],
    /// Instances drawn this frame. Sized by live instances, so long
    /// bind/unbind sessions do not grow the snapshot.
    pub visible: HashSet<InstanceUid>,
}

impl IndirectDrawInfo {
    pub fn total_draws(&self) -> u64 {
        self.pass_draw_counts.iter().map(|&c| u64::from(c)).sum()
    }

    #[inline]
    pub fn is_visible(&self, uid: InstanceUid) -> bool {
        self.visible.contains(&uid)
    }

    /// Visible instances of `primitive` under this snapshot.
    pub fn visible_instances(&self, primitive: &PrimitiveRef<'_>) -> usize {
        primitive
            .instances
            .iter()
            .filter(|&&uid| self.is_visible(uid))
            .count()
    }

    /// Fill the pass counts from `visible`.
    fn count_passes(&mut self, registry: &BindingRegistry) {
        self.pass_draw_counts = [0; PASS_COUNT];
        for prim in registry.primitives() {
            if self.visible_instances(&prim) == 0 {
                continue;
            }
            for pass in prim.passes.iter() {
                self.pass_draw_counts[pass.index()] += 1;
            }
        }
    }
}

/// Decides which instances a frame draws.
pub trait VisibilityProducer: Send + 'static {
    fn produce(&mut self, registry: &BindingRegistry, camera: &CameraMatrices) -> IndirectDrawInfo;
}

/// Draws every instance marked visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllVisible;

impl VisibilityProducer for AllVisible {
    fn produce(&mut self, registry: &BindingRegistry, _camera: &CameraMatrices) -> IndirectDrawInfo {
        let mut info = IndirectDrawInfo {
            pass_draw_counts: [0; PASS_COUNT],
            visible: HashSet::with_capacity(registry.instance_count()),
        };
        for prim in registry.primitives() {
            for uid in prim.instances {
                if registry.instance(*uid).is_some_and(|record| record.visible) {
                    info.visible.insert(*uid);
                }
            }
        }
        info.count_passes(registry);
        info
    }
}

/// Drops instances whose world-space bounds fall outside the view frustum.
///
/// Primitives without bounds are never culled.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrustumCuller {
    culled_last_frame: usize,
}

impl FrustumCuller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn culled_last_frame(&self) -> usize {
        self.culled_last_frame
    }
}

impl VisibilityProducer for FrustumCuller {
    fn produce(&mut self, registry: &BindingRegistry, camera: &CameraMatrices) -> IndirectDrawInfo {
        let frustum: Frustum = camera.frustum();
        let mut info = IndirectDrawInfo {
            pass_draw_counts: [0; PASS_COUNT],
            visible: HashSet::with_capacity(registry.instance_count()),
        };
        let mut culled = 0;
        for prim in registry.primitives() {
            for uid in prim.instances {
                let Some(record) = registry.instance(*uid) else {
                    continue;
                };
                if !record.visible {
                    continue;
                }
                let inside = prim.bounds.is_none_or(|bounds| {
                    frustum.intersects_aabb(&bounds.transformed(&record.world))
                });
                if inside {
                    info.visible.insert(*uid);
                } else {
                    culled += 1;
                }
            }
        }
        info.count_passes(registry);
        self.culled_last_frame = culled;
        info
    }
}

/// Pass counts for a snapshot, in pipeline order. Used in log lines.
pub fn describe_counts(counts: &[u32; PASS_COUNT]) -> String {
    Pass::ALL
        .iter()
        .map(|pass| format!("{}={}", pass, counts[pass.index()]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};
    use lumen_resources::{InstanceDesc, Material, ModelData, ModelId, PassSet};
    use lumen_scene::Camera;

    use super::*;

    #[test]
    fn counts_primitives_with_a_visible_instance() {
        let mut registry = BindingRegistry::new(1000, 1000);
        // two instances, one hidden: still one draw per pass
        let first = registry
            .insert(&ModelData::cube(
                ModelId(1),
                Material::opaque(0),
                vec![InstanceDesc::default(), InstanceDesc::default().hidden()],
            ))
            .unwrap();
        // only hidden instances: no draws
        registry
            .insert(&ModelData::cube(
                ModelId(2),
                Material::opaque(0),
                vec![InstanceDesc::default().hidden()],
            ))
            .unwrap();
        let quad = registry
            .insert(&ModelData::quad(
                ModelId(3),
                Material::transparent(1),
                vec![InstanceDesc::default()],
            ))
            .unwrap();

        let info = AllVisible.produce(&registry, &CameraMatrices::default());
        assert_eq!(info.pass_draw_counts, [1, 1, 0, 1]);
        let first = registry.instances_of(first).unwrap();
        let quad = registry.instances_of(quad).unwrap();
        assert_eq!(info.visible, HashSet::from([first[0], quad[0]]));
        assert_eq!(info.total_draws(), 3);
        assert_eq!(
            describe_counts(&info.pass_draw_counts),
            "depth-prepass=1 opaque=1 double-sided=0 transparent=1"
        );
    }

    #[test]
    fn frustum_culler_drops_instances_behind_the_camera() {
        let mut registry = BindingRegistry::new(1000, 1000);
        let material = Material::opaque(0).with_passes(PassSet::of(&[Pass::Opaque]));
        let handle = registry
            .insert(&ModelData::cube(
                ModelId(1),
                material,
                vec![
                    InstanceDesc::at(Mat4::IDENTITY),
                    InstanceDesc::at(Mat4::from_translation(Vec3::new(0.0, 0.0, 20.0))),
                ],
            ))
            .unwrap();

        let mut culler = FrustumCuller::new();
        let info = culler.produce(&registry, &Camera::default().matrices());
        let uids = registry.instances_of(handle).unwrap();
        assert!(info.is_visible(uids[0]));
        assert!(!info.is_visible(uids[1]));
        assert_eq!(info.pass_draw_counts, [0, 1, 0, 0]);
        assert_eq!(culler.culled_last_frame(), 1);
    }
}
