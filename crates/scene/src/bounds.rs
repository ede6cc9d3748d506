//! Bounding volumes and view frustum tests.

use glam::{Mat4, Vec3, Vec4};

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point. `None` for an empty iterator.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::new(first, first), |acc, p| Self {
            min: acc.min.min(p),
            max: acc.max.max(p),
        }))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// World-space box enclosing this box under `matrix`.
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let corners = self.corners().map(|c| matrix.transform_point3(c));
        // corners is never empty
        Self::from_points(corners).unwrap_or(*self)
    }
}

/// Six inward-facing planes `(n, d)` with `n·p + d >= 0` inside.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Extract planes from a clip matrix with a `[0, 1]` depth range.
    pub fn from_view_projection(m: Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| {
            let len = p.truncate().length();
            if len > 0.0 { p / len } else { p }
        });
        Self { planes }
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(p) + plane.w >= 0.0)
    }

    /// Conservative test: may report boxes near frustum corners as visible.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let n = plane.truncate();
            let positive = Vec3::select(n.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            n.dot(positive) + plane.w >= 0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Camera;

    #[test]
    fn from_points_encloses_all() {
        let aabb = Aabb::from_points([Vec3::X, Vec3::NEG_Y, Vec3::new(0.0, 0.0, 4.0)]).unwrap();
        assert_eq!(aabb.min, Vec3::new(0.0, -1.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 0.0, 4.0));
        assert!(Aabb::from_points(std::iter::empty()).is_none());
    }

    #[test]
    fn translation_moves_box() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let moved = aabb.transformed(&Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)));
        assert_eq!(moved.center(), Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(moved.half_extents(), Vec3::ONE);
    }

    #[test]
    fn frustum_accepts_box_in_front() {
        let frustum = Frustum::from_view_projection(Camera::default().view_projection_matrix());
        let aabb = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        assert!(frustum.contains_point(Vec3::ZERO));
        assert!(frustum.intersects_aabb(&aabb));
    }

    #[test]
    fn frustum_rejects_box_behind_and_beside() {
        let frustum = Frustum::from_view_projection(Camera::default().view_projection_matrix());
        let behind = Aabb::new(Vec3::new(-0.5, -0.5, 9.5), Vec3::new(0.5, 0.5, 10.5));
        let beside = Aabb::new(Vec3::new(99.0, -0.5, -0.5), Vec3::new(100.0, 0.5, 0.5));
        let beyond_far = Aabb::new(Vec3::new(-1.0, -1.0, -2000.0), Vec3::new(1.0, 1.0, -1990.0));
        assert!(!frustum.intersects_aabb(&behind));
        assert!(!frustum.intersects_aabb(&beside));
        assert!(!frustum.intersects_aabb(&beyond_far));
    }

    #[test]
    fn box_straddling_plane_is_visible() {
        let frustum = Frustum::from_view_projection(Camera::default().view_projection_matrix());
        let straddle = Aabb::new(Vec3::new(-100.0, -0.5, -0.5), Vec3::new(0.0, 0.5, 0.5));
        assert!(frustum.intersects_aabb(&straddle));
    }
}
