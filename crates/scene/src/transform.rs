//! Local transform of a scene node.
//!
//! A [`Transform`] is a plain value: position, rotation and scale relative
//! to the node's parent. Hierarchy lives in [`SceneGraph`](crate::SceneGraph),
//! which composes these into world matrices.
//!
//! # Example
//!
//! ```
//! use lumen_scene::Transform;
//! use glam::Vec3;
//!
//! let t = Transform::new()
//!     .with_position(Vec3::new(1.0, 0.0, 0.0))
//!     .with_scale(Vec3::splat(2.0));
//! let p = t.matrix().transform_point3(Vec3::ONE);
//! assert!((p - Vec3::new(3.0, 2.0, 2.0)).length() < 1e-5);
//! ```

use glam::{Mat4, Quat, Vec3};

/// Position, rotation and scale relative to the parent node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn new() -> Self {
        Self::IDENTITY
    }

    pub fn from_position(position: Vec3) -> Self {
        Self::IDENTITY.with_position(position)
    }

    /// Decompose an affine matrix. Shear is lost.
    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, position) = matrix.to_scale_rotation_translation();
        Self {
            position,
            rotation,
            scale,
        }
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Local-to-parent matrix (scale, then rotate, then translate).
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Inverse transpose of `matrix()`, identity when the transform is
    /// degenerate.
    pub fn normal_matrix(&self) -> Mat4 {
        const EPSILON: f32 = 1e-6;
        let model = self.matrix();
        if model.determinant().abs() < EPSILON {
            Mat4::IDENTITY
        } else {
            model.inverse().transpose()
        }
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    fn approx_eq_vec3(a: Vec3, b: Vec3) -> bool {
        (a - b).abs().max_element() < EPSILON
    }

    #[test]
    fn test_transform_default() {
        let t = Transform::default();
        assert_eq!(t.position, Vec3::ZERO);
        assert_eq!(t.rotation, Quat::IDENTITY);
        assert_eq!(t.scale, Vec3::ONE);
        assert_eq!(t.matrix(), Mat4::IDENTITY);
    }

    #[test]
    fn test_normal_matrix_with_scale() {
        let t = Transform::new().with_scale(Vec3::new(1.0, 2.0, 1.0));
        assert_eq!(t.normal_matrix(), t.matrix().inverse().transpose());
    }

    #[test]
    fn test_normal_matrix_non_invertible() {
        let t = Transform::new().with_scale(Vec3::ZERO);
        let normal = t.normal_matrix();
        assert_eq!(normal, Mat4::IDENTITY);
        assert!(!normal.is_nan());
    }

    #[test]
    fn test_direction_vectors() {
        let t = Transform::default();
        assert_eq!(t.forward(), Vec3::NEG_Z);
        assert_eq!(t.right(), Vec3::X);
        assert_eq!(t.up(), Vec3::Y);
    }

    #[test]
    fn test_scale_applies_before_translation() {
        let t = Transform::from_position(Vec3::new(10.0, 0.0, 0.0)).with_scale(Vec3::splat(3.0));
        let p = t.matrix().transform_point3(Vec3::X);
        assert!(approx_eq_vec3(p, Vec3::new(13.0, 0.0, 0.0)));
    }

    #[test]
    fn test_from_matrix_round_trips_trs() {
        let t = Transform::new()
            .with_position(Vec3::new(1.0, -2.0, 3.0))
            .with_rotation(Quat::from_rotation_y(0.5))
            .with_scale(Vec3::new(1.0, 2.0, 3.0));
        let back = Transform::from_matrix(t.matrix());
        assert!(approx_eq_vec3(back.position, t.position));
        assert!(approx_eq_vec3(back.scale, t.scale));
        assert!(back.rotation.abs_diff_eq(t.rotation, EPSILON));
    }
}
