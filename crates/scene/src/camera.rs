//! Camera for the frame pipeline.

use glam::{Mat4, Quat, Vec3};

use crate::bounds::Frustum;

/// Projection type for the camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
}

/// Matrices captured from a camera at one point in time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub position: Vec3,
}

impl CameraMatrices {
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection)
    }
}

impl Default for CameraMatrices {
    fn default() -> Self {
        Camera::default().matrices()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub rotation: Quat,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            rotation: Quat::IDENTITY,
            projection: Projection::Perspective {
                fov_y: 45.0_f32.to_radians(),
                aspect: 16.0 / 9.0,
                near: 0.1,
                far: 1000.0,
            },
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            },
            ..Self::default()
        }
    }

    pub fn set_orthographic(
        &mut self,
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    ) {
        self.projection = Projection::Orthographic {
            left,
            right,
            bottom,
            top,
            near,
            far,
        };
    }

    /// Update the aspect ratio. No-op for orthographic projections.
    pub fn set_aspect(&mut self, aspect: f32) {
        if let Projection::Perspective {
            aspect: ref mut current,
            ..
        } = self.projection
            && aspect.is_finite()
            && aspect > 0.0
        {
            *current = aspect;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y)
    }

    /// Projection matrix with the Y axis flipped for Vulkan clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = match self.projection {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => Mat4::orthographic_rh(left, right, bottom, top, near, far),
        };
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn matrices(&self) -> CameraMatrices {
        let view = self.view_matrix();
        let projection = self.projection_matrix();
        CameraMatrices {
            view,
            projection,
            view_projection: projection * view,
            position: self.position,
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

    pub fn look_at(&mut self, target: Vec3) {
        let forward = (target - self.position).normalize_or_zero();
        if forward != Vec3::ZERO {
            self.rotation = Quat::from_rotation_arc(Vec3::NEG_Z, forward);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = Camera::default();
        let unflipped = Mat4::perspective_rh(45.0_f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0);
        let proj = camera.projection_matrix();
        assert_eq!(proj.y_axis.y, -unflipped.y_axis.y);
        assert_eq!(proj.x_axis.x, unflipped.x_axis.x);
    }

    #[test]
    fn look_at_points_forward_at_target() {
        let mut camera = Camera::default();
        camera.position = Vec3::new(0.0, 0.0, 10.0);
        camera.look_at(Vec3::new(10.0, 0.0, 10.0));
        assert!((camera.forward() - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn look_at_own_position_keeps_rotation() {
        let mut camera = Camera::default();
        camera.look_at(camera.position);
        assert_eq!(camera.rotation, Quat::IDENTITY);
    }

    #[test]
    fn aspect_is_ignored_when_invalid() {
        let mut camera = Camera::perspective(1.0, 1.0, 0.1, 10.0);
        camera.set_aspect(0.0);
        camera.set_aspect(f32::NAN);
        camera.set_aspect(2.0);
        match camera.projection {
            Projection::Perspective { aspect, .. } => assert_eq!(aspect, 2.0),
            Projection::Orthographic { .. } => panic!("projection changed kind"),
        }
    }

    #[test]
    fn matrices_are_consistent() {
        let mut camera = Camera::default();
        camera.look_at(Vec3::new(1.0, 2.0, 0.0));
        let m = camera.matrices();
        assert_eq!(m.view_projection, m.projection * m.view);
        assert_eq!(m.position, camera.position);
    }

    #[test]
    fn origin_projects_in_front_of_default_camera() {
        let clip = Camera::default()
            .view_projection_matrix()
            .project_point3(Vec3::ZERO);
        assert!(clip.z > 0.0 && clip.z < 1.0);
        assert!(clip.x.abs() < 1e-5 && clip.y.abs() < 1e-5);
    }
}
