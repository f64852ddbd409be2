use ultraviolet::{projection, Mat4, Rotor3, Vec3};

use crate::{config_loader::CameraPosition, gpu::Extent};

/// A pinhole camera looking down its local -Z axis with +Y up.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    /// Rotates camera space into world space.
    pub orientation: Rotor3,
    pub settings: CameraSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub z_near: f32,
    pub z_far: f32,
    /// Vertical field of view in radians
    pub fov: f32,
    pub aspect_ratio: f32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            z_near: 0.01,
            z_far: 10_000.0,
            fov: std::f32::consts::FRAC_PI_2,
            aspect_ratio: 16.0 / 9.0,
        }
    }
}

impl Camera {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            position: Vec3::zero(),
            orientation: Rotor3::identity(),
            settings,
        }
    }

    /// Restores the pose saved in the config file.
    pub fn from_cached(settings: CameraSettings, cached: &CameraPosition) -> Self {
        Self {
            position: cached.position,
            orientation: Rotor3::from_euler_angles(0.0, cached.pitch, cached.yaw),
            settings,
        }
    }

    /// World to camera.
    pub fn view_matrix(&self) -> Mat4 {
        let rotation = self.orientation.reversed().into_matrix().into_homogeneous();
        rotation * Mat4::from_translation(-self.position)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        let settings = &self.settings;
        projection::rh_yup::perspective_vk(
            settings.fov,
            settings.aspect_ratio,
            settings.z_near,
            settings.z_far,
        )
    }

    /// Camera to world, the ray generation shaders start rays from here.
    pub fn inverse_view(&self) -> Mat4 {
        Mat4::from_translation(self.position) * self.orientation.into_matrix().into_homogeneous()
    }

    pub fn inverse_projection(&self) -> Mat4 {
        self.projection_matrix().inversed()
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// Matches the aspect ratio to `extent`. Degenerate extents keep the old one.
    pub fn set_extent(&mut self, extent: Extent) {
        if extent.height > 0 {
            self.settings.aspect_ratio = extent.width as f32 / extent.height as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_view_maps_origin_to_position() {
        let mut camera = Camera::new(CameraSettings::default());
        camera.set_position(Vec3::new(1.0, 2.0, 3.0));
        let origin = camera.inverse_view().transform_point3(Vec3::zero());
        assert!((origin - camera.position).mag() < 1e-5);
    }

    #[test]
    fn view_and_inverse_view_cancel() {
        let camera = Camera::from_cached(
            CameraSettings::default(),
            &CameraPosition {
                position: Vec3::new(-2.0, 0.5, 4.0),
                pitch: 0.3,
                yaw: 1.2,
            },
        );
        let point = Vec3::new(0.25, -1.0, 7.0);
        let back = camera
            .inverse_view()
            .transform_point3(camera.view_matrix().transform_point3(point));
        assert!((back - point).mag() < 1e-4);

        let forward = camera.inverse_view().transform_vec3(Vec3::new(0.0, 0.0, -1.0));
        assert!((forward.mag() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn extent_sets_aspect_ratio() {
        let mut camera = Camera::new(CameraSettings::default());
        camera.set_extent(Extent::new(200, 100));
        assert_eq!(camera.settings.aspect_ratio, 2.0);
        camera.set_extent(Extent::new(200, 0));
        assert_eq!(camera.settings.aspect_ratio, 2.0);
    }
}
