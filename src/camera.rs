// =============================================================================
// CAMERA - Per-frame uniform matrices
// =============================================================================
//
// Fixed camera looking at a model spinning about +Z.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use crate::config::CameraConfig;

/// Uniform block at binding 0, matching the vertex shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Matrices for `elapsed` seconds since startup at the given aspect ratio
    pub fn new(elapsed: f32, aspect: f32, camera: &CameraConfig) -> Self {
        let angle = (elapsed * camera.rotation_degrees_per_second).to_radians();
        let model = Mat4::from_rotation_z(angle);

        let view = Mat4::look_at_rh(
            Vec3::from(camera.eye),
            Vec3::from(camera.target),
            Vec3::from(camera.up),
        );

        // Depth 0..1; clip space Y points down in Vulkan
        let mut proj = Mat4::perspective_rh(
            camera.fov_degrees.to_radians(),
            aspect,
            camera.near,
            camera.far,
        );
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 192);
    }

    #[test]
    fn model_starts_unrotated() {
        let ubo = UniformBufferObject::new(0.0, 4.0 / 3.0, &CameraConfig::default());
        assert!(ubo.model.abs_diff_eq(Mat4::IDENTITY, EPSILON));
    }

    #[test]
    fn model_turns_quarter_after_one_second() {
        let ubo = UniformBufferObject::new(1.0, 4.0 / 3.0, &CameraConfig::default());
        let turned = ubo.model.transform_vector3(Vec3::X);
        assert!(turned.abs_diff_eq(Vec3::Y, EPSILON));
    }

    #[test]
    fn view_moves_eye_to_origin() {
        let camera = CameraConfig::default();
        let ubo = UniformBufferObject::new(0.0, 1.0, &camera);
        let eye = ubo.view.transform_point3(Vec3::from(camera.eye));
        assert!(eye.abs_diff_eq(Vec3::ZERO, EPSILON));

        // Target lies straight ahead, down -Z
        let target = ubo.view.transform_point3(Vec3::from(camera.target));
        assert!(target.x.abs() < EPSILON && target.y.abs() < EPSILON);
        assert!(target.z < 0.0);
    }

    #[test]
    fn projection_flips_y_and_maps_depth_to_unit_range() {
        let camera = CameraConfig::default();
        let ubo = UniformBufferObject::new(0.0, 1.0, &camera);
        assert!(ubo.proj.y_axis.y < 0.0);

        let near = ubo.proj * Vec4::new(0.0, 0.0, -camera.near, 1.0);
        let far = ubo.proj * Vec4::new(0.0, 0.0, -camera.far, 1.0);
        assert!((near.z / near.w).abs() < EPSILON);
        assert!((far.z / far.w - 1.0).abs() < EPSILON);

        // A point above the axis lands in the top half, which is -Y in Vulkan
        let above = ubo.proj * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(above.y / above.w < 0.0);
    }
}
