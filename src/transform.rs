// Camera/scene transform shared between the session side and the render loop
//
// The session (network I/O thread) applies incremental deltas; the render
// thread takes one snapshot per frame and turns it into the uniform matrices.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::CameraConfig;

/// Smallest model scale the zoom can reach
const MIN_SCALE: f32 = 0.01;

/// Accumulated rotation (radians), translation and zoom
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transform {
    pub rotate_x: f32,
    pub rotate_y: f32,
    pub rotate_z: f32,
    pub translate_x: f32,
    pub translate_y: f32,
    pub translate_z: f32,
    pub zoom: f32,
}

/// Increment sent by a client; absent fields are zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransformDelta {
    pub rotate_x: f32,
    pub rotate_y: f32,
    pub rotate_z: f32,
    pub translate_x: f32,
    pub translate_y: f32,
    pub translate_z: f32,
    pub zoom: f32,
}

impl Transform {
    /// Add a delta to every component. No bounds are enforced.
    pub fn apply(&mut self, delta: &TransformDelta) {
        self.rotate_x += delta.rotate_x;
        self.rotate_y += delta.rotate_y;
        self.rotate_z += delta.rotate_z;
        self.translate_x += delta.translate_x;
        self.translate_y += delta.translate_y;
        self.translate_z += delta.translate_z;
        self.zoom += delta.zoom;
    }

    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.translate_x, self.translate_y, self.translate_z)
    }

    /// Uniform model scale derived from zoom
    pub fn scale(&self) -> f32 {
        (1.0 + self.zoom).max(MIN_SCALE)
    }

    /// Model matrix with an extra rotation around Z (the automatic spin)
    pub fn model_matrix(&self, spin: f32) -> Mat4 {
        Mat4::from_translation(self.translation())
            * Mat4::from_rotation_z(self.rotate_z + spin)
            * Mat4::from_rotation_y(self.rotate_y)
            * Mat4::from_rotation_x(self.rotate_x)
            * Mat4::from_scale(Vec3::splat(self.scale()))
    }
}

/// Cloneable handle to one engine's transform
#[derive(Debug, Clone, Default)]
pub struct TransformHandle {
    inner: Arc<Mutex<Transform>>,
}

impl TransformHandle {
    pub fn new(initial: Transform) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn apply(&self, delta: &TransformDelta) {
        self.inner.lock().apply(delta);
    }

    pub fn set(&self, transform: Transform) {
        *self.inner.lock() = transform;
    }

    /// Consistent copy for one frame
    pub fn snapshot(&self) -> Transform {
        *self.inner.lock()
    }
}

/// Matrices written to the uniform buffer before each submission
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformFrame {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformFrame {
    pub fn compose(transform: &Transform, camera: &CameraConfig, aspect: f32, spin: f32) -> Self {
        let view = Mat4::look_at_rh(
            Vec3::from(camera.eye),
            Vec3::from(camera.center),
            Vec3::from(camera.up),
        );

        let mut proj = Mat4::perspective_rh(
            camera.fov_y_degrees.to_radians(),
            aspect,
            camera.near,
            camera.far,
        );
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self {
            model: transform.model_matrix(spin),
            view,
            proj,
        }
    }

    pub fn clip_matrix(&self) -> Mat4 {
        self.proj * self.view * self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn deltas_accumulate() {
        let handle = TransformHandle::default();
        let delta = TransformDelta { rotate_x: 0.1, ..Default::default() };
        handle.apply(&delta);
        handle.apply(&delta);
        assert_eq!(handle.snapshot().rotate_x, 0.2);
        assert_eq!(handle.snapshot().rotate_y, 0.0);
    }

    #[test]
    fn handles_share_state() {
        let handle = TransformHandle::default();
        let other = handle.clone();
        other.apply(&TransformDelta { zoom: 0.5, ..Default::default() });
        assert_eq!(handle.snapshot().zoom, 0.5);
    }

    #[test]
    fn updates_from_another_thread_are_visible() {
        let handle = TransformHandle::default();
        let writer = handle.clone();
        std::thread::spawn(move || {
            for _ in 0..100 {
                writer.apply(&TransformDelta { translate_z: 1.0, ..Default::default() });
            }
        })
        .join()
        .unwrap();
        assert_eq!(handle.snapshot().translate_z, 100.0);
    }

    #[test]
    fn zoom_scale_never_collapses() {
        let transform = Transform { zoom: -5.0, ..Default::default() };
        assert_eq!(transform.scale(), MIN_SCALE);
    }

    fn default_frame() -> UniformFrame {
        UniformFrame::compose(&Transform::default(), &CameraConfig::default(), 4.0 / 3.0, 0.0)
    }

    #[test]
    fn partial_delta_deserializes_with_zero_defaults() {
        let delta: TransformDelta = toml::from_str("rotate_x = 0.1").unwrap();
        assert_eq!(
            delta,
            TransformDelta {
                rotate_x: 0.1,
                ..Default::default()
            }
        );

        let empty: TransformDelta = toml::from_str("").unwrap();
        assert_eq!(empty, TransformDelta::default());
    }

    #[test]
    fn identity_transform_gives_identity_model() {
        let frame = default_frame();
        assert!(frame.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn origin_projects_inside_the_viewport() {
        let frame = default_frame();
        let clip = frame.clip_matrix() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-5);
        assert!(ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn quad_corners_stay_on_screen() {
        let frame = default_frame();
        for corner in [[-0.5, -0.5], [0.5, -0.5], [0.5, 0.5], [-0.5, 0.5]] {
            let clip = frame.clip_matrix() * Vec4::new(corner[0], corner[1], 0.0, 1.0);
            let ndc = clip / clip.w;
            assert!(ndc.x.abs() < 1.0 && ndc.y.abs() < 1.0, "{:?} -> {:?}", corner, ndc);
        }
    }

    #[test]
    fn uniform_frame_is_three_mat4() {
        assert_eq!(std::mem::size_of::<UniformFrame>(), 192);
    }
}
