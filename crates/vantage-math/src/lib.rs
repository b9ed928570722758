// SPDX-License-Identifier: CEPL-1.0
//! Scene math: camera, model animation and the per-frame uniform record.
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

pub use glam;

pub const FOV_Y_DEGREES: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 50.0;
/// Model spin around +Y.
pub const ROTATION_DEGREES_PER_SEC: f32 = 30.0;

/// Model/view/projection as consumed by the vertex stage (binding 0).
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformData {
    pub model: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for UniformData {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// World units per second.
    pub speed: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(10.0, 5.0, 10.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            speed: 5.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Translate position and target together. `forward`/`right` are axis
    /// inputs in [-1, 1]; the look direction never changes.
    pub fn move_by(&mut self, forward: f32, right: f32, dt: f32) {
        let dir = (self.target - self.position).normalize_or_zero();
        let side = dir.cross(self.up).normalize_or_zero();
        let step = (dir * forward + side * right) * self.speed * dt;
        self.position += step;
        self.target += step;
    }
}

/// Vulkan-style perspective: right handed, depth in [0,1], Y pointing down
/// in clip space.
pub fn vulkan_perspective(aspect: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR);
    proj.y_axis.y *= -1.0;
    proj
}

#[derive(Clone, Debug)]
pub struct Scene {
    pub camera: Camera,
    elapsed: f32,
    aspect: f32,
    model: Mat4,
    projection: Mat4,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new(Camera::default())
    }
}

impl Scene {
    pub fn new(camera: Camera) -> Self {
        let aspect = 800.0 / 600.0;
        Self {
            camera,
            elapsed: 0.0,
            aspect,
            model: Mat4::IDENTITY,
            projection: vulkan_perspective(aspect),
        }
    }

    /// Recompute the projection for a new drawable size. A zero height is
    /// ignored (minimised window).
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.aspect = width as f32 / height as f32;
        self.projection = vulkan_perspective(self.aspect);
    }

    pub fn update(&mut self, dt: f32) {
        self.elapsed += dt.max(0.0);
        let angle = (ROTATION_DEGREES_PER_SEC * self.elapsed).to_radians();
        self.model = Mat4::from_rotation_y(angle);
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    pub fn uniforms(&self) -> UniformData {
        UniformData {
            model: self.model,
            view: self.camera.view(),
            projection: self.projection,
        }
    }
}
