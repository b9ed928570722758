// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic render contracts: surface size, geometry layout and the
//! renderer interface the app drives.
use anyhow::Result;

mod mesh;

pub use mesh::{Mesh, MeshError, Vertex};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimised window reports 0 on either axis.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Last-frame timing as reported by a renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frame_time_ms: f32,
    pub fps: f32,
}

/// Construction is backend specific; everything after that goes through here.
pub trait Renderer {
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);

    /// Camera input in [-1, 1] per axis, scaled by `dt` seconds.
    fn move_camera(&mut self, _forward: f32, _right: f32, _dt: f32) {}

    fn frame_stats(&self) -> FrameStats {
        FrameStats::default()
    }
}
