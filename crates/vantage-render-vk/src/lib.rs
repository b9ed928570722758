// SPDX-License-Identifier: CEPL-1.0
//! Vulkan orchestration: device bootstrap, swapchain, render targets,
//! pipeline, commands, buffers and frame synchronization, driven by the
//! [`Engine`] lifecycle. All driver calls go through the [`Gpu`] seam.
use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use vantage_core::{DiagnosticsExt, SharedDiagnostics};
use vantage_render::{FrameStats, Mesh, RenderSize, Renderer};

pub mod backend;
pub mod buffer;
pub mod command;
pub mod device;
pub mod engine;
mod error;
pub mod gpu;
pub mod pipeline;
pub mod render_target;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod mock;

pub use backend::AshGpu;
pub use engine::{Engine, EngineConfig, FrameOutcome, LifecycleState};
pub use error::{VkError, VkResultExt, VALIDATION_LAYER};
pub use gpu::Gpu;
pub use pipeline::ShaderSet;

/// [`Renderer`] over the real driver.
pub struct VkRenderer {
    engine: Engine<AshGpu>,
    diag: SharedDiagnostics,
    last_outcome: Option<FrameOutcome>,
}

impl VkRenderer {
    /// Bootstraps the full lifecycle against `window`, which must outlive
    /// the renderer.
    pub fn new(
        window: &(impl HasWindowHandle + HasDisplayHandle),
        config: EngineConfig,
        mesh: Option<Mesh>,
        shaders: ShaderSet,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        let gpu = AshGpu::from_window(window, diag.clone()).context("window handles")?;
        let mut engine =
            Engine::new(gpu, config, mesh, shaders, diag.clone()).context("engine config")?;
        engine.bootstrap().context("vulkan bootstrap")?;
        Ok(Self {
            engine,
            diag,
            last_outcome: None,
        })
    }

    pub fn engine(&self) -> &Engine<AshGpu> {
        &self.engine
    }

    pub fn last_outcome(&self) -> Option<FrameOutcome> {
        self.last_outcome
    }

    pub fn frame_count(&self) -> u64 {
        self.engine.frame_count()
    }
}

impl Renderer for VkRenderer {
    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.engine
            .handle_resize(size)
            .with_context(|| format!("resize to {}x{}", size.width, size.height))
    }

    fn render(&mut self) -> Result<()> {
        let outcome = self.engine.render()?;
        if outcome != FrameOutcome::Presented && self.last_outcome != Some(outcome) {
            self.diag.debug("renderer", format!("frame outcome {outcome:?}"));
        }
        self.last_outcome = Some(outcome);
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.engine.set_clear_color(rgba);
    }

    fn move_camera(&mut self, forward: f32, right: f32, dt: f32) {
        self.engine.move_camera(forward, right, dt);
    }

    fn frame_stats(&self) -> FrameStats {
        self.engine.frame_stats()
    }
}
