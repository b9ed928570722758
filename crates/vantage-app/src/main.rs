// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use vantage_core::{init_tracing, TracingDiagnostics};
use vantage_math::{glam::Vec3, Camera};
use vantage_render::{RenderSize, Renderer};
use vantage_render_vk::{EngineConfig, ShaderSet, VkRenderer};

use vantage_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg(long, default_value = "vantage.toml")]
    config: PathBuf,
    /// Force the Khronos validation layer on
    #[arg(long)]
    validation: bool,
    #[arg(long)]
    frames_in_flight: Option<usize>,
    /// Directory holding vertex.vert.spv and fragment.frag.spv
    #[arg(long)]
    shader_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct WindowCfg {
    title: String,
    width: u32,
    height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: "vantage".into(),
            width: 800,
            height: 600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct RenderCfg {
    clear_color: [f32; 4],
    frames_in_flight: usize,
    validation: bool,
    /// 0 waits forever.
    fence_timeout_ms: u64,
    shader_dir: Option<PathBuf>,
    max_consecutive_errors: u32,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            frames_in_flight: 2,
            validation: cfg!(debug_assertions),
            fence_timeout_ms: 0,
            shader_dir: None,
            max_consecutive_errors: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
struct CameraCfg {
    speed: f32,
    position: [f32; 3],
    target: [f32; 3],
}

impl Default for CameraCfg {
    fn default() -> Self {
        let c = Camera::default();
        CameraCfg {
            speed: c.speed,
            position: c.position.to_array(),
            target: c.target.to_array(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
struct AppCfg {
    window: WindowCfg,
    render: RenderCfg,
    camera: CameraCfg,
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => AppCfg::default(),
    }
}

impl AppCfg {
    fn apply(&mut self, args: &Args) {
        if args.validation {
            self.render.validation = true;
        }
        if let Some(n) = args.frames_in_flight {
            self.render.frames_in_flight = n;
        }
        if let Some(dir) = &args.shader_dir {
            self.render.shader_dir = Some(dir.clone());
        }
    }

    fn engine_config(&self, size: RenderSize) -> EngineConfig {
        EngineConfig {
            frames_in_flight: self.render.frames_in_flight,
            validation: self.render.validation,
            fence_timeout: (self.render.fence_timeout_ms > 0)
                .then(|| Duration::from_millis(self.render.fence_timeout_ms)),
            clear_color: self.render.clear_color,
            initial_size: size,
            camera: Camera {
                position: Vec3::from_array(self.camera.position),
                target: Vec3::from_array(self.camera.target),
                speed: self.camera.speed,
                ..Camera::default()
            },
        }
    }

    fn shaders(&self) -> Result<ShaderSet> {
        match &self.render.shader_dir {
            Some(dir) => ShaderSet::from_dir(dir)
                .with_context(|| format!("loading shaders from {}", dir.display())),
            None => ShaderSet::builtin().context("built-in shaders"),
        }
    }
}

struct App {
    cfg: AppCfg,
    // renderer before window: the surface must go first
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    render_size: RenderSize,

    exiting: bool,
    paused: bool,
    held: HashSet<KeyCode>,
    last_tick: Instant,
    consecutive_errors: u32,

    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        let now = Instant::now();
        App {
            cfg,
            renderer: None,
            window: None,
            render_size: RenderSize::new(1, 1),
            exiting: false,
            paused: false,
            held: HashSet::new(),
            last_tick: now,
            consecutive_errors: 0,
            frames: 0,
            last_fps_instant: now,
        }
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    /// WASD as axis input in [-1, 1].
    fn camera_input(&self) -> (f32, f32) {
        let axis = |pos: KeyCode, neg: KeyCode| {
            f32::from(u8::from(self.held.contains(&pos))) - f32::from(u8::from(self.held.contains(&neg)))
        };
        (axis(KeyCode::KeyW, KeyCode::KeyS), axis(KeyCode::KeyD, KeyCode::KeyA))
    }

    fn create_renderer(&self, window: &Window) -> Result<VkRenderer> {
        let shaders = self.cfg.shaders()?;
        VkRenderer::new(
            window,
            self.cfg.engine_config(self.render_size),
            None,
            shaders,
            TracingDiagnostics::shared(),
        )
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let attrs = Window::default_attributes()
                .with_title(self.cfg.window.title.clone())
                .with_inner_size(vantage_platform::winit::dpi::PhysicalSize::new(
                    self.cfg.window.width,
                    self.cfg.window.height,
                ));
            let window = event_loop.create_window(attrs).expect("create_window");

            let size = window.inner_size();
            self.render_size = RenderSize::new(size.width, size.height);

            match self.create_renderer(&window) {
                Ok(renderer) => {
                    info!(
                        "vulkan ready: {}x{}, {} frame(s) in flight, validation={}",
                        self.render_size.width,
                        self.render_size.height,
                        self.cfg.render.frames_in_flight,
                        self.cfg.render.validation
                    );
                    self.renderer = Some(renderer);
                }
                Err(e) => {
                    error!("vk init failed: {e:#}");
                    self.exit(event_loop);
                    return;
                }
            }
            self.window = Some(window);
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        self.paused = self.render_size.is_empty();
        self.last_tick = Instant::now();
        info!("resumed → paused={}", self.paused);

        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exit(event_loop);
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        ..
                    },
                ..
            } => match (code, state) {
                (KeyCode::Escape, ElementState::Pressed) => {
                    info!("Escape");
                    self.exit(event_loop);
                }
                (_, ElementState::Pressed) => {
                    self.held.insert(code);
                }
                (_, ElementState::Released) => {
                    self.held.remove(&code);
                }
            },

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize::new(new_size.width, new_size.height);
                let now_paused = self.render_size.is_empty();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        self.render_size.width, self.render_size.height, self.paused
                    );
                }

                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.resize(self.render_size) {
                        error!("resize failed: {e:#}");
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }

                let now = Instant::now();
                let dt = now.duration_since(self.last_tick).as_secs_f32();
                self.last_tick = now;
                let (forward, right) = self.camera_input();

                let Some(renderer) = &mut self.renderer else {
                    return;
                };
                if forward != 0.0 || right != 0.0 {
                    renderer.move_camera(forward, right, dt);
                }

                match renderer.render() {
                    Ok(()) => {
                        self.consecutive_errors = 0;
                        self.frames = self.frames.saturating_add(1);
                    }
                    Err(e) => {
                        self.consecutive_errors += 1;
                        error!(
                            "render error ({}/{}): {e:#}",
                            self.consecutive_errors, self.cfg.render.max_consecutive_errors
                        );
                        if self.consecutive_errors >= self.cfg.render.max_consecutive_errors {
                            error!("too many consecutive render errors, exiting");
                            self.exit(event_loop);
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            // minimised → sleep until the next event
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            let stats = self
                .renderer
                .as_ref()
                .map(|r| r.frame_stats())
                .unwrap_or_default();
            info!(
                "fps ~ {} (last frame {:.2} ms)",
                self.frames, stats.frame_time_ms
            );
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    cfg.apply(&args);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
