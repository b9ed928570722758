// SPDX-License-Identifier: CEPL-1.0
//! Lifecycle state machine and the per-frame loop that drive every other
//! component.
use std::time::{Duration, Instant};

use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};
use vantage_math::{Camera, Scene, UniformData};
use vantage_render::{FrameStats, Mesh, RenderSize};

use crate::buffer::{BufferUsage, FrameDescriptors, GpuBuffer, MemoryVisibility};
use crate::command::{CommandRecorder, FrameCommands};
use crate::device::DeviceContext;
use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::Gpu;
use crate::pipeline::{GraphicsPipeline, ShaderSet};
use crate::render_target::{find_depth_format, RenderTarget};
use crate::swapchain::SwapchainManager;
use crate::sync::{AcquireOutcome, FrameWait, PresentOutcome, SyncManager};

const COMPONENT: &str = "engine";

/// Bootstrap walks these forward, teardown walks them back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    NotInitialized,
    Context,
    Surface,
    Device,
    Swapchain,
    RenderTarget,
    Pipeline,
    Descriptors,
    Buffers,
    CommandPool,
    Synchronization,
    ContentLoaded,
    Ready,
}

impl LifecycleState {
    pub fn next(self) -> Option<Self> {
        use LifecycleState::*;
        Some(match self {
            NotInitialized => Context,
            Context => Surface,
            Surface => Device,
            Device => Swapchain,
            Swapchain => RenderTarget,
            RenderTarget => Pipeline,
            Pipeline => Descriptors,
            Descriptors => Buffers,
            Buffers => CommandPool,
            CommandPool => Synchronization,
            Synchronization => ContentLoaded,
            ContentLoaded => Ready,
            Ready => return None,
        })
    }

    pub fn previous(self) -> Option<Self> {
        use LifecycleState::*;
        Some(match self {
            NotInitialized => return None,
            Context => NotInitialized,
            Surface => Context,
            Device => Surface,
            Swapchain => Device,
            RenderTarget => Swapchain,
            Pipeline => RenderTarget,
            Descriptors => Pipeline,
            Buffers => Descriptors,
            CommandPool => Buffers,
            Synchronization => CommandPool,
            ContentLoaded => Synchronization,
            Ready => ContentLoaded,
        })
    }
}

/// What one call to [`Engine::render`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Paused (minimised); nothing touched the GPU.
    Skipped,
    /// The slot's fence did not signal within the configured timeout.
    NotReady,
    /// The chain was stale and has been rebuilt.
    SwapchainRecreated,
    /// The frame failed and one forced recreation brought the engine back.
    Recovered,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub frames_in_flight: usize,
    pub validation: bool,
    /// Per-frame fence wait; `None` blocks until the GPU gets there.
    pub fence_timeout: Option<Duration>,
    pub clear_color: [f32; 4],
    pub initial_size: RenderSize,
    pub camera: Camera,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            validation: false,
            fence_timeout: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            initial_size: RenderSize::new(800, 600),
            camera: Camera::default(),
        }
    }
}

fn live<'a, T>(slot: &'a Option<T>, what: &str) -> Result<&'a T> {
    slot.as_ref()
        .ok_or_else(|| VkError::precondition(format!("{what} not created")))
}

fn live_mut<'a, T>(slot: &'a mut Option<T>, what: &str) -> Result<&'a mut T> {
    slot.as_mut()
        .ok_or_else(|| VkError::precondition(format!("{what} not created")))
}

pub struct Engine<G: Gpu> {
    gpu: G,
    config: EngineConfig,
    diag: SharedDiagnostics,
    state: LifecycleState,
    size: RenderSize,
    paused: bool,

    mesh: Mesh,
    shaders: ShaderSet,
    scene: Scene,

    surface: vk::SurfaceKHR,
    device: Option<DeviceContext>,
    swapchain: Option<SwapchainManager>,
    render_target: Option<RenderTarget>,
    pipeline: Option<GraphicsPipeline>,
    descriptors: Option<FrameDescriptors>,
    uniforms: Vec<GpuBuffer>,
    commands: Option<CommandRecorder>,
    frame_commands: Vec<vk::CommandBuffer>,
    sync: Option<SyncManager>,
    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,

    frame_index: usize,
    frame_count: u64,
    stats: FrameStats,
    last_frame: Option<Instant>,
}

impl<G: Gpu> Engine<G> {
    /// Validates inputs only; nothing touches the GPU until
    /// [`Engine::bootstrap`]. Without a mesh the built-in cube is drawn.
    pub fn new(
        gpu: G,
        config: EngineConfig,
        mesh: Option<Mesh>,
        shaders: ShaderSet,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        if config.frames_in_flight == 0 {
            return Err(VkError::precondition("frames_in_flight must be at least 1"));
        }
        let mesh = mesh.unwrap_or_else(Mesh::cube);
        mesh.validate()?;

        let mut scene = Scene::new(config.camera);
        scene.set_viewport(config.initial_size.width, config.initial_size.height);

        Ok(Self {
            gpu,
            size: config.initial_size,
            paused: config.initial_size.is_empty(),
            config,
            diag,
            state: LifecycleState::NotInitialized,
            mesh,
            shaders,
            scene,
            surface: vk::SurfaceKHR::null(),
            device: None,
            swapchain: None,
            render_target: None,
            pipeline: None,
            descriptors: None,
            uniforms: Vec::new(),
            commands: None,
            frame_commands: Vec::new(),
            sync: None,
            vertex_buffer: None,
            index_buffer: None,
            frame_index: 0,
            frame_count: 0,
            stats: FrameStats::default(),
            last_frame: None,
        })
    }

    // --- lifecycle ------------------------------------------------------

    /// Enters every state in order. On failure the partially entered layer
    /// and everything below it are torn down before the error is returned.
    pub fn bootstrap(&mut self) -> Result<()> {
        if self.state != LifecycleState::NotInitialized {
            return Err(VkError::precondition(format!(
                "bootstrap from {:?}",
                self.state
            )));
        }
        while let Some(target) = self.state.next() {
            if let Err(e) = self.enter(target) {
                self.diag
                    .error(COMPONENT, format!("bootstrap failed entering {target:?}: {e}"));
                self.exit(target);
                self.teardown();
                return Err(e);
            }
            self.state = target;
            self.diag.debug(COMPONENT, format!("entered {target:?}"));
        }
        self.diag.info(
            COMPONENT,
            format!(
                "ready: {} frame(s) in flight, {} vertices / {} indices",
                self.config.frames_in_flight,
                self.mesh.vertices.len(),
                self.mesh.indices.len()
            ),
        );
        Ok(())
    }

    fn enter(&mut self, state: LifecycleState) -> Result<()> {
        let frames = self.config.frames_in_flight;
        match state {
            LifecycleState::NotInitialized => Ok(()),
            LifecycleState::Context => self
                .gpu
                .create_context(self.config.validation)
                .op("vkCreateInstance"),
            LifecycleState::Surface => {
                self.surface = self.gpu.create_surface().op("vkCreateSurfaceKHR")?;
                Ok(())
            }
            LifecycleState::Device => {
                self.device = Some(DeviceContext::create(
                    &mut self.gpu,
                    self.surface,
                    self.diag.clone(),
                )?);
                Ok(())
            }
            LifecycleState::Swapchain => {
                let device = live(&self.device, "device")?;
                self.swapchain = Some(SwapchainManager::create(
                    &self.gpu,
                    device,
                    self.surface,
                    self.size,
                    self.diag.clone(),
                )?);
                Ok(())
            }
            LifecycleState::RenderTarget => {
                let sc = live(&self.swapchain, "swapchain")?;
                let depth_format = find_depth_format(&self.gpu)?;
                let rt = self.render_target.insert(RenderTarget::create(
                    &self.gpu,
                    sc.format(),
                    depth_format,
                    self.diag.clone(),
                )?);
                rt.create_framebuffers(&self.gpu, sc.image_views(), sc.extent())
            }
            LifecycleState::Pipeline => {
                let sc = live(&self.swapchain, "swapchain")?;
                let rt = live(&self.render_target, "render target")?;
                self.pipeline = Some(GraphicsPipeline::create(
                    &self.gpu,
                    rt.render_pass(),
                    sc.extent(),
                    self.shaders.clone(),
                    self.diag.clone(),
                )?);
                Ok(())
            }
            LifecycleState::Descriptors => {
                let pipeline = live(&self.pipeline, "pipeline")?;
                self.descriptors = Some(FrameDescriptors::create(
                    &self.gpu,
                    pipeline.set_layout(),
                    frames as u32,
                    self.diag.clone(),
                )?);
                Ok(())
            }
            LifecycleState::Buffers => {
                let size = std::mem::size_of::<UniformData>() as vk::DeviceSize;
                for _ in 0..frames {
                    self.uniforms.push(GpuBuffer::create(
                        &self.gpu,
                        size,
                        BufferUsage::Uniform,
                        MemoryVisibility::HostCoherent,
                    )?);
                }
                live(&self.descriptors, "descriptors")?.bind_uniforms(&self.gpu, &self.uniforms)
            }
            LifecycleState::CommandPool => {
                let device = live(&self.device, "device")?;
                let recorder = self.commands.insert(CommandRecorder::create(
                    &self.gpu,
                    device.graphics_family(),
                    device.queues.graphics,
                    false,
                    self.diag.clone(),
                )?);
                self.frame_commands = recorder.allocate_command_buffers(
                    &self.gpu,
                    frames as u32,
                    vk::CommandBufferLevel::PRIMARY,
                )?;
                Ok(())
            }
            LifecycleState::Synchronization => {
                let sc = live(&self.swapchain, "swapchain")?;
                self.sync = Some(SyncManager::create(
                    &self.gpu,
                    frames,
                    sc.image_count(),
                    self.diag.clone(),
                )?);
                Ok(())
            }
            LifecycleState::ContentLoaded => {
                let recorder = live_mut(&mut self.commands, "command pool")?;
                self.vertex_buffer = Some(GpuBuffer::device_local_with_data(
                    &self.gpu,
                    recorder,
                    BufferUsage::Vertex,
                    self.mesh.vertex_bytes(),
                )?);
                if self.mesh.is_indexed() {
                    self.index_buffer = Some(GpuBuffer::device_local_with_data(
                        &self.gpu,
                        recorder,
                        BufferUsage::Index,
                        self.mesh.index_bytes(),
                    )?);
                }
                Ok(())
            }
            LifecycleState::Ready => {
                let extent = live(&self.swapchain, "swapchain")?.extent();
                self.scene.set_viewport(extent.width, extent.height);
                self.frame_index = 0;
                self.frame_count = 0;
                self.last_frame = None;
                Ok(())
            }
        }
    }

    /// Releases what entering `state` created. Idempotent, so it also
    /// cleans up a layer that failed halfway.
    fn exit(&mut self, state: LifecycleState) {
        match state {
            LifecycleState::NotInitialized | LifecycleState::Ready => {}
            LifecycleState::ContentLoaded => {
                if let Some(mut b) = self.index_buffer.take() {
                    b.cleanup(&self.gpu);
                }
                if let Some(mut b) = self.vertex_buffer.take() {
                    b.cleanup(&self.gpu);
                }
            }
            LifecycleState::Synchronization => {
                if let Some(mut sync) = self.sync.take() {
                    sync.cleanup(&self.gpu);
                }
            }
            LifecycleState::CommandPool => {
                self.frame_commands.clear();
                if let Some(mut recorder) = self.commands.take() {
                    recorder.cleanup(&self.gpu);
                }
            }
            LifecycleState::Buffers => {
                for mut b in self.uniforms.drain(..) {
                    b.cleanup(&self.gpu);
                }
            }
            LifecycleState::Descriptors => {
                if let Some(mut d) = self.descriptors.take() {
                    d.cleanup(&self.gpu);
                }
            }
            LifecycleState::Pipeline => {
                if let Some(mut p) = self.pipeline.take() {
                    p.cleanup(&self.gpu);
                }
            }
            LifecycleState::RenderTarget => {
                if let Some(mut rt) = self.render_target.take() {
                    rt.cleanup(&self.gpu);
                }
            }
            LifecycleState::Swapchain => {
                if let Some(mut sc) = self.swapchain.take() {
                    sc.cleanup(&self.gpu);
                }
            }
            LifecycleState::Device => {
                if let Some(device) = self.device.take() {
                    device.destroy(&mut self.gpu);
                }
            }
            LifecycleState::Surface => {
                if self.surface != vk::SurfaceKHR::null() {
                    self.gpu.destroy_surface(self.surface);
                    self.surface = vk::SurfaceKHR::null();
                }
            }
            LifecycleState::Context => self.gpu.destroy_context(),
        }
    }

    // STRICT TEARDOWN ORDER:
    // - device idle first, so no submission references anything below
    // - then every state exits in reverse: content, sync, commands, uniforms,
    //   descriptors, pipeline, render target, swapchain, device, surface,
    //   instance last
    /// Safe to call in any state and more than once.
    pub fn teardown(&mut self) {
        if self.state == LifecycleState::NotInitialized {
            return;
        }
        if self.device.is_some() {
            if let Err(e) = self.gpu.device_wait_idle() {
                self.diag
                    .error(COMPONENT, format!("vkDeviceWaitIdle during teardown: {e:?}"));
            }
        }
        let from = self.state;
        while let Some(previous) = self.state.previous() {
            self.exit(self.state);
            self.state = previous;
        }
        self.diag
            .info(COMPONENT, format!("torn down from {from:?}"));
    }

    // --- per frame ------------------------------------------------------

    /// One frame. Transient conditions come back as a [`FrameOutcome`];
    /// anything else gets one forced swapchain recreation before it is
    /// reported as fatal.
    pub fn render(&mut self) -> Result<FrameOutcome> {
        if self.state != LifecycleState::Ready {
            return Err(VkError::precondition(format!(
                "render in state {:?}",
                self.state
            )));
        }
        if self.paused {
            return Ok(FrameOutcome::Skipped);
        }
        match self.draw_frame() {
            Ok(outcome) => Ok(outcome),
            Err(original) => {
                self.diag.error(
                    COMPONENT,
                    format!("frame {} failed: {original}; forcing recreation", self.frame_count),
                );
                match self.recover() {
                    Ok(()) => Ok(FrameOutcome::Recovered),
                    Err(recovery) => Err(VkError::RecoveryFailed {
                        original: Box::new(original),
                        recovery: Box::new(recovery),
                    }),
                }
            }
        }
    }

    // STRICT PER-FRAME ORDER:
    // 1) wait on this slot's fence (bounded by fence_timeout)
    // 2) acquire (signals this slot's image-acquired semaphore)
    // 3) claim the image from whichever slot used it last
    // 4) reset the fence, only now that a submit is certain to follow
    // 5) uniforms, record, submit (waits image-acquired, signals
    //    render-finished + fence)
    // 6) present (waits render-finished)
    // 7) advance the slot
    fn draw_frame(&mut self) -> Result<FrameOutcome> {
        let frame = self.frame_index;
        let timeout = self.config.fence_timeout;

        // 1)
        let sync = live(&self.sync, "sync")?;
        if sync.wait_for_frame(&self.gpu, frame, timeout)? == FrameWait::TimedOut {
            return Ok(FrameOutcome::NotReady);
        }

        // 2)
        let chain = live(&self.swapchain, "swapchain")?.handle();
        let (image_index, suboptimal) = match sync.acquire_next_image(&self.gpu, chain, frame, None)? {
            AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => {
                self.diag
                    .info(COMPONENT, "acquire: swapchain out of date");
                self.recreate_swapchain()?;
                return Ok(FrameOutcome::SwapchainRecreated);
            }
        };

        // 3) the owning slot was submitted, so an unbounded wait always returns
        let sync = live_mut(&mut self.sync, "sync")?;
        sync.claim_image(&self.gpu, image_index, frame, None)?;

        // 4)
        sync.reset_frame_fence(&self.gpu, frame)?;

        // 5)
        let now = Instant::now();
        let dt = self
            .last_frame
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32());
        self.update_scene(dt);
        let uniforms = self.scene.uniforms();
        self.uniforms
            .get(frame)
            .ok_or_else(|| VkError::precondition(format!("no uniform buffer for slot {frame}")))?
            .write(&self.gpu, 0, bytemuck::bytes_of(&uniforms))?;

        let cmd = *self
            .frame_commands
            .get(frame)
            .ok_or_else(|| VkError::precondition(format!("no command buffer for slot {frame}")))?;
        let rt = live(&self.render_target, "render target")?;
        let pipeline = live(&self.pipeline, "pipeline")?;
        let vertex = live(&self.vertex_buffer, "vertex buffer")?.handle();
        let framebuffer = rt.framebuffer(image_index as usize).ok_or_else(|| {
            VkError::precondition(format!("no framebuffer for image {image_index}"))
        })?;
        let frame_cmds = FrameCommands {
            render_pass: rt.render_pass(),
            framebuffer,
            extent: rt.extent(),
            pipeline: pipeline.handle(),
            layout: pipeline.layout(),
            vertex_buffers: std::slice::from_ref(&vertex),
            vertex_offsets: &[0],
            index_buffer: self.index_buffer.as_ref().map(GpuBuffer::handle),
            index_count: self.mesh.indices.len() as u32,
            vertex_count: self.mesh.vertices.len() as u32,
            descriptor_set: live(&self.descriptors, "descriptors")?.set(frame),
            clear_color: self.config.clear_color,
        };
        let recorder = live_mut(&mut self.commands, "command pool")?;
        recorder.reset_buffer(&self.gpu, cmd)?;
        recorder.record_frame_commands(&self.gpu, cmd, &frame_cmds)?;

        let queues = live(&self.device, "device")?.queues;
        let sync = live_mut(&mut self.sync, "sync")?;
        sync.submit_command_buffers(&self.gpu, queues.graphics, frame, &[cmd])?;

        // 6)
        let presented = sync.present_image(&self.gpu, queues.present, chain, image_index, frame)?;

        // 7)
        self.frame_index = (frame + 1) % self.config.frames_in_flight;
        self.frame_count += 1;
        let frame_time = self
            .last_frame
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_frame = Some(now);
        self.stats = FrameStats {
            frame_time_ms: frame_time.as_secs_f32() * 1000.0,
            fps: if frame_time.is_zero() {
                0.0
            } else {
                1.0 / frame_time.as_secs_f32()
            },
        };

        match presented {
            PresentOutcome::Presented if !suboptimal => Ok(FrameOutcome::Presented),
            outcome => {
                self.diag
                    .info(COMPONENT, format!("present: {outcome:?}, suboptimal acquire={suboptimal}"));
                self.recreate_swapchain()?;
                Ok(FrameOutcome::SwapchainRecreated)
            }
        }
    }

    fn recover(&mut self) -> Result<()> {
        self.recreate_swapchain()?;
        // a failed frame can leave a semaphore signaled or a fence reset
        // with nothing to signal it; the device is idle, so replace them
        live_mut(&mut self.sync, "sync")?.rebuild(&self.gpu)
    }

    // STRICT ORDER:
    // 1) device idle: nothing in flight may reference the old chain
    // 2) pipeline and framebuffers (+ depth) go before the views they use
    // 3) chain + views rebuilt for the current surface
    // 4) render pass rebuilt for the new chain's format (depth format kept),
    //    then framebuffers and pipeline against the new pass and extent
    // 5) image ownership and projection follow the new chain
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        if self.state != LifecycleState::Ready {
            return Err(VkError::precondition(format!(
                "recreate_swapchain in state {:?}",
                self.state
            )));
        }
        if self.size.is_empty() {
            self.paused = true;
            return Ok(());
        }

        // 1)
        self.gpu.device_wait_idle().op("vkDeviceWaitIdle")?;

        // 2)
        live_mut(&mut self.pipeline, "pipeline")?.destroy_pipeline(&self.gpu);
        live_mut(&mut self.render_target, "render target")?.destroy_framebuffers(&self.gpu);

        // 3)
        let device = live(&self.device, "device")?;
        let sc = live_mut(&mut self.swapchain, "swapchain")?;
        sc.recreate(&self.gpu, device, self.surface, self.size)?;
        let sc = live(&self.swapchain, "swapchain")?;
        let extent = sc.extent();

        // 4)
        let rt = live_mut(&mut self.render_target, "render target")?;
        let depth_format = rt.depth_format();
        rt.cleanup(&self.gpu);
        *rt = RenderTarget::create(&self.gpu, sc.format(), depth_format, self.diag.clone())?;
        rt.create_framebuffers(&self.gpu, sc.image_views(), extent)?;
        let render_pass = rt.render_pass();
        live_mut(&mut self.pipeline, "pipeline")?.rebuild(&self.gpu, render_pass, extent)?;

        // 5)
        live_mut(&mut self.sync, "sync")?.resize_images(sc.image_count())?;
        self.scene.set_viewport(extent.width, extent.height);

        self.diag.info(
            COMPONENT,
            format!(
                "swapchain generation {} at {}x{}",
                sc.generation(),
                extent.width,
                extent.height
            ),
        );
        Ok(())
    }

    /// A 0 on either axis pauses rendering; any other size resumes it and,
    /// once running, rebuilds the chain.
    pub fn handle_resize(&mut self, size: RenderSize) -> Result<()> {
        self.size = size;
        if size.is_empty() {
            if !self.paused {
                self.diag.info(COMPONENT, "resize to 0x0: paused");
            }
            self.paused = true;
            return Ok(());
        }
        if self.paused {
            self.diag.info(
                COMPONENT,
                format!("resize to {}x{}: resumed", size.width, size.height),
            );
        }
        self.paused = false;
        if self.state == LifecycleState::Ready {
            self.recreate_swapchain()
        } else {
            Ok(())
        }
    }

    pub fn update_scene(&mut self, dt: f32) {
        self.scene.update(dt);
    }

    pub fn move_camera(&mut self, forward: f32, right: f32, dt: f32) {
        self.scene.camera.move_by(forward, right, dt);
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.config.clear_color = rgba;
    }

    pub fn wait_idle(&self) -> Result<()> {
        if self.device.is_none() {
            return Ok(());
        }
        self.gpu.device_wait_idle().op("vkDeviceWaitIdle")
    }

    // --- queries --------------------------------------------------------

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Slot the next frame will use, always below `frames_in_flight`.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Frames submitted since bootstrap.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(SwapchainManager::extent)
    }

    /// The window no longer matches the chain. Never true while minimised.
    pub fn needs_swapchain_recreation(&self) -> bool {
        if self.size.is_empty() {
            return false;
        }
        self.swapchain_extent().is_some_and(|e| {
            e.width != self.size.width || e.height != self.size.height
        })
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }
}

impl<G: Gpu> Drop for Engine<G> {
    fn drop(&mut self) {
        self.teardown();
    }
}
