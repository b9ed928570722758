// SPDX-License-Identifier: CEPL-1.0
//! Command pool ownership and the per-frame recording sequence.
use std::collections::HashMap;

use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};

use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::{Gpu, SubmitBatch};

const COMPONENT: &str = "commands";

/// Usage hint passed to `vkBeginCommandBuffer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Usage {
    SingleUse,
    RenderPassContinue,
    Simultaneous,
}

impl Usage {
    pub fn flags(self) -> vk::CommandBufferUsageFlags {
        match self {
            Usage::SingleUse => vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            Usage::RenderPassContinue => vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            Usage::Simultaneous => vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

/// Everything one frame's draw needs. Borrowed for the duration of
/// [`CommandRecorder::record_frame_commands`].
#[derive(Clone, Debug)]
pub struct FrameCommands<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub vertex_buffers: &'a [vk::Buffer],
    pub vertex_offsets: &'a [vk::DeviceSize],
    pub index_buffer: Option<vk::Buffer>,
    pub index_count: u32,
    pub vertex_count: u32,
    pub descriptor_set: Option<vk::DescriptorSet>,
    pub clear_color: [f32; 4],
}

pub struct CommandRecorder {
    pool: vk::CommandPool,
    queue: vk::Queue,
    buffers: Vec<vk::CommandBuffer>,
    states: HashMap<vk::CommandBuffer, RecordState>,
    diag: SharedDiagnostics,
}

impl CommandRecorder {
    /// Pool on `family`; individual buffers may be reset. `queue` is where
    /// single-time commands are submitted.
    pub fn create(
        gpu: &dyn Gpu,
        family: u32,
        queue: vk::Queue,
        transient: bool,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        if transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        let pool = gpu
            .create_command_pool(family, flags)
            .op("vkCreateCommandPool")?;
        diag.created(COMPONENT, format!("command pool on family {family}"));
        Ok(Self {
            pool,
            queue,
            buffers: Vec::new(),
            states: HashMap::new(),
            diag,
        })
    }

    fn require_pool(&self) -> Result<()> {
        if self.pool == vk::CommandPool::null() {
            return Err(VkError::precondition("command pool already destroyed"));
        }
        Ok(())
    }

    fn state(&self, cmd: vk::CommandBuffer) -> Result<RecordState> {
        self.states.get(&cmd).copied().ok_or_else(|| {
            VkError::precondition(format!("command buffer {cmd:?} not allocated from this pool"))
        })
    }

    pub fn allocate_command_buffers(
        &mut self,
        gpu: &dyn Gpu,
        count: u32,
        level: vk::CommandBufferLevel,
    ) -> Result<Vec<vk::CommandBuffer>> {
        self.require_pool()?;
        let buffers = gpu
            .allocate_command_buffers(self.pool, level, count)
            .op("vkAllocateCommandBuffers")?;
        for &cb in &buffers {
            self.states.insert(cb, RecordState::Initial);
        }
        self.buffers.extend_from_slice(&buffers);
        Ok(buffers)
    }

    pub fn free_command_buffers(&mut self, gpu: &dyn Gpu, buffers: &[vk::CommandBuffer]) {
        let owned: Vec<_> = buffers
            .iter()
            .copied()
            .filter(|cb| self.states.remove(cb).is_some())
            .collect();
        if owned.is_empty() || self.pool == vk::CommandPool::null() {
            return;
        }
        self.buffers.retain(|cb| !owned.contains(cb));
        gpu.free_command_buffers(self.pool, &owned);
    }

    /// Caller guarantees the buffer is no longer executing.
    pub fn reset_buffer(&mut self, gpu: &dyn Gpu, cmd: vk::CommandBuffer) -> Result<()> {
        self.require_pool()?;
        self.state(cmd)?;
        gpu.reset_command_buffer(cmd).op("vkResetCommandBuffer")?;
        self.states.insert(cmd, RecordState::Initial);
        Ok(())
    }

    /// Resets every buffer allocated from the pool at once.
    pub fn reset(&mut self, gpu: &dyn Gpu) -> Result<()> {
        self.require_pool()?;
        gpu.reset_command_pool(self.pool).op("vkResetCommandPool")?;
        for state in self.states.values_mut() {
            *state = RecordState::Initial;
        }
        Ok(())
    }

    pub fn begin(&mut self, gpu: &dyn Gpu, cmd: vk::CommandBuffer, usage: Usage) -> Result<()> {
        self.require_pool()?;
        if self.state(cmd)? == RecordState::Recording {
            return Err(VkError::precondition("begin on a buffer already recording"));
        }
        gpu.begin_command_buffer(cmd, usage.flags())
            .op("vkBeginCommandBuffer")?;
        self.states.insert(cmd, RecordState::Recording);
        Ok(())
    }

    pub fn end(&mut self, gpu: &dyn Gpu, cmd: vk::CommandBuffer) -> Result<()> {
        self.require_pool()?;
        if self.state(cmd)? != RecordState::Recording {
            return Err(VkError::precondition("end on a buffer that is not recording"));
        }
        gpu.end_command_buffer(cmd).op("vkEndCommandBuffer")?;
        self.states.insert(cmd, RecordState::Executable);
        Ok(())
    }

    pub fn is_executable(&self, cmd: vk::CommandBuffer) -> bool {
        self.states.get(&cmd) == Some(&RecordState::Executable)
    }

    /// begin → render pass → pipeline → viewport/scissor → vertex/index →
    /// descriptor set → one draw → end pass → end.
    pub fn record_frame_commands(
        &mut self,
        gpu: &dyn Gpu,
        cmd: vk::CommandBuffer,
        frame: &FrameCommands<'_>,
    ) -> Result<()> {
        if frame.vertex_buffers.len() != frame.vertex_offsets.len() {
            return Err(VkError::precondition(format!(
                "{} vertex buffer(s) but {} offset(s)",
                frame.vertex_buffers.len(),
                frame.vertex_offsets.len()
            )));
        }
        if frame.framebuffer == vk::Framebuffer::null() || frame.pipeline == vk::Pipeline::null() {
            return Err(VkError::precondition("recording without framebuffer or pipeline"));
        }

        self.begin(gpu, cmd, Usage::SingleUse)?;

        // Clear values MUST match attachment order: [color, depth]
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: frame.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: frame.extent,
        };
        gpu.cmd_begin_render_pass(cmd, frame.render_pass, frame.framebuffer, area, &clear_values);
        gpu.cmd_bind_pipeline(cmd, frame.pipeline);
        gpu.cmd_set_viewport(
            cmd,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: frame.extent.width as f32,
                height: frame.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        gpu.cmd_set_scissor(cmd, area);

        if !frame.vertex_buffers.is_empty() {
            gpu.cmd_bind_vertex_buffers(cmd, frame.vertex_buffers, frame.vertex_offsets);
        }
        if let Some(index_buffer) = frame.index_buffer {
            gpu.cmd_bind_index_buffer(cmd, index_buffer, 0, vk::IndexType::UINT32);
        }
        if let Some(set) = frame.descriptor_set {
            gpu.cmd_bind_descriptor_sets(cmd, frame.layout, &[set]);
        }

        if frame.index_buffer.is_some() {
            gpu.cmd_draw_indexed(cmd, frame.index_count, 1);
        } else {
            gpu.cmd_draw(cmd, frame.vertex_count, 1);
        }

        gpu.cmd_end_render_pass(cmd);
        self.end(gpu, cmd)
    }

    /// One-shot buffer for transfer work; pair with
    /// [`CommandRecorder::end_single_time_commands`].
    pub fn begin_single_time_commands(&mut self, gpu: &dyn Gpu) -> Result<vk::CommandBuffer> {
        let cmd = self
            .allocate_command_buffers(gpu, 1, vk::CommandBufferLevel::PRIMARY)?
            .into_iter()
            .next()
            .ok_or_else(|| VkError::precondition("driver returned no command buffer"))?;
        if let Err(e) = self.begin(gpu, cmd, Usage::SingleUse) {
            self.free_command_buffers(gpu, &[cmd]);
            return Err(e);
        }
        Ok(cmd)
    }

    /// end → submit → block until the queue is idle → free.
    pub fn end_single_time_commands(&mut self, gpu: &dyn Gpu, cmd: vk::CommandBuffer) -> Result<()> {
        let result = self.end(gpu, cmd).and_then(|()| {
            let batch = SubmitBatch {
                command_buffers: vec![cmd],
                ..Default::default()
            };
            gpu.queue_submit(self.queue, &batch, vk::Fence::null())
                .op("vkQueueSubmit")?;
            gpu.queue_wait_idle(self.queue).op("vkQueueWaitIdle")
        });
        self.free_command_buffers(gpu, &[cmd]);
        result
    }

    pub fn buffers(&self) -> &[vk::CommandBuffer] {
        &self.buffers
    }

    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    /// Frees tracked buffers, then the pool. Callers drain the GPU first.
    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        if self.pool == vk::CommandPool::null() {
            return;
        }
        if !self.buffers.is_empty() {
            gpu.free_command_buffers(self.pool, &self.buffers);
            self.buffers.clear();
        }
        self.states.clear();
        gpu.destroy_command_pool(self.pool);
        self.pool = vk::CommandPool::null();
        self.diag.destroyed(COMPONENT, "command pool");
    }
}
