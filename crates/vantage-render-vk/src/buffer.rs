// SPDX-License-Identifier: CEPL-1.0
//! Buffers, their memory, and the per-frame uniform descriptor sets.
use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};

use crate::command::CommandRecorder;
use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::Gpu;

const COMPONENT: &str = "buffers";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Staging,
    Storage,
}

impl BufferUsage {
    pub fn flags(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
        }
    }
}

/// Where the memory lives and whether the CPU may map it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryVisibility {
    DeviceLocal,
    /// Mappable; writes need an explicit flush unless the driver hands back
    /// coherent memory anyway.
    HostVisible,
    HostCoherent,
    Staging,
}

impl MemoryVisibility {
    pub fn flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryVisibility::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryVisibility::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE,
            MemoryVisibility::HostCoherent | MemoryVisibility::Staging => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

#[derive(Debug)]
pub struct GpuBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: BufferUsage,
    visibility: MemoryVisibility,
    memory_flags: vk::MemoryPropertyFlags,
}

impl GpuBuffer {
    pub fn create(
        gpu: &dyn Gpu,
        size: vk::DeviceSize,
        usage: BufferUsage,
        visibility: MemoryVisibility,
    ) -> Result<Self> {
        if size == 0 {
            return Err(VkError::precondition(format!("zero-sized {usage:?} buffer")));
        }
        let alloc = gpu
            .create_buffer(size, usage.flags(), visibility.flags())
            .op("vkCreateBuffer")?;
        // host-visible memory stays mapped until cleanup
        if alloc
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            if let Err(e) = gpu.map_memory(alloc.memory) {
                gpu.destroy_buffer(alloc.buffer, alloc.memory);
                return Err(VkError::from_vk("vkMapMemory", e));
            }
        }
        Ok(Self {
            buffer: alloc.buffer,
            memory: alloc.memory,
            size,
            usage,
            visibility,
            memory_flags: alloc.memory_flags,
        })
    }

    /// Host-visible buffer filled with `data`.
    pub fn create_with_data(
        gpu: &dyn Gpu,
        usage: BufferUsage,
        visibility: MemoryVisibility,
        data: &[u8],
    ) -> Result<Self> {
        let mut buf = Self::create(gpu, data.len() as vk::DeviceSize, usage, visibility)?;
        if let Err(e) = buf.write(gpu, 0, data) {
            buf.cleanup(gpu);
            return Err(e);
        }
        Ok(buf)
    }

    /// Device-local buffer populated through a throwaway staging buffer and
    /// one blocking copy.
    pub fn device_local_with_data(
        gpu: &dyn Gpu,
        recorder: &mut CommandRecorder,
        usage: BufferUsage,
        data: &[u8],
    ) -> Result<Self> {
        // STRICT ORDER:
        // 1) staging (host-visible, TRANSFER_SRC) filled on the CPU
        // 2) destination (device-local, TRANSFER_DST)
        // 3) one-shot copy; returns after the queue is idle
        // 4) staging destroyed whether or not the copy succeeded
        let mut staging =
            Self::create_with_data(gpu, BufferUsage::Staging, MemoryVisibility::Staging, data)?;
        let result = Self::create(
            gpu,
            data.len() as vk::DeviceSize,
            usage,
            MemoryVisibility::DeviceLocal,
        )
        .and_then(|mut dst| match staging.copy_to(gpu, recorder, &dst) {
            Ok(()) => Ok(dst),
            Err(e) => {
                dst.cleanup(gpu);
                Err(e)
            }
        });
        staging.cleanup(gpu);
        result
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn check_range(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<()> {
        if self.buffer == vk::Buffer::null() {
            return Err(VkError::precondition("buffer already destroyed"));
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(VkError::precondition(format!(
                "range {offset}+{len} outside {}-byte buffer",
                self.size
            )));
        }
        Ok(())
    }

    /// Copies into the persistent mapping; flushes when the memory is not
    /// coherent.
    pub fn write(&self, gpu: &dyn Gpu, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        if !self.is_host_visible() {
            return Err(VkError::precondition(format!(
                "{:?} buffer in {:?} memory cannot be mapped",
                self.usage, self.visibility
            )));
        }
        let len = data.len() as vk::DeviceSize;
        self.check_range(offset, len)?;
        gpu.write_memory(self.memory, offset, data)
            .op("vkMapMemory")?;
        self.flush(gpu, offset, len)
    }

    /// Makes host writes visible to the device. No-op on coherent memory.
    pub fn flush(&self, gpu: &dyn Gpu, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<()> {
        if self.is_coherent() {
            return Ok(());
        }
        self.check_range(offset, size)?;
        gpu.flush_memory(self.memory, offset, size)
            .op("vkFlushMappedMemoryRanges")
    }

    /// Makes device writes visible to the host. No-op on coherent memory.
    pub fn invalidate(
        &self,
        gpu: &dyn Gpu,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        if self.is_coherent() {
            return Ok(());
        }
        self.check_range(offset, size)?;
        gpu.invalidate_memory(self.memory, offset, size)
            .op("vkInvalidateMappedMemoryRanges")
    }

    /// Whole-buffer copy into `dst` through a single-time command buffer.
    pub fn copy_to(
        &self,
        gpu: &dyn Gpu,
        recorder: &mut CommandRecorder,
        dst: &GpuBuffer,
    ) -> Result<()> {
        if dst.size < self.size {
            return Err(VkError::precondition(format!(
                "copy of {} bytes into {}-byte buffer",
                self.size, dst.size
            )));
        }
        let cmd = recorder.begin_single_time_commands(gpu)?;
        gpu.cmd_copy_buffer(
            cmd,
            self.buffer,
            dst.buffer,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: self.size,
            }],
        );
        recorder.end_single_time_commands(gpu, cmd)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        if self.buffer != vk::Buffer::null() {
            if self.is_host_visible() {
                gpu.unmap_memory(self.memory);
            }
            gpu.destroy_buffer(self.buffer, self.memory);
            self.buffer = vk::Buffer::null();
            self.memory = vk::DeviceMemory::null();
        }
    }
}

/// One uniform descriptor set per frame in flight, all from one pool.
pub struct FrameDescriptors {
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    diag: SharedDiagnostics,
}

impl FrameDescriptors {
    pub fn create(
        gpu: &dyn Gpu,
        set_layout: vk::DescriptorSetLayout,
        frames: u32,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        let pool = gpu
            .create_descriptor_pool(frames, frames)
            .op("vkCreateDescriptorPool")?;
        let layouts = vec![set_layout; frames as usize];
        let sets = match gpu.allocate_descriptor_sets(pool, &layouts) {
            Ok(sets) => sets,
            Err(e) => {
                gpu.destroy_descriptor_pool(pool);
                return Err(VkError::from_vk("vkAllocateDescriptorSets", e));
            }
        };
        diag.created(COMPONENT, format!("descriptor pool with {frames} set(s)"));
        Ok(Self { pool, sets, diag })
    }

    /// Points set `i` at `uniforms[i]`, binding 0.
    pub fn bind_uniforms(&self, gpu: &dyn Gpu, uniforms: &[GpuBuffer]) -> Result<()> {
        if uniforms.len() != self.sets.len() {
            return Err(VkError::precondition(format!(
                "{} uniform buffer(s) for {} descriptor set(s)",
                uniforms.len(),
                self.sets.len()
            )));
        }
        for (&set, ubo) in self.sets.iter().zip(uniforms) {
            gpu.write_uniform_descriptor(set, 0, ubo.handle(), ubo.size());
        }
        Ok(())
    }

    pub fn set(&self, frame: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(frame).copied()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Sets are released with the pool.
    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        self.sets.clear();
        if self.pool != vk::DescriptorPool::null() {
            gpu.destroy_descriptor_pool(self.pool);
            self.pool = vk::DescriptorPool::null();
            self.diag.destroyed(COMPONENT, "descriptor pool");
        }
    }
}
