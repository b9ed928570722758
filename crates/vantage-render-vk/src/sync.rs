// SPDX-License-Identifier: CEPL-1.0
//! Per-frame semaphores and fences, and the wait/acquire/submit/present
//! primitives built on them.
//!
//! Every blocking point takes an explicit timeout (`None` waits forever), so
//! the only places the CPU can stall are visible in these signatures.
use std::time::Duration;

use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};

use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::{Gpu, SubmitBatch};

const COMPONENT: &str = "sync";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameWait {
    Signaled,
    /// The slot is still in flight; retry later.
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    /// The chain no longer matches the surface; nothing was signaled.
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

#[derive(Clone, Copy, Debug)]
struct FrameSync {
    image_acquired: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    /// The fence is signaled or a submission will signal it. Cleared
    /// between reset and submit, when waiting on it would never return.
    armed: bool,
}

pub struct SyncManager {
    frames: Vec<FrameSync>,
    /// Frame slot that last rendered into each swapchain image.
    images_in_flight: Vec<Option<usize>>,
    diag: SharedDiagnostics,
}

impl SyncManager {
    pub fn create(
        gpu: &dyn Gpu,
        frames_in_flight: usize,
        image_count: usize,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        if frames_in_flight == 0 || frames_in_flight > image_count {
            return Err(VkError::precondition(format!(
                "{frames_in_flight} frame(s) in flight for {image_count} swapchain image(s)"
            )));
        }
        let mut sync = Self {
            frames: Vec::with_capacity(frames_in_flight),
            images_in_flight: vec![None; image_count],
            diag,
        };
        if let Err(e) = sync.build(gpu, frames_in_flight) {
            sync.destroy_objects(gpu);
            return Err(e);
        }
        sync.diag.created(
            COMPONENT,
            format!("{frames_in_flight} frame slot(s), fences start signaled"),
        );
        Ok(sync)
    }

    fn build(&mut self, gpu: &dyn Gpu, count: usize) -> Result<()> {
        for _ in 0..count {
            let image_acquired = gpu.create_semaphore().op("vkCreateSemaphore")?;
            let render_finished = match gpu.create_semaphore() {
                Ok(s) => s,
                Err(e) => {
                    gpu.destroy_semaphore(image_acquired);
                    return Err(VkError::from_vk("vkCreateSemaphore", e));
                }
            };
            // Signaled so the first wait on this slot returns immediately
            let in_flight = match gpu.create_fence(true) {
                Ok(f) => f,
                Err(e) => {
                    gpu.destroy_semaphore(render_finished);
                    gpu.destroy_semaphore(image_acquired);
                    return Err(VkError::from_vk("vkCreateFence", e));
                }
            };
            self.frames.push(FrameSync {
                image_acquired,
                render_finished,
                in_flight,
                armed: true,
            });
        }
        Ok(())
    }

    fn slot(&self, frame: usize) -> Result<FrameSync> {
        self.frames.get(frame).copied().ok_or_else(|| {
            VkError::precondition(format!(
                "frame slot {frame} out of range ({} slot(s))",
                self.frames.len()
            ))
        })
    }

    /// Blocks on slot `frame`'s fence for at most `timeout`.
    pub fn wait_for_frame(
        &self,
        gpu: &dyn Gpu,
        frame: usize,
        timeout: Option<Duration>,
    ) -> Result<FrameWait> {
        let slot = self.slot(frame)?;
        if !slot.armed {
            return Err(VkError::precondition(format!(
                "frame slot {frame} fence was reset but never submitted"
            )));
        }
        let signaled = gpu
            .wait_for_fences(&[slot.in_flight], timeout_ns(timeout))
            .op("vkWaitForFences")?;
        if signaled {
            Ok(FrameWait::Signaled)
        } else {
            self.diag
                .warn(COMPONENT, format!("frame slot {frame} not ready before timeout"));
            Ok(FrameWait::TimedOut)
        }
    }

    /// Drains every slot that has work outstanding.
    pub fn wait_for_all_frames(&self, gpu: &dyn Gpu) -> Result<()> {
        let fences: Vec<_> = self
            .frames
            .iter()
            .filter(|f| f.armed)
            .map(|f| f.in_flight)
            .collect();
        if fences.is_empty() {
            return Ok(());
        }
        gpu.wait_for_fences(&fences, u64::MAX)
            .op("vkWaitForFences")?;
        Ok(())
    }

    /// Signals slot `frame`'s image-acquired semaphore once the image is
    /// ready. An out-of-date chain is reported, not raised.
    pub fn acquire_next_image(
        &self,
        gpu: &dyn Gpu,
        swapchain: vk::SwapchainKHR,
        frame: usize,
        timeout: Option<Duration>,
    ) -> Result<AcquireOutcome> {
        let slot = self.slot(frame)?;
        match gpu.acquire_next_image(swapchain, timeout_ns(timeout), slot.image_acquired) {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(VkError::from_vk("vkAcquireNextImageKHR", e)),
        }
    }

    /// If another slot still owns `image_index`, waits for that slot before
    /// handing the image to `frame`.
    pub fn claim_image(
        &mut self,
        gpu: &dyn Gpu,
        image_index: u32,
        frame: usize,
        timeout: Option<Duration>,
    ) -> Result<FrameWait> {
        let image = image_index as usize;
        let owner = *self.images_in_flight.get(image).ok_or_else(|| {
            VkError::precondition(format!(
                "image {image_index} out of range ({} image(s))",
                self.images_in_flight.len()
            ))
        })?;
        if let Some(other) = owner.filter(|&o| o != frame) {
            if self.slot(other)?.armed
                && self.wait_for_frame(gpu, other, timeout)? == FrameWait::TimedOut
            {
                return Ok(FrameWait::TimedOut);
            }
        }
        self.images_in_flight[image] = Some(frame);
        Ok(FrameWait::Signaled)
    }

    /// Must precede every resubmission on the slot.
    pub fn reset_frame_fence(&mut self, gpu: &dyn Gpu, frame: usize) -> Result<()> {
        let slot = self.slot(frame)?;
        gpu.reset_fences(&[slot.in_flight]).op("vkResetFences")?;
        self.frames[frame].armed = false;
        Ok(())
    }

    /// Waits on image-acquired at color-attachment output, signals
    /// render-finished and the slot's fence.
    pub fn submit_command_buffers(
        &mut self,
        gpu: &dyn Gpu,
        queue: vk::Queue,
        frame: usize,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<()> {
        let slot = self.slot(frame)?;
        let batch = SubmitBatch {
            command_buffers: command_buffers.to_vec(),
            wait_semaphores: vec![slot.image_acquired],
            wait_stages: vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            signal_semaphores: vec![slot.render_finished],
        };
        gpu.queue_submit(queue, &batch, slot.in_flight)
            .op("vkQueueSubmit")?;
        self.frames[frame].armed = true;
        Ok(())
    }

    /// Presentation waits on slot `frame`'s render-finished semaphore.
    pub fn present_image(
        &self,
        gpu: &dyn Gpu,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        frame: usize,
    ) -> Result<PresentOutcome> {
        let slot = self.slot(frame)?;
        match gpu.queue_present(queue, swapchain, image_index, &[slot.render_finished]) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(VkError::from_vk("vkQueuePresentKHR", e)),
        }
    }

    /// Swapchain images changed; ownership history no longer applies.
    pub fn resize_images(&mut self, image_count: usize) -> Result<()> {
        if self.frames.len() > image_count {
            return Err(VkError::precondition(format!(
                "{} frame(s) in flight for {image_count} swapchain image(s)",
                self.frames.len()
            )));
        }
        self.images_in_flight = vec![None; image_count];
        Ok(())
    }

    /// Replaces every semaphore and fence without waiting on them. Only
    /// valid once the device is idle; used after a failed frame left a
    /// semaphore signaled or a fence reset with nothing to signal it.
    pub fn rebuild(&mut self, gpu: &dyn Gpu) -> Result<()> {
        let count = self.frames.len();
        self.destroy_objects(gpu);
        self.images_in_flight.iter_mut().for_each(|i| *i = None);
        if let Err(e) = self.build(gpu, count) {
            self.destroy_objects(gpu);
            return Err(e);
        }
        self.diag
            .debug(COMPONENT, format!("rebuilt {count} frame slot(s)"));
        Ok(())
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn fence(&self, frame: usize) -> Option<vk::Fence> {
        self.frames.get(frame).map(|f| f.in_flight)
    }

    fn destroy_objects(&mut self, gpu: &dyn Gpu) {
        for f in self.frames.drain(..) {
            gpu.destroy_fence(f.in_flight);
            gpu.destroy_semaphore(f.render_finished);
            gpu.destroy_semaphore(f.image_acquired);
        }
    }

    /// Waits for every in-flight slot, then destroys the sync objects.
    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        if self.frames.is_empty() {
            return;
        }
        if let Err(e) = self.wait_for_all_frames(gpu) {
            self.diag
                .error(COMPONENT, format!("draining frames before cleanup: {e}"));
        }
        let count = self.frames.len();
        self.destroy_objects(gpu);
        self.images_in_flight.clear();
        self.diag
            .destroyed(COMPONENT, format!("{count} frame slot(s)"));
    }
}
