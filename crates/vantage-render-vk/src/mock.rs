// SPDX-License-Identifier: CEPL-1.0
//! Scripted in-memory [`Gpu`] for tests.
//!
//! Handles are fabricated integers. Every create/destroy is tracked so tests
//! can assert that nothing leaked and that no handle was used after it was
//! destroyed. Submissions either complete on the spot or stay pending until
//! a wait drains them, which is what lets tests pin down fence semantics.
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::gpu::{
    AdapterFeatures, AdapterInfo, BufferAllocation, GraphicsPipelineDesc, Gpu, QueueFamilyInfo,
    RenderPassDesc, SubmitBatch, SurfaceSupport, SwapchainRequest,
};

static NEXT_ADAPTER: AtomicU64 = AtomicU64::new(0xA000);

/// A suitable adapter: one universal queue family that can present.
pub fn adapter(name: &str, device_type: vk::PhysicalDeviceType) -> AdapterInfo {
    AdapterInfo {
        handle: vk::PhysicalDevice::from_raw(NEXT_ADAPTER.fetch_add(1, Ordering::Relaxed)),
        name: name.to_owned(),
        device_type,
        max_image_dimension_2d: 16384,
        features: AdapterFeatures::GEOMETRY_SHADER | AdapterFeatures::SAMPLER_ANISOTROPY,
        device_local_bytes: 4 * 1024 * 1024 * 1024,
        queue_families: vec![QueueFamilyInfo {
            flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            queue_count: 16,
            present: true,
        }],
        extensions: vec![ash::khr::swapchain::NAME.to_string_lossy().into_owned()],
        surface_format_count: 2,
        present_mode_count: 2,
    }
}

pub fn capabilities(width: u32, height: u32) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: 2,
        max_image_count: 8,
        current_extent: vk::Extent2D { width, height },
        min_image_extent: vk::Extent2D {
            width: 1,
            height: 1,
        },
        max_image_extent: vk::Extent2D {
            width: 4096,
            height: 4096,
        },
        max_image_array_layers: 1,
        supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
        current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        ..Default::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmdState {
    Initial,
    Recording,
    Executable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawCall {
    pub indexed: bool,
    pub count: u32,
}

struct Swapchain {
    images: Vec<u64>,
    extent: vk::Extent2D,
    next: u32,
}

struct Memory {
    bytes: Vec<u8>,
    flags: vk::MemoryPropertyFlags,
    mapped: bool,
}

struct Pending {
    fence: u64,
    command_buffers: Vec<u64>,
}

struct State {
    next_id: u64,
    live: HashMap<u64, &'static str>,
    destroyed: HashSet<u64>,
    violations: Vec<String>,
    calls: Vec<&'static str>,

    adapters: Vec<AdapterInfo>,
    surface: SurfaceSupport,
    validation_available: bool,
    depth_formats: Vec<vk::Format>,
    host_coherent: bool,
    fail_on: HashMap<&'static str, vk::Result>,
    fail_next: HashMap<&'static str, vk::Result>,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
    hold_submissions: bool,

    context: bool,
    validation: bool,
    device: Option<vk::PhysicalDevice>,
    device_families: Vec<u32>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    pending: Vec<Pending>,
    swapchains: HashMap<u64, Swapchain>,
    last_swapchain_request: Option<SwapchainRequest>,
    memory: HashMap<u64, Memory>,
    commands: HashMap<u64, CmdState>,
    in_render_pass: HashSet<u64>,
    render_areas: Vec<vk::Rect2D>,
    clear_values: Vec<Vec<vk::ClearValue>>,
    draws: Vec<DrawCall>,
    copies: Vec<(vk::Buffer, vk::Buffer, vk::DeviceSize)>,
    bound_sets: Vec<vk::DescriptorSet>,
    presents: Vec<u32>,
    pipelines: Vec<GraphicsPipelineDesc>,
    render_passes: Vec<RenderPassDesc>,
}

impl State {
    fn call(&mut self, op: &'static str) -> VkResult<()> {
        self.calls.push(op);
        if let Some(code) = self.fail_next.remove(op) {
            return Err(code);
        }
        match self.fail_on.get(op) {
            Some(&code) => Err(code),
            None => Ok(()),
        }
    }

    fn alloc(&mut self, kind: &'static str) -> u64 {
        self.next_id += 1;
        self.live.insert(self.next_id, kind);
        self.next_id
    }

    fn check(&mut self, raw: u64, kind: &'static str, op: &'static str) {
        if raw == 0 {
            self.violations.push(format!("{op}: null {kind}"));
        } else if self.destroyed.contains(&raw) {
            self.violations
                .push(format!("{op}: {kind} {raw:#x} used after destroy"));
        } else if self.live.get(&raw) != Some(&kind) {
            self.violations.push(format!("{op}: unknown {kind} {raw:#x}"));
        }
    }

    /// Host access through `op` needs a live mapping.
    fn check_mapped(&mut self, raw: u64, op: &'static str) {
        if self.memory.get(&raw).is_some_and(|m| !m.mapped) {
            self.violations
                .push(format!("{op}: memory {raw:#x} is not mapped"));
        }
    }

    fn release(&mut self, raw: u64, kind: &'static str, op: &'static str) {
        self.calls.push(op);
        // destroying VK_NULL_HANDLE is a no-op
        if raw == 0 {
            return;
        }
        if !self.pending.is_empty() {
            self.violations
                .push(format!("{op}: {kind} {raw:#x} destroyed while GPU work pending"));
        }
        if self.destroyed.contains(&raw) {
            self.violations
                .push(format!("{op}: {kind} {raw:#x} destroyed twice"));
            return;
        }
        if self.live.remove(&raw).is_none() {
            self.violations.push(format!("{op}: unknown {kind} {raw:#x}"));
            return;
        }
        self.destroyed.insert(raw);
    }

    fn recording(&mut self, cmd: vk::CommandBuffer, op: &'static str) {
        self.calls.push(op);
        self.check(cmd.as_raw(), "command buffer", op);
        if self.commands.get(&cmd.as_raw()) != Some(&CmdState::Recording) {
            self.violations
                .push(format!("{op}: command buffer not recording"));
        }
    }

    fn complete_all(&mut self) {
        for p in std::mem::take(&mut self.pending) {
            if p.fence != 0 {
                self.fences.insert(p.fence, true);
            }
        }
    }

    fn complete_fence(&mut self, fence: u64) {
        let (done, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|p| p.fence == fence);
        self.pending = rest;
        if !done.is_empty() {
            self.fences.insert(fence, true);
        }
    }
}

pub struct MockGpu {
    state: RefCell<State>,
}

impl Default for MockGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGpu {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_id: 0x1000,
                live: HashMap::new(),
                destroyed: HashSet::new(),
                violations: Vec::new(),
                calls: Vec::new(),
                adapters: vec![adapter("Mock Discrete", vk::PhysicalDeviceType::DISCRETE_GPU)],
                surface: SurfaceSupport {
                    capabilities: capabilities(800, 600),
                    formats: vec![
                        vk::SurfaceFormatKHR {
                            format: vk::Format::B8G8R8A8_UNORM,
                            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                        },
                        vk::SurfaceFormatKHR {
                            format: vk::Format::B8G8R8A8_SRGB,
                            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                        },
                    ],
                    present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                },
                validation_available: true,
                depth_formats: vec![vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT],
                host_coherent: true,
                fail_on: HashMap::new(),
                fail_next: HashMap::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                hold_submissions: false,
                context: false,
                validation: false,
                device: None,
                device_families: Vec::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                pending: Vec::new(),
                swapchains: HashMap::new(),
                last_swapchain_request: None,
                memory: HashMap::new(),
                commands: HashMap::new(),
                in_render_pass: HashSet::new(),
                render_areas: Vec::new(),
                clear_values: Vec::new(),
                draws: Vec::new(),
                copies: Vec::new(),
                bound_sets: Vec::new(),
                presents: Vec::new(),
                pipelines: Vec::new(),
                render_passes: Vec::new(),
            }),
        }
    }

    // ---- scripting ----

    pub fn set_adapters(&self, adapters: Vec<AdapterInfo>) {
        self.state.borrow_mut().adapters = adapters;
    }

    pub fn set_surface(&self, surface: SurfaceSupport) {
        self.state.borrow_mut().surface = surface;
    }

    /// Simulates the window changing size under the swapchain.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.borrow_mut().surface.capabilities.current_extent =
            vk::Extent2D { width, height };
    }

    pub fn set_capabilities(&self, caps: vk::SurfaceCapabilitiesKHR) {
        self.state.borrow_mut().surface.capabilities = caps;
    }

    pub fn set_validation_available(&self, available: bool) {
        self.state.borrow_mut().validation_available = available;
    }

    pub fn set_depth_formats(&self, formats: Vec<vk::Format>) {
        self.state.borrow_mut().depth_formats = formats;
    }

    pub fn set_host_coherent(&self, coherent: bool) {
        self.state.borrow_mut().host_coherent = coherent;
    }

    /// Every call to `op` fails with `code` until cleared.
    pub fn fail_on(&self, op: &'static str, code: vk::Result) {
        self.state.borrow_mut().fail_on.insert(op, code);
    }

    /// Only the next call to `op` fails.
    pub fn fail_next(&self, op: &'static str, code: vk::Result) {
        self.state.borrow_mut().fail_next.insert(op, code);
    }

    pub fn clear_failures(&self) {
        let mut s = self.state.borrow_mut();
        s.fail_on.clear();
        s.fail_next.clear();
    }

    pub fn script_acquire(&self, result: VkResult<(u32, bool)>) {
        self.state.borrow_mut().acquire_script.push_back(result);
    }

    pub fn script_present(&self, result: VkResult<bool>) {
        self.state.borrow_mut().present_script.push_back(result);
    }

    /// Held submissions stay pending until waited on or drained.
    pub fn hold_submissions(&self, hold: bool) {
        self.state.borrow_mut().hold_submissions = hold;
    }

    pub fn complete_pending(&self) {
        self.state.borrow_mut().complete_all();
    }

    // ---- inspection ----

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state.borrow().calls.iter().filter(|c| **c == op).count()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    pub fn live_count(&self, kind: &str) -> usize {
        self.state
            .borrow()
            .live
            .values()
            .filter(|k| **k == kind)
            .count()
    }

    pub fn is_live<H: Handle>(&self, handle: H) -> bool {
        self.state.borrow().live.contains_key(&handle.as_raw())
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .borrow()
            .fences
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn render_areas(&self) -> Vec<vk::Rect2D> {
        self.state.borrow().render_areas.clone()
    }

    pub fn clear_values(&self) -> Vec<Vec<vk::ClearValue>> {
        self.state.borrow().clear_values.clone()
    }

    pub fn draws(&self) -> Vec<DrawCall> {
        self.state.borrow().draws.clone()
    }

    pub fn copies(&self) -> Vec<(vk::Buffer, vk::Buffer, vk::DeviceSize)> {
        self.state.borrow().copies.clone()
    }

    pub fn bound_sets(&self) -> Vec<vk::DescriptorSet> {
        self.state.borrow().bound_sets.clone()
    }

    pub fn presents(&self) -> Vec<u32> {
        self.state.borrow().presents.clone()
    }

    pub fn pipelines(&self) -> Vec<GraphicsPipelineDesc> {
        self.state.borrow().pipelines.clone()
    }

    pub fn render_passes(&self) -> Vec<RenderPassDesc> {
        self.state.borrow().render_passes.clone()
    }

    pub fn last_swapchain_request(&self) -> Option<SwapchainRequest> {
        self.state.borrow().last_swapchain_request.clone()
    }

    pub fn swapchain_extent(&self, swapchain: vk::SwapchainKHR) -> Option<vk::Extent2D> {
        self.state
            .borrow()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.extent)
    }

    pub fn created_queue_families(&self) -> Vec<u32> {
        self.state.borrow().device_families.clone()
    }

    pub fn validation_enabled(&self) -> bool {
        self.state.borrow().validation
    }

    pub fn is_mapped(&self, memory: vk::DeviceMemory) -> bool {
        self.state
            .borrow()
            .memory
            .get(&memory.as_raw())
            .is_some_and(|m| m.mapped)
    }

    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state
            .borrow()
            .memory
            .get(&memory.as_raw())
            .map(|m| m.bytes.clone())
            .unwrap_or_default()
    }

    /// No violations, no live handles, no instance or device left.
    #[track_caller]
    pub fn assert_clean(&self) {
        let s = self.state.borrow();
        assert!(s.violations.is_empty(), "violations: {:#?}", s.violations);
        let mut leaked: Vec<_> = s.live.iter().map(|(h, k)| format!("{k} {h:#x}")).collect();
        leaked.sort();
        assert!(leaked.is_empty(), "leaked handles: {leaked:#?}");
        assert!(s.device.is_none(), "device not destroyed");
        assert!(!s.context, "instance not destroyed");
    }

    #[track_caller]
    pub fn assert_no_violations(&self) {
        let s = self.state.borrow();
        assert!(s.violations.is_empty(), "violations: {:#?}", s.violations);
    }
}

impl Gpu for MockGpu {
    fn create_context(&mut self, validation: bool) -> VkResult<()> {
        let s = self.state.get_mut();
        s.call("vkCreateInstance")?;
        if s.context {
            s.violations.push("vkCreateInstance: instance already exists".into());
        }
        if validation && !s.validation_available {
            return Err(vk::Result::ERROR_LAYER_NOT_PRESENT);
        }
        s.context = true;
        s.validation = validation;
        Ok(())
    }

    fn destroy_context(&mut self) {
        let s = self.state.get_mut();
        s.calls.push("vkDestroyInstance");
        if s.device.is_some() {
            s.violations
                .push("vkDestroyInstance: device still alive".into());
        }
        if s.live.values().any(|k| *k == "surface") {
            s.violations
                .push("vkDestroyInstance: surface still alive".into());
        }
        s.context = false;
    }

    fn create_surface(&mut self) -> VkResult<vk::SurfaceKHR> {
        let s = self.state.get_mut();
        s.call("vkCreateSurfaceKHR")?;
        if !s.context {
            s.violations
                .push("vkCreateSurfaceKHR: no instance".into());
        }
        Ok(vk::SurfaceKHR::from_raw(s.alloc("surface")))
    }

    fn destroy_surface(&mut self, surface: vk::SurfaceKHR) {
        let s = self.state.get_mut();
        if s.device.is_some() {
            s.violations
                .push("vkDestroySurfaceKHR: device still alive".into());
        }
        s.release(surface.as_raw(), "surface", "vkDestroySurfaceKHR");
    }

    fn enumerate_adapters(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<AdapterInfo>> {
        let mut s = self.state.borrow_mut();
        s.call("vkEnumeratePhysicalDevices")?;
        s.check(surface.as_raw(), "surface", "vkEnumeratePhysicalDevices");
        Ok(s.adapters.clone())
    }

    fn create_device(
        &mut self,
        adapter: vk::PhysicalDevice,
        queue_families: &[u32],
        extensions: &[&'static CStr],
    ) -> VkResult<()> {
        let s = self.state.get_mut();
        s.call("vkCreateDevice")?;
        if !s.adapters.iter().any(|a| a.handle == adapter) {
            s.violations
                .push("vkCreateDevice: unknown adapter".into());
        }
        if extensions.is_empty() {
            s.violations
                .push("vkCreateDevice: no extensions requested".into());
        }
        s.device = Some(adapter);
        s.device_families = queue_families.to_vec();
        Ok(())
    }

    fn device_queue(&self, family: u32) -> vk::Queue {
        let mut s = self.state.borrow_mut();
        if !s.device_families.contains(&family) {
            s.violations
                .push(format!("vkGetDeviceQueue: family {family} was not requested"));
        }
        vk::Queue::from_raw(0xF000 + u64::from(family))
    }

    fn destroy_device(&mut self) {
        let s = self.state.get_mut();
        s.calls.push("vkDestroyDevice");
        if !s.pending.is_empty() {
            s.violations
                .push("vkDestroyDevice: GPU work pending".into());
        }
        let children: Vec<_> = s
            .live
            .iter()
            .filter(|(_, k)| **k != "surface")
            .map(|(h, k)| format!("{k} {h:#x}"))
            .collect();
        if !children.is_empty() {
            s.violations
                .push(format!("vkDestroyDevice: children alive {children:?}"));
        }
        s.device = None;
        s.device_families.clear();
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkDeviceWaitIdle")?;
        s.complete_all();
        Ok(())
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> VkResult<SurfaceSupport> {
        let mut s = self.state.borrow_mut();
        s.call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        s.check(
            surface.as_raw(),
            "surface",
            "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
        );
        Ok(s.surface.clone())
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        self.state.borrow().depth_formats.contains(&format)
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> VkResult<vk::SwapchainKHR> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateSwapchainKHR")?;
        s.check(request.surface.as_raw(), "surface", "vkCreateSwapchainKHR");
        if request.old_swapchain != vk::SwapchainKHR::null() {
            s.check(
                request.old_swapchain.as_raw(),
                "swapchain",
                "vkCreateSwapchainKHR",
            );
        }
        let raw = s.alloc("swapchain");
        let images = (0..request.min_image_count)
            .map(|_| s.alloc("swapchain image"))
            .collect();
        s.swapchains.insert(
            raw,
            Swapchain {
                images,
                extent: request.extent,
                next: 0,
            },
        );
        s.last_swapchain_request = Some(request.clone());
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut s = self.state.borrow_mut();
        if let Some(chain) = s.swapchains.remove(&swapchain.as_raw()) {
            for img in chain.images {
                s.live.remove(&img);
                s.destroyed.insert(img);
            }
        }
        s.release(swapchain.as_raw(), "swapchain", "vkDestroySwapchainKHR");
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let mut s = self.state.borrow_mut();
        s.call("vkGetSwapchainImagesKHR")?;
        s.check(swapchain.as_raw(), "swapchain", "vkGetSwapchainImagesKHR");
        Ok(s.swapchains
            .get(&swapchain.as_raw())
            .map(|c| c.images.iter().map(|&i| vk::Image::from_raw(i)).collect())
            .unwrap_or_default())
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateImageView")?;
        let kind = s.live.get(&image.as_raw()).copied().unwrap_or("image");
        s.check(image.as_raw(), kind, "vkCreateImageView");
        Ok(vk::ImageView::from_raw(s.alloc("image view")))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state
            .borrow_mut()
            .release(view.as_raw(), "image view", "vkDestroyImageView");
    }

    fn create_depth_image(
        &self,
        format: vk::Format,
        _extent: vk::Extent2D,
    ) -> VkResult<(vk::Image, vk::DeviceMemory)> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateImage")?;
        if !s.depth_formats.contains(&format) {
            s.violations
                .push(format!("vkCreateImage: unsupported depth format {format:?}"));
        }
        let image = s.alloc("image");
        let memory = s.alloc("memory");
        Ok((vk::Image::from_raw(image), vk::DeviceMemory::from_raw(memory)))
    }

    fn destroy_image(&self, image: vk::Image, memory: vk::DeviceMemory) {
        let mut s = self.state.borrow_mut();
        s.release(image.as_raw(), "image", "vkDestroyImage");
        s.release(memory.as_raw(), "memory", "vkFreeMemory");
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateRenderPass")?;
        s.render_passes.push(*desc);
        Ok(vk::RenderPass::from_raw(s.alloc("render pass")))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state
            .borrow_mut()
            .release(render_pass.as_raw(), "render pass", "vkDestroyRenderPass");
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateFramebuffer")?;
        s.check(render_pass.as_raw(), "render pass", "vkCreateFramebuffer");
        for view in attachments {
            s.check(view.as_raw(), "image view", "vkCreateFramebuffer");
        }
        Ok(vk::Framebuffer::from_raw(s.alloc("framebuffer")))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state
            .borrow_mut()
            .release(framebuffer.as_raw(), "framebuffer", "vkDestroyFramebuffer");
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateShaderModule")?;
        if code.is_empty() {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(vk::ShaderModule::from_raw(s.alloc("shader module")))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state
            .borrow_mut()
            .release(module.as_raw(), "shader module", "vkDestroyShaderModule");
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'static>],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateDescriptorSetLayout")?;
        Ok(vk::DescriptorSetLayout::from_raw(
            s.alloc("descriptor set layout"),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.borrow_mut().release(
            layout.as_raw(),
            "descriptor set layout",
            "vkDestroyDescriptorSetLayout",
        );
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<vk::PipelineLayout> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreatePipelineLayout")?;
        for l in set_layouts {
            s.check(l.as_raw(), "descriptor set layout", "vkCreatePipelineLayout");
        }
        Ok(vk::PipelineLayout::from_raw(s.alloc("pipeline layout")))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.borrow_mut().release(
            layout.as_raw(),
            "pipeline layout",
            "vkDestroyPipelineLayout",
        );
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateGraphicsPipelines")?;
        s.check(
            desc.vertex_module.as_raw(),
            "shader module",
            "vkCreateGraphicsPipelines",
        );
        s.check(
            desc.fragment_module.as_raw(),
            "shader module",
            "vkCreateGraphicsPipelines",
        );
        s.check(
            desc.layout.as_raw(),
            "pipeline layout",
            "vkCreateGraphicsPipelines",
        );
        s.check(
            desc.render_pass.as_raw(),
            "render pass",
            "vkCreateGraphicsPipelines",
        );
        s.pipelines.push(desc.clone());
        Ok(vk::Pipeline::from_raw(s.alloc("pipeline")))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state
            .borrow_mut()
            .release(pipeline.as_raw(), "pipeline", "vkDestroyPipeline");
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _uniform_descriptors: u32,
    ) -> VkResult<vk::DescriptorPool> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateDescriptorPool")?;
        Ok(vk::DescriptorPool::from_raw(s.alloc("descriptor pool")))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut s = self.state.borrow_mut();
        // sets go with their pool
        let sets: Vec<u64> = s
            .live
            .iter()
            .filter(|(_, k)| **k == "descriptor set")
            .map(|(h, _)| *h)
            .collect();
        for set in sets {
            s.live.remove(&set);
            s.destroyed.insert(set);
        }
        s.release(pool.as_raw(), "descriptor pool", "vkDestroyDescriptorPool");
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut s = self.state.borrow_mut();
        s.call("vkAllocateDescriptorSets")?;
        s.check(pool.as_raw(), "descriptor pool", "vkAllocateDescriptorSets");
        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(s.alloc("descriptor set")))
            .collect())
    }

    fn write_uniform_descriptor(
        &self,
        set: vk::DescriptorSet,
        _binding: u32,
        buffer: vk::Buffer,
        _range: vk::DeviceSize,
    ) {
        let mut s = self.state.borrow_mut();
        s.calls.push("vkUpdateDescriptorSets");
        s.check(set.as_raw(), "descriptor set", "vkUpdateDescriptorSets");
        s.check(buffer.as_raw(), "buffer", "vkUpdateDescriptorSets");
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> VkResult<BufferAllocation> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateBuffer")?;
        s.call("vkAllocateMemory")?;
        let mut flags = memory;
        if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            if s.host_coherent {
                flags |= vk::MemoryPropertyFlags::HOST_COHERENT;
            } else {
                flags &= !vk::MemoryPropertyFlags::HOST_COHERENT;
            }
        }
        let buffer = s.alloc("buffer");
        let mem = s.alloc("memory");
        s.memory.insert(
            mem,
            Memory {
                bytes: vec![0; size as usize],
                flags,
                mapped: false,
            },
        );
        Ok(BufferAllocation {
            buffer: vk::Buffer::from_raw(buffer),
            memory: vk::DeviceMemory::from_raw(mem),
            size,
            memory_flags: flags,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) {
        let mut s = self.state.borrow_mut();
        s.release(buffer.as_raw(), "buffer", "vkDestroyBuffer");
        s.memory.remove(&memory.as_raw());
        s.release(memory.as_raw(), "memory", "vkFreeMemory");
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkMapMemory")?;
        s.check(memory.as_raw(), "memory", "vkMapMemory");
        let mut bad = None;
        if let Some(m) = s.memory.get_mut(&memory.as_raw()) {
            if !m.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                bad = Some("vkMapMemory: memory is not host visible".to_owned());
            } else if m.mapped {
                bad = Some("vkMapMemory: memory is already mapped".to_owned());
            } else {
                m.mapped = true;
            }
        }
        if let Some(v) = bad {
            s.violations.push(v);
        }
        Ok(())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut s = self.state.borrow_mut();
        s.calls.push("vkUnmapMemory");
        s.check(memory.as_raw(), "memory", "vkUnmapMemory");
        s.check_mapped(memory.as_raw(), "vkUnmapMemory");
        if let Some(m) = s.memory.get_mut(&memory.as_raw()) {
            m.mapped = false;
        }
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.check(memory.as_raw(), "memory", "memcpy");
        s.check_mapped(memory.as_raw(), "memcpy");
        if let Some(m) = s.memory.get_mut(&memory.as_raw()) {
            let start = offset as usize;
            let end = start + data.len();
            if end > m.bytes.len() {
                return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
            }
            m.bytes[start..end].copy_from_slice(data);
        }
        Ok(())
    }

    fn flush_memory(
        &self,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkFlushMappedMemoryRanges")?;
        s.check(memory.as_raw(), "memory", "vkFlushMappedMemoryRanges");
        s.check_mapped(memory.as_raw(), "vkFlushMappedMemoryRanges");
        Ok(())
    }

    fn invalidate_memory(
        &self,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkInvalidateMappedMemoryRanges")?;
        s.check(memory.as_raw(), "memory", "vkInvalidateMappedMemoryRanges");
        s.check_mapped(memory.as_raw(), "vkInvalidateMappedMemoryRanges");
        Ok(())
    }

    fn create_command_pool(
        &self,
        _family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateCommandPool")?;
        Ok(vk::CommandPool::from_raw(s.alloc("command pool")))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut s = self.state.borrow_mut();
        if s.live.values().any(|k| *k == "command buffer") {
            s.violations
                .push("vkDestroyCommandPool: command buffers not freed".into());
        }
        s.release(pool.as_raw(), "command pool", "vkDestroyCommandPool");
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkResetCommandPool")?;
        s.check(pool.as_raw(), "command pool", "vkResetCommandPool");
        for state in s.commands.values_mut() {
            *state = CmdState::Initial;
        }
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut s = self.state.borrow_mut();
        s.call("vkAllocateCommandBuffers")?;
        s.check(pool.as_raw(), "command pool", "vkAllocateCommandBuffers");
        Ok((0..count)
            .map(|_| {
                let raw = s.alloc("command buffer");
                s.commands.insert(raw, CmdState::Initial);
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut s = self.state.borrow_mut();
        s.check(pool.as_raw(), "command pool", "vkFreeCommandBuffers");
        for cb in buffers {
            s.commands.remove(&cb.as_raw());
            s.release(cb.as_raw(), "command buffer", "vkFreeCommandBuffers");
        }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkBeginCommandBuffer")?;
        s.check(cmd.as_raw(), "command buffer", "vkBeginCommandBuffer");
        if s.pending.iter().any(|p| p.command_buffers.contains(&cmd.as_raw())) {
            s.violations
                .push("vkBeginCommandBuffer: buffer still executing".into());
        }
        if s.commands.get(&cmd.as_raw()) == Some(&CmdState::Recording) {
            s.violations
                .push("vkBeginCommandBuffer: already recording".into());
        }
        s.commands.insert(cmd.as_raw(), CmdState::Recording);
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkEndCommandBuffer")?;
        if s.commands.get(&cmd.as_raw()) != Some(&CmdState::Recording) {
            s.violations
                .push("vkEndCommandBuffer: not recording".into());
        }
        if s.in_render_pass.contains(&cmd.as_raw()) {
            s.violations
                .push("vkEndCommandBuffer: render pass still open".into());
        }
        s.commands.insert(cmd.as_raw(), CmdState::Executable);
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkResetCommandBuffer")?;
        s.check(cmd.as_raw(), "command buffer", "vkResetCommandBuffer");
        if s.pending.iter().any(|p| p.command_buffers.contains(&cmd.as_raw())) {
            s.violations
                .push("vkResetCommandBuffer: buffer still executing".into());
        }
        s.commands.insert(cmd.as_raw(), CmdState::Initial);
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdBeginRenderPass");
        s.check(render_pass.as_raw(), "render pass", "vkCmdBeginRenderPass");
        s.check(framebuffer.as_raw(), "framebuffer", "vkCmdBeginRenderPass");
        if !s.in_render_pass.insert(cmd.as_raw()) {
            s.violations
                .push("vkCmdBeginRenderPass: nested render pass".into());
        }
        s.render_areas.push(area);
        s.clear_values.push(clear_values.to_vec());
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdEndRenderPass");
        if !s.in_render_pass.remove(&cmd.as_raw()) {
            s.violations
                .push("vkCmdEndRenderPass: no render pass open".into());
        }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdBindPipeline");
        s.check(pipeline.as_raw(), "pipeline", "vkCmdBindPipeline");
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, _viewport: vk::Viewport) {
        self.state
            .borrow_mut()
            .recording(cmd, "vkCmdSetViewport");
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, _scissor: vk::Rect2D) {
        self.state.borrow_mut().recording(cmd, "vkCmdSetScissor");
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdBindVertexBuffers");
        if buffers.len() != offsets.len() {
            s.violations
                .push("vkCmdBindVertexBuffers: buffer/offset count mismatch".into());
        }
        for b in buffers {
            s.check(b.as_raw(), "buffer", "vkCmdBindVertexBuffers");
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_type: vk::IndexType,
    ) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdBindIndexBuffer");
        s.check(buffer.as_raw(), "buffer", "vkCmdBindIndexBuffer");
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdBindDescriptorSets");
        s.check(layout.as_raw(), "pipeline layout", "vkCmdBindDescriptorSets");
        for set in sets {
            s.check(set.as_raw(), "descriptor set", "vkCmdBindDescriptorSets");
        }
        s.bound_sets.extend_from_slice(sets);
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, _instance_count: u32) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdDraw");
        if !s.in_render_pass.contains(&cmd.as_raw()) {
            s.violations
                .push("vkCmdDraw: outside render pass".into());
        }
        s.draws.push(DrawCall {
            indexed: false,
            count: vertex_count,
        });
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, _instance_count: u32) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdDrawIndexed");
        if !s.in_render_pass.contains(&cmd.as_raw()) {
            s.violations
                .push("vkCmdDrawIndexed: outside render pass".into());
        }
        s.draws.push(DrawCall {
            indexed: true,
            count: index_count,
        });
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut s = self.state.borrow_mut();
        s.recording(cmd, "vkCmdCopyBuffer");
        s.check(src.as_raw(), "buffer", "vkCmdCopyBuffer");
        s.check(dst.as_raw(), "buffer", "vkCmdCopyBuffer");
        let size = regions.iter().map(|r| r.size).sum();
        s.copies.push((src, dst, size));
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateSemaphore")?;
        let raw = s.alloc("semaphore");
        s.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut s = self.state.borrow_mut();
        s.semaphores.remove(&semaphore.as_raw());
        s.release(semaphore.as_raw(), "semaphore", "vkDestroySemaphore");
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut s = self.state.borrow_mut();
        s.call("vkCreateFence")?;
        let raw = s.alloc("fence");
        s.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut s = self.state.borrow_mut();
        if s.pending.iter().any(|p| p.fence == fence.as_raw()) {
            s.violations
                .push("vkDestroyFence: fence still in use".into());
        }
        s.fences.remove(&fence.as_raw());
        s.release(fence.as_raw(), "fence", "vkDestroyFence");
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VkResult<bool> {
        let mut s = self.state.borrow_mut();
        s.call("vkWaitForFences")?;
        let mut all = true;
        for f in fences {
            let raw = f.as_raw();
            s.check(raw, "fence", "vkWaitForFences");
            if s.fences.get(&raw).copied().unwrap_or(false) {
                continue;
            }
            let in_flight = s.pending.iter().any(|p| p.fence == raw);
            if in_flight && timeout_ns == u64::MAX {
                // blocks until the GPU gets there
                s.complete_fence(raw);
            } else if !in_flight && timeout_ns == u64::MAX {
                s.violations
                    .push(format!("vkWaitForFences: fence {raw:#x} can never signal"));
                all = false;
            } else {
                all = false;
            }
        }
        Ok(all)
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkResetFences")?;
        for f in fences {
            let raw = f.as_raw();
            s.check(raw, "fence", "vkResetFences");
            if s.pending.iter().any(|p| p.fence == raw) {
                s.violations
                    .push("vkResetFences: fence still in use".into());
            }
            s.fences.insert(raw, false);
        }
        Ok(())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkQueueSubmit")?;
        if batch.wait_semaphores.len() != batch.wait_stages.len() {
            s.violations
                .push("vkQueueSubmit: wait semaphore/stage count mismatch".into());
        }
        for cb in &batch.command_buffers {
            s.check(cb.as_raw(), "command buffer", "vkQueueSubmit");
            if s.commands.get(&cb.as_raw()) != Some(&CmdState::Executable) {
                s.violations
                    .push("vkQueueSubmit: command buffer not executable".into());
            }
        }
        for sem in &batch.wait_semaphores {
            s.check(sem.as_raw(), "semaphore", "vkQueueSubmit");
            if s.semaphores.insert(sem.as_raw(), false) != Some(true) {
                s.violations
                    .push("vkQueueSubmit: waits on a semaphore nothing signals".into());
            }
        }
        for sem in &batch.signal_semaphores {
            s.check(sem.as_raw(), "semaphore", "vkQueueSubmit");
            s.semaphores.insert(sem.as_raw(), true);
        }
        let raw_fence = fence.as_raw();
        if raw_fence != 0 {
            s.check(raw_fence, "fence", "vkQueueSubmit");
            if s.fences.get(&raw_fence) == Some(&true) {
                s.violations
                    .push("vkQueueSubmit: fence already signaled".into());
            }
        }
        if s.hold_submissions {
            let command_buffers = batch.command_buffers.iter().map(|c| c.as_raw()).collect();
            s.pending.push(Pending {
                fence: raw_fence,
                command_buffers,
            });
        } else if raw_fence != 0 {
            s.fences.insert(raw_fence, true);
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        let mut s = self.state.borrow_mut();
        s.call("vkQueueWaitIdle")?;
        s.complete_all();
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut s = self.state.borrow_mut();
        s.call("vkAcquireNextImageKHR")?;
        s.check(swapchain.as_raw(), "swapchain", "vkAcquireNextImageKHR");
        s.check(semaphore.as_raw(), "semaphore", "vkAcquireNextImageKHR");
        let scripted = s.acquire_script.pop_front();
        let (index, suboptimal) = match scripted {
            Some(Err(e)) => return Err(e),
            Some(Ok(pair)) => pair,
            None => {
                let Some(chain) = s.swapchains.get_mut(&swapchain.as_raw()) else {
                    return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
                };
                let index = chain.next;
                chain.next = (chain.next + 1) % chain.images.len().max(1) as u32;
                (index, false)
            }
        };
        if s.semaphores.insert(semaphore.as_raw(), true) == Some(true) {
            s.violations
                .push("vkAcquireNextImageKHR: semaphore already signaled".into());
        }
        Ok((index, suboptimal))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut s = self.state.borrow_mut();
        s.call("vkQueuePresentKHR")?;
        s.check(swapchain.as_raw(), "swapchain", "vkQueuePresentKHR");
        for sem in wait_semaphores {
            s.check(sem.as_raw(), "semaphore", "vkQueuePresentKHR");
            if s.semaphores.insert(sem.as_raw(), false) != Some(true) {
                s.violations
                    .push("vkQueuePresentKHR: waits on a semaphore nothing signals".into());
            }
        }
        s.presents.push(image_index);
        s.present_script.pop_front().unwrap_or(Ok(false))
    }
}
