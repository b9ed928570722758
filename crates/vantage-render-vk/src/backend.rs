// SPDX-License-Identifier: CEPL-1.0
//! [`Gpu`] over a real driver through `ash`.
//!
//! Everything here is a thin translation from the plain descriptors in
//! [`crate::gpu`] to create-info structs. Calls that need a device before
//! one exists fail with `ERROR_INITIALIZATION_FAILED`; destroys become
//! no-ops.
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};

use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use tracing::Level;
use vantage_core::{Diagnostics, DiagnosticsExt, SharedDiagnostics};

use crate::error::{Result, VkError, VALIDATION_LAYER};
use crate::gpu::{
    AdapterFeatures, AdapterInfo, BufferAllocation, GraphicsPipelineDesc, Gpu, QueueFamilyInfo,
    RenderPassDesc, SubmitBatch, SurfaceSupport, SwapchainRequest,
};

const COMPONENT: &str = "vulkan";
const APP_NAME: &CStr = c"Vantage";

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || user.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let diag = &*(user as *const SharedDiagnostics);
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    let level = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Level::ERROR
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Level::WARN
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Level::INFO
    } else {
        Level::DEBUG
    };
    diag.record(level, "validation", &msg);
    vk::FALSE
}

struct Messenger {
    loader: ext_debug::Instance,
    handle: vk::DebugUtilsMessengerEXT,
    // the callback reads through this pointer until the messenger is gone
    _sink: Box<SharedDiagnostics>,
}

struct InstanceState {
    instance: ash::Instance,
    surface: surface::Instance,
    messenger: Option<Messenger>,
}

struct DeviceState {
    physical: vk::PhysicalDevice,
    device: ash::Device,
    swapchain: swapchain::Device,
    memory: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom: vk::DeviceSize,
    /// Live host mappings, whole allocation each.
    mapped: RefCell<HashMap<vk::DeviceMemory, *mut u8>>,
}

fn no_device<T>() -> VkResult<T> {
    Err(vk::Result::ERROR_INITIALIZATION_FAILED)
}

/// First memory type allowed by `type_bits` that has every `wanted` flag.
fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    wanted: vk::MemoryPropertyFlags,
) -> Option<(u32, vk::MemoryPropertyFlags)> {
    (0..memory.memory_type_count).find_map(|i| {
        let flags = memory.memory_types[i as usize].property_flags;
        ((type_bits & (1 << i)) != 0 && flags.contains(wanted)).then_some((i, flags))
    })
}

pub struct AshGpu {
    entry: Entry,
    display: RawDisplayHandle,
    window: RawWindowHandle,
    diag: SharedDiagnostics,
    instance: Option<InstanceState>,
    device: Option<DeviceState>,
}

impl AshGpu {
    /// The handles must stay valid for as long as a surface made from them
    /// exists.
    pub fn new(display: RawDisplayHandle, window: RawWindowHandle, diag: SharedDiagnostics) -> Self {
        Self {
            entry: Entry::linked(),
            display,
            window,
            diag,
            instance: None,
            device: None,
        }
    }

    pub fn from_window(
        window: &(impl HasWindowHandle + HasDisplayHandle),
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        let display = window
            .display_handle()
            .map_err(|e| VkError::Window(e.to_string()))?
            .as_raw();
        let window = window
            .window_handle()
            .map_err(|e| VkError::Window(e.to_string()))?
            .as_raw();
        Ok(Self::new(display, window, diag))
    }

    fn instance(&self) -> VkResult<&InstanceState> {
        self.instance.as_ref().ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn dev(&self) -> VkResult<&DeviceState> {
        self.device.as_ref().ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn validation_layer_present(&self) -> VkResult<bool> {
        let layers = unsafe { self.entry.enumerate_instance_layer_properties()? };
        Ok(layers.iter().any(|l| {
            let name = unsafe { CStr::from_ptr(l.layer_name.as_ptr()) };
            name.to_bytes() == VALIDATION_LAYER.as_bytes()
        }))
    }

    fn create_messenger(&self, instance: &ash::Instance) -> VkResult<Messenger> {
        let loader = ext_debug::Instance::new(&self.entry, instance);
        let sink = Box::new(self.diag.clone());
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            p_user_data: &*sink as *const SharedDiagnostics as *mut c_void,
            ..Default::default()
        };
        let handle = unsafe { loader.create_debug_utils_messenger(&ci, None)? };
        Ok(Messenger {
            loader,
            handle,
            _sink: sink,
        })
    }

    fn adapter_info(
        &self,
        inst: &InstanceState,
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> AdapterInfo {
        let instance = &inst.instance;
        let (props, feats, memory, families, exts) = unsafe {
            (
                instance.get_physical_device_properties(physical),
                instance.get_physical_device_features(physical),
                instance.get_physical_device_memory_properties(physical),
                instance.get_physical_device_queue_family_properties(physical),
                instance
                    .enumerate_device_extension_properties(physical)
                    .unwrap_or_default(),
            )
        };

        let mut features = AdapterFeatures::empty();
        features.set(AdapterFeatures::GEOMETRY_SHADER, feats.geometry_shader == vk::TRUE);
        features.set(
            AdapterFeatures::TESSELLATION_SHADER,
            feats.tessellation_shader == vk::TRUE,
        );
        features.set(
            AdapterFeatures::SAMPLER_ANISOTROPY,
            feats.sampler_anisotropy == vk::TRUE,
        );

        let device_local_bytes: u64 = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|h| h.size)
            .sum();

        let queue_families = families
            .iter()
            .enumerate()
            .map(|(i, f)| QueueFamilyInfo {
                flags: f.queue_flags,
                queue_count: f.queue_count,
                // a failed query counts as "cannot present"
                present: unsafe {
                    inst.surface
                        .get_physical_device_surface_support(physical, i as u32, surface)
                        .unwrap_or(false)
                },
            })
            .collect();

        let extensions = exts
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned())
            .collect();

        let (surface_format_count, present_mode_count) = unsafe {
            (
                inst.surface
                    .get_physical_device_surface_formats(physical, surface)
                    .map_or(0, |f| f.len()),
                inst.surface
                    .get_physical_device_surface_present_modes(physical, surface)
                    .map_or(0, |m| m.len()),
            )
        };

        AdapterInfo {
            handle: physical,
            name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            device_type: props.device_type,
            max_image_dimension_2d: props.limits.max_image_dimension2_d,
            features,
            device_local_bytes,
            queue_families,
            extensions,
            surface_format_count,
            present_mode_count,
        }
    }

    fn allocate(
        d: &DeviceState,
        requirements: vk::MemoryRequirements,
        wanted: vk::MemoryPropertyFlags,
    ) -> VkResult<(vk::DeviceMemory, vk::MemoryPropertyFlags)> {
        // coherent is a preference; write() flushes when it is missing
        let found = find_memory_type(&d.memory, requirements.memory_type_bits, wanted).or_else(|| {
            wanted
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
                .then(|| {
                    find_memory_type(
                        &d.memory,
                        requirements.memory_type_bits,
                        wanted & !vk::MemoryPropertyFlags::HOST_COHERENT,
                    )
                })
                .flatten()
        });
        let Some((index, flags)) = found else {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        };
        let ai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: requirements.size,
            memory_type_index: index,
            ..Default::default()
        };
        let memory = unsafe { d.device.allocate_memory(&ai, None)? };
        Ok((memory, flags))
    }

    /// Aligns a host range to `nonCoherentAtomSize`; the tail runs to the
    /// end of the allocation.
    fn mapped_range(d: &DeviceState, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> vk::MappedMemoryRange<'static> {
        let atom = d.non_coherent_atom.max(1);
        vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            memory,
            offset: offset - offset % atom,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        }
    }
}

impl Drop for AshGpu {
    fn drop(&mut self) {
        if self.device.is_some() {
            let _ = self.device_wait_idle();
            self.destroy_device();
        }
        self.destroy_context();
    }
}

impl Gpu for AshGpu {
    // --- instance / surface / device ---

    fn create_context(&mut self, validation: bool) -> VkResult<()> {
        // STRICT ORDER:
        // 1) validation layer presence checked before anything is created
        // 2) instance with the platform WSI extensions (+ debug utils)
        // 3) surface loader and debug messenger bound to THIS instance
        if self.instance.is_some() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        if validation && !self.validation_layer_present()? {
            return Err(vk::Result::ERROR_LAYER_NOT_PRESENT);
        }

        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: APP_NAME.as_ptr(),
            application_version: 0,
            p_engine_name: APP_NAME.as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_2,
            ..Default::default()
        };

        let mut extensions = ash_window::enumerate_required_extensions(self.display)?.to_vec();
        if validation {
            extensions.push(ext_debug::NAME.as_ptr());
        }
        let layer = CString::new(VALIDATION_LAYER).map_err(|_| vk::Result::ERROR_LAYER_NOT_PRESENT)?;
        let layers = [layer.as_ptr()];
        let (enabled_layer_count, pp_enabled_layer_names) = if validation {
            (layers.len() as u32, layers.as_ptr())
        } else {
            (0, std::ptr::null())
        };

        let ci = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            enabled_layer_count,
            pp_enabled_layer_names,
            ..Default::default()
        };
        let instance = unsafe { self.entry.create_instance(&ci, None)? };

        let messenger = if validation {
            match self.create_messenger(&instance) {
                Ok(m) => Some(m),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.diag.created(
            COMPONENT,
            format!("instance (validation={validation}, {} extension(s))", extensions.len()),
        );
        self.instance = Some(InstanceState {
            surface: surface::Instance::new(&self.entry, &instance),
            instance,
            messenger,
        });
        Ok(())
    }

    fn destroy_context(&mut self) {
        let Some(inst) = self.instance.take() else {
            return;
        };
        unsafe {
            if let Some(m) = inst.messenger {
                m.loader.destroy_debug_utils_messenger(m.handle, None);
            }
            inst.instance.destroy_instance(None);
        }
        self.diag.destroyed(COMPONENT, "instance");
    }

    fn create_surface(&mut self) -> VkResult<vk::SurfaceKHR> {
        let inst = self.instance()?;
        unsafe {
            ash_window::create_surface(&self.entry, &inst.instance, self.display, self.window, None)
        }
    }

    fn destroy_surface(&mut self, surface: vk::SurfaceKHR) {
        if let Some(inst) = &self.instance {
            unsafe { inst.surface.destroy_surface(surface, None) };
        }
    }

    fn enumerate_adapters(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<AdapterInfo>> {
        let inst = self.instance()?;
        let physicals = unsafe { inst.instance.enumerate_physical_devices()? };
        Ok(physicals
            .into_iter()
            .map(|p| self.adapter_info(inst, p, surface))
            .collect())
    }

    fn create_device(
        &mut self,
        adapter: vk::PhysicalDevice,
        queue_families: &[u32],
        extensions: &[&'static CStr],
    ) -> VkResult<()> {
        let inst = self.instance()?;
        if self.device.is_some() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }

        let priorities = [1.0f32];
        let queue_cis: Vec<_> = queue_families
            .iter()
            .map(|&family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();
        let ext_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let ci = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_cis.len() as u32,
            p_queue_create_infos: queue_cis.as_ptr(),
            enabled_extension_count: ext_ptrs.len() as u32,
            pp_enabled_extension_names: ext_ptrs.as_ptr(),
            p_enabled_features: &features,
            ..Default::default()
        };

        let (device, memory, props) = unsafe {
            (
                inst.instance.create_device(adapter, &ci, None)?,
                inst.instance.get_physical_device_memory_properties(adapter),
                inst.instance.get_physical_device_properties(adapter),
            )
        };
        let swapchain = swapchain::Device::new(&inst.instance, &device);
        self.device = Some(DeviceState {
            physical: adapter,
            device,
            swapchain,
            memory,
            non_coherent_atom: props.limits.non_coherent_atom_size,
            mapped: RefCell::new(HashMap::new()),
        });
        Ok(())
    }

    fn device_queue(&self, family: u32) -> vk::Queue {
        match &self.device {
            Some(d) => unsafe { d.device.get_device_queue(family, 0) },
            None => vk::Queue::null(),
        }
    }

    fn destroy_device(&mut self) {
        if let Some(d) = self.device.take() {
            unsafe { d.device.destroy_device(None) };
        }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.dev()?.device.device_wait_idle() }
    }

    // --- surface queries ---

    fn surface_support(&self, surface: vk::SurfaceKHR) -> VkResult<SurfaceSupport> {
        let inst = self.instance()?;
        let physical = self.dev()?.physical;
        unsafe {
            Ok(SurfaceSupport {
                capabilities: inst
                    .surface
                    .get_physical_device_surface_capabilities(physical, surface)?,
                formats: inst
                    .surface
                    .get_physical_device_surface_formats(physical, surface)?,
                present_modes: inst
                    .surface
                    .get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        let (Ok(inst), Ok(d)) = (self.instance(), self.dev()) else {
            return false;
        };
        let props = unsafe {
            inst.instance
                .get_physical_device_format_properties(d.physical, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    // --- presentable images ---

    fn create_swapchain(&self, request: &SwapchainRequest) -> VkResult<vk::SwapchainKHR> {
        let d = self.dev()?;
        let concurrent = request.sharing_mode == vk::SharingMode::CONCURRENT;
        let ci = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: request.surface,
            min_image_count: request.min_image_count,
            image_format: request.format.format,
            image_color_space: request.format.color_space,
            image_extent: request.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: request.sharing_mode,
            queue_family_index_count: if concurrent {
                request.queue_family_indices.len() as u32
            } else {
                0
            },
            p_queue_family_indices: if concurrent {
                request.queue_family_indices.as_ptr()
            } else {
                std::ptr::null()
            },
            pre_transform: request.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: request.present_mode,
            clipped: vk::TRUE,
            old_swapchain: request.old_swapchain,
            ..Default::default()
        };
        unsafe { d.swapchain.create_swapchain(&ci, None) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(d) = &self.device {
            unsafe { d.swapchain.destroy_swapchain(swapchain, None) };
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.dev()?.swapchain.get_swapchain_images(swapchain) }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_image_view(&ci, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_image_view(view, None) };
        }
    }

    fn create_depth_image(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> VkResult<(vk::Image, vk::DeviceMemory)> {
        let d = self.dev()?;
        let ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        unsafe {
            let image = d.device.create_image(&ci, None)?;
            let requirements = d.device.get_image_memory_requirements(image);
            let bound = Self::allocate(d, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .and_then(|(memory, _)| match d.device.bind_image_memory(image, memory, 0) {
                    Ok(()) => Ok(memory),
                    Err(e) => {
                        d.device.free_memory(memory, None);
                        Err(e)
                    }
                });
            match bound {
                Ok(memory) => Ok((image, memory)),
                Err(e) => {
                    d.device.destroy_image(image, None);
                    Err(e)
                }
            }
        }
    }

    fn destroy_image(&self, image: vk::Image, memory: vk::DeviceMemory) {
        if let Some(d) = &self.device {
            unsafe {
                d.device.destroy_image(image, None);
                d.device.free_memory(memory, None);
            }
        }
    }

    // --- render targets ---

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let attachment = |a: &crate::gpu::AttachmentDesc| vk::AttachmentDescription {
            format: a.format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: a.load_op,
            store_op: a.store_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: a.initial_layout,
            final_layout: a.final_layout,
            ..Default::default()
        };
        let attachments = [attachment(&desc.color), attachment(&desc.depth)];
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: desc.color.subpass_layout,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: desc.depth.subpass_layout,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &color_ref,
            p_depth_stencil_attachment: &depth_ref,
            ..Default::default()
        };
        let ci = vk::RenderPassCreateInfo {
            s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: 1,
            p_dependencies: &desc.dependency,
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_render_pass(&ci, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_render_pass(render_pass, None) };
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let ci = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_framebuffer(&ci, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    // --- pipeline ---

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let ci = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            code_size: std::mem::size_of_val(code),
            p_code: code.as_ptr(),
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_shader_module(&ci, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_shader_module(module, None) };
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'static>],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_descriptor_set_layout(&ci, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<vk::PipelineLayout> {
        let ci = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: set_layouts.len() as u32,
            p_set_layouts: set_layouts.as_ptr(),
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_pipeline_layout(&ci, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_pipeline_layout(layout, None) };
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline> {
        let d = self.dev()?;

        // --- stages ---
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: desc.vertex_module,
                p_name: desc.entry_point.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: desc.fragment_module,
                p_name: desc.entry_point.as_ptr(),
                ..Default::default()
            },
        ];

        // --- fixed function ---
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            vertex_binding_description_count: desc.vertex_bindings.len() as u32,
            p_vertex_binding_descriptions: desc.vertex_bindings.as_ptr(),
            vertex_attribute_description_count: desc.vertex_attributes.len() as u32,
            p_vertex_attribute_descriptions: desc.vertex_attributes.as_ptr(),
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: desc.topology,
            primitive_restart_enable: vk::FALSE,
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            p_viewports: &desc.viewport,
            scissor_count: 1,
            p_scissors: &desc.scissor,
            ..Default::default()
        };
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: desc.polygon_mode,
            cull_mode: desc.cull_mode,
            front_face: desc.front_face,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: desc.samples,
            ..Default::default()
        };
        let depth = vk::PipelineDepthStencilStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
            depth_test_enable: desc.depth_test.into(),
            depth_write_enable: desc.depth_write.into(),
            depth_compare_op: desc.depth_compare,
            ..Default::default()
        };
        let blend_attachment = vk::PipelineColorBlendAttachmentState {
            blend_enable: desc.blend_enable.into(),
            color_write_mask: desc.color_write_mask,
            ..Default::default()
        };
        let blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &blend_attachment,
            ..Default::default()
        };
        let dynamic = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: desc.dynamic_states.len() as u32,
            p_dynamic_states: desc.dynamic_states.as_ptr(),
            ..Default::default()
        };

        let ci = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth,
            p_color_blend_state: &blend,
            p_dynamic_state: &dynamic,
            layout: desc.layout,
            render_pass: desc.render_pass,
            subpass: desc.subpass,
            ..Default::default()
        };
        let pipelines = unsafe {
            d.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[ci], None)
                .map_err(|(_, e)| e)?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_pipeline(pipeline, None) };
        }
    }

    // --- descriptors ---

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        uniform_descriptors: u32,
    ) -> VkResult<vk::DescriptorPool> {
        let size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: uniform_descriptors,
        };
        let ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets,
            pool_size_count: 1,
            p_pool_sizes: &size,
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_descriptor_pool(&ci, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_descriptor_pool(pool, None) };
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool,
            descriptor_set_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        unsafe { self.dev()?.device.allocate_descriptor_sets(&ai) }
    }

    fn write_uniform_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let Some(d) = &self.device else {
            return;
        };
        let info = vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: set,
            dst_binding: binding,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            p_buffer_info: &info,
            ..Default::default()
        };
        unsafe { d.device.update_descriptor_sets(&[write], &[]) };
    }

    // --- buffers and memory ---

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> VkResult<BufferAllocation> {
        let d = self.dev()?;
        let ci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let buffer = d.device.create_buffer(&ci, None)?;
            let requirements = d.device.get_buffer_memory_requirements(buffer);
            let bound = Self::allocate(d, requirements, memory).and_then(|(mem, flags)| {
                match d.device.bind_buffer_memory(buffer, mem, 0) {
                    Ok(()) => Ok((mem, flags)),
                    Err(e) => {
                        d.device.free_memory(mem, None);
                        Err(e)
                    }
                }
            });
            match bound {
                Ok((mem, memory_flags)) => Ok(BufferAllocation {
                    buffer,
                    memory: mem,
                    size: requirements.size,
                    memory_flags,
                }),
                Err(e) => {
                    d.device.destroy_buffer(buffer, None);
                    Err(e)
                }
            }
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) {
        if let Some(d) = &self.device {
            if d.mapped.borrow_mut().remove(&memory).is_some() {
                unsafe { d.device.unmap_memory(memory) };
            }
            unsafe {
                d.device.destroy_buffer(buffer, None);
                d.device.free_memory(memory, None);
            }
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let d = self.dev()?;
        if d.mapped.borrow().contains_key(&memory) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let ptr = unsafe {
            d.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        d.mapped.borrow_mut().insert(memory, ptr.cast::<u8>());
        Ok(())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(d) = &self.device {
            if d.mapped.borrow_mut().remove(&memory).is_some() {
                unsafe { d.device.unmap_memory(memory) };
            }
        }
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        let d = self.dev()?;
        let base = d
            .mapped
            .borrow()
            .get(&memory)
            .copied()
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        // range checked by the caller against the buffer size
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn flush_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()> {
        let d = self.dev()?;
        if !d.mapped.borrow().contains_key(&memory) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let range = Self::mapped_range(d, memory, offset);
        unsafe { d.device.flush_mapped_memory_ranges(&[range]) }
    }

    fn invalidate_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()> {
        let d = self.dev()?;
        if !d.mapped.borrow().contains_key(&memory) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let range = Self::mapped_range(d, memory, offset);
        unsafe { d.device.invalidate_mapped_memory_ranges(&[range]) }
    }

    // --- command pools and buffers ---

    fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags,
            queue_family_index: family,
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_command_pool(&ci, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_command_pool(pool, None) };
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe {
            self.dev()?
                .device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level,
            command_buffer_count: count,
            ..Default::default()
        };
        unsafe { self.dev()?.device.allocate_command_buffers(&ai) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        if let Some(d) = &self.device {
            unsafe { d.device.free_command_buffers(pool, buffers) };
        }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags,
            ..Default::default()
        };
        unsafe { self.dev()?.device.begin_command_buffer(cmd, &bi) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.dev()?.device.end_command_buffer(cmd) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.dev()?
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
    }

    // --- recording ---

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let Some(d) = &self.device else {
            return;
        };
        let bi = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass,
            framebuffer,
            render_area: area,
            clear_value_count: clear_values.len() as u32,
            p_clear_values: clear_values.as_ptr(),
            ..Default::default()
        };
        unsafe {
            d.device
                .cmd_begin_render_pass(cmd, &bi, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        if let Some(d) = &self.device {
            unsafe { d.device.cmd_end_render_pass(cmd) };
        }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        if let Some(d) = &self.device {
            unsafe {
                d.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
            };
        }
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        if let Some(d) = &self.device {
            unsafe { d.device.cmd_set_viewport(cmd, 0, &[viewport]) };
        }
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        if let Some(d) = &self.device {
            unsafe { d.device.cmd_set_scissor(cmd, 0, &[scissor]) };
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        if let Some(d) = &self.device {
            unsafe { d.device.cmd_bind_vertex_buffers(cmd, 0, buffers, offsets) };
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        if let Some(d) = &self.device {
            unsafe {
                d.device
                    .cmd_bind_index_buffer(cmd, buffer, offset, index_type)
            };
        }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        if let Some(d) = &self.device {
            unsafe {
                d.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    sets,
                    &[],
                )
            };
        }
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        if let Some(d) = &self.device {
            unsafe { d.device.cmd_draw(cmd, vertex_count, instance_count, 0, 0) };
        }
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        if let Some(d) = &self.device {
            unsafe {
                d.device
                    .cmd_draw_indexed(cmd, index_count, instance_count, 0, 0, 0)
            };
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        if let Some(d) = &self.device {
            unsafe { d.device.cmd_copy_buffer(cmd, src, dst, regions) };
        }
    }

    // --- synchronization and queues ---

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_semaphore(&ci, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.dev()?.device.create_fence(&ci, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if let Some(d) = &self.device {
            unsafe { d.device.destroy_fence(fence, None) };
        }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VkResult<bool> {
        match unsafe { self.dev()?.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.dev()?.device.reset_fences(fences) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let d = self.dev()?;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: batch.wait_semaphores.len() as u32,
            p_wait_semaphores: batch.wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: batch.wait_stages.as_ptr(),
            command_buffer_count: batch.command_buffers.len() as u32,
            p_command_buffers: batch.command_buffers.as_ptr(),
            signal_semaphore_count: batch.signal_semaphores.len() as u32,
            p_signal_semaphores: batch.signal_semaphores.as_ptr(),
            ..Default::default()
        };
        unsafe { d.device.queue_submit(queue, &[submit], fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.dev()?.device.queue_wait_idle(queue) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let Some(d) = &self.device else {
            return no_device();
        };
        unsafe {
            d.swapchain
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let Some(d) = &self.device else {
            return no_device();
        };
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe { d.swapchain.queue_present(queue, &present) }
    }
}
