// SPDX-License-Identifier: CEPL-1.0
//! Presentable image chain: negotiation against surface capabilities,
//! creation, and full recreation.
use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};
use vantage_render::RenderSize;

use crate::device::DeviceContext;
use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::{Gpu, SurfaceSupport, SwapchainRequest};

const COMPONENT: &str = "swapchain";

/// BGRA8 sRGB, then RGBA8 sRGB, then whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];
    PREFERRED
        .iter()
        .find_map(|want| {
            formats.iter().copied().find(|f| {
                f.format == *want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
}

/// MAILBOX, then IMMEDIATE, then FIFO (always available).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// A fixed `current_extent` wins; `u32::MAX` means the window decides,
/// clamped into the surface's bounds.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: want
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: want
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum; a maximum of 0 means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub struct SwapchainManager {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    generation: u64,
    diag: SharedDiagnostics,
}

impl SwapchainManager {
    pub fn create(
        gpu: &dyn Gpu,
        device: &DeviceContext,
        surface: vk::SurfaceKHR,
        size: RenderSize,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        let mut sc = Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            generation: 0,
            diag,
        };
        if let Err(e) = sc.build(gpu, device, surface, size) {
            sc.cleanup(gpu);
            return Err(e);
        }
        Ok(sc)
    }

    fn build(
        &mut self,
        gpu: &dyn Gpu,
        device: &DeviceContext,
        surface: vk::SurfaceKHR,
        size: RenderSize,
    ) -> Result<()> {
        // --- Query surface capabilities / formats / present modes ---
        let SurfaceSupport {
            capabilities: caps,
            formats,
            present_modes,
        } = gpu
            .surface_support(surface)
            .op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        if formats.is_empty() || present_modes.is_empty() {
            return Err(VkError::precondition(format!(
                "surface reports {} format(s) and {} present mode(s)",
                formats.len(),
                present_modes.len()
            )));
        }

        // --- Negotiate ---
        let format = choose_surface_format(&formats)
            .ok_or_else(|| VkError::precondition("surface reports no formats"))?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&caps, size);
        let min_image_count = choose_image_count(&caps);
        if extent.width == 0 || extent.height == 0 {
            return Err(VkError::precondition("swapchain extent is 0x0"));
        }

        // Prefer IDENTITY if supported, otherwise keep whatever the compositor uses
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let sharing_mode = device.families.sharing_mode();
        let queue_family_indices = if sharing_mode == vk::SharingMode::CONCURRENT {
            device.families.unique()[..2].to_vec()
        } else {
            Vec::new()
        };

        let request = SwapchainRequest {
            surface,
            min_image_count,
            format,
            extent,
            present_mode,
            pre_transform,
            sharing_mode,
            queue_family_indices,
            old_swapchain: vk::SwapchainKHR::null(),
        };

        // --- Create swapchain + fetch images ---
        self.handle = gpu.create_swapchain(&request).op("vkCreateSwapchainKHR")?;
        self.images = gpu
            .swapchain_images(self.handle)
            .op("vkGetSwapchainImagesKHR")?;

        // --- One view per image; view format MUST match the chain ---
        self.image_views.reserve(self.images.len());
        for &image in &self.images {
            let view = gpu
                .create_image_view(image, format.format, vk::ImageAspectFlags::COLOR)
                .op("vkCreateImageView")?;
            self.image_views.push(view);
        }

        self.format = format;
        self.present_mode = present_mode;
        self.extent = extent;
        self.generation += 1;

        self.diag.info(
            COMPONENT,
            format!(
                "format {:?}/{:?}, present_mode {:?}, extent {}x{}, images(min={} → got={})",
                format.format,
                format.color_space,
                present_mode,
                extent.width,
                extent.height,
                min_image_count,
                self.images.len()
            ),
        );
        Ok(())
    }

    /// Drain the device, destroy the chain and its views, then build afresh.
    pub fn recreate(
        &mut self,
        gpu: &dyn Gpu,
        device: &DeviceContext,
        surface: vk::SurfaceKHR,
        size: RenderSize,
    ) -> Result<()> {
        gpu.device_wait_idle().op("vkDeviceWaitIdle")?;
        self.cleanup(gpu);
        if let Err(e) = self.build(gpu, device, surface, size) {
            self.cleanup(gpu);
            return Err(e);
        }
        Ok(())
    }

    /// Safe to call repeatedly. Images belong to the chain; only views are
    /// destroyed explicitly.
    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        let had_views = !self.image_views.is_empty();
        for view in self.image_views.drain(..) {
            gpu.destroy_image_view(view);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            gpu.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
            self.diag.destroyed(COMPONENT, "swapchain");
        } else if had_views {
            self.diag.destroyed(COMPONENT, "orphaned image views");
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn is_live(&self) -> bool {
        self.handle != vk::SwapchainKHR::null()
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Bumped on every successful build.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
