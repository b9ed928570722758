// SPDX-License-Identifier: CEPL-1.0
//! Render pass, shared depth buffer and the per-image framebuffers.
use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};

use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::{AttachmentDesc, Gpu, RenderPassDesc};

const COMPONENT: &str = "render-target";

/// Depth formats in order of preference.
pub const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub fn find_depth_format(gpu: &dyn Gpu) -> Result<vk::Format> {
    DEPTH_CANDIDATES
        .into_iter()
        .find(|f| gpu.supports_depth_format(*f))
        .ok_or_else(|| VkError::precondition("no supported depth attachment format"))
}

/// Color cleared and stored for presentation, depth cleared and discarded.
pub fn render_pass_desc(color_format: vk::Format, depth_format: vk::Format) -> RenderPassDesc {
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    RenderPassDesc {
        color: AttachmentDesc {
            format: color_format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            subpass_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        },
        depth: AttachmentDesc {
            format: depth_format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            subpass_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        },
        // Previous frame's color/depth writes finish before this frame's.
        dependency: vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            dst_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        },
    }
}

/// Depth image shared by every framebuffer of one swapchain generation.
#[derive(Debug, Default)]
pub struct DepthBuffer {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

impl DepthBuffer {
    pub fn create(gpu: &dyn Gpu, format: vk::Format, extent: vk::Extent2D) -> Result<Self> {
        let (image, memory) = gpu
            .create_depth_image(format, extent)
            .op("vkCreateImage")?;
        let view = match gpu.create_image_view(image, format, vk::ImageAspectFlags::DEPTH) {
            Ok(v) => v,
            Err(e) => {
                gpu.destroy_image(image, memory);
                return Err(VkError::from_vk("vkCreateImageView", e));
            }
        };
        Ok(Self {
            image,
            memory,
            view,
            format,
        })
    }

    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        if self.view != vk::ImageView::null() {
            gpu.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        if self.image != vk::Image::null() {
            gpu.destroy_image(self.image, self.memory);
            self.image = vk::Image::null();
            self.memory = vk::DeviceMemory::null();
        }
    }
}

pub struct RenderTarget {
    render_pass: vk::RenderPass,
    color_format: vk::Format,
    depth: DepthBuffer,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    diag: SharedDiagnostics,
}

impl RenderTarget {
    /// Builds the render pass only; framebuffers come from
    /// [`RenderTarget::create_framebuffers`].
    pub fn create(
        gpu: &dyn Gpu,
        color_format: vk::Format,
        depth_format: vk::Format,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        let desc = render_pass_desc(color_format, depth_format);
        let render_pass = gpu.create_render_pass(&desc).op("vkCreateRenderPass")?;
        diag.created(
            COMPONENT,
            format!("render pass color={color_format:?} depth={depth_format:?}"),
        );
        Ok(Self {
            render_pass,
            color_format,
            depth: DepthBuffer {
                format: depth_format,
                ..Default::default()
            },
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
            diag,
        })
    }

    /// (Re)builds the depth buffer and one framebuffer per swapchain view.
    /// The views are borrowed; the swapchain keeps owning them.
    pub fn create_framebuffers(
        &mut self,
        gpu: &dyn Gpu,
        image_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<()> {
        if self.render_pass == vk::RenderPass::null() {
            return Err(VkError::precondition("framebuffers need a live render pass"));
        }
        self.destroy_framebuffers(gpu);

        self.depth = DepthBuffer::create(gpu, self.depth.format, extent)?;
        for &view in image_views {
            match gpu.create_framebuffer(self.render_pass, &[view, self.depth.view], extent) {
                Ok(fb) => self.framebuffers.push(fb),
                Err(e) => {
                    self.destroy_framebuffers(gpu);
                    return Err(VkError::from_vk("vkCreateFramebuffer", e));
                }
            }
        }
        self.extent = extent;
        self.diag.debug(
            COMPONENT,
            format!(
                "{} framebuffer(s) at {}x{}",
                self.framebuffers.len(),
                extent.width,
                extent.height
            ),
        );
        Ok(())
    }

    /// Framebuffers first, then the depth attachment they reference.
    pub fn destroy_framebuffers(&mut self, gpu: &dyn Gpu) {
        for fb in self.framebuffers.drain(..) {
            gpu.destroy_framebuffer(fb);
        }
        self.depth.cleanup(gpu);
    }

    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        self.destroy_framebuffers(gpu);
        if self.render_pass != vk::RenderPass::null() {
            gpu.destroy_render_pass(self.render_pass);
            self.render_pass = vk::RenderPass::null();
            self.diag.destroyed(COMPONENT, "render pass");
        }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth.format
    }

    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.view
    }

    pub fn framebuffer(&self, image_index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index).copied()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}
