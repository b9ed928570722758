// SPDX-License-Identifier: CEPL-1.0
//! Graphics pipeline: shader binaries, descriptor layout and baked
//! fixed-function state.
use std::io::Cursor;
use std::path::Path;

use ash::util::read_spv;
use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};
use vantage_render::Vertex;

use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::{Gpu, GraphicsPipelineDesc};

const COMPONENT: &str = "pipeline";

pub const VERTEX_SHADER_FILE: &str = "vertex.vert.spv";
pub const FRAGMENT_SHADER_FILE: &str = "fragment.frag.spv";

/// Pre-compiled SPIR-V for the two stages. Contents are opaque beyond the
/// word-stream check `read_spv` performs.
#[derive(Clone, Debug)]
pub struct ShaderSet {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderSet {
    /// Shaders compiled by the build script.
    pub fn builtin() -> Result<Self> {
        let vs = include_bytes!(concat!(env!("OUT_DIR"), "/vertex.vert.spv"));
        let fs = include_bytes!(concat!(env!("OUT_DIR"), "/fragment.frag.spv"));
        Self::from_bytes(vs, fs)
    }

    pub fn from_bytes(vertex: &[u8], fragment: &[u8]) -> Result<Self> {
        let decode = |stage: &str, bytes: &[u8]| {
            read_spv(&mut Cursor::new(bytes)).map_err(|e| VkError::Shader(format!("{stage}: {e}")))
        };
        Ok(Self {
            vertex: decode("vertex", vertex)?,
            fragment: decode("fragment", fragment)?,
        })
    }

    /// Reads `vertex.vert.spv` and `fragment.frag.spv` from `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read(&path).map_err(|source| VkError::Io {
                path: path.display().to_string(),
                source,
            })
        };
        Self::from_bytes(&read(VERTEX_SHADER_FILE)?, &read(FRAGMENT_SHADER_FILE)?)
    }
}

/// Binding 0 carries the model/view/projection uniform for the vertex stage.
pub fn uniform_layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 1] {
    [vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::VERTEX,
        ..Default::default()
    }]
}

pub fn vertex_input() -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: Vertex::STRIDE,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = vec![
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: Vertex::POSITION_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: Vertex::COLOR_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: Vertex::TEX_COORD_OFFSET,
        },
    ];
    (vec![binding], attributes)
}

/// Triangle list, back-face culling with CCW front faces, depth test and
/// write with LESS, no blending, one viewport/scissor covering `extent`.
/// Viewport and scissor are also dynamic so recorded frames set them
/// explicitly.
pub fn fixed_function_desc(
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> GraphicsPipelineDesc {
    let (vertex_bindings, vertex_attributes) = vertex_input();
    GraphicsPipelineDesc {
        vertex_module,
        fragment_module,
        entry_point: c"main",
        vertex_bindings,
        vertex_attributes,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        viewport: vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        },
        scissor: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        },
        dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        samples: vk::SampleCountFlags::TYPE_1,
        depth_test: true,
        depth_write: true,
        depth_compare: vk::CompareOp::LESS,
        blend_enable: false,
        color_write_mask: vk::ColorComponentFlags::RGBA,
        layout,
        render_pass,
        subpass: 0,
    }
}

pub struct GraphicsPipeline {
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    shaders: ShaderSet,
    diag: SharedDiagnostics,
}

impl GraphicsPipeline {
    pub fn create(
        gpu: &dyn Gpu,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        shaders: ShaderSet,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        let set_layout = gpu
            .create_descriptor_set_layout(&uniform_layout_bindings())
            .op("vkCreateDescriptorSetLayout")?;
        let mut p = Self {
            set_layout,
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            shaders,
            diag,
        };
        if let Err(e) = p.build(gpu, render_pass, extent) {
            p.cleanup(gpu);
            return Err(e);
        }
        Ok(p)
    }

    fn build(
        &mut self,
        gpu: &dyn Gpu,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        // STRICT: render pass MUST be compatible (same formats/samples) with
        // the framebuffers this pipeline draws into.

        // --- Shader modules are transient: destroyed before return, success or not ---
        let vs = gpu
            .create_shader_module(&self.shaders.vertex)
            .op("vkCreateShaderModule")?;
        let fs = match gpu.create_shader_module(&self.shaders.fragment) {
            Ok(m) => m,
            Err(e) => {
                gpu.destroy_shader_module(vs);
                return Err(VkError::from_vk("vkCreateShaderModule", e));
            }
        };

        let result = self.build_with_modules(gpu, vs, fs, render_pass, extent);
        gpu.destroy_shader_module(fs);
        gpu.destroy_shader_module(vs);
        result
    }

    fn build_with_modules(
        &mut self,
        gpu: &dyn Gpu,
        vs: vk::ShaderModule,
        fs: vk::ShaderModule,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.layout = gpu
            .create_pipeline_layout(&[self.set_layout])
            .op("vkCreatePipelineLayout")?;
        let desc = fixed_function_desc(vs, fs, self.layout, render_pass, extent);
        self.pipeline = gpu
            .create_graphics_pipeline(&desc)
            .op("vkCreateGraphicsPipelines")?;
        self.diag.created(
            COMPONENT,
            format!("graphics pipeline for {}x{}", extent.width, extent.height),
        );
        Ok(())
    }

    /// Drops pipeline + layout and builds them against a new render pass
    /// and extent. The descriptor set layout survives, so sets allocated
    /// from it stay valid.
    pub fn rebuild(
        &mut self,
        gpu: &dyn Gpu,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.destroy_pipeline(gpu);
        let result = self.build(gpu, render_pass, extent);
        if result.is_err() {
            self.destroy_pipeline(gpu);
        }
        result
    }

    pub fn destroy_pipeline(&mut self, gpu: &dyn Gpu) {
        if self.pipeline != vk::Pipeline::null() {
            gpu.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
        }
        if self.layout != vk::PipelineLayout::null() {
            gpu.destroy_pipeline_layout(self.layout);
            self.layout = vk::PipelineLayout::null();
        }
    }

    pub fn cleanup(&mut self, gpu: &dyn Gpu) {
        self.destroy_pipeline(gpu);
        if self.set_layout != vk::DescriptorSetLayout::null() {
            gpu.destroy_descriptor_set_layout(self.set_layout);
            self.set_layout = vk::DescriptorSetLayout::null();
            self.diag.destroyed(COMPONENT, "pipeline + descriptor set layout");
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}
