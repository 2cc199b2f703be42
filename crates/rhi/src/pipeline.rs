//! Graphics pipeline configuration.
//!
//! # Overview
//!
//! - [`PipelineConfig`] is what a caller asks for: a name, two shader stages,
//!   attachment formats, descriptor set layouts and two feature switches
//! - [`FixedFunctionState`] is the complete fixed-function description derived
//!   from a config; it is stored next to the compiled pipeline
//! - [`GpuDrawPushConstants`] is the per-draw payload every pipeline accepts
//!
//! All pipelines share the same shape: triangle lists, dynamic viewport and
//! scissor, single-sampled, back-face culling with clockwise front faces, and
//! reversed-Z depth (`GREATER_OR_EQUAL`, cleared to 0.0).
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use inflight_rhi::pipeline::{FixedFunctionState, PipelineConfig, ShaderStage};
//!
//! # fn example(vert: vk::ShaderModule, frag: vk::ShaderModule, scene: vk::DescriptorSetLayout) {
//! let config = PipelineConfig::new(
//!     "opaque",
//!     ShaderStage::new(vert),
//!     ShaderStage::new(frag),
//!     vk::Format::B8G8R8A8_SRGB,
//! )
//! .depth_format(vk::Format::D32_SFLOAT)
//! .binding_layout(scene)
//! .depth_test(true);
//!
//! let state = FixedFunctionState::from_config(&config);
//! assert!(state.depth_test_enable);
//! # }
//! ```

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::error::{RhiError, RhiResult};

/// Per-draw push constant block: object transform plus the device address of
/// the vertex buffer the shader pulls from.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuDrawPushConstants {
    pub world_matrix: Mat4,
    pub vertex_buffer: vk::DeviceAddress,
    pub _padding: u64,
}

impl GpuDrawPushConstants {
    pub fn new(world_matrix: Mat4, vertex_buffer: vk::DeviceAddress) -> Self {
        Self {
            world_matrix,
            vertex_buffer,
            _padding: 0,
        }
    }
}

/// One shader stage of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStage {
    pub module: vk::ShaderModule,
    pub entry_point: String,
}

impl ShaderStage {
    /// A stage using the conventional `main` entry point.
    pub fn new(module: vk::ShaderModule) -> Self {
        Self::with_entry_point(module, "main")
    }

    pub fn with_entry_point(module: vk::ShaderModule, entry_point: impl Into<String>) -> Self {
        Self {
            module,
            entry_point: entry_point.into(),
        }
    }
}

/// Everything needed to build one named graphics pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Cache key. Two configs with the same name are treated as the same pipeline.
    pub name: String,
    pub vertex_stage: ShaderStage,
    pub fragment_stage: ShaderStage,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    /// Descriptor set layouts, in set order.
    pub binding_layouts: Vec<vk::DescriptorSetLayout>,
    pub blend_enable: bool,
    pub depth_enable: bool,
}

impl PipelineConfig {
    /// Creates an opaque, depth-less configuration.
    pub fn new(
        name: impl Into<String>,
        vertex_stage: ShaderStage,
        fragment_stage: ShaderStage,
        color_format: vk::Format,
    ) -> Self {
        Self {
            name: name.into(),
            vertex_stage,
            fragment_stage,
            color_format,
            depth_format: None,
            binding_layouts: Vec::new(),
            blend_enable: false,
            depth_enable: false,
        }
    }

    pub fn depth_format(mut self, format: vk::Format) -> Self {
        self.depth_format = Some(format);
        self
    }

    /// Appends a descriptor set layout; the first call is set 0.
    pub fn binding_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.binding_layouts.push(layout);
        self
    }

    pub fn blend(mut self, enable: bool) -> Self {
        self.blend_enable = enable;
        self
    }

    pub fn depth_test(mut self, enable: bool) -> Self {
        self.depth_enable = enable;
        self
    }

    /// Checks the configuration before any device work is done.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] describing the first problem found.
    pub fn validate(&self) -> RhiResult<()> {
        if self.name.is_empty() {
            return Err(RhiError::PipelineError("Pipeline name is required".to_string()));
        }
        for (label, stage) in [("Vertex", &self.vertex_stage), ("Fragment", &self.fragment_stage)] {
            if stage.module == vk::ShaderModule::null() {
                return Err(RhiError::PipelineError(format!(
                    "{label} shader is required for '{}'",
                    self.name
                )));
            }
            if stage.entry_point.is_empty() || stage.entry_point.contains('\0') {
                return Err(RhiError::PipelineError(format!(
                    "{label} shader entry point '{}' is invalid",
                    stage.entry_point
                )));
            }
        }
        if self.color_format == vk::Format::UNDEFINED {
            return Err(RhiError::PipelineError(format!(
                "Color attachment format is required for '{}'",
                self.name
            )));
        }
        if self.depth_enable && self.depth_format.is_none() {
            return Err(RhiError::PipelineError(format!(
                "Depth test enabled without a depth format for '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
}

impl BlendFactor {
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        }
    }
}

/// Blend state of the single color attachment. Blend ops are always ADD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
        }
    }
}

impl ColorBlendAttachment {
    /// Standard `src_alpha / one_minus_src_alpha` blending.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: BlendFactor::SrcAlpha,
            dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
        }
    }

    pub fn to_vk(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: self.blend_enable.into(),
            src_color_blend_factor: self.src_color_blend_factor.to_vk(),
            dst_color_blend_factor: self.dst_color_blend_factor.to_vk(),
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: self.src_alpha_blend_factor.to_vk(),
            dst_alpha_blend_factor: self.dst_alpha_blend_factor.to_vk(),
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

/// Fixed-function state a pipeline was compiled with.
#[derive(Clone, Debug, PartialEq)]
pub struct FixedFunctionState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    /// Reversed-Z: nearer fragments have greater depth.
    pub depth_compare_op: vk::CompareOp,
    pub color_blend: ColorBlendAttachment,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub push_constant_size: u32,
}

impl FixedFunctionState {
    /// Derives the full state block for `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let depth = config.depth_enable && config.depth_format.is_some();
        let color_blend = if config.blend_enable {
            ColorBlendAttachment::alpha_blend()
        } else {
            ColorBlendAttachment::default()
        };

        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test_enable: depth,
            depth_write_enable: depth,
            depth_compare_op: if depth {
                vk::CompareOp::GREATER_OR_EQUAL
            } else {
                vk::CompareOp::ALWAYS
            },
            color_blend,
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            push_constant_stages: vk::ShaderStageFlags::VERTEX,
            push_constant_size: std::mem::size_of::<GpuDrawPushConstants>() as u32,
        }
    }

    /// The single push constant range every pipeline layout declares.
    pub fn push_constant_range(&self) -> vk::PushConstantRange {
        vk::PushConstantRange::default()
            .stage_flags(self.push_constant_stages)
            .offset(0)
            .size(self.push_constant_size)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    fn config(name: &str) -> PipelineConfig {
        PipelineConfig::new(
            name,
            ShaderStage::new(vk::ShaderModule::from_raw(1)),
            ShaderStage::new(vk::ShaderModule::from_raw(2)),
            vk::Format::B8G8R8A8_SRGB,
        )
    }

    #[test]
    fn test_push_constants_layout() {
        assert_eq!(std::mem::size_of::<GpuDrawPushConstants>(), 80);
        let constants = GpuDrawPushConstants::new(Mat4::IDENTITY, 0xdead_beef);
        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(&bytes[64..72], &0xdead_beef_u64.to_ne_bytes());
    }

    #[test]
    fn test_opaque_state() {
        let config = config("opaque")
            .depth_format(vk::Format::D32_SFLOAT)
            .depth_test(true);
        let state = FixedFunctionState::from_config(&config);

        assert!(!state.color_blend.blend_enable);
        assert!(state.depth_test_enable);
        assert!(state.depth_write_enable);
        assert_eq!(state.depth_compare_op, vk::CompareOp::GREATER_OR_EQUAL);
        assert_eq!(state.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(
            state.dynamic_states,
            vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
        assert_eq!(state.samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn test_transparent_state() {
        let state = FixedFunctionState::from_config(&config("transparent").blend(true));

        assert!(state.color_blend.blend_enable);
        assert!(!state.depth_test_enable);
        let vk_blend = state.color_blend.to_vk();
        assert_eq!(vk_blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            vk_blend.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
    }

    #[test]
    fn test_push_constant_range() {
        let range = FixedFunctionState::from_config(&config("a")).push_constant_range();
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 80);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn test_validate() {
        assert!(config("ok").validate().is_ok());
        assert!(config("").validate().is_err());
        assert!(config("no_depth_format").depth_test(true).validate().is_err());

        let mut missing_shader = config("missing");
        missing_shader.fragment_stage.module = vk::ShaderModule::null();
        assert!(missing_shader.validate().is_err());

        let mut bad_format = config("format");
        bad_format.color_format = vk::Format::UNDEFINED;
        assert!(bad_format.validate().is_err());
    }

    #[test]
    fn test_rasterization_is_fixed() {
        let opaque = config("opaque")
            .depth_format(vk::Format::D32_SFLOAT)
            .depth_test(true);
        let transparent = config("transparent").blend(true);

        for state in [&opaque, &transparent].map(FixedFunctionState::from_config) {
            assert_eq!(state.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
            assert_eq!(state.polygon_mode, vk::PolygonMode::FILL);
            assert_eq!(state.cull_mode, vk::CullModeFlags::BACK);
            assert_eq!(state.front_face, vk::FrontFace::CLOCKWISE);
        }
    }
}
