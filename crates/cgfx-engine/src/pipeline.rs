//! Pipeline-state fragments.
//!
//! A graphics pipeline is built from three pieces owned by different
//! systems: the shader program (stages plus fixed-function defaults), the
//! pass (render pass and attachment counts) and the vertex layout. The
//! engine treats each piece as opaque and only merges them.

use std::sync::{Arc, OnceLock};

use ash::vk;
use cgfx_core::DriverHandle;

/// Identity of a render pass as issued by the pass system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub u64);

/// Identity of a compiled shader program variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderProgramId(pub u64);

/// Identity of a distinct vertex-input description. Layouts are compared by
/// this id, never by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VertexLayoutId(pub u64);

#[derive(Debug, Clone)]
pub struct ShaderStageInfo {
    pub stage: vk::ShaderStageFlags,
    pub module: DriverHandle,
    pub entry_point: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RasterState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_clamp: bool,
    pub depth_bias: Option<(f32, f32, f32)>,
    pub line_width: f32,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_clamp: false,
            depth_bias: None,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: vk::CompareOp,
    pub stencil_test: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
            stencil_test: false,
            front: vk::StencilOpState::default(),
            back: vk::StencilOpState::default(),
        }
    }
}

/// Shader-side pipeline fragment, produced by the shader system for a
/// feature mask.
#[derive(Debug, Clone)]
pub struct ShaderProgramInfo {
    pub id: ShaderProgramId,
    pub name: String,
    pub layout: DriverHandle,
    pub stages: Vec<ShaderStageInfo>,
    pub raster: RasterState,
    pub samples: vk::SampleCountFlags,
    pub depth_stencil: DepthStencilState,
    /// Blend state per color attachment; the last entry repeats for any
    /// attachment beyond the list
    pub blend: Vec<vk::PipelineColorBlendAttachmentState>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// Pass-side pipeline fragment plus what a command buffer needs to begin
/// the pass.
#[derive(Debug, Clone)]
pub struct PassInfo {
    pub id: PassId,
    pub name: String,
    pub render_pass: DriverHandle,
    pub framebuffer: DriverHandle,
    pub render_area: vk::Rect2D,
    pub clear_values: Vec<ClearValue>,
    /// Color attachment count of each subpass
    pub subpass_attachment_counts: Vec<u32>,
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
}

impl PassInfo {
    #[track_caller]
    pub fn attachment_count(&self, subpass: u32) -> u32 {
        match self.subpass_attachment_counts.get(subpass as usize) {
            Some(count) => *count,
            None => panic!(
                "pass '{}' has no subpass {} ({} subpasses)",
                self.name,
                subpass,
                self.subpass_attachment_counts.len()
            ),
        }
    }

    pub fn subpass_count(&self) -> u32 {
        self.subpass_attachment_counts.len() as u32
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexLayoutInfo {
    pub id: VertexLayoutId,
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayoutInfo {
    /// Layout with no vertex inputs, for passes that generate vertices in the
    /// shader. Always the same object, so the pipeline cache sees one
    /// fragment no matter how many command buffers use it.
    pub fn empty() -> Arc<VertexLayoutInfo> {
        static EMPTY: OnceLock<Arc<VertexLayoutInfo>> = OnceLock::new();
        EMPTY
            .get_or_init(|| Arc::new(VertexLayoutInfo::default()))
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputAssemblyKey {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
}

impl InputAssemblyKey {
    pub const TRIANGLES: InputAssemblyKey = InputAssemblyKey {
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        primitive_restart: false,
    };
}

/// Everything needed to compile one graphics pipeline.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub program: Arc<ShaderProgramInfo>,
    pub pass: Arc<PassInfo>,
    pub subpass: u32,
    pub color_attachment_count: u32,
    pub vertex_layout: Arc<VertexLayoutInfo>,
    pub input_assembly: InputAssemblyKey,
}

impl GraphicsPipelineDesc {
    /// Blend state for each live color attachment of the subpass.
    pub fn blend_attachments(&self) -> Vec<vk::PipelineColorBlendAttachmentState> {
        let fallback = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        };
        let last = self.program.blend.last().copied().unwrap_or(fallback);
        (0..self.color_attachment_count as usize)
            .map(|i| self.program.blend.get(i).copied().unwrap_or(last))
            .collect()
    }
}
