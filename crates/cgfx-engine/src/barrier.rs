//! Resource-state transitions.
//!
//! A [`BarrierInfo`] says "these subresources stop being used by stage A and
//! start being used by stage B". Translation to native stage, access and
//! layout masks happens through [`PipelineStage`]. The model does no
//! tracking of its own: callers must not record overlapping, contradictory
//! transitions in one recording.

use ash::vk;
use cgfx_core::arena::Arena;
use cgfx_core::{define_id, DriverHandle, ResourceKind};

use crate::driver::QueueType;

/// Semantic usage of a resource by a part of the GPU pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    ImageInitial,
    UniformGraphics,
    UniformCompute,
    VertexInput,
    Indirect,
    VertexShaderRead,
    VertexShaderWrite,
    HullShaderRead,
    HullShaderWrite,
    DomainShaderRead,
    DomainShaderWrite,
    GeometryShaderRead,
    GeometryShaderWrite,
    PixelShaderRead,
    PixelShaderWrite,
    GraphicsShadersRead,
    GraphicsShadersWrite,
    ComputeShaderRead,
    ComputeShaderWrite,
    AllShadersRead,
    AllShadersWrite,
    ColorRead,
    ColorWrite,
    DepthStencilRead,
    DepthStencilWrite,
    TransferRead,
    TransferWrite,
    HostRead,
    HostWrite,
    MemoryRead,
    MemoryWrite,
    Present,
}

const GRAPHICS_SHADERS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER.as_raw()
        | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER.as_raw()
        | vk::PipelineStageFlags::GEOMETRY_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw(),
);

const ALL_SHADERS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    GRAPHICS_SHADERS.as_raw() | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

impl PipelineStage {
    pub fn is_write(self) -> bool {
        use PipelineStage::*;
        matches!(
            self,
            VertexShaderWrite
                | HullShaderWrite
                | DomainShaderWrite
                | GeometryShaderWrite
                | PixelShaderWrite
                | GraphicsShadersWrite
                | ComputeShaderWrite
                | AllShadersWrite
                | ColorWrite
                | DepthStencilWrite
                | TransferWrite
                | HostWrite
                | MemoryWrite
        )
    }

    pub fn stage_flags(self) -> vk::PipelineStageFlags {
        use PipelineStage::*;
        match self {
            ImageInitial => vk::PipelineStageFlags::TOP_OF_PIPE,
            UniformGraphics | GraphicsShadersRead | GraphicsShadersWrite => GRAPHICS_SHADERS,
            UniformCompute | ComputeShaderRead | ComputeShaderWrite => {
                vk::PipelineStageFlags::COMPUTE_SHADER
            }
            VertexInput => vk::PipelineStageFlags::VERTEX_INPUT,
            Indirect => vk::PipelineStageFlags::DRAW_INDIRECT,
            VertexShaderRead | VertexShaderWrite => vk::PipelineStageFlags::VERTEX_SHADER,
            HullShaderRead | HullShaderWrite => {
                vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER
            }
            DomainShaderRead | DomainShaderWrite => {
                vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER
            }
            GeometryShaderRead | GeometryShaderWrite => vk::PipelineStageFlags::GEOMETRY_SHADER,
            PixelShaderRead | PixelShaderWrite => vk::PipelineStageFlags::FRAGMENT_SHADER,
            AllShadersRead | AllShadersWrite => ALL_SHADERS,
            ColorRead | ColorWrite => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            DepthStencilRead | DepthStencilWrite => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            TransferRead | TransferWrite => vk::PipelineStageFlags::TRANSFER,
            HostRead | HostWrite => vk::PipelineStageFlags::HOST,
            MemoryRead | MemoryWrite => vk::PipelineStageFlags::ALL_COMMANDS,
            Present => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    pub fn access_flags(self) -> vk::AccessFlags {
        use PipelineStage::*;
        match self {
            ImageInitial | Present => vk::AccessFlags::empty(),
            UniformGraphics | UniformCompute => vk::AccessFlags::UNIFORM_READ,
            VertexInput => {
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ
            }
            Indirect => vk::AccessFlags::INDIRECT_COMMAND_READ,
            VertexShaderRead | HullShaderRead | DomainShaderRead | GeometryShaderRead
            | PixelShaderRead | GraphicsShadersRead | ComputeShaderRead | AllShadersRead => {
                vk::AccessFlags::SHADER_READ
            }
            VertexShaderWrite | HullShaderWrite | DomainShaderWrite | GeometryShaderWrite
            | PixelShaderWrite | GraphicsShadersWrite | ComputeShaderWrite
            | AllShadersWrite => vk::AccessFlags::SHADER_WRITE,
            ColorRead => vk::AccessFlags::COLOR_ATTACHMENT_READ,
            ColorWrite => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            DepthStencilRead => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            DepthStencilWrite => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            TransferRead => vk::AccessFlags::TRANSFER_READ,
            TransferWrite => vk::AccessFlags::TRANSFER_WRITE,
            HostRead => vk::AccessFlags::HOST_READ,
            HostWrite => vk::AccessFlags::HOST_WRITE,
            MemoryRead => vk::AccessFlags::MEMORY_READ,
            MemoryWrite => vk::AccessFlags::MEMORY_WRITE,
        }
    }

    /// Image layout a texture must be in while used by this stage.
    pub fn image_layout(self) -> vk::ImageLayout {
        use PipelineStage::*;
        match self {
            ImageInitial => vk::ImageLayout::UNDEFINED,
            VertexShaderRead | HullShaderRead | DomainShaderRead | GeometryShaderRead
            | PixelShaderRead | GraphicsShadersRead | ComputeShaderRead | AllShadersRead
            | UniformGraphics | UniformCompute => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ColorRead | ColorWrite => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            DepthStencilRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            DepthStencilWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            TransferRead => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            TransferWrite => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Present => vk::ImageLayout::PRESENT_SRC_KHR,
            _ => vk::ImageLayout::GENERAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierDomain {
    /// Dependency limited to the same framebuffer region, outside a pass
    Local,
    /// Full dependency across the whole resource
    Global,
    /// Dependency inside a render pass (subpass self-dependency)
    Pass,
}

impl BarrierDomain {
    pub fn dependency_flags(self) -> vk::DependencyFlags {
        match self {
            BarrierDomain::Global => vk::DependencyFlags::empty(),
            BarrierDomain::Local | BarrierDomain::Pass => vk::DependencyFlags::BY_REGION,
        }
    }
}

/// Aspect, mip range and layer range of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSubresource {
    pub aspect: vk::ImageAspectFlags,
    pub mip: u32,
    pub mip_count: u32,
    pub layer: u32,
    pub layer_count: u32,
}

impl TextureSubresource {
    pub fn color(mip_count: u32, layer_count: u32) -> Self {
        Self {
            aspect: vk::ImageAspectFlags::COLOR,
            mip: 0,
            mip_count,
            layer: 0,
            layer_count,
        }
    }

    /// Two ranges overlap iff aspects, mips and layers all intersect.
    pub fn overlaps(&self, other: &TextureSubresource) -> bool {
        self.aspect.intersects(other.aspect)
            && ranges_intersect(self.mip, self.mip_count, other.mip, other.mip_count)
            && ranges_intersect(self.layer, self.layer_count, other.layer, other.layer_count)
    }

    pub fn to_vk(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.mip,
            level_count: self.mip_count,
            base_array_layer: self.layer,
            layer_count: self.layer_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSubresource {
    pub offset: u64,
    pub size: u64,
}

impl BufferSubresource {
    pub const WHOLE: BufferSubresource = BufferSubresource {
        offset: 0,
        size: vk::WHOLE_SIZE,
    };

    pub fn overlaps(&self, other: &BufferSubresource) -> bool {
        let end = self.offset.saturating_add(self.size);
        let other_end = other.offset.saturating_add(other.size);
        self.offset < other_end && other.offset < end
    }
}

fn ranges_intersect(a: u32, a_count: u32, b: u32, b_count: u32) -> bool {
    let a_end = a.saturating_add(a_count);
    let b_end = b.saturating_add(b_count);
    a < b_end && b < a_end
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBarrierInfo {
    pub texture: DriverHandle,
    pub subresource: TextureSubresource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBarrierInfo {
    pub buffer: DriverHandle,
    pub subresource: BufferSubresource,
}

/// One transition of a set of subresources between two stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierInfo {
    pub from_stage: PipelineStage,
    pub to_stage: PipelineStage,
    pub domain: BarrierDomain,
    pub from_queue: QueueType,
    pub to_queue: QueueType,
    pub textures: Vec<TextureBarrierInfo>,
    pub buffers: Vec<BufferBarrierInfo>,
}

impl BarrierInfo {
    /// A same-queue transition on the graphics queue.
    pub fn new(from_stage: PipelineStage, to_stage: PipelineStage, domain: BarrierDomain) -> Self {
        Self {
            from_stage,
            to_stage,
            domain,
            from_queue: QueueType::Graphics,
            to_queue: QueueType::Graphics,
            textures: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn with_queues(mut self, from_queue: QueueType, to_queue: QueueType) -> Self {
        self.from_queue = from_queue;
        self.to_queue = to_queue;
        self
    }

    pub fn texture(mut self, texture: DriverHandle, subresource: TextureSubresource) -> Self {
        self.textures.push(TextureBarrierInfo {
            texture: texture.expect_kind(ResourceKind::Image),
            subresource,
        });
        self
    }

    pub fn buffer(mut self, buffer: DriverHandle, subresource: BufferSubresource) -> Self {
        self.buffers.push(BufferBarrierInfo {
            buffer: buffer.expect_kind(ResourceKind::Buffer),
            subresource,
        });
        self
    }

    /// The same subresources moving back from `to_stage` to `from_stage`.
    pub fn reversed(&self) -> BarrierInfo {
        BarrierInfo {
            from_stage: self.to_stage,
            to_stage: self.from_stage,
            domain: self.domain,
            from_queue: self.to_queue,
            to_queue: self.from_queue,
            textures: self.textures.clone(),
            buffers: self.buffers.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty() && self.buffers.is_empty()
    }

    #[track_caller]
    pub(crate) fn assert_not_empty(&self) {
        assert!(
            !self.is_empty(),
            "barrier {:?} -> {:?} lists no textures or buffers",
            self.from_stage,
            self.to_stage
        );
    }
}

define_id!(
    /// A reusable barrier stored in a [`BarrierTable`].
    BarrierId
);

/// Named barriers that outlive a single recording.
#[derive(Default)]
pub struct BarrierTable {
    barriers: Arena<BarrierInfo, BarrierId>,
}

impl BarrierTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    pub fn create(&mut self, info: BarrierInfo) -> BarrierId {
        info.assert_not_empty();
        self.barriers.insert(info)
    }

    #[track_caller]
    pub fn destroy(&mut self, id: BarrierId) {
        if self.barriers.remove(id).is_none() {
            panic!("stale id {:?}", id);
        }
    }

    #[track_caller]
    pub fn get(&self, id: BarrierId) -> &BarrierInfo {
        &self.barriers[id]
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }
}
