use ash::vk;
use cgfx_core::DriverHandle;

use crate::barrier::{BarrierInfo, PipelineStage};
use crate::pipeline::ClearValue;

/// Commands batched by a [`CommandBuffer`](crate::command::CommandBuffer)
/// and replayed into the native command buffer when recording ends.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    Barrier(BarrierInfo),

    // ── Passes ──────────────────────────────────────────────
    BeginPass {
        render_pass: DriverHandle,
        framebuffer: DriverHandle,
        render_area: vk::Rect2D,
        clear_values: Vec<ClearValue>,
        contents: vk::SubpassContents,
    },
    NextSubpass {
        contents: vk::SubpassContents,
    },
    EndPass,

    // ── State ───────────────────────────────────────────────
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: DriverHandle,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: DriverHandle,
        first_set: u32,
        descriptor_sets: Vec<DriverHandle>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: DriverHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: DriverHandle,
        offset: u64,
        index_type: vk::IndexType,
    },
    SetViewports {
        first: u32,
        viewports: Vec<vk::Viewport>,
    },
    SetScissors {
        first: u32,
        scissors: Vec<vk::Rect2D>,
    },

    // ── Work ────────────────────────────────────────────────
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: DriverHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    DrawIndexedIndirect {
        buffer: DriverHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    DispatchIndirect {
        buffer: DriverHandle,
        offset: u64,
    },

    // ── Transfer ────────────────────────────────────────────
    CopyBuffer {
        src: DriverHandle,
        dst: DriverHandle,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: DriverHandle,
        dst: DriverHandle,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: DriverHandle,
        src_layout: vk::ImageLayout,
        dst: DriverHandle,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImage {
        src: DriverHandle,
        src_layout: vk::ImageLayout,
        dst: DriverHandle,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    Blit {
        src: DriverHandle,
        src_layout: vk::ImageLayout,
        dst: DriverHandle,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
        filter: vk::Filter,
    },
    Resolve {
        src: DriverHandle,
        src_layout: vk::ImageLayout,
        dst: DriverHandle,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageResolve>,
    },

    // ── Events ──────────────────────────────────────────────
    SignalEvent {
        event: DriverHandle,
        stage: PipelineStage,
    },
    WaitEvent {
        events: Vec<DriverHandle>,
        barrier: BarrierInfo,
    },
    ResetEvent {
        event: DriverHandle,
        stage: PipelineStage,
    },

    // ── Profiling ───────────────────────────────────────────
    BeginMarker {
        name: String,
        color: [f32; 4],
    },
    EndMarker,
    InsertMarker {
        name: String,
        color: [f32; 4],
    },
    WriteTimestamp {
        stage: PipelineStage,
        query: u32,
    },

    ExecuteSecondary {
        buffers: Vec<DriverHandle>,
    },
}
