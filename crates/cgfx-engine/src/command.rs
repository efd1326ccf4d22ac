//! Command buffers and the pools they are allocated from.
//!
//! A [`CommandBuffer`] batches [`RecordedCommand`]s locally and hands the
//! stream to the driver in [`CommandBuffer::end_record`]. One thread records
//! into a buffer at a time; pools are the thread-affine allocation unit, so
//! concurrent recording needs one pool per thread.

use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use cgfx_core::arena::Arena;
use cgfx_core::{define_id, DriverHandle, ResourceKind};
use tracing::{debug, trace};

use crate::barrier::{BarrierId, BarrierInfo, BarrierTable, PipelineStage};
use crate::commands::RecordedCommand;
use crate::driver::{CommandBufferLevel, CommandBufferUsage, CommandPoolFlags, Driver, QueueType};
use crate::error::DriverResult;
use crate::pipeline::{InputAssemblyKey, PassInfo, ShaderProgramInfo, VertexLayoutInfo};
use crate::pipeline_db::{PipelineDatabase, PipelineRequest};

bitflags! {
    /// Pipeline-state fragments a command buffer currently has set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineBuildBits: u32 {
        const SHADER_INFO_SET = 1 << 0;
        const FRAMEBUFFER_LAYOUT_INFO_SET = 1 << 1;
        const INPUT_ASSEMBLY_INFO_SET = 1 << 2;
        const PIPELINE_BUILT = 1 << 3;

        const ALL_INFO_SET = Self::SHADER_INFO_SET.bits()
            | Self::FRAMEBUFFER_LAYOUT_INFO_SET.bits()
            | Self::INPUT_ASSEMBLY_INFO_SET.bits();
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryFlags: u32 {
        const TIMESTAMP = 1 << 0;
        const OCCLUSION = 1 << 1;
        const PIPELINE_STATISTICS = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Recording,
    Executable,
}

/// How the buffers of a pool are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferPoolInfo {
    pub queue: QueueType,
    /// Buffers may be reset individually
    pub resettable: bool,
    /// Buffers are short-lived and re-recorded often
    pub short_lived: bool,
}

impl CommandBufferPoolInfo {
    pub fn flags(&self) -> CommandPoolFlags {
        let mut flags = CommandPoolFlags::empty();
        if self.resettable {
            flags |= CommandPoolFlags::RESETTABLE;
        }
        if self.short_lived {
            flags |= CommandPoolFlags::TRANSIENT;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBufferCreateInfo {
    pub name: String,
    pub secondary: bool,
    pub queries: QueryFlags,
    /// Record profiling markers
    pub markers: bool,
}

impl Default for CommandBufferCreateInfo {
    fn default() -> Self {
        Self {
            name: String::from("cmd"),
            secondary: false,
            queries: QueryFlags::empty(),
            markers: true,
        }
    }
}

define_id!(
    /// A command buffer owned by a [`CommandBufferPool`].
    CommandBufferId
);

pub struct CommandBuffer {
    driver: Arc<dyn Driver>,
    name: String,
    handle: DriverHandle,
    queue: QueueType,
    level: CommandBufferLevel,
    pool: CommandPoolFlags,
    queries: QueryFlags,
    markers_enabled: bool,

    state: RecordState,
    usage: CommandBufferUsage,
    commands: Vec<RecordedCommand>,

    build_bits: PipelineBuildBits,
    pass: Option<Arc<PassInfo>>,
    subpass: u32,
    program: Option<Arc<ShaderProgramInfo>>,
    vertex_layout: Arc<VertexLayoutInfo>,
    input_assembly: InputAssemblyKey,
    graphics_pipeline: Option<DriverHandle>,
    compute_pipeline: Option<DriverHandle>,

    barrier_stack: Vec<BarrierInfo>,
    marker_stack: Vec<String>,
    timestamp_queries: u32,
}

impl CommandBuffer {
    pub fn new(
        driver: Arc<dyn Driver>,
        pool: &CommandBufferPoolInfo,
        info: &CommandBufferCreateInfo,
    ) -> DriverResult<Self> {
        let level = if info.secondary {
            CommandBufferLevel::Secondary
        } else {
            CommandBufferLevel::Primary
        };
        let handle = driver.create_command_buffer(pool.queue, pool.flags(), level)?;
        trace!(name = %info.name, raw = handle.raw, "command buffer created");
        Ok(Self {
            driver,
            name: info.name.clone(),
            handle,
            queue: pool.queue,
            level,
            pool: pool.flags(),
            queries: info.queries,
            markers_enabled: info.markers,
            state: RecordState::Idle,
            usage: CommandBufferUsage::empty(),
            commands: Vec::new(),
            build_bits: PipelineBuildBits::empty(),
            pass: None,
            subpass: 0,
            program: None,
            vertex_layout: VertexLayoutInfo::empty(),
            input_assembly: InputAssemblyKey::TRIANGLES,
            graphics_pipeline: None,
            compute_pipeline: None,
            barrier_stack: Vec::new(),
            marker_stack: Vec::new(),
            timestamp_queries: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle
    }

    pub fn queue(&self) -> QueueType {
        self.queue
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn build_bits(&self) -> PipelineBuildBits {
        self.build_bits
    }

    /// The locally batched command stream.
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn barrier_depth(&self) -> usize {
        self.barrier_stack.len()
    }

    pub fn in_pass(&self) -> bool {
        self.pass.is_some()
    }

    // ── Recording lifecycle ─────────────────────────────────

    #[track_caller]
    pub fn begin_record(&mut self, usage: CommandBufferUsage) {
        assert!(
            self.state == RecordState::Idle,
            "command buffer '{}' must be idle to begin recording, is {:?}",
            self.name,
            self.state
        );
        self.usage = usage;
        self.commands.clear();
        self.state = RecordState::Recording;
    }

    /// Replay the batched commands into the driver's command buffer.
    #[track_caller]
    pub fn end_record(&mut self) -> DriverResult<()> {
        self.assert_recording();
        assert!(
            self.marker_stack.is_empty(),
            "command buffer '{}' ended with open markers {:?}",
            self.name,
            self.marker_stack
        );
        assert!(
            self.pass.is_none(),
            "command buffer '{}' ended inside a pass",
            self.name
        );
        self.driver.record(self.handle, self.usage, &self.commands)?;
        self.state = RecordState::Executable;
        trace!(name = %self.name, commands = self.commands.len(), "recording ended");
        Ok(())
    }

    /// Return to idle. With `allow_release` the driver may also give back
    /// the buffer's backing storage, which costs a reallocation on the next
    /// recording of similar size.
    #[track_caller]
    pub fn reset(&mut self, allow_release: bool) -> DriverResult<()> {
        assert!(
            self.pool.contains(CommandPoolFlags::RESETTABLE),
            "command buffer '{}' comes from a non-resettable pool",
            self.name
        );
        self.driver.reset_command_buffer(self.handle, allow_release)?;
        self.clear_local_state();
        Ok(())
    }

    fn clear_local_state(&mut self) {
        self.state = RecordState::Idle;
        self.commands.clear();
        self.build_bits = PipelineBuildBits::empty();
        self.pass = None;
        self.subpass = 0;
        self.program = None;
        self.vertex_layout = VertexLayoutInfo::empty();
        self.input_assembly = InputAssemblyKey::TRIANGLES;
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.barrier_stack.clear();
        self.marker_stack.clear();
        self.timestamp_queries = 0;
    }

    #[track_caller]
    fn assert_recording(&self) {
        assert!(
            self.state == RecordState::Recording,
            "command buffer '{}' is not recording ({:?})",
            self.name,
            self.state
        );
    }

    #[track_caller]
    fn assert_outside_pass(&self, what: &str) {
        self.assert_recording();
        assert!(
            self.pass.is_none(),
            "{} on command buffer '{}' is not allowed inside a pass",
            what,
            self.name
        );
    }

    #[track_caller]
    fn assert_can_draw(&self) {
        self.assert_recording();
        assert!(
            self.pass.is_some(),
            "draw on command buffer '{}' outside a pass",
            self.name
        );
        assert!(
            self.build_bits.contains(PipelineBuildBits::PIPELINE_BUILT),
            "draw on command buffer '{}' without a graphics pipeline",
            self.name
        );
    }

    // ── Passes ──────────────────────────────────────────────

    #[track_caller]
    pub fn begin_pass(&mut self, pass: Arc<PassInfo>) {
        self.assert_outside_pass("begin_pass");
        let contents = if self.usage.contains(CommandBufferUsage::SUBMIT_DURING_PASS) {
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS
        } else {
            vk::SubpassContents::INLINE
        };
        self.commands.push(RecordedCommand::BeginPass {
            render_pass: pass.render_pass,
            framebuffer: pass.framebuffer,
            render_area: pass.render_area,
            clear_values: pass.clear_values.clone(),
            contents,
        });
        if !pass.viewports.is_empty() {
            self.commands.push(RecordedCommand::SetViewports {
                first: 0,
                viewports: pass.viewports.clone(),
            });
        }
        if !pass.scissors.is_empty() {
            self.commands.push(RecordedCommand::SetScissors {
                first: 0,
                scissors: pass.scissors.clone(),
            });
        }
        self.pass = Some(pass);
        self.subpass = 0;
        self.build_bits |= PipelineBuildBits::FRAMEBUFFER_LAYOUT_INFO_SET;
        self.build_bits.remove(PipelineBuildBits::PIPELINE_BUILT);
    }

    #[track_caller]
    pub fn next_subpass(&mut self) {
        self.assert_recording();
        let Some(pass) = &self.pass else {
            panic!("next_subpass on command buffer '{}' outside a pass", self.name);
        };
        assert!(
            self.subpass + 1 < pass.subpass_count(),
            "pass '{}' has no subpass after {}",
            pass.name,
            self.subpass
        );
        self.subpass += 1;
        self.commands.push(RecordedCommand::NextSubpass {
            contents: vk::SubpassContents::INLINE,
        });
        self.build_bits.remove(PipelineBuildBits::PIPELINE_BUILT);
    }

    #[track_caller]
    pub fn end_pass(&mut self) {
        self.assert_recording();
        assert!(
            self.pass.is_some(),
            "end_pass on command buffer '{}' outside a pass",
            self.name
        );
        self.commands.push(RecordedCommand::EndPass);
        self.pass = None;
        self.subpass = 0;
        self.build_bits.remove(
            PipelineBuildBits::FRAMEBUFFER_LAYOUT_INFO_SET | PipelineBuildBits::PIPELINE_BUILT,
        );
    }

    // ── Pipeline state ──────────────────────────────────────

    pub fn set_shader_program(&mut self, program: Arc<ShaderProgramInfo>) {
        self.program = Some(program);
        self.build_bits |= PipelineBuildBits::SHADER_INFO_SET;
        self.build_bits.remove(PipelineBuildBits::PIPELINE_BUILT);
    }

    pub fn set_vertex_layout(&mut self, layout: Arc<VertexLayoutInfo>) {
        self.vertex_layout = layout;
        self.build_bits.remove(PipelineBuildBits::PIPELINE_BUILT);
    }

    pub fn set_primitive_topology(&mut self, input_assembly: InputAssemblyKey) {
        self.input_assembly = input_assembly;
        self.build_bits |= PipelineBuildBits::INPUT_ASSEMBLY_INFO_SET;
        self.build_bits.remove(PipelineBuildBits::PIPELINE_BUILT);
    }

    /// Resolve a pipeline for the current pass, subpass, program, vertex
    /// layout and input assembly through the database and bind it.
    #[track_caller]
    pub fn set_graphics_pipeline(&mut self, db: &PipelineDatabase) -> DriverResult<DriverHandle> {
        self.assert_recording();
        let missing = PipelineBuildBits::ALL_INFO_SET - self.build_bits;
        assert!(
            missing.is_empty(),
            "command buffer '{}' cannot build a pipeline, missing {:?}",
            self.name,
            missing
        );
        let (Some(pass), Some(program)) = (&self.pass, &self.program) else {
            unreachable!("build bits are set without pass or program")
        };
        let request = PipelineRequest {
            pass: pass.clone(),
            subpass: self.subpass,
            program: program.clone(),
            vertex_layout: self.vertex_layout.clone(),
            input_assembly: self.input_assembly,
        };
        let pipeline = db.get_compiled_pipeline_for(&request)?;
        self.bind_graphics_pipeline(pipeline);
        Ok(pipeline)
    }

    /// Bind an explicitly compiled graphics pipeline.
    #[track_caller]
    pub fn bind_graphics_pipeline(&mut self, pipeline: DriverHandle) {
        self.assert_recording();
        let pipeline = pipeline.expect_kind(ResourceKind::Pipeline);
        if self.graphics_pipeline != Some(pipeline) {
            self.commands.push(RecordedCommand::BindPipeline {
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            });
            self.graphics_pipeline = Some(pipeline);
        }
        self.build_bits |= PipelineBuildBits::PIPELINE_BUILT;
    }

    #[track_caller]
    pub fn bind_compute_pipeline(&mut self, pipeline: DriverHandle) {
        self.assert_recording();
        let pipeline = pipeline.expect_kind(ResourceKind::Pipeline);
        if self.compute_pipeline != Some(pipeline) {
            self.commands.push(RecordedCommand::BindPipeline {
                bind_point: vk::PipelineBindPoint::COMPUTE,
                pipeline,
            });
            self.compute_pipeline = Some(pipeline);
        }
    }

    #[track_caller]
    pub fn set_resource_table(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: DriverHandle,
        set_index: u32,
        table: DriverHandle,
        dynamic_offsets: &[u32],
    ) {
        self.assert_recording();
        self.commands.push(RecordedCommand::BindDescriptorSets {
            bind_point,
            layout: layout.expect_kind(ResourceKind::PipelineLayout),
            first_set: set_index,
            descriptor_sets: vec![table.expect_kind(ResourceKind::DescriptorSet)],
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    #[track_caller]
    pub fn set_vertex_buffer(&mut self, binding: u32, buffer: DriverHandle, offset: u64) {
        self.assert_recording();
        self.commands.push(RecordedCommand::BindVertexBuffer {
            binding,
            buffer: buffer.expect_kind(ResourceKind::Buffer),
            offset,
        });
    }

    #[track_caller]
    pub fn set_index_buffer(&mut self, buffer: DriverHandle, offset: u64, index_type: vk::IndexType) {
        self.assert_recording();
        self.commands.push(RecordedCommand::BindIndexBuffer {
            buffer: buffer.expect_kind(ResourceKind::Buffer),
            offset,
            index_type,
        });
    }

    #[track_caller]
    pub fn set_viewports(&mut self, viewports: &[vk::Viewport]) {
        self.assert_recording();
        self.commands.push(RecordedCommand::SetViewports {
            first: 0,
            viewports: viewports.to_vec(),
        });
    }

    #[track_caller]
    pub fn set_scissors(&mut self, scissors: &[vk::Rect2D]) {
        self.assert_recording();
        self.commands.push(RecordedCommand::SetScissors {
            first: 0,
            scissors: scissors.to_vec(),
        });
    }

    // ── Draws and dispatches ────────────────────────────────

    #[track_caller]
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.assert_can_draw();
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    #[track_caller]
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.assert_can_draw();
        self.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    #[track_caller]
    pub fn draw_indirect(&mut self, buffer: DriverHandle, offset: u64, draw_count: u32, stride: u32) {
        self.assert_can_draw();
        self.commands.push(RecordedCommand::DrawIndirect {
            buffer: buffer.expect_kind(ResourceKind::Buffer),
            offset,
            draw_count,
            stride,
        });
    }

    #[track_caller]
    pub fn draw_indexed_indirect(&mut self, buffer: DriverHandle, offset: u64, draw_count: u32, stride: u32) {
        self.assert_can_draw();
        self.commands.push(RecordedCommand::DrawIndexedIndirect {
            buffer: buffer.expect_kind(ResourceKind::Buffer),
            offset,
            draw_count,
            stride,
        });
    }

    #[track_caller]
    fn assert_can_dispatch(&self) {
        self.assert_outside_pass("dispatch");
        assert!(
            self.compute_pipeline.is_some(),
            "dispatch on command buffer '{}' without a compute pipeline",
            self.name
        );
    }

    #[track_caller]
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.assert_can_dispatch();
        self.commands.push(RecordedCommand::Dispatch {
            group_count_x: x,
            group_count_y: y,
            group_count_z: z,
        });
    }

    #[track_caller]
    pub fn dispatch_indirect(&mut self, buffer: DriverHandle, offset: u64) {
        self.assert_can_dispatch();
        self.commands.push(RecordedCommand::DispatchIndirect {
            buffer: buffer.expect_kind(ResourceKind::Buffer),
            offset,
        });
    }

    // ── Transfers ───────────────────────────────────────────

    #[track_caller]
    pub fn copy_buffer(&mut self, src: DriverHandle, dst: DriverHandle, regions: &[vk::BufferCopy]) {
        self.assert_outside_pass("copy");
        self.commands.push(RecordedCommand::CopyBuffer {
            src: src.expect_kind(ResourceKind::Buffer),
            dst: dst.expect_kind(ResourceKind::Buffer),
            regions: regions.to_vec(),
        });
    }

    /// Copy into an image that is in the `TransferWrite` state.
    #[track_caller]
    pub fn copy_buffer_to_image(&mut self, src: DriverHandle, dst: DriverHandle, regions: &[vk::BufferImageCopy]) {
        self.assert_outside_pass("copy");
        self.commands.push(RecordedCommand::CopyBufferToImage {
            src: src.expect_kind(ResourceKind::Buffer),
            dst: dst.expect_kind(ResourceKind::Image),
            dst_layout: PipelineStage::TransferWrite.image_layout(),
            regions: regions.to_vec(),
        });
    }

    #[track_caller]
    pub fn copy_image_to_buffer(&mut self, src: DriverHandle, dst: DriverHandle, regions: &[vk::BufferImageCopy]) {
        self.assert_outside_pass("copy");
        self.commands.push(RecordedCommand::CopyImageToBuffer {
            src: src.expect_kind(ResourceKind::Image),
            src_layout: PipelineStage::TransferRead.image_layout(),
            dst: dst.expect_kind(ResourceKind::Buffer),
            regions: regions.to_vec(),
        });
    }

    #[track_caller]
    pub fn copy_image(&mut self, src: DriverHandle, dst: DriverHandle, regions: &[vk::ImageCopy]) {
        self.assert_outside_pass("copy");
        self.commands.push(RecordedCommand::CopyImage {
            src: src.expect_kind(ResourceKind::Image),
            src_layout: PipelineStage::TransferRead.image_layout(),
            dst: dst.expect_kind(ResourceKind::Image),
            dst_layout: PipelineStage::TransferWrite.image_layout(),
            regions: regions.to_vec(),
        });
    }

    #[track_caller]
    pub fn blit(&mut self, src: DriverHandle, dst: DriverHandle, regions: &[vk::ImageBlit], filter: vk::Filter) {
        self.assert_outside_pass("blit");
        self.commands.push(RecordedCommand::Blit {
            src: src.expect_kind(ResourceKind::Image),
            src_layout: PipelineStage::TransferRead.image_layout(),
            dst: dst.expect_kind(ResourceKind::Image),
            dst_layout: PipelineStage::TransferWrite.image_layout(),
            regions: regions.to_vec(),
            filter,
        });
    }

    #[track_caller]
    pub fn resolve(&mut self, src: DriverHandle, dst: DriverHandle, regions: &[vk::ImageResolve]) {
        self.assert_outside_pass("resolve");
        self.commands.push(RecordedCommand::Resolve {
            src: src.expect_kind(ResourceKind::Image),
            src_layout: PipelineStage::TransferRead.image_layout(),
            dst: dst.expect_kind(ResourceKind::Image),
            dst_layout: PipelineStage::TransferWrite.image_layout(),
            regions: regions.to_vec(),
        });
    }

    // ── Barriers ────────────────────────────────────────────

    /// Record a one-off transition.
    #[track_caller]
    pub fn barrier(&mut self, info: BarrierInfo) {
        self.assert_recording();
        info.assert_not_empty();
        self.commands.push(RecordedCommand::Barrier(info));
    }

    /// Record `info` now and remember it so [`barrier_pop`](Self::barrier_pop)
    /// can transition the subresources back.
    #[track_caller]
    pub fn barrier_push(&mut self, info: BarrierInfo) {
        self.barrier(info.clone());
        self.barrier_stack.push(info);
    }

    #[track_caller]
    pub fn barrier_push_named(&mut self, table: &BarrierTable, id: BarrierId) {
        self.barrier_push(table.get(id).clone());
    }

    /// Pop the innermost pushed transition and record its reverse.
    #[track_caller]
    pub fn barrier_pop(&mut self) {
        self.assert_recording();
        let Some(top) = self.barrier_stack.pop() else {
            panic!("barrier_pop on command buffer '{}' with an empty stack", self.name);
        };
        self.commands.push(RecordedCommand::Barrier(top.reversed()));
    }

    /// Record the innermost pushed transition again, leaving the stack
    /// untouched. A later pop still reverses it exactly once.
    #[track_caller]
    pub fn barrier_repeat(&mut self) {
        self.assert_recording();
        let Some(top) = self.barrier_stack.last() else {
            panic!("barrier_repeat on command buffer '{}' with an empty stack", self.name);
        };
        self.commands.push(RecordedCommand::Barrier(top.clone()));
    }

    // ── Events ──────────────────────────────────────────────

    #[track_caller]
    pub fn signal_event(&mut self, event: DriverHandle, stage: PipelineStage) {
        self.assert_outside_pass("signal_event");
        self.commands.push(RecordedCommand::SignalEvent {
            event: event.expect_kind(ResourceKind::Event),
            stage,
        });
    }

    /// Wait for `events` and apply `barrier` once they are signaled.
    #[track_caller]
    pub fn wait_event(&mut self, events: &[DriverHandle], barrier: BarrierInfo) {
        self.assert_recording();
        assert!(!events.is_empty(), "wait_event on '{}' with no events", self.name);
        for event in events {
            event.expect_kind(ResourceKind::Event);
        }
        self.commands.push(RecordedCommand::WaitEvent {
            events: events.to_vec(),
            barrier,
        });
    }

    #[track_caller]
    pub fn reset_event(&mut self, event: DriverHandle, stage: PipelineStage) {
        self.assert_outside_pass("reset_event");
        self.commands.push(RecordedCommand::ResetEvent {
            event: event.expect_kind(ResourceKind::Event),
            stage,
        });
    }

    // ── Markers and queries ─────────────────────────────────

    #[track_caller]
    pub fn begin_marker(&mut self, name: &str, color: [f32; 4]) {
        self.assert_recording();
        self.marker_stack.push(name.to_string());
        if self.markers_enabled {
            self.commands.push(RecordedCommand::BeginMarker {
                name: name.to_string(),
                color,
            });
        }
    }

    #[track_caller]
    pub fn end_marker(&mut self) {
        self.assert_recording();
        assert!(
            self.marker_stack.pop().is_some(),
            "end_marker on command buffer '{}' without an open marker",
            self.name
        );
        if self.markers_enabled {
            self.commands.push(RecordedCommand::EndMarker);
        }
    }

    #[track_caller]
    pub fn insert_marker(&mut self, name: &str, color: [f32; 4]) {
        self.assert_recording();
        if self.markers_enabled {
            self.commands.push(RecordedCommand::InsertMarker {
                name: name.to_string(),
                color,
            });
        }
    }

    /// Write a timestamp after `stage` completes; returns the query slot.
    #[track_caller]
    pub fn write_timestamp(&mut self, stage: PipelineStage) -> u32 {
        self.assert_recording();
        assert!(
            self.queries.contains(QueryFlags::TIMESTAMP),
            "command buffer '{}' was created without timestamp queries",
            self.name
        );
        let query = self.timestamp_queries;
        self.timestamp_queries += 1;
        self.commands.push(RecordedCommand::WriteTimestamp { stage, query });
        query
    }

    // ── Secondary buffers ───────────────────────────────────

    #[track_caller]
    pub fn execute_secondary(&mut self, secondaries: &[&CommandBuffer]) {
        self.assert_recording();
        assert!(
            self.level == CommandBufferLevel::Primary,
            "command buffer '{}' is secondary and cannot execute others",
            self.name
        );
        let buffers = secondaries
            .iter()
            .map(|cmd| {
                assert!(
                    cmd.level == CommandBufferLevel::Secondary && cmd.state == RecordState::Executable,
                    "'{}' is not an executable secondary command buffer",
                    cmd.name
                );
                cmd.handle
            })
            .collect();
        self.commands.push(RecordedCommand::ExecuteSecondary { buffers });
    }

    fn release(&self) {
        self.driver.destroy(self.handle);
    }
}

/// Command buffers sharing one queue and allocation policy.
pub struct CommandBufferPool {
    driver: Arc<dyn Driver>,
    info: CommandBufferPoolInfo,
    buffers: Arena<CommandBuffer, CommandBufferId>,
}

impl CommandBufferPool {
    pub fn new(driver: Arc<dyn Driver>, info: CommandBufferPoolInfo) -> Self {
        debug!(queue = ?info.queue, flags = ?info.flags(), "command buffer pool created");
        Self {
            driver,
            info,
            buffers: Arena::new(),
        }
    }

    pub fn info(&self) -> &CommandBufferPoolInfo {
        &self.info
    }

    pub fn create(&mut self, info: &CommandBufferCreateInfo) -> DriverResult<CommandBufferId> {
        let cmd = CommandBuffer::new(self.driver.clone(), &self.info, info)?;
        Ok(self.buffers.insert(cmd))
    }

    #[track_caller]
    pub fn get(&self, id: CommandBufferId) -> &CommandBuffer {
        &self.buffers[id]
    }

    #[track_caller]
    pub fn get_mut(&mut self, id: CommandBufferId) -> &mut CommandBuffer {
        &mut self.buffers[id]
    }

    pub fn contains(&self, id: CommandBufferId) -> bool {
        self.buffers.contains(id)
    }

    #[track_caller]
    pub fn destroy(&mut self, id: CommandBufferId) {
        match self.buffers.remove(id) {
            Some(cmd) => cmd.release(),
            None => panic!("stale id {:?}", id),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Destroy every buffer still owned by the pool.
    pub fn destroy_all(&mut self) {
        for (_, cmd) in self.buffers.drain() {
            cmd.release();
        }
    }
}
