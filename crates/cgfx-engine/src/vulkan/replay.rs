use std::ffi::CString;

use ash::vk;
use cgfx_core::DriverHandle;

use super::{convert, VulkanDriver};
use crate::barrier::BarrierInfo;
use crate::commands::RecordedCommand;

impl VulkanDriver {
    fn native_barrier(&self, info: &BarrierInfo) -> convert::NativeBarrier {
        convert::barrier(
            info,
            &self.families,
            |h| self.resolve::<vk::Image>(h),
            |h| self.resolve::<vk::Buffer>(h),
        )
    }

    fn resolve_all<T: vk::Handle>(&self, handles: &[DriverHandle]) -> Vec<T> {
        handles.iter().filter_map(|h| self.resolve::<T>(*h)).collect()
    }

    /// Translate a recorded command stream into `cb`, which must be in the
    /// recording state. Commands naming unknown handles are skipped.
    pub(super) fn replay(
        &self,
        cb: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        commands: &[RecordedCommand],
    ) {
        let dev = &self.device;
        for cmd in commands {
            match cmd {
                RecordedCommand::Barrier(info) => {
                    let native = self.native_barrier(info);
                    unsafe {
                        dev.cmd_pipeline_barrier(
                            cb,
                            native.src_stage,
                            native.dst_stage,
                            native.dependency_flags,
                            &[],
                            &native.buffers,
                            &native.images,
                        );
                    }
                }

                RecordedCommand::BeginPass {
                    render_pass,
                    framebuffer,
                    render_area,
                    clear_values,
                    contents,
                } => {
                    let (Some(rp), Some(fb)) = (
                        self.resolve::<vk::RenderPass>(*render_pass),
                        self.resolve::<vk::Framebuffer>(*framebuffer),
                    ) else {
                        continue;
                    };
                    let clears: Vec<vk::ClearValue> =
                        clear_values.iter().map(|c| c.to_vk()).collect();
                    let begin = vk::RenderPassBeginInfo::default()
                        .render_pass(rp)
                        .framebuffer(fb)
                        .render_area(*render_area)
                        .clear_values(&clears);
                    unsafe { dev.cmd_begin_render_pass(cb, &begin, *contents) };
                }
                RecordedCommand::NextSubpass { contents } => unsafe {
                    dev.cmd_next_subpass(cb, *contents);
                },
                RecordedCommand::EndPass => unsafe { dev.cmd_end_render_pass(cb) },

                RecordedCommand::BindPipeline {
                    bind_point,
                    pipeline,
                } => {
                    let Some(p) = self.resolve::<vk::Pipeline>(*pipeline) else {
                        continue;
                    };
                    unsafe { dev.cmd_bind_pipeline(cb, *bind_point, p) };
                }
                RecordedCommand::BindDescriptorSets {
                    bind_point,
                    layout,
                    first_set,
                    descriptor_sets,
                    dynamic_offsets,
                } => {
                    let Some(pl) = self.resolve::<vk::PipelineLayout>(*layout) else {
                        continue;
                    };
                    let sets: Vec<vk::DescriptorSet> = self.resolve_all(descriptor_sets);
                    unsafe {
                        dev.cmd_bind_descriptor_sets(
                            cb,
                            *bind_point,
                            pl,
                            *first_set,
                            &sets,
                            dynamic_offsets,
                        );
                    }
                }
                RecordedCommand::BindVertexBuffer {
                    binding,
                    buffer,
                    offset,
                } => {
                    let Some(b) = self.resolve::<vk::Buffer>(*buffer) else {
                        continue;
                    };
                    unsafe { dev.cmd_bind_vertex_buffers(cb, *binding, &[b], &[*offset]) };
                }
                RecordedCommand::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => {
                    let Some(b) = self.resolve::<vk::Buffer>(*buffer) else {
                        continue;
                    };
                    unsafe { dev.cmd_bind_index_buffer(cb, b, *offset, *index_type) };
                }
                RecordedCommand::SetViewports { first, viewports } => unsafe {
                    dev.cmd_set_viewport(cb, *first, viewports);
                },
                RecordedCommand::SetScissors { first, scissors } => unsafe {
                    dev.cmd_set_scissor(cb, *first, scissors);
                },

                RecordedCommand::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => unsafe {
                    dev.cmd_draw(
                        cb,
                        *vertex_count,
                        *instance_count,
                        *first_vertex,
                        *first_instance,
                    );
                },
                RecordedCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => unsafe {
                    dev.cmd_draw_indexed(
                        cb,
                        *index_count,
                        *instance_count,
                        *first_index,
                        *vertex_offset,
                        *first_instance,
                    );
                },
                RecordedCommand::DrawIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => {
                    let Some(b) = self.resolve::<vk::Buffer>(*buffer) else {
                        continue;
                    };
                    unsafe { dev.cmd_draw_indirect(cb, b, *offset, *draw_count, *stride) };
                }
                RecordedCommand::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => {
                    let Some(b) = self.resolve::<vk::Buffer>(*buffer) else {
                        continue;
                    };
                    unsafe {
                        dev.cmd_draw_indexed_indirect(cb, b, *offset, *draw_count, *stride)
                    };
                }
                RecordedCommand::Dispatch {
                    group_count_x,
                    group_count_y,
                    group_count_z,
                } => unsafe {
                    dev.cmd_dispatch(cb, *group_count_x, *group_count_y, *group_count_z);
                },
                RecordedCommand::DispatchIndirect { buffer, offset } => {
                    let Some(b) = self.resolve::<vk::Buffer>(*buffer) else {
                        continue;
                    };
                    unsafe { dev.cmd_dispatch_indirect(cb, b, *offset) };
                }

                RecordedCommand::CopyBuffer { src, dst, regions } => {
                    let (Some(s), Some(d)) = (
                        self.resolve::<vk::Buffer>(*src),
                        self.resolve::<vk::Buffer>(*dst),
                    ) else {
                        continue;
                    };
                    unsafe { dev.cmd_copy_buffer(cb, s, d, regions) };
                }
                RecordedCommand::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => {
                    let (Some(s), Some(d)) = (
                        self.resolve::<vk::Buffer>(*src),
                        self.resolve::<vk::Image>(*dst),
                    ) else {
                        continue;
                    };
                    unsafe { dev.cmd_copy_buffer_to_image(cb, s, d, *dst_layout, regions) };
                }
                RecordedCommand::CopyImageToBuffer {
                    src,
                    src_layout,
                    dst,
                    regions,
                } => {
                    let (Some(s), Some(d)) = (
                        self.resolve::<vk::Image>(*src),
                        self.resolve::<vk::Buffer>(*dst),
                    ) else {
                        continue;
                    };
                    unsafe { dev.cmd_copy_image_to_buffer(cb, s, *src_layout, d, regions) };
                }
                RecordedCommand::CopyImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                } => {
                    let (Some(s), Some(d)) = (
                        self.resolve::<vk::Image>(*src),
                        self.resolve::<vk::Image>(*dst),
                    ) else {
                        continue;
                    };
                    unsafe { dev.cmd_copy_image(cb, s, *src_layout, d, *dst_layout, regions) };
                }
                RecordedCommand::Blit {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                    filter,
                } => {
                    let (Some(s), Some(d)) = (
                        self.resolve::<vk::Image>(*src),
                        self.resolve::<vk::Image>(*dst),
                    ) else {
                        continue;
                    };
                    unsafe {
                        dev.cmd_blit_image(cb, s, *src_layout, d, *dst_layout, regions, *filter)
                    };
                }
                RecordedCommand::Resolve {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                } => {
                    let (Some(s), Some(d)) = (
                        self.resolve::<vk::Image>(*src),
                        self.resolve::<vk::Image>(*dst),
                    ) else {
                        continue;
                    };
                    unsafe {
                        dev.cmd_resolve_image(cb, s, *src_layout, d, *dst_layout, regions)
                    };
                }

                RecordedCommand::SignalEvent { event, stage } => {
                    let Some(e) = self.resolve::<vk::Event>(*event) else {
                        continue;
                    };
                    unsafe { dev.cmd_set_event(cb, e, stage.stage_flags()) };
                }
                RecordedCommand::ResetEvent { event, stage } => {
                    let Some(e) = self.resolve::<vk::Event>(*event) else {
                        continue;
                    };
                    unsafe { dev.cmd_reset_event(cb, e, stage.stage_flags()) };
                }
                RecordedCommand::WaitEvent { events, barrier } => {
                    let events: Vec<vk::Event> = self.resolve_all(events);
                    if events.is_empty() {
                        continue;
                    }
                    let native = self.native_barrier(barrier);
                    unsafe {
                        dev.cmd_wait_events(
                            cb,
                            &events,
                            native.src_stage,
                            native.dst_stage,
                            &[],
                            &native.buffers,
                            &native.images,
                        );
                    }
                }

                RecordedCommand::BeginMarker { name, color } => {
                    let Some(debug_utils) = &self.debug_utils else {
                        continue;
                    };
                    let name = CString::new(name.as_str()).unwrap_or_default();
                    unsafe {
                        debug_utils
                            .cmd_begin_debug_utils_label(cb, &convert::label(&name, *color))
                    };
                }
                RecordedCommand::EndMarker => {
                    if let Some(debug_utils) = &self.debug_utils {
                        unsafe { debug_utils.cmd_end_debug_utils_label(cb) };
                    }
                }
                RecordedCommand::InsertMarker { name, color } => {
                    let Some(debug_utils) = &self.debug_utils else {
                        continue;
                    };
                    let name = CString::new(name.as_str()).unwrap_or_default();
                    unsafe {
                        debug_utils
                            .cmd_insert_debug_utils_label(cb, &convert::label(&name, *color))
                    };
                }
                RecordedCommand::WriteTimestamp { stage, query } => {
                    if query_pool == vk::QueryPool::null() {
                        continue;
                    }
                    unsafe {
                        dev.cmd_write_timestamp(cb, stage.stage_flags(), query_pool, *query)
                    };
                }

                RecordedCommand::ExecuteSecondary { buffers } => {
                    let secondaries: Vec<vk::CommandBuffer> = buffers
                        .iter()
                        .filter_map(|h| self.command_buffers.get(&h.raw).map(|e| e.value().raw))
                        .collect();
                    if secondaries.is_empty() {
                        continue;
                    }
                    unsafe { dev.cmd_execute_commands(cb, &secondaries) };
                }
            }
        }
    }
}
