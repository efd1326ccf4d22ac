//! Integration test: CommandBuffer
//!
//! Records against the capture driver and inspects the batched command
//! stream: barrier stack behaviour, state assertions, markers, queries and
//! secondary buffers.

mod common;

use cgfx_core::ResourceKind;
use cgfx_engine::barrier::{
    BarrierDomain, BarrierInfo, BarrierTable, BufferSubresource, PipelineStage, TextureSubresource,
};
use cgfx_engine::capture::DriverCall;
use cgfx_engine::command::{
    CommandBuffer, CommandBufferCreateInfo, CommandBufferPoolInfo, PipelineBuildBits, QueryFlags,
    RecordState,
};
use cgfx_engine::commands::RecordedCommand;
use cgfx_engine::driver::{CommandBufferUsage, QueueType};
use cgfx_engine::pipeline::InputAssemblyKey;
use cgfx_engine::pipeline_db::PipelineDatabase;

use common::{command_buffer, command_buffer_with, driver, pass, program, vertex_layout};

fn barriers(cmd: &CommandBuffer) -> Vec<BarrierInfo> {
    cmd.commands()
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::Barrier(info) => Some(info.clone()),
            _ => None,
        })
        .collect()
}

fn shadow_map_transition(cmd_driver: &cgfx_engine::CaptureDriver) -> BarrierInfo {
    let image = cmd_driver.create_handle(ResourceKind::Image);
    BarrierInfo::new(
        PipelineStage::DepthStencilWrite,
        PipelineStage::PixelShaderRead,
        BarrierDomain::Global,
    )
    .texture(
        image,
        TextureSubresource {
            aspect: ash::vk::ImageAspectFlags::DEPTH,
            mip: 0,
            mip_count: 1,
            layer: 2,
            layer_count: 4,
        },
    )
}

#[test]
fn test_push_pop_records_reverse_transition() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "shadow");
    let transition = shadow_map_transition(&driver);

    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.barrier_push(transition.clone());
    assert_eq!(cmd.barrier_depth(), 1);
    cmd.barrier_pop();
    assert_eq!(cmd.barrier_depth(), 0);

    let recorded = barriers(&cmd);
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0], transition);
    assert_eq!(recorded[1].from_stage, PipelineStage::PixelShaderRead);
    assert_eq!(recorded[1].to_stage, PipelineStage::DepthStencilWrite);
    assert_eq!(recorded[1].textures, transition.textures);
    assert_eq!(recorded[1].buffers, transition.buffers);
}

#[test]
fn test_repeat_then_pop_reverses_once() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "repeat");
    let transition = shadow_map_transition(&driver);

    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.barrier_push(transition.clone());
    cmd.barrier_repeat();
    cmd.barrier_repeat();
    assert_eq!(cmd.barrier_depth(), 1);
    cmd.barrier_pop();

    let recorded = barriers(&cmd);
    assert_eq!(
        recorded,
        vec![
            transition.clone(),
            transition.clone(),
            transition.clone(),
            transition.reversed(),
        ]
    );
    assert_eq!(cmd.barrier_depth(), 0);
}

#[test]
fn test_nested_pushes_pop_in_reverse_order() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "nested");
    let outer = shadow_map_transition(&driver);
    let buffer = driver.create_handle(ResourceKind::Buffer);
    let inner = BarrierInfo::new(
        PipelineStage::ComputeShaderWrite,
        PipelineStage::Indirect,
        BarrierDomain::Global,
    )
    .buffer(buffer, BufferSubresource::WHOLE);

    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.barrier_push(outer.clone());
    cmd.barrier_push(inner.clone());
    cmd.barrier_repeat();
    cmd.barrier_pop();
    cmd.barrier_repeat();
    cmd.barrier_pop();

    assert_eq!(
        barriers(&cmd),
        vec![
            outer.clone(),
            inner.clone(),
            inner.clone(),
            inner.reversed(),
            outer.clone(),
            outer.reversed(),
        ]
    );
}

#[test]
fn test_named_barrier_push() {
    let driver = driver();
    let mut table = BarrierTable::new();
    let transition = shadow_map_transition(&driver);
    let id = table.create(transition.clone());

    let mut cmd = command_buffer(&driver, "named");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.barrier_push_named(&table, id);
    cmd.barrier_pop();
    assert_eq!(barriers(&cmd), vec![transition.clone(), transition.reversed()]);

    table.destroy(id);
    assert!(table.is_empty());
}

#[test]
#[should_panic(expected = "empty stack")]
fn test_pop_without_push_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "underflow");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.barrier_pop();
}

#[test]
#[should_panic(expected = "lists no textures or buffers")]
fn test_empty_barrier_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "empty");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.barrier(BarrierInfo::new(
        PipelineStage::TransferWrite,
        PipelineStage::AllShadersRead,
        BarrierDomain::Global,
    ));
}

#[test]
fn test_end_record_hands_stream_to_driver() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "upload");
    let src = driver.create_handle(ResourceKind::Buffer);
    let dst = driver.create_handle(ResourceKind::Buffer);

    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.copy_buffer(
        src,
        dst,
        &[ash::vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 256,
        }],
    );
    cmd.end_record().unwrap();

    assert_eq!(cmd.state(), RecordState::Executable);
    let recorded = driver.recording(cmd.handle()).unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(matches!(recorded[0], RecordedCommand::CopyBuffer { .. }));
    assert_eq!(
        driver.count(|call| matches!(call, DriverCall::Record { commands: 1, .. })),
        1
    );

    cmd.reset(false).unwrap();
    assert_eq!(cmd.state(), RecordState::Idle);
    assert!(cmd.commands().is_empty());
    assert!(driver.recording(cmd.handle()).is_none());
}

#[test]
fn test_draw_through_pipeline_database() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let mut cmd = command_buffer(&driver, "forward");
    let forward = pass(&driver, 1, &[1]);

    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.set_shader_program(program(&driver, 1));
    cmd.set_vertex_layout(vertex_layout(1));
    cmd.set_primitive_topology(InputAssemblyKey::TRIANGLES);
    cmd.begin_pass(forward.clone());
    assert!(cmd.build_bits().contains(PipelineBuildBits::ALL_INFO_SET));

    let first = cmd.set_graphics_pipeline(&db).unwrap();
    cmd.draw(3, 1, 0, 0);
    let second = cmd.set_graphics_pipeline(&db).unwrap();
    cmd.draw(3, 1, 0, 0);
    cmd.end_pass();
    cmd.end_record().unwrap();

    assert_eq!(first, second);
    assert_eq!(driver.pipelines_created(), 1);
    let binds = cmd
        .commands()
        .iter()
        .filter(|c| matches!(c, RecordedCommand::BindPipeline { .. }))
        .count();
    assert_eq!(binds, 1);
    assert!(matches!(cmd.commands()[0], RecordedCommand::BeginPass { .. }));
    assert!(matches!(cmd.commands()[1], RecordedCommand::SetViewports { .. }));
}

#[test]
fn test_default_vertex_layout_reuses_the_compiled_pipeline() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let post = pass(&driver, 1, &[1]);
    let tonemap = program(&driver, 1);

    let record_frame = |cmd: &mut CommandBuffer| {
        cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
        cmd.begin_pass(post.clone());
        cmd.set_shader_program(tonemap.clone());
        cmd.set_primitive_topology(InputAssemblyKey::TRIANGLES);
        let pipeline = cmd.set_graphics_pipeline(&db).unwrap();
        cmd.draw(3, 1, 0, 0);
        cmd.end_pass();
        cmd.end_record().unwrap();
        pipeline
    };

    let mut pipelines = Vec::new();
    for frame in 0..3 {
        let mut cmd = command_buffer(&driver, &format!("post{}", frame));
        pipelines.push(record_frame(&mut cmd));
    }
    let mut reused = command_buffer(&driver, "post-reused");
    pipelines.push(record_frame(&mut reused));
    reused.reset(false).unwrap();
    pipelines.push(record_frame(&mut reused));

    assert!(pipelines.iter().all(|p| *p == pipelines[0]));
    assert_eq!(driver.pipelines_created(), 1);
    assert!(db.take_retired_pipelines().is_empty());
}

#[test]
#[should_panic(expected = "missing")]
fn test_pipeline_without_topology_panics() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let mut cmd = command_buffer(&driver, "incomplete");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.set_shader_program(program(&driver, 1));
    cmd.begin_pass(pass(&driver, 1, &[1]));
    let _ = cmd.set_graphics_pipeline(&db);
}

#[test]
#[should_panic(expected = "without a graphics pipeline")]
fn test_draw_without_pipeline_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "nodraw");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.begin_pass(pass(&driver, 1, &[1]));
    cmd.draw(3, 1, 0, 0);
}

#[test]
#[should_panic(expected = "must be idle")]
fn test_begin_record_twice_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "twice");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
}

#[test]
#[should_panic(expected = "ended inside a pass")]
fn test_end_record_inside_pass_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "open-pass");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.begin_pass(pass(&driver, 1, &[1]));
    let _ = cmd.end_record();
}

#[test]
#[should_panic(expected = "not allowed inside a pass")]
fn test_copy_inside_pass_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "copy-in-pass");
    let buffer = driver.create_handle(ResourceKind::Buffer);
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.begin_pass(pass(&driver, 1, &[1]));
    cmd.copy_buffer(buffer, buffer, &[]);
}

#[test]
#[should_panic(expected = "without a compute pipeline")]
fn test_dispatch_without_pipeline_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "compute");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.dispatch(8, 8, 1);
}

#[test]
#[should_panic(expected = "non-resettable pool")]
fn test_reset_from_fixed_pool_panics() {
    let driver = driver();
    let pool = CommandBufferPoolInfo {
        queue: QueueType::Graphics,
        resettable: false,
        short_lived: false,
    };
    let mut cmd =
        CommandBuffer::new(driver.clone(), &pool, &CommandBufferCreateInfo::default()).unwrap();
    let _ = cmd.reset(false);
}

#[test]
fn test_disabled_markers_are_tracked_but_not_recorded() {
    let driver = driver();
    let mut cmd = command_buffer_with(
        &driver,
        &CommandBufferCreateInfo {
            name: "quiet".into(),
            markers: false,
            ..Default::default()
        },
    );
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.begin_marker("shadows", [1.0, 0.0, 0.0, 1.0]);
    cmd.insert_marker("cascade 0", [1.0, 1.0, 0.0, 1.0]);
    cmd.end_marker();
    cmd.end_record().unwrap();
    assert!(cmd.commands().is_empty());
}

#[test]
#[should_panic(expected = "open markers")]
fn test_unbalanced_markers_panic_at_end() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "markers");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.begin_marker("gbuffer", [0.0, 1.0, 0.0, 1.0]);
    let _ = cmd.end_record();
}

#[test]
fn test_timestamps_use_consecutive_queries() {
    let driver = driver();
    let mut cmd = command_buffer_with(
        &driver,
        &CommandBufferCreateInfo {
            name: "timed".into(),
            queries: QueryFlags::TIMESTAMP,
            ..Default::default()
        },
    );
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    assert_eq!(cmd.write_timestamp(PipelineStage::ImageInitial), 0);
    assert_eq!(cmd.write_timestamp(PipelineStage::ColorWrite), 1);
}

#[test]
#[should_panic(expected = "without timestamp queries")]
fn test_timestamp_without_queries_panics() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "untimed");
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.write_timestamp(PipelineStage::ColorWrite);
}

#[test]
fn test_execute_secondary() {
    let driver = driver();
    let mut secondary = command_buffer_with(
        &driver,
        &CommandBufferCreateInfo {
            name: "bundle".into(),
            secondary: true,
            ..Default::default()
        },
    );
    secondary.begin_record(CommandBufferUsage::SUBMIT_DURING_PASS);
    secondary.end_record().unwrap();

    let mut primary = command_buffer(&driver, "primary");
    primary.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    primary.execute_secondary(&[&secondary]);

    match &primary.commands()[0] {
        RecordedCommand::ExecuteSecondary { buffers } => {
            assert_eq!(buffers, &vec![secondary.handle()])
        }
        other => panic!("expected ExecuteSecondary, got {:?}", other),
    }
}

#[test]
fn test_events_carry_their_barrier() {
    let driver = driver();
    let mut cmd = command_buffer(&driver, "events");
    let event = driver.create_handle(ResourceKind::Event);
    let transition = shadow_map_transition(&driver);

    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.signal_event(event, PipelineStage::DepthStencilWrite);
    cmd.wait_event(&[event], transition.clone());
    cmd.reset_event(event, PipelineStage::PixelShaderRead);

    match &cmd.commands()[1] {
        RecordedCommand::WaitEvent { events, barrier } => {
            assert_eq!(events, &vec![event]);
            assert_eq!(barrier, &transition);
        }
        other => panic!("expected WaitEvent, got {:?}", other),
    }
}
