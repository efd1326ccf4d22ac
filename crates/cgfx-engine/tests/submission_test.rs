//! Integration test: SubmissionContext
//!
//! Checks that deferred frees wait for their slot to come back around and
//! for the slot's timeline value to be reached.

mod common;

use std::sync::Arc;

use cgfx_core::ResourceKind;
use cgfx_engine::capture::{CaptureDriver, DriverCall};
use cgfx_engine::command::{CommandBufferCreateInfo, RecordState};
use cgfx_engine::driver::{CommandBufferUsage, Driver, GpuAlloc, QueueType};
use cgfx_engine::submission::{SubmissionContext, SubmissionContextCreateInfo};

use common::{driver, graphics_pool};

fn context(driver: &Arc<CaptureDriver>, num_buffers: u32) -> SubmissionContext {
    SubmissionContext::new(
        driver.clone(),
        SubmissionContextCreateInfo {
            name: "frame".into(),
            num_buffers,
            pool: graphics_pool(),
            buffer: CommandBufferCreateInfo::default(),
        },
    )
}

/// Record an empty buffer into the current slot and submit it.
fn submit_frame(ctx: &mut SubmissionContext) -> u64 {
    let id = ctx.new_buffer().unwrap();
    let cmd = ctx.command_buffer_mut(id);
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.end_record().unwrap();
    ctx.submit(&[]).unwrap()
}

#[test]
fn test_sentinel_freed_only_when_slot_is_revisited() {
    let driver = driver();
    driver.set_auto_complete(false);
    let mut ctx = context(&driver, 3);
    let sentinel = driver.create_handle(ResourceKind::Buffer);

    // Cycle 0
    let first = submit_frame(&mut ctx);
    ctx.free_buffer(sentinel);
    let mut syncs = 0;
    ctx.next_cycle(|_| syncs += 1);

    // Cycles 1 and 2: the GPU has not finished anything yet.
    submit_frame(&mut ctx);
    ctx.next_cycle(|_| syncs += 1);
    submit_frame(&mut ctx);
    assert_eq!(driver.destroy_count(sentinel), 0);
    assert_eq!(syncs, 0);

    // Back to slot 0: the wait completes the slot, then it is drained.
    ctx.next_cycle(|value| {
        assert_eq!(value, first);
        assert_eq!(driver.destroy_count(sentinel), 0);
        driver.complete(QueueType::Graphics, value);
    });
    assert_eq!(ctx.current_index(), 0);
    assert_eq!(driver.destroy_count(sentinel), 1);
    assert_eq!(ctx.timeline_index(0), 0);

    // Another full round does not free it again.
    for _ in 0..3 {
        ctx.next_cycle(|value| driver.complete(QueueType::Graphics, value));
    }
    assert_eq!(driver.destroy_count(sentinel), 1);
}

#[test]
fn test_single_slot_context_waits_every_cycle() {
    let driver = driver();
    let mut ctx = context(&driver, 1);
    let texture = driver.create_handle(ResourceKind::Image);

    let value = submit_frame(&mut ctx);
    ctx.free_texture(texture);
    let mut waited = None;
    ctx.next_cycle(|v| waited = Some(v));
    assert_eq!(waited, Some(value));
    assert_eq!(driver.destroy_count(texture), 1);
}

#[test]
fn test_unsubmitted_slot_is_drained_without_waiting() {
    let driver = driver();
    let mut ctx = context(&driver, 2);
    let buffer = driver.create_handle(ResourceKind::Buffer);

    ctx.free_buffer(buffer);
    ctx.next_cycle(|_| panic!("nothing was submitted"));
    assert_eq!(driver.destroy_count(buffer), 0);
    ctx.next_cycle(|_| panic!("nothing was submitted"));
    assert_eq!(driver.destroy_count(buffer), 1);
}

#[test]
fn test_new_buffer_retires_the_previous_one() {
    let driver = driver();
    let mut ctx = context(&driver, 2);

    let first = ctx.new_buffer().unwrap();
    let first_handle = ctx.command_buffer(first).handle();
    let second = ctx.new_buffer().unwrap();
    assert_ne!(first, second);
    assert_eq!(ctx.current_buffer(), Some(second));
    assert_eq!(ctx.pending_count(0), 1);

    ctx.next_cycle(|_| {});
    ctx.next_cycle(|_| {});
    assert_eq!(driver.destroy_count(first_handle), 1);
    assert_eq!(ctx.current_buffer(), Some(second));
}

#[test]
fn test_clear_command_buffer_resets_without_destroying() {
    let driver = driver();
    let mut ctx = context(&driver, 1);
    let id = ctx.new_buffer().unwrap();
    let cmd = ctx.command_buffer_mut(id);
    cmd.begin_record(CommandBufferUsage::SUBMIT_ONCE);
    cmd.end_record().unwrap();
    let handle = cmd.handle();

    ctx.clear_command_buffer(id);
    ctx.next_cycle(|_| {});

    assert_eq!(ctx.command_buffer(id).state(), RecordState::Idle);
    assert_eq!(driver.destroy_count(handle), 0);
    let resets = driver.count(|call| {
        matches!(call, DriverCall::ResetCommandBuffer { cmd, .. } if *cmd == handle)
    });
    assert_eq!(resets, 1);
}

#[test]
fn test_poll_frees_only_completed_slots() {
    let driver = driver();
    driver.set_auto_complete(false);
    let mut ctx = context(&driver, 3);
    let early = driver.create_handle(ResourceKind::Buffer);
    let late = driver.create_handle(ResourceKind::Buffer);

    let first = submit_frame(&mut ctx);
    ctx.free_buffer(early);
    ctx.next_cycle(|_| {});
    submit_frame(&mut ctx);
    ctx.free_buffer(late);

    let completed =
        |driver: &CaptureDriver| driver.timeline_value(QueueType::Graphics).unwrap();
    let reached = completed(&driver);
    assert_eq!(ctx.poll(|v| v <= reached), 0);

    driver.complete(QueueType::Graphics, first);
    let reached = completed(&driver);
    assert_eq!(ctx.poll(|v| v <= reached), 1);
    assert_eq!(driver.destroy_count(early), 1);
    assert_eq!(driver.destroy_count(late), 0);
    assert_eq!(ctx.pending_count(0), 0);
}

#[test]
fn test_memory_and_host_memory_are_released() {
    let driver = driver();
    let mut ctx = context(&driver, 1);
    let alloc = GpuAlloc {
        memory: driver.create_handle(ResourceKind::Memory),
        offset: 0,
        size: 4096,
    };
    let staging = Arc::new(vec![0u8; 64]);

    ctx.free_memory(alloc);
    ctx.free_host_memory(Box::new(staging.clone()));
    assert_eq!(Arc::strong_count(&staging), 2);

    ctx.next_cycle(|_| {});
    assert_eq!(driver.freed_memory(), vec![alloc]);
    assert_eq!(Arc::strong_count(&staging), 1);
}

#[test]
fn test_destroy_syncs_and_frees_every_slot() {
    let driver = driver();
    let mut ctx = context(&driver, 2);
    let a = driver.create_handle(ResourceKind::Buffer);
    let b = driver.create_handle(ResourceKind::Pipeline);

    let current_handle = |ctx: &SubmissionContext| match ctx.current_buffer() {
        Some(id) => ctx.command_buffer(id).handle(),
        None => panic!("slot has no buffer"),
    };

    let first = submit_frame(&mut ctx);
    let first_cmd = current_handle(&ctx);
    ctx.free_buffer(a);
    ctx.next_cycle(|_| {});
    let second = submit_frame(&mut ctx);
    let second_cmd = current_handle(&ctx);
    ctx.free_pipeline(b);

    let mut synced = Vec::new();
    ctx.destroy(|value| synced.push(value));
    synced.sort_unstable();
    assert_eq!(synced, vec![first, second]);
    assert_eq!(driver.destroy_count(a), 1);
    assert_eq!(driver.destroy_count(b), 1);
    assert_eq!(driver.destroy_count(first_cmd), 1);
    assert_eq!(driver.destroy_count(second_cmd), 1);
}

#[test]
#[should_panic(expected = "submitted while Recording")]
fn test_submit_while_recording_panics() {
    let driver = driver();
    let mut ctx = context(&driver, 2);
    let id = ctx.new_buffer().unwrap();
    ctx.command_buffer_mut(id).begin_record(CommandBufferUsage::SUBMIT_ONCE);
    let _ = ctx.submit(&[]);
}

#[test]
#[should_panic(expected = "needs at least one buffer")]
fn test_zero_buffers_panics() {
    let driver = driver();
    let _ = context(&driver, 0);
}
