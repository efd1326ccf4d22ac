//! Frame ring with deferred destruction.
//!
//! A [`SubmissionContext`] owns `N` slots. Work recorded during a cycle goes
//! into the current slot's command buffer, and anything retired during that
//! cycle is queued on the same slot. The queue is only drained when the ring
//! comes back around to the slot and the slot's timeline value has been
//! waited on, so nothing is freed while the GPU may still read it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cgfx_core::{DriverHandle, ResourceKind};
use tracing::{debug, error, trace};

use crate::command::{
    CommandBuffer, CommandBufferCreateInfo, CommandBufferId, CommandBufferPool,
    CommandBufferPoolInfo, RecordState,
};
use crate::driver::{Driver, GpuAlloc, QueueType, SubmitInfo, TimelineWait};
use crate::error::DriverResult;

/// An object waiting for its slot to come back around before it is freed.
/// Ownership moves into the queue when the item is appended.
pub enum DeferredFree {
    /// Any driver object, destroyed by kind
    Resource(DriverHandle),
    Buffer(DriverHandle),
    Image(DriverHandle),
    Pipeline(DriverHandle),
    /// Destroy a command buffer of this context's pool
    CommandBuffer(CommandBufferId),
    /// Reset a recorded but unused command buffer, keeping it alive
    ClearCommandBuffer(CommandBufferId),
    Memory(GpuAlloc),
    HostMemory(Box<dyn Any + Send>),
}

impl fmt::Debug for DeferredFree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredFree::Resource(h) => f.debug_tuple("Resource").field(h).finish(),
            DeferredFree::Buffer(h) => f.debug_tuple("Buffer").field(h).finish(),
            DeferredFree::Image(h) => f.debug_tuple("Image").field(h).finish(),
            DeferredFree::Pipeline(h) => f.debug_tuple("Pipeline").field(h).finish(),
            DeferredFree::CommandBuffer(id) => f.debug_tuple("CommandBuffer").field(id).finish(),
            DeferredFree::ClearCommandBuffer(id) => {
                f.debug_tuple("ClearCommandBuffer").field(id).finish()
            }
            DeferredFree::Memory(alloc) => f.debug_tuple("Memory").field(alloc).finish(),
            DeferredFree::HostMemory(_) => f.write_str("HostMemory(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionContextCreateInfo {
    pub name: String,
    pub num_buffers: u32,
    pub pool: CommandBufferPoolInfo,
    /// Template for the command buffer handed out each cycle
    pub buffer: CommandBufferCreateInfo,
}

#[derive(Debug, Default)]
struct Slot {
    cmd_buffer: Option<CommandBufferId>,
    timeline: u64,
    pending: Vec<DeferredFree>,
}

pub struct SubmissionContext {
    name: String,
    driver: Arc<dyn Driver>,
    pool: CommandBufferPool,
    template: CommandBufferCreateInfo,
    slots: Vec<Slot>,
    current: usize,
    cycle: u64,
}

impl SubmissionContext {
    #[track_caller]
    pub fn new(driver: Arc<dyn Driver>, info: SubmissionContextCreateInfo) -> Self {
        assert!(
            info.num_buffers > 0,
            "submission context '{}' needs at least one buffer",
            info.name
        );
        let slots = (0..info.num_buffers).map(|_| Slot::default()).collect();
        debug!(
            name = %info.name,
            buffers = info.num_buffers,
            queue = ?info.pool.queue,
            "submission context created"
        );
        Self {
            name: info.name,
            pool: CommandBufferPool::new(driver.clone(), info.pool),
            driver,
            template: info.buffer,
            slots,
            current: 0,
            cycle: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Number of `next_cycle` calls so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn queue(&self) -> QueueType {
        self.pool.info().queue
    }

    /// Items waiting on slot `index`.
    pub fn pending_count(&self, index: usize) -> usize {
        self.slots[index].pending.len()
    }

    pub fn timeline_index(&self, index: usize) -> u64 {
        self.slots[index].timeline
    }

    /// Retire the current slot's command buffer and create a fresh one.
    pub fn new_buffer(&mut self) -> DriverResult<CommandBufferId> {
        let mut info = self.template.clone();
        info.name = format!("{} #{}", self.name, self.current);
        let id = self.pool.create(&info)?;
        let slot = &mut self.slots[self.current];
        if let Some(old) = slot.cmd_buffer.replace(id) {
            slot.pending.push(DeferredFree::CommandBuffer(old));
        }
        Ok(id)
    }

    pub fn current_buffer(&self) -> Option<CommandBufferId> {
        self.slots[self.current].cmd_buffer
    }

    #[track_caller]
    pub fn command_buffer(&self, id: CommandBufferId) -> &CommandBuffer {
        self.pool.get(id)
    }

    #[track_caller]
    pub fn command_buffer_mut(&mut self, id: CommandBufferId) -> &mut CommandBuffer {
        self.pool.get_mut(id)
    }

    // ── Deferred frees ──────────────────────────────────────

    pub fn free(&mut self, item: DeferredFree) {
        trace!(context = %self.name, slot = self.current, ?item, "deferred");
        self.slots[self.current].pending.push(item);
    }

    pub fn free_resource(&mut self, handle: DriverHandle) {
        self.free(DeferredFree::Resource(handle));
    }

    #[track_caller]
    pub fn free_buffer(&mut self, buffer: DriverHandle) {
        self.free(DeferredFree::Buffer(buffer.expect_kind(ResourceKind::Buffer)));
    }

    #[track_caller]
    pub fn free_texture(&mut self, image: DriverHandle) {
        self.free(DeferredFree::Image(image.expect_kind(ResourceKind::Image)));
    }

    #[track_caller]
    pub fn free_pipeline(&mut self, pipeline: DriverHandle) {
        self.free(DeferredFree::Pipeline(pipeline.expect_kind(ResourceKind::Pipeline)));
    }

    pub fn free_command_buffer(&mut self, id: CommandBufferId) {
        self.free(DeferredFree::CommandBuffer(id));
    }

    pub fn clear_command_buffer(&mut self, id: CommandBufferId) {
        self.free(DeferredFree::ClearCommandBuffer(id));
    }

    pub fn free_memory(&mut self, alloc: GpuAlloc) {
        self.free(DeferredFree::Memory(alloc));
    }

    pub fn free_host_memory(&mut self, memory: Box<dyn Any + Send>) {
        self.free(DeferredFree::HostMemory(memory));
    }

    // ── Submission ──────────────────────────────────────────

    /// Record that the current slot's work completes at `value`.
    pub fn set_timeline_index(&mut self, value: u64) {
        self.slots[self.current].timeline = value;
    }

    /// Submit the current slot's command buffer after `waits`, tagging the
    /// slot with the timeline value that signals its completion.
    #[track_caller]
    pub fn submit(&mut self, waits: &[TimelineWait]) -> DriverResult<u64> {
        let Some(id) = self.slots[self.current].cmd_buffer else {
            panic!("submission context '{}' has no buffer to submit", self.name);
        };
        let cmd = self.pool.get(id);
        assert!(
            cmd.state() == RecordState::Executable,
            "command buffer '{}' submitted while {:?}",
            cmd.name(),
            cmd.state()
        );
        let value = self.driver.submit(&SubmitInfo {
            queue: cmd.queue(),
            command_buffers: &[cmd.handle()],
            waits,
        })?;
        self.set_timeline_index(value);
        Ok(value)
    }

    // ── Cycling ─────────────────────────────────────────────

    /// Advance to the next slot. `sync` is called with the slot's timeline
    /// value and must block until the GPU has reached it; only then is the
    /// slot's queue drained. Returns the timeline value of the slot left
    /// behind.
    pub fn next_cycle(&mut self, sync: impl FnOnce(u64)) -> u64 {
        let outgoing = self.slots[self.current].timeline;
        self.current = (self.current + 1) % self.slots.len();
        self.cycle += 1;

        let timeline = self.slots[self.current].timeline;
        if timeline != 0 {
            sync(timeline);
        }
        let freed = self.cleanup(self.current);
        if freed > 0 {
            debug!(context = %self.name, slot = self.current, freed, "slot reclaimed");
        }
        outgoing
    }

    /// Drain every slot whose timeline `is_done` reports complete, without
    /// advancing the ring or blocking.
    pub fn poll(&mut self, mut is_done: impl FnMut(u64) -> bool) -> usize {
        let mut freed = 0;
        for index in 0..self.slots.len() {
            let timeline = self.slots[index].timeline;
            if timeline != 0 && is_done(timeline) {
                freed += self.cleanup(index);
            }
        }
        freed
    }

    fn cleanup(&mut self, index: usize) -> usize {
        let slot = &mut self.slots[index];
        slot.timeline = 0;
        let pending = std::mem::take(&mut slot.pending);
        let count = pending.len();
        for item in pending {
            match item {
                DeferredFree::Resource(handle)
                | DeferredFree::Buffer(handle)
                | DeferredFree::Image(handle)
                | DeferredFree::Pipeline(handle) => self.driver.destroy(handle),
                DeferredFree::CommandBuffer(id) => self.pool.destroy(id),
                DeferredFree::ClearCommandBuffer(id) => {
                    if let Err(e) = self.pool.get_mut(id).reset(false) {
                        error!(context = %self.name, "failed to clear command buffer: {}", e);
                    }
                }
                DeferredFree::Memory(alloc) => self.driver.free_memory(alloc),
                DeferredFree::HostMemory(memory) => drop(memory),
            }
        }
        count
    }

    /// Wait for every slot, free everything queued and destroy the pool.
    pub fn destroy(mut self, mut sync: impl FnMut(u64)) {
        for index in 0..self.slots.len() {
            let timeline = self.slots[index].timeline;
            if timeline != 0 {
                sync(timeline);
            }
            self.cleanup(index);
        }
        for slot in &mut self.slots {
            slot.cmd_buffer = None;
        }
        self.pool.destroy_all();
        debug!(context = %self.name, "submission context destroyed");
    }
}
