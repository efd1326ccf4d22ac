//! An in-memory [`Driver`] that records every call.
//!
//! No GPU is involved: handles come from a [`HandleAllocator`], memory is
//! fictitious and timelines only advance when a test says so (or
//! immediately on wait, with auto-completion on). Tests inspect the call log
//! to check what the engine asked the device to do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use cgfx_core::{DriverHandle, HandleAllocator, ResourceKind};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::commands::RecordedCommand;
use crate::driver::{
    CommandBufferLevel, CommandBufferUsage, CommandPoolFlags, DeviceLimits, Driver, GpuAlloc,
    QueueFamilies, QueueType, SparseBindInfo, SparseImageDesc, SparseImageRequirements,
    SparseOpaqueBind, SparsePageBind, SubmitInfo,
};
use crate::error::{DriverError, DriverResult};
use crate::pipeline::{GraphicsPipelineDesc, ShaderProgramId};

#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    CreateCommandBuffer {
        handle: DriverHandle,
        queue: QueueType,
        pool: CommandPoolFlags,
        level: CommandBufferLevel,
    },
    Record {
        cmd: DriverHandle,
        usage: CommandBufferUsage,
        commands: usize,
    },
    ResetCommandBuffer {
        cmd: DriverHandle,
        release: bool,
    },
    Submit {
        queue: QueueType,
        command_buffers: Vec<DriverHandle>,
        value: u64,
    },
    CreatePipeline {
        handle: DriverHandle,
        program: ShaderProgramId,
        subpass: u32,
        color_attachments: u32,
        topology: vk::PrimitiveTopology,
    },
    CreateEvent(DriverHandle),
    CreateSparseImage(DriverHandle),
    BindSparse {
        image: DriverHandle,
        pages: Vec<SparsePageBind>,
        opaque: Vec<SparseOpaqueBind>,
    },
    AllocateMemory(GpuAlloc),
    FreeMemory(GpuAlloc),
    Destroy(DriverHandle),
    WaitIdle,
}

/// Driver entry points a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateSparseImage,
    SparseRequirements,
    BindSparse,
    AllocateMemory,
    CreatePipeline,
}

type PipelineHook = Arc<dyn Fn(&GraphicsPipelineDesc) + Send + Sync>;

pub struct CaptureDriver {
    handles: HandleAllocator,
    failures: DashMap<FailPoint, (usize, DriverError)>,
    pipeline_hook: Mutex<Option<PipelineHook>>,
    calls: Mutex<Vec<DriverCall>>,
    recordings: DashMap<DriverHandle, Vec<RecordedCommand>>,
    signaled: DashMap<QueueType, u64>,
    completed: DashMap<QueueType, u64>,
    auto_complete: AtomicBool,
    families: QueueFamilies,
    limits: DeviceLimits,
    sparse: SparseImageRequirements,
}

impl Default for CaptureDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDriver {
    pub fn new() -> Self {
        Self {
            handles: HandleAllocator::new(),
            failures: DashMap::new(),
            pipeline_hook: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            recordings: DashMap::new(),
            signaled: DashMap::new(),
            completed: DashMap::new(),
            auto_complete: AtomicBool::new(true),
            families: QueueFamilies::unified(0),
            limits: DeviceLimits {
                sparse_address_space_size: 1 << 40,
                timestamp_period: 1.0,
            },
            sparse: SparseImageRequirements {
                aspect: vk::ImageAspectFlags::COLOR,
                granularity: vk::Extent3D {
                    width: 128,
                    height: 128,
                    depth: 1,
                },
                page_size: 64 * 1024,
                alignment: 64 * 1024,
                memory_size: 64 << 20,
                mip_tail_first_lod: 4,
                mip_tail_size: 64 * 1024,
                mip_tail_offset: 60 << 20,
                mip_tail_stride: 0,
                single_mip_tail: true,
            },
        }
    }

    pub fn with_queue_families(mut self, families: QueueFamilies) -> Self {
        self.families = families;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_sparse_requirements(mut self, reqs: SparseImageRequirements) -> Self {
        self.sparse = reqs;
        self
    }

    /// When off, `wait_timeline` times out until [`complete`](Self::complete)
    /// reaches the waited value.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    /// Mark `queue`'s work up to `value` as finished.
    pub fn complete(&self, queue: QueueType, value: u64) {
        let mut done = self.completed.entry(queue).or_insert(0);
        *done = (*done).max(value);
    }

    pub fn complete_all(&self) {
        for entry in self.signaled.iter() {
            self.complete(*entry.key(), *entry.value());
        }
    }

    /// Let `point` succeed `successes` more times, then fail once with
    /// `error`.
    pub fn fail_after(&self, point: FailPoint, successes: usize, error: DriverError) {
        self.failures.insert(point, (successes, error));
    }

    /// Run `hook` inside every `create_graphics_pipeline`, before the
    /// pipeline is handed back.
    pub fn on_create_pipeline(
        &self,
        hook: impl Fn(&GraphicsPipelineDesc) + Send + Sync + 'static,
    ) {
        *self.pipeline_hook.lock() = Some(Arc::new(hook));
    }

    fn check(&self, point: FailPoint) -> DriverResult<()> {
        let error = match self.failures.get_mut(&point) {
            Some(mut entry) if entry.0 > 0 => {
                entry.0 -= 1;
                return Ok(());
            }
            Some(entry) => entry.1.clone(),
            None => return Ok(()),
        };
        self.failures.remove(&point);
        Err(error)
    }

    fn log(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| pred(call)).count()
    }

    pub fn pipelines_created(&self) -> usize {
        self.count(|call| matches!(call, DriverCall::CreatePipeline { .. }))
    }

    pub fn destroyed(&self) -> Vec<DriverHandle> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Destroy(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    /// How many times `handle` has been destroyed.
    pub fn destroy_count(&self, handle: DriverHandle) -> usize {
        self.count(|call| *call == DriverCall::Destroy(handle))
    }

    pub fn freed_memory(&self) -> Vec<GpuAlloc> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::FreeMemory(alloc) => Some(*alloc),
                _ => None,
            })
            .collect()
    }

    /// The last command stream recorded into `cmd`.
    pub fn recording(&self, cmd: DriverHandle) -> Option<Vec<RecordedCommand>> {
        self.recordings.get(&cmd).map(|r| r.value().clone())
    }

    /// A fresh handle of `kind`, as if some other subsystem created it.
    pub fn create_handle(&self, kind: ResourceKind) -> DriverHandle {
        self.handles.alloc(kind)
    }
}

impl Driver for CaptureDriver {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn device_limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_command_buffer(
        &self,
        queue: QueueType,
        pool: CommandPoolFlags,
        level: CommandBufferLevel,
    ) -> DriverResult<DriverHandle> {
        let handle = self.handles.alloc(ResourceKind::CommandBuffer);
        self.log(DriverCall::CreateCommandBuffer {
            handle,
            queue,
            pool,
            level,
        });
        Ok(handle)
    }

    fn record(
        &self,
        cmd: DriverHandle,
        usage: CommandBufferUsage,
        commands: &[RecordedCommand],
    ) -> DriverResult<()> {
        self.recordings.insert(cmd, commands.to_vec());
        self.log(DriverCall::Record {
            cmd,
            usage,
            commands: commands.len(),
        });
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: DriverHandle, release: bool) -> DriverResult<()> {
        self.recordings.remove(&cmd);
        self.log(DriverCall::ResetCommandBuffer { cmd, release });
        Ok(())
    }

    fn submit(&self, info: &SubmitInfo<'_>) -> DriverResult<u64> {
        let value = {
            let mut signaled = self.signaled.entry(info.queue).or_insert(0);
            *signaled += 1;
            *signaled
        };
        self.log(DriverCall::Submit {
            queue: info.queue,
            command_buffers: info.command_buffers.to_vec(),
            value,
        });
        Ok(value)
    }

    fn timeline_value(&self, queue: QueueType) -> DriverResult<u64> {
        Ok(self.completed.get(&queue).map(|v| *v.value()).unwrap_or(0))
    }

    fn wait_timeline(&self, queue: QueueType, value: u64, _timeout: Duration) -> DriverResult<bool> {
        if self.timeline_value(queue)? >= value {
            return Ok(true);
        }
        if self.auto_complete.load(Ordering::SeqCst) {
            self.complete(queue, value);
            return Ok(true);
        }
        Ok(false)
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> DriverResult<DriverHandle> {
        self.check(FailPoint::CreatePipeline)?;
        let hook = self.pipeline_hook.lock().clone();
        if let Some(hook) = hook {
            hook(desc);
        }
        let handle = self.handles.alloc(ResourceKind::Pipeline);
        self.log(DriverCall::CreatePipeline {
            handle,
            program: desc.program.id,
            subpass: desc.subpass,
            color_attachments: desc.color_attachment_count,
            topology: desc.input_assembly.topology,
        });
        Ok(handle)
    }

    fn create_event(&self) -> DriverResult<DriverHandle> {
        let handle = self.handles.alloc(ResourceKind::Event);
        self.log(DriverCall::CreateEvent(handle));
        Ok(handle)
    }

    fn create_sparse_image(&self, _desc: &SparseImageDesc) -> DriverResult<DriverHandle> {
        self.check(FailPoint::CreateSparseImage)?;
        let handle = self.handles.alloc(ResourceKind::Image);
        self.log(DriverCall::CreateSparseImage(handle));
        Ok(handle)
    }

    fn sparse_requirements(&self, _image: DriverHandle) -> DriverResult<SparseImageRequirements> {
        self.check(FailPoint::SparseRequirements)?;
        Ok(self.sparse)
    }

    fn bind_sparse(&self, info: &SparseBindInfo<'_>) -> DriverResult<()> {
        self.check(FailPoint::BindSparse)?;
        self.log(DriverCall::BindSparse {
            image: info.image,
            pages: info.page_binds.to_vec(),
            opaque: info.opaque_binds.to_vec(),
        });
        Ok(())
    }

    fn allocate_memory(&self, size: u64, _alignment: u64) -> DriverResult<GpuAlloc> {
        self.check(FailPoint::AllocateMemory)?;
        let alloc = GpuAlloc {
            memory: self.handles.alloc(ResourceKind::Memory),
            offset: 0,
            size,
        };
        self.log(DriverCall::AllocateMemory(alloc));
        Ok(alloc)
    }

    fn free_memory(&self, alloc: GpuAlloc) {
        self.log(DriverCall::FreeMemory(alloc));
    }

    fn destroy(&self, handle: DriverHandle) {
        self.recordings.remove(&handle);
        self.log(DriverCall::Destroy(handle));
    }

    fn wait_idle(&self) -> DriverResult<()> {
        self.complete_all();
        self.log(DriverCall::WaitIdle);
        Ok(())
    }
}
