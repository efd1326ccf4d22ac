//! The seam between the engine and a native graphics API.
//!
//! Everything above this trait is pure bookkeeping: barrier translation,
//! pipeline caching, deferred frees, page tables. Everything below it talks
//! to a device. [`VulkanDriver`](crate::vulkan::VulkanDriver) is the real
//! implementation; [`CaptureDriver`](crate::capture::CaptureDriver) records
//! calls in memory for headless tests.

use std::time::Duration;

use ash::vk;
use bitflags::bitflags;
use cgfx_core::DriverHandle;

use crate::commands::RecordedCommand;
use crate::error::DriverResult;
use crate::pipeline::GraphicsPipelineDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
    Sparse,
}

impl QueueType {
    pub const ALL: [QueueType; 4] = [
        QueueType::Graphics,
        QueueType::Compute,
        QueueType::Transfer,
        QueueType::Sparse,
    ];
}

/// Queue family index for each logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    pub sparse: u32,
}

impl QueueFamilies {
    /// Every logical queue served by one family.
    pub const fn unified(family: u32) -> Self {
        Self {
            graphics: family,
            compute: family,
            transfer: family,
            sparse: family,
        }
    }

    pub fn family(&self, queue: QueueType) -> u32 {
        match queue {
            QueueType::Graphics => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
            QueueType::Sparse => self.sparse,
        }
    }

    /// Source and destination family indices for an ownership transfer.
    /// Queues sharing a family need no transfer.
    pub fn transfer_indices(&self, from: QueueType, to: QueueType) -> (u32, u32) {
        let (src, dst) = (self.family(from), self.family(to));
        if src == dst {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (src, dst)
        }
    }
}

bitflags! {
    /// Properties of the pool a command buffer is allocated from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandPoolFlags: u32 {
        const RESETTABLE = 1 << 0;
        const TRANSIENT = 1 << 1;
    }
}

bitflags! {
    /// Options given when recording begins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandBufferUsage: u32 {
        const SUBMIT_ONCE = 1 << 0;
        const SUBMIT_DURING_PASS = 1 << 1;
        const RESUBMITTABLE = 1 << 2;
    }
}

impl CommandBufferUsage {
    pub fn to_vk(self) -> vk::CommandBufferUsageFlags {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if self.contains(Self::SUBMIT_ONCE) {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if self.contains(Self::SUBMIT_DURING_PASS) {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        if self.contains(Self::RESUBMITTABLE) {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

/// A block of device memory handed out by [`Driver::allocate_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuAlloc {
    pub memory: DriverHandle,
    pub offset: u64,
    pub size: u64,
}

/// Wait for `queue`'s timeline to reach `value` before executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineWait {
    pub queue: QueueType,
    pub value: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    pub queue: QueueType,
    pub command_buffers: &'a [DriverHandle],
    pub waits: &'a [TimelineWait],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mips: u32,
    pub layers: u32,
    pub usage: vk::ImageUsageFlags,
}

/// Sparse memory layout reported for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseImageRequirements {
    pub aspect: vk::ImageAspectFlags,
    /// Page extent in texels
    pub granularity: vk::Extent3D,
    /// Size in bytes of one page
    pub page_size: u64,
    pub alignment: u64,
    /// Total size of the image's virtual memory footprint
    pub memory_size: u64,
    pub mip_tail_first_lod: u32,
    pub mip_tail_size: u64,
    pub mip_tail_offset: u64,
    pub mip_tail_stride: u64,
    /// One mip tail shared by all layers
    pub single_mip_tail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub sparse_address_space_size: u64,
    pub timestamp_period: f32,
}

/// Bind (or unbind, with `memory == None`) one page of a sparse image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparsePageBind {
    pub aspect: vk::ImageAspectFlags,
    pub mip: u32,
    pub layer: u32,
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub memory: Option<GpuAlloc>,
}

/// Bind a byte range of the image's opaque (mip tail) region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseOpaqueBind {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: Option<GpuAlloc>,
}

#[derive(Debug, Clone, Copy)]
pub struct SparseBindInfo<'a> {
    pub image: DriverHandle,
    pub page_binds: &'a [SparsePageBind],
    pub opaque_binds: &'a [SparseOpaqueBind],
}

pub trait Driver: Send + Sync {
    fn queue_families(&self) -> QueueFamilies;

    fn device_limits(&self) -> DeviceLimits;

    fn create_command_buffer(
        &self,
        queue: QueueType,
        pool: CommandPoolFlags,
        level: CommandBufferLevel,
    ) -> DriverResult<DriverHandle>;

    /// Begin `cmd`, replay `commands` into it and end it.
    fn record(
        &self,
        cmd: DriverHandle,
        usage: CommandBufferUsage,
        commands: &[RecordedCommand],
    ) -> DriverResult<()>;

    fn reset_command_buffer(&self, cmd: DriverHandle, release: bool) -> DriverResult<()>;

    /// Submit and return the timeline value signaled on completion.
    fn submit(&self, info: &SubmitInfo<'_>) -> DriverResult<u64>;

    /// Last timeline value the GPU has completed on `queue`.
    fn timeline_value(&self, queue: QueueType) -> DriverResult<u64>;

    /// Block until `queue` reaches `value`. Returns `false` on timeout.
    fn wait_timeline(&self, queue: QueueType, value: u64, timeout: Duration)
        -> DriverResult<bool>;

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> DriverResult<DriverHandle>;

    fn create_event(&self) -> DriverResult<DriverHandle>;

    fn create_sparse_image(&self, desc: &SparseImageDesc) -> DriverResult<DriverHandle>;

    fn sparse_requirements(&self, image: DriverHandle) -> DriverResult<SparseImageRequirements>;

    fn bind_sparse(&self, info: &SparseBindInfo<'_>) -> DriverResult<()>;

    fn allocate_memory(&self, size: u64, alignment: u64) -> DriverResult<GpuAlloc>;

    fn free_memory(&self, alloc: GpuAlloc);

    /// Destroy any object the driver handed out, by kind.
    fn destroy(&self, handle: DriverHandle);

    fn wait_idle(&self) -> DriverResult<()>;
}
