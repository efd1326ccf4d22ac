//! [`Driver`] implementation over `ash`.
//!
//! Requires Vulkan 1.3 (synchronization2 and timeline semaphores). Each
//! logical queue gets its own timeline semaphore; submission values are
//! issued from a per-queue counter. Engine handles map to native objects
//! through one `DashMap` keyed by handle id.

mod convert;
mod replay;

use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use cgfx_core::{DriverHandle, HandleAllocator, ResourceKind};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::commands::RecordedCommand;
use crate::driver::{
    CommandBufferLevel, CommandBufferUsage, CommandPoolFlags, DeviceLimits, Driver, GpuAlloc,
    QueueFamilies, QueueType, SparseBindInfo, SparseImageDesc, SparseImageRequirements,
    SubmitInfo,
};
use crate::error::{DriverError, DriverResult};
use crate::pipeline::GraphicsPipelineDesc;

/// A device queue and the family it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    pub family: u32,
    pub queue: vk::Queue,
}

/// Queues the driver submits to. Several entries may name the same queue.
#[derive(Debug, Clone, Copy)]
pub struct VulkanQueues {
    pub graphics: QueueInfo,
    pub compute: QueueInfo,
    pub transfer: QueueInfo,
    pub sparse: QueueInfo,
}

impl VulkanQueues {
    fn get(&self, queue: QueueType) -> QueueInfo {
        match queue {
            QueueType::Graphics => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
            QueueType::Sparse => self.sparse,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VulkanDriverOptions {
    /// `VK_EXT_debug_utils` is enabled on the instance
    pub debug_utils: bool,
    /// Attach names to command buffers and pipelines
    pub object_names: bool,
}

struct Timeline {
    queue: vk::Queue,
    semaphore: vk::Semaphore,
    /// Last value handed out; guards the queue, which Vulkan requires to be
    /// externally synchronized
    next: Mutex<u64>,
}

#[derive(Clone, Copy)]
struct NativeCommandBuffer {
    raw: vk::CommandBuffer,
    pool: (QueueType, CommandPoolFlags),
    level: CommandBufferLevel,
}

pub struct VulkanDriver {
    device: ash::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    object_names: bool,
    handles: HandleAllocator,
    families: QueueFamilies,
    limits: DeviceLimits,
    memory_type: u32,
    timelines: HashMap<QueueType, Timeline>,
    pools: DashMap<(QueueType, CommandPoolFlags), Mutex<vk::CommandPool>>,
    command_buffers: DashMap<u64, NativeCommandBuffer>,
    query_pools: DashMap<u64, (vk::QueryPool, u32)>,
    /// Every other object, as the raw native handle
    objects: DashMap<u64, u64>,
}

impl VulkanDriver {
    /// Wrap an existing device. The driver owns the pools, semaphores and
    /// objects it creates but never destroys the device itself.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queues: VulkanQueues,
        options: VulkanDriverOptions,
    ) -> DriverResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory_type = memory.memory_types[..memory.memory_type_count as usize]
            .iter()
            .position(|ty| {
                ty.property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .ok_or_else(|| DriverError::Unsupported("no device-local memory type".into()))?
            as u32;

        let mut timelines = HashMap::new();
        for queue in QueueType::ALL {
            let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
            let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
            timelines.insert(
                queue,
                Timeline {
                    queue: queues.get(queue).queue,
                    semaphore,
                    next: Mutex::new(0),
                },
            );
        }

        let debug_utils = options
            .debug_utils
            .then(|| ash::ext::debug_utils::Device::new(instance, &device));

        let name = unsafe { std::ffi::CStr::from_ptr(properties.device_name.as_ptr()) };
        info!(
            device = %name.to_string_lossy(),
            api = %format!(
                "{}.{}.{}",
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version),
                vk::api_version_patch(properties.api_version)
            ),
            "vulkan driver created"
        );

        Ok(Self {
            device,
            object_names: options.object_names && debug_utils.is_some(),
            debug_utils,
            handles: HandleAllocator::new(),
            families: QueueFamilies {
                graphics: queues.graphics.family,
                compute: queues.compute.family,
                transfer: queues.transfer.family,
                sparse: queues.sparse.family,
            },
            limits: DeviceLimits {
                sparse_address_space_size: properties.limits.sparse_address_space_size,
                timestamp_period: properties.limits.timestamp_period,
            },
            memory_type,
            timelines,
            pools: DashMap::new(),
            command_buffers: DashMap::new(),
            query_pools: DashMap::new(),
            objects: DashMap::new(),
        })
    }

    /// Register a native object created elsewhere (buffers, images, passes,
    /// layouts) so it can be referenced from recorded commands.
    pub fn import<T: Handle>(&self, kind: ResourceKind, object: T) -> DriverHandle {
        let handle = self.handles.alloc(kind);
        self.objects.insert(handle.raw, object.as_raw());
        handle
    }

    /// Drop a registration without destroying the native object.
    pub fn forget(&self, handle: DriverHandle) {
        self.objects.remove(&handle.raw);
    }

    pub(crate) fn resolve<T: Handle>(&self, handle: DriverHandle) -> Option<T> {
        if handle.is_null() {
            return None;
        }
        self.objects.get(&handle.raw).map(|raw| T::from_raw(*raw.value()))
    }

    fn timeline(&self, queue: QueueType) -> &Timeline {
        &self.timelines[&queue]
    }

    fn pool(&self, queue: QueueType, flags: CommandPoolFlags) -> DriverResult<vk::CommandPool> {
        if let Some(pool) = self.pools.get(&(queue, flags)) {
            return Ok(*pool.lock());
        }
        let mut create_flags = vk::CommandPoolCreateFlags::empty();
        if flags.contains(CommandPoolFlags::RESETTABLE) {
            create_flags |= vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        }
        if flags.contains(CommandPoolFlags::TRANSIENT) {
            create_flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.families.family(queue))
            .flags(create_flags);
        let created = unsafe { self.device.create_command_pool(&info, None)? };
        let pool = *self
            .pools
            .entry((queue, flags))
            .or_insert_with(|| Mutex::new(created))
            .lock();
        if pool != created {
            unsafe { self.device.destroy_command_pool(created, None) };
        }
        debug!(?queue, ?flags, "command pool created");
        Ok(pool)
    }

    fn set_name(&self, object_type: vk::ObjectType, raw: u64, name: &str) {
        let (Some(debug_utils), true) = (&self.debug_utils, self.object_names) else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: raw,
            p_object_name: name.as_ptr(),
            ..Default::default()
        };
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            warn!("failed to name object: {:?}", e);
        }
    }

    /// Query pool sized for `count` timestamps of one command buffer.
    fn timestamp_pool(&self, cmd: DriverHandle, count: u32) -> DriverResult<vk::QueryPool> {
        if let Some(entry) = self.query_pools.get(&cmd.raw) {
            let (pool, capacity) = *entry.value();
            if capacity >= count {
                return Ok(pool);
            }
        }
        if let Some((_, (old, _))) = self.query_pools.remove(&cmd.raw) {
            unsafe { self.device.destroy_query_pool(old, None) };
        }
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        let pool = unsafe { self.device.create_query_pool(&info, None)? };
        self.query_pools.insert(cmd.raw, (pool, count));
        Ok(pool)
    }

    /// Timestamps written by the last submission of `cmd`, in ticks.
    pub fn read_timestamps(&self, cmd: DriverHandle) -> DriverResult<Vec<u64>> {
        let Some(entry) = self.query_pools.get(&cmd.raw) else {
            return Ok(Vec::new());
        };
        let (pool, count) = *entry.value();
        let mut data = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                pool,
                0,
                &mut data,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?
        };
        Ok(data)
    }
}

impl Driver for VulkanDriver {
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
        let raw_pool = self.pool(queue, pool)?;
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw_pool)
            .level(match level {
                CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
                CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
            })
            .command_buffer_count(1);
        let raw = {
            let guard = self.pools.get(&(queue, pool));
            let _lock = guard.as_ref().map(|entry| entry.lock());
            unsafe { self.device.allocate_command_buffers(&info)? }
        };
        let raw = raw
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Driver {
                code: vk::Result::ERROR_UNKNOWN.as_raw(),
                message: "no command buffer allocated".into(),
            })?;
        let handle = self.handles.alloc(ResourceKind::CommandBuffer);
        self.command_buffers.insert(
            handle.raw,
            NativeCommandBuffer {
                raw,
                pool: (queue, pool),
                level,
            },
        );
        self.set_name(
            vk::ObjectType::COMMAND_BUFFER,
            raw.as_raw(),
            &format!("{:?} cmd {}", queue, handle.raw),
        );
        Ok(handle)
    }

    fn record(
        &self,
        cmd: DriverHandle,
        usage: CommandBufferUsage,
        commands: &[RecordedCommand],
    ) -> DriverResult<()> {
        let native = self
            .command_buffers
            .get(&cmd.raw)
            .map(|entry| *entry.value())
            .ok_or_else(|| DriverError::Driver {
                code: vk::Result::ERROR_UNKNOWN.as_raw(),
                message: format!("invalid command buffer handle {}", cmd.raw),
            })?;

        let timestamps = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::WriteTimestamp { .. }))
            .count() as u32;
        let query_pool = if timestamps > 0 {
            self.timestamp_pool(cmd, timestamps)?
        } else {
            vk::QueryPool::null()
        };

        let pool = self.pools.get(&native.pool);
        let _lock = pool.as_ref().map(|entry| entry.lock());

        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info = vk::CommandBufferBeginInfo::default().flags(usage.to_vk());
        if native.level == CommandBufferLevel::Secondary {
            begin_info = begin_info.inheritance_info(&inheritance);
        }
        unsafe { self.device.begin_command_buffer(native.raw, &begin_info)? };
        if timestamps > 0 {
            unsafe {
                self.device
                    .cmd_reset_query_pool(native.raw, query_pool, 0, timestamps)
            };
        }
        self.replay(native.raw, query_pool, commands);
        unsafe { self.device.end_command_buffer(native.raw)? };
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: DriverHandle, release: bool) -> DriverResult<()> {
        let Some(native) = self.command_buffers.get(&cmd.raw).map(|e| *e.value()) else {
            return Ok(());
        };
        let flags = if release {
            vk::CommandBufferResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandBufferResetFlags::empty()
        };
        let pool = self.pools.get(&native.pool);
        let _lock = pool.as_ref().map(|entry| entry.lock());
        unsafe { self.device.reset_command_buffer(native.raw, flags)? };
        Ok(())
    }

    fn submit(&self, info: &SubmitInfo<'_>) -> DriverResult<u64> {
        let command_buffers: Vec<vk::CommandBufferSubmitInfo> = info
            .command_buffers
            .iter()
            .filter_map(|cmd| self.command_buffers.get(&cmd.raw).map(|e| e.value().raw))
            .map(|raw| vk::CommandBufferSubmitInfo::default().command_buffer(raw))
            .collect();
        let waits: Vec<vk::SemaphoreSubmitInfo> = info
            .waits
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.timeline(wait.queue).semaphore)
                    .value(wait.value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();

        let timeline = self.timeline(info.queue);
        let mut next = timeline.next.lock();
        let value = *next + 1;
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(timeline.semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.device
                .queue_submit2(timeline.queue, &[submit], vk::Fence::null())?
        };
        *next = value;
        Ok(value)
    }

    fn timeline_value(&self, queue: QueueType) -> DriverResult<u64> {
        let semaphore = self.timeline(queue).semaphore;
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn wait_timeline(&self, queue: QueueType, value: u64, timeout: Duration) -> DriverResult<bool> {
        let semaphores = [self.timeline(queue).semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_semaphores(&info, timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> DriverResult<DriverHandle> {
        let program = &desc.program;
        let entry_points: Vec<CString> = program
            .stages
            .iter()
            .map(|stage| CString::new(stage.entry_point.as_str()))
            .collect::<Result<_, _>>()
            .map_err(|e| DriverError::Unsupported(format!("invalid entry point: {}", e)))?;
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = program
            .stages
            .iter()
            .zip(&entry_points)
            .filter_map(|(stage, name)| {
                let module = self.resolve::<vk::ShaderModule>(stage.module)?;
                Some(
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(stage.stage)
                        .module(module)
                        .name(name),
                )
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_layout.bindings)
            .vertex_attribute_descriptions(&desc.vertex_layout.attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.input_assembly.topology)
            .primitive_restart_enable(desc.input_assembly.primitive_restart);
        let viewport_count = desc.pass.viewports.len().max(1) as u32;
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(viewport_count)
            .scissor_count(desc.pass.scissors.len().max(1) as u32);

        let raster = &program.raster;
        let mut rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(raster.polygon_mode)
            .cull_mode(raster.cull_mode)
            .front_face(raster.front_face)
            .depth_clamp_enable(raster.depth_clamp)
            .line_width(raster.line_width);
        if let Some((constant, clamp, slope)) = raster.depth_bias {
            rasterization = rasterization
                .depth_bias_enable(true)
                .depth_bias_constant_factor(constant)
                .depth_bias_clamp(clamp)
                .depth_bias_slope_factor(slope);
        }
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(program.samples);
        let ds = &program.depth_stencil;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            depth_test_enable: convert::bool32(ds.depth_test),
            depth_write_enable: convert::bool32(ds.depth_write),
            depth_compare_op: ds.compare_op,
            stencil_test_enable: convert::bool32(ds.stencil_test),
            front: ds.front,
            back: ds.back,
            max_depth_bounds: 1.0,
            ..Default::default()
        };
        let attachments = desc.blend_attachments();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let layout = self
            .resolve::<vk::PipelineLayout>(desc.program.layout)
            .ok_or_else(|| DriverError::Unsupported(format!("program '{}' has no layout", program.name)))?;
        let render_pass = self
            .resolve::<vk::RenderPass>(desc.pass.render_pass)
            .ok_or_else(|| DriverError::Unsupported(format!("pass '{}' has no render pass", desc.pass.name)))?;

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(desc.subpass);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| DriverError::from(e))?
        };
        let Some(pipeline) = pipelines.into_iter().next() else {
            return Err(DriverError::Unsupported("no pipeline returned".into()));
        };
        self.set_name(
            vk::ObjectType::PIPELINE,
            pipeline.as_raw(),
            &format!("{}/{}", desc.pass.name, program.name),
        );
        Ok(self.import(ResourceKind::Pipeline, pipeline))
    }

    fn create_event(&self) -> DriverResult<DriverHandle> {
        let event = unsafe {
            self.device
                .create_event(&vk::EventCreateInfo::default(), None)?
        };
        Ok(self.import(ResourceKind::Event, event))
    }

    fn create_sparse_image(&self, desc: &SparseImageDesc) -> DriverResult<DriverHandle> {
        let info = vk::ImageCreateInfo::default()
            .flags(vk::ImageCreateFlags::SPARSE_BINDING | vk::ImageCreateFlags::SPARSE_RESIDENCY)
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mips)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        Ok(self.import(ResourceKind::Image, image))
    }

    fn sparse_requirements(&self, image: DriverHandle) -> DriverResult<SparseImageRequirements> {
        let raw = self
            .resolve::<vk::Image>(image)
            .ok_or_else(|| DriverError::Unsupported(format!("unknown image {}", image.raw)))?;
        let memory = unsafe { self.device.get_image_memory_requirements(raw) };
        let sparse = unsafe { self.device.get_image_sparse_memory_requirements(raw) };
        let Some(color) = sparse
            .iter()
            .find(|req| {
                req.format_properties
                    .aspect_mask
                    .contains(vk::ImageAspectFlags::COLOR)
            })
            .or_else(|| sparse.first())
        else {
            return Err(DriverError::Unsupported(
                "image has no sparse memory requirements".into(),
            ));
        };
        Ok(SparseImageRequirements {
            aspect: color.format_properties.aspect_mask,
            granularity: color.format_properties.image_granularity,
            page_size: memory.alignment,
            alignment: memory.alignment,
            memory_size: memory.size,
            mip_tail_first_lod: color.image_mip_tail_first_lod,
            mip_tail_size: color.image_mip_tail_size,
            mip_tail_offset: color.image_mip_tail_offset,
            mip_tail_stride: color.image_mip_tail_stride,
            single_mip_tail: color
                .format_properties
                .flags
                .contains(vk::SparseImageFormatFlags::SINGLE_MIPTAIL),
        })
    }

    fn bind_sparse(&self, info: &SparseBindInfo<'_>) -> DriverResult<()> {
        let image = self
            .resolve::<vk::Image>(info.image)
            .ok_or_else(|| DriverError::Unsupported(format!("unknown image {}", info.image.raw)))?;
        let memory_of = |alloc: Option<GpuAlloc>| sparse_memory(&self.objects, alloc);

        let page_binds = info
            .page_binds
            .iter()
            .map(|bind| {
                let (memory, memory_offset) = memory_of(bind.memory)?;
                Ok(vk::SparseImageMemoryBind {
                    subresource: vk::ImageSubresource {
                        aspect_mask: bind.aspect,
                        mip_level: bind.mip,
                        array_layer: bind.layer,
                    },
                    offset: bind.offset,
                    extent: bind.extent,
                    memory,
                    memory_offset,
                    flags: vk::SparseMemoryBindFlags::empty(),
                })
            })
            .collect::<DriverResult<Vec<_>>>()?;
        let opaque_binds = info
            .opaque_binds
            .iter()
            .map(|bind| {
                let (memory, memory_offset) = memory_of(bind.memory)?;
                Ok(vk::SparseMemoryBind {
                    resource_offset: bind.resource_offset,
                    size: bind.size,
                    memory,
                    memory_offset,
                    flags: vk::SparseMemoryBindFlags::empty(),
                })
            })
            .collect::<DriverResult<Vec<_>>>()?;

        let image_binds = [vk::SparseImageMemoryBindInfo::default()
            .image(image)
            .binds(&page_binds)];
        let image_opaque_binds = [vk::SparseImageOpaqueMemoryBindInfo::default()
            .image(image)
            .binds(&opaque_binds)];

        let timeline = self.timeline(QueueType::Sparse);
        let mut next = timeline.next.lock();
        let value = *next + 1;
        let signal_semaphores = [timeline.semaphore];
        let signal_values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .signal_semaphore_values(&signal_values);
        let mut bind_info = vk::BindSparseInfo::default()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);
        if !page_binds.is_empty() {
            bind_info = bind_info.image_binds(&image_binds);
        }
        if !opaque_binds.is_empty() {
            bind_info = bind_info.image_opaque_binds(&image_opaque_binds);
        }
        unsafe {
            self.device
                .queue_bind_sparse(timeline.queue, &[bind_info], vk::Fence::null())?
        };
        *next = value;
        Ok(())
    }

    fn allocate_memory(&self, size: u64, _alignment: u64) -> DriverResult<GpuAlloc> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(self.memory_type);
        let memory = unsafe { self.device.allocate_memory(&info, None)? };
        Ok(GpuAlloc {
            memory: self.import(ResourceKind::Memory, memory),
            offset: 0,
            size,
        })
    }

    fn free_memory(&self, alloc: GpuAlloc) {
        self.destroy(alloc.memory);
    }

    fn destroy(&self, handle: DriverHandle) {
        if handle.kind == ResourceKind::CommandBuffer {
            if let Some((_, native)) = self.command_buffers.remove(&handle.raw) {
                if let Some(pool) = self.pools.get(&native.pool) {
                    let pool = pool.lock();
                    unsafe { self.device.free_command_buffers(*pool, &[native.raw]) };
                }
            }
            if let Some((_, (pool, _))) = self.query_pools.remove(&handle.raw) {
                unsafe { self.device.destroy_query_pool(pool, None) };
            }
            return;
        }

        let Some((_, raw)) = self.objects.remove(&handle.raw) else {
            warn!(?handle, "destroy of unknown handle");
            return;
        };
        let device = &self.device;
        unsafe {
            match handle.kind {
                ResourceKind::Buffer => device.destroy_buffer(vk::Buffer::from_raw(raw), None),
                ResourceKind::Image => device.destroy_image(vk::Image::from_raw(raw), None),
                ResourceKind::ImageView => {
                    device.destroy_image_view(vk::ImageView::from_raw(raw), None)
                }
                ResourceKind::Pipeline => {
                    device.destroy_pipeline(vk::Pipeline::from_raw(raw), None)
                }
                ResourceKind::PipelineLayout => {
                    device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(raw), None)
                }
                ResourceKind::RenderPass => {
                    device.destroy_render_pass(vk::RenderPass::from_raw(raw), None)
                }
                ResourceKind::Framebuffer => {
                    device.destroy_framebuffer(vk::Framebuffer::from_raw(raw), None)
                }
                ResourceKind::ShaderModule => {
                    device.destroy_shader_module(vk::ShaderModule::from_raw(raw), None)
                }
                ResourceKind::Event => device.destroy_event(vk::Event::from_raw(raw), None),
                ResourceKind::Memory => device.free_memory(vk::DeviceMemory::from_raw(raw), None),
                ResourceKind::QueryPool => {
                    device.destroy_query_pool(vk::QueryPool::from_raw(raw), None)
                }
                ResourceKind::Semaphore => {
                    device.destroy_semaphore(vk::Semaphore::from_raw(raw), None)
                }
                // Descriptor sets belong to their pool.
                ResourceKind::DescriptorSet | ResourceKind::CommandBuffer | ResourceKind::None => {}
            }
        }
    }

    fn wait_idle(&self) -> DriverResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

/// Native memory and offset for one sparse bind; `None` unbinds. An
/// allocation this driver does not know is an error, never an unbind.
fn sparse_memory(
    objects: &DashMap<u64, u64>,
    alloc: Option<GpuAlloc>,
) -> DriverResult<(vk::DeviceMemory, u64)> {
    let Some(alloc) = alloc else {
        return Ok((vk::DeviceMemory::null(), 0));
    };
    match objects.get(&alloc.memory.raw) {
        Some(raw) if !alloc.memory.is_null() => {
            Ok((vk::DeviceMemory::from_raw(*raw.value()), alloc.offset))
        }
        _ => Err(DriverError::Unsupported(format!(
            "unknown memory {}",
            alloc.memory.raw
        ))),
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during driver teardown: {:?}", e);
            }
            for entry in self.query_pools.iter() {
                self.device.destroy_query_pool(entry.value().0, None);
            }
            for entry in self.pools.iter() {
                self.device.destroy_command_pool(*entry.value().lock(), None);
            }
            for timeline in self.timelines.values() {
                self.device.destroy_semaphore(timeline.semaphore, None);
            }
        }
        debug!("vulkan driver destroyed");
    }
}
