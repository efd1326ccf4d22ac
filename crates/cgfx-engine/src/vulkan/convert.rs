use ash::vk;
use cgfx_core::DriverHandle;

use crate::barrier::BarrierInfo;
use crate::driver::QueueFamilies;

/// A [`BarrierInfo`] resolved to native stage masks and memory barriers.
pub(super) struct NativeBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dependency_flags: vk::DependencyFlags,
    pub images: Vec<vk::ImageMemoryBarrier<'static>>,
    pub buffers: Vec<vk::BufferMemoryBarrier<'static>>,
}

/// Translate a barrier. Subresources whose handles do not resolve are
/// skipped, matching how unknown handles are treated during replay.
pub(super) fn barrier(
    info: &BarrierInfo,
    families: &QueueFamilies,
    image: impl Fn(DriverHandle) -> Option<vk::Image>,
    buffer: impl Fn(DriverHandle) -> Option<vk::Buffer>,
) -> NativeBarrier {
    let (src_family, dst_family) = families.transfer_indices(info.from_queue, info.to_queue);
    let src_access = info.from_stage.access_flags();
    let dst_access = info.to_stage.access_flags();

    let images = info
        .textures
        .iter()
        .filter_map(|texture| {
            let raw = image(texture.texture)?;
            Some(
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(info.from_stage.image_layout())
                    .new_layout(info.to_stage.image_layout())
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .image(raw)
                    .subresource_range(texture.subresource.to_vk()),
            )
        })
        .collect();

    let buffers = info
        .buffers
        .iter()
        .filter_map(|b| {
            let raw = buffer(b.buffer)?;
            Some(
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .buffer(raw)
                    .offset(b.subresource.offset)
                    .size(b.subresource.size),
            )
        })
        .collect();

    NativeBarrier {
        src_stage: info.from_stage.stage_flags(),
        dst_stage: info.to_stage.stage_flags(),
        dependency_flags: info.domain.dependency_flags(),
        images,
        buffers,
    }
}

pub(super) fn bool32(value: bool) -> vk::Bool32 {
    if value {
        vk::TRUE
    } else {
        vk::FALSE
    }
}

/// Debug label for a profiling marker.
pub(super) fn label<'a>(name: &'a std::ffi::CStr, color: [f32; 4]) -> vk::DebugUtilsLabelEXT<'a> {
    vk::DebugUtilsLabelEXT::default().label_name(name).color(color)
}
