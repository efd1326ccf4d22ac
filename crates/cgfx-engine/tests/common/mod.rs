//! Fixtures shared by the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ash::vk;
use cgfx_core::ResourceKind;
use cgfx_engine::capture::CaptureDriver;
use cgfx_engine::command::{CommandBuffer, CommandBufferCreateInfo, CommandBufferPoolInfo};
use cgfx_engine::driver::QueueType;
use cgfx_engine::pipeline::{
    DepthStencilState, PassId, PassInfo, RasterState, ShaderProgramId, ShaderProgramInfo,
    VertexLayoutId, VertexLayoutInfo,
};

pub fn init_logging() {
    let _ = cgfx_common::logging::try_init_logging();
}

pub fn driver() -> Arc<CaptureDriver> {
    init_logging();
    Arc::new(CaptureDriver::new())
}

pub fn pass(driver: &CaptureDriver, id: u64, subpasses: &[u32]) -> Arc<PassInfo> {
    Arc::new(PassInfo {
        id: PassId(id),
        name: format!("pass{}", id),
        render_pass: driver.create_handle(ResourceKind::RenderPass),
        framebuffer: driver.create_handle(ResourceKind::Framebuffer),
        render_area: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
        },
        clear_values: Vec::new(),
        subpass_attachment_counts: subpasses.to_vec(),
        viewports: vec![vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: 1280.0,
            height: 720.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }],
        scissors: Vec::new(),
    })
}

pub fn program(driver: &CaptureDriver, id: u64) -> Arc<ShaderProgramInfo> {
    Arc::new(ShaderProgramInfo {
        id: ShaderProgramId(id),
        name: format!("program{}", id),
        layout: driver.create_handle(ResourceKind::PipelineLayout),
        stages: Vec::new(),
        raster: RasterState::default(),
        samples: vk::SampleCountFlags::TYPE_1,
        depth_stencil: DepthStencilState::default(),
        blend: Vec::new(),
    })
}

pub fn vertex_layout(id: u64) -> Arc<VertexLayoutInfo> {
    Arc::new(VertexLayoutInfo {
        id: VertexLayoutId(id),
        bindings: vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: 32,
            input_rate: vk::VertexInputRate::VERTEX,
        }],
        attributes: Vec::new(),
    })
}

pub fn graphics_pool() -> CommandBufferPoolInfo {
    CommandBufferPoolInfo {
        queue: QueueType::Graphics,
        resettable: true,
        short_lived: true,
    }
}

pub fn command_buffer(driver: &Arc<CaptureDriver>, name: &str) -> CommandBuffer {
    command_buffer_with(
        driver,
        &CommandBufferCreateInfo {
            name: name.to_string(),
            ..Default::default()
        },
    )
}

pub fn command_buffer_with(
    driver: &Arc<CaptureDriver>,
    info: &CommandBufferCreateInfo,
) -> CommandBuffer {
    match CommandBuffer::new(driver.clone(), &graphics_pool(), info) {
        Ok(cmd) => cmd,
        Err(e) => panic!("command buffer creation failed: {}", e),
    }
}
