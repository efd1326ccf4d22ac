pub mod barrier;
pub mod capture;
pub mod command;
pub mod commands;
pub mod context;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod pipeline_db;
pub mod shader_feature;
pub mod sparse;
pub mod submission;
pub mod vulkan;

pub use barrier::{BarrierDomain, BarrierId, BarrierInfo, BarrierTable, PipelineStage};
pub use capture::CaptureDriver;
pub use command::{CommandBuffer, CommandBufferId, CommandBufferPool};
pub use context::GraphicsContext;
pub use driver::{Driver, QueueType};
pub use error::{DriverError, DriverResult};
pub use pipeline_db::PipelineDatabase;
pub use shader_feature::ShaderFeatureRegistry;
pub use sparse::SparseTexture;
pub use submission::{DeferredFree, SubmissionContext};
pub use vulkan::VulkanDriver;
