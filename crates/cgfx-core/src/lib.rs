pub mod arena;
pub mod config;
pub mod error;
pub mod handle;

pub use arena::{Arena, ArenaId};
pub use config::GraphicsConfig;
pub use error::CoreError;
pub use handle::{DriverHandle, HandleAllocator, ResourceKind};
