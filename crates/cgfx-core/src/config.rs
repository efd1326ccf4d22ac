use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level graphics core configuration, loaded from cgfx.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphicsConfig {
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub pipelines: PipelineConfig,
    #[serde(default)]
    pub sparse: SparseConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Number of frames the CPU may run ahead of the GPU
    #[serde(default = "default_buffered_frames")]
    pub buffered_frames: u32,
    /// Track slot completion with per-queue timeline semaphores
    #[serde(default = "default_true")]
    pub use_timeline: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Log a warning whenever a pipeline has to be compiled after warm-up
    #[serde(default)]
    pub warn_on_compile_in_frame: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseConfig {
    /// Allow creation of sparse (partially resident) textures
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Split commits into driver calls of at most this many page binds (0 = unlimited)
    #[serde(default)]
    pub max_pages_per_commit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Record profiling markers into command buffers
    #[serde(default = "default_markers")]
    pub markers: bool,
    /// Attach debug names to driver objects
    #[serde(default = "default_true")]
    pub object_names: bool,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            buffered_frames: default_buffered_frames(),
            use_timeline: true,
        }
    }
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pages_per_commit: 0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
            object_names: true,
        }
    }
}

impl GraphicsConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, CoreError> {
        let config: GraphicsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists and is valid, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("using default graphics config ({}): {}", path, e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.submission.buffered_frames == 0 {
            return Err(CoreError::ConfigError(
                "submission.buffered_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the config file path.
/// Search order:
/// 1. `CGFX_CONFIG` environment variable
/// 2. Local fallback: `./cgfx.toml`
pub fn default_config_path() -> String {
    std::env::var("CGFX_CONFIG").unwrap_or_else(|_| "cgfx.toml".to_string())
}

fn default_buffered_frames() -> u32 {
    3
}

fn default_markers() -> bool {
    cfg!(debug_assertions)
}

fn default_true() -> bool {
    true
}
