use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "CGFX_LOG";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with environment filter.
/// Set CGFX_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but reports instead of panicking when a subscriber
/// is already installed. Writes through the test harness capture so
/// `cargo test` output stays attached to the failing test.
pub fn try_init_logging() -> Result<(), LoggingError> {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_test_writer()
        .try_init()
        .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}
