//! Integration test: GraphicsConfig
//!
//! Verifies TOML parsing, defaults for omitted sections, and validation.

use cgfx_core::config::GraphicsConfig;
use cgfx_core::CoreError;

#[test]
fn test_empty_config_uses_defaults() {
    let config = GraphicsConfig::from_toml("").expect("empty config parses");
    assert_eq!(config.submission.buffered_frames, 3);
    assert!(config.submission.use_timeline);
    assert!(config.sparse.enabled);
    assert_eq!(config.sparse.max_pages_per_commit, 0);
    assert!(config.debug.object_names);
}

#[test]
fn test_partial_sections() {
    let config = GraphicsConfig::from_toml(
        r#"
        [submission]
        buffered_frames = 2

        [sparse]
        max_pages_per_commit = 64

        [pipelines]
        warn_on_compile_in_frame = true
        "#,
    )
    .expect("config parses");
    assert_eq!(config.submission.buffered_frames, 2);
    assert!(config.submission.use_timeline);
    assert_eq!(config.sparse.max_pages_per_commit, 64);
    assert!(config.pipelines.warn_on_compile_in_frame);
}

#[test]
fn test_zero_buffered_frames_rejected() {
    let err = GraphicsConfig::from_toml("[submission]\nbuffered_frames = 0\n").unwrap_err();
    assert!(matches!(err, CoreError::ConfigError(_)), "got {:?}", err);
}

#[test]
fn test_malformed_toml_rejected() {
    let err = GraphicsConfig::from_toml("[submission\nbuffered_frames = ").unwrap_err();
    assert!(matches!(err, CoreError::Parse(_)), "got {:?}", err);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let config = GraphicsConfig::load_or_default("/nonexistent/cgfx.toml");
    assert_eq!(config.submission.buffered_frames, 3);
}
