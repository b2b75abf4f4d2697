//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, serialization/deserialization,
//! and edge cases in configuration handling.

use super::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = DispatcherConfig::default();

    assert!(config.validate().is_ok());
    assert_eq!(config.dispatcher.max_events_per_second, 90);
    assert_eq!(config.dispatcher.key_repeat_timeout(), millis(500));
    assert_eq!(config.dispatcher.key_repeat_delay(), millis(50));
    assert_eq!(config.timeouts.default_dispatching_timeout(), millis(5000));
    assert_eq!(config.timeouts.app_switch_timeout(), millis(500));
    assert_eq!(config.timeouts.stale_event_timeout(), millis(10_000));
    assert_eq!(config.timeouts.motion_sample_coalesce_interval(), millis(3));
}

#[test]
fn test_throttle_interval() {
    let mut settings = DispatchSettings::default();
    assert_eq!(settings.min_time_between_events(), Some(NSECS_PER_SEC / 90));

    settings.max_events_per_second = 0;
    assert_eq!(settings.min_time_between_events(), None);
}

#[test]
fn test_configuration_serialization_roundtrip() -> Result<()> {
    let mut original_config = DispatcherConfig::default();
    original_config.logging.batching = true;
    original_config.timeouts.app_switch_timeout_ms = 750;

    let toml_string = toml::to_string(&original_config)?;
    let deserialized_config: DispatcherConfig = toml::from_str(&toml_string)?;

    assert_eq!(original_config, deserialized_config);

    Ok(())
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("dispatcher.toml");

    let test_config = r#"
[dispatcher]
max_events_per_second = 60
key_repeat_timeout_ms = 400

[timeouts]
default_dispatching_timeout_ms = 8000
app_switch_timeout_ms = 500
stale_event_timeout_ms = 10000

[channel]
buffer_size = 4096

[logging]
level = "debug"
focus = true
anr = true
"#;

    fs::write(&file_path, test_config)?;
    let config = DispatcherConfig::load(&file_path)?;

    assert_eq!(config.dispatcher.max_events_per_second, 60);
    assert_eq!(config.dispatcher.key_repeat_timeout_ms, 400);
    // Unspecified fields fall back to defaults
    assert_eq!(config.dispatcher.key_repeat_delay_ms, 50);
    assert_eq!(config.timeouts.default_dispatching_timeout_ms, 8000);
    assert_eq!(config.timeouts.motion_sample_coalesce_interval_us, 3000);
    assert_eq!(config.channel.buffer_size, 4096);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(
        config.logging.debug_targets(),
        vec![crate::logging::targets::FOCUS, crate::logging::targets::ANR]
    );

    Ok(())
}

#[test]
fn test_empty_file_uses_defaults() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("empty.toml");
    fs::write(&file_path, "")?;

    let config = DispatcherConfig::load(&file_path)?;
    assert_eq!(config, DispatcherConfig::default());

    Ok(())
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut config = DispatcherConfig::default();
    config.dispatcher.key_repeat_delay_ms = 0;
    assert!(config.validate().is_err());

    let mut config = DispatcherConfig::default();
    config.timeouts.default_dispatching_timeout_ms = 0;
    assert!(config.validate().is_err());

    let mut config = DispatcherConfig::default();
    config.channel.buffer_size = 16;
    assert!(config.validate().is_err());

    let mut config = DispatcherConfig::default();
    config.logging.level = "verbose".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_load_rejects_invalid_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad.toml");
    fs::write(&file_path, "[dispatcher]\nkey_repeat_delay_ms = 0\n")?;

    assert!(DispatcherConfig::load(&file_path).is_err());
    assert!(DispatcherConfig::load(dir.path().join("missing.toml")).is_err());

    fs::write(&file_path, "this is not toml = = =")?;
    assert!(DispatcherConfig::load(&file_path).is_err());

    Ok(())
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = DispatcherConfig::default();
    config.dispatcher.max_events_per_second = 0;
    config.logging.hover = true;
    config.save(&file_path)?;

    let reloaded = DispatcherConfig::load(&file_path)?;
    assert_eq!(config, reloaded);

    Ok(())
}
