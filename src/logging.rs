//! Logging setup for the dispatcher
//!
//! All modules log through the `log` facade. Subsystems that produce a lot
//! of per-event output log under their own target so they can be raised to
//! debug individually, either from the `[logging]` config table or through
//! `RUST_LOG` (for example `RUST_LOG=input_dispatcher::batching=debug`).
//!
//! # Usage
//!
//! ```no_run
//! use input_dispatcher::config::DispatcherConfig;
//! use input_dispatcher::logging;
//!
//! let mut config = DispatcherConfig::default();
//! config.logging.focus = true;
//! logging::init(&config.logging, false).expect("logger already set");
//! ```

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use log::LevelFilter;

/// Log targets of the per-subsystem debug categories
pub mod targets {
    pub const INBOUND: &str = "input_dispatcher::inbound";
    pub const OUTBOUND: &str = "input_dispatcher::outbound";
    pub const BATCHING: &str = "input_dispatcher::batching";
    pub const DISPATCH_CYCLE: &str = "input_dispatcher::dispatch_cycle";
    pub const FOCUS: &str = "input_dispatcher::focus";
    pub const INJECTION: &str = "input_dispatcher::injection";
    pub const THROTTLING: &str = "input_dispatcher::throttling";
    pub const APP_SWITCH: &str = "input_dispatcher::app_switch";
    pub const HOVER: &str = "input_dispatcher::hover";
    pub const REGISTRATION: &str = "input_dispatcher::registration";
    pub const ANR: &str = "input_dispatcher::anr";
}

/// Parses a configured level name
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Builds an env_logger builder from the configuration.
///
/// `force_debug` (the `--debug` CLI flag) overrides the configured level.
/// `RUST_LOG` directives are applied last and win over both.
pub fn builder(config: &LoggingConfig, force_debug: bool) -> env_logger::Builder {
    let level = if force_debug {
        LevelFilter::Debug
    } else {
        parse_level(&config.level).unwrap_or(LevelFilter::Info)
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    for target in config.debug_targets() {
        if level < LevelFilter::Debug {
            builder.filter_module(target, LevelFilter::Debug);
        }
    }
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }
    builder
}

/// Installs the global logger
pub fn init(config: &LoggingConfig, force_debug: bool) -> Result<()> {
    builder(config, force_debug)
        .try_init()
        .context("Failed to initialize logger")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info"), Some(LevelFilter::Info));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("trace"), Some(LevelFilter::Trace));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_targets_share_crate_prefix() {
        let config = LoggingConfig {
            inbound: true,
            outbound: true,
            batching: true,
            dispatch_cycle: true,
            focus: true,
            injection: true,
            throttling: true,
            app_switch: true,
            hover: true,
            registration: true,
            anr: true,
            ..LoggingConfig::default()
        };
        let targets = config.debug_targets();
        assert_eq!(targets.len(), 11);
        assert!(targets.iter().all(|t| t.starts_with("input_dispatcher::")));
    }

    #[test]
    fn test_builder_accepts_debug_override() {
        let config = LoggingConfig::default();
        // Building must not panic; installing is left to the binary.
        let _ = builder(&config, true);
    }
}
