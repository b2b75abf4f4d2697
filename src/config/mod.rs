//! Configuration management for the input dispatcher
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files: throttling and key repeat, dispatch timeouts, channel
//! buffer sizing and logging categories.

use crate::clock::{millis, Nsecs, NSECS_PER_SEC};
use crate::logging::targets;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration struct containing all dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DispatcherConfig {
    /// Throttling and key repeat
    #[serde(default)]
    pub dispatcher: DispatchSettings,

    /// Dispatch deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Shared channel buffer sizing
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Log level and per-subsystem debug output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Throttling and key repeat settings handed over by the policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSettings {
    /// Maximum motion events per second delivered from one device (0 = unthrottled)
    pub max_events_per_second: u32,

    /// Delay before the first synthesized key repeat (ms)
    pub key_repeat_timeout_ms: u64,

    /// Delay between subsequent key repeats (ms)
    pub key_repeat_delay_ms: u64,
}

/// Dispatch deadlines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    /// Dispatch timeout for windows and applications that do not set one (ms)
    pub default_dispatching_timeout_ms: u64,

    /// How long after a HOME/ENDCALL key up pending events are preempted (ms)
    pub app_switch_timeout_ms: u64,

    /// Events older than this are dropped instead of dispatched (ms)
    pub stale_event_timeout_ms: u64,

    /// Samples closer together than this are coalesced (microseconds)
    #[serde(default = "TimeoutConfig::default_coalesce_interval")]
    pub motion_sample_coalesce_interval_us: u64,
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Size of the shared publish buffer of channels opened by the dispatcher host (bytes)
    pub buffer_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level (error, warn, info, debug, trace)
    pub level: String,

    pub inbound: bool,
    pub outbound: bool,
    pub batching: bool,
    pub dispatch_cycle: bool,
    pub focus: bool,
    pub injection: bool,
    pub throttling: bool,
    pub app_switch: bool,
    pub hover: bool,
    pub registration: bool,
    pub anr: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_events_per_second: 90,
            key_repeat_timeout_ms: 500,
            key_repeat_delay_ms: 50,
        }
    }
}

impl DispatchSettings {
    pub fn key_repeat_timeout(&self) -> Nsecs {
        millis(self.key_repeat_timeout_ms as i64)
    }

    pub fn key_repeat_delay(&self) -> Nsecs {
        millis(self.key_repeat_delay_ms as i64)
    }

    /// Minimum spacing of throttled motion events, `None` when unthrottled.
    pub fn min_time_between_events(&self) -> Option<Nsecs> {
        (self.max_events_per_second > 0).then(|| NSECS_PER_SEC / self.max_events_per_second as Nsecs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_dispatching_timeout_ms: 5000,
            app_switch_timeout_ms: 500,
            stale_event_timeout_ms: 10_000,
            motion_sample_coalesce_interval_us: Self::default_coalesce_interval(),
        }
    }
}

impl TimeoutConfig {
    fn default_coalesce_interval() -> u64 {
        3000
    }

    pub fn default_dispatching_timeout(&self) -> Nsecs {
        millis(self.default_dispatching_timeout_ms as i64)
    }

    pub fn app_switch_timeout(&self) -> Nsecs {
        millis(self.app_switch_timeout_ms as i64)
    }

    pub fn stale_event_timeout(&self) -> Nsecs {
        millis(self.stale_event_timeout_ms as i64)
    }

    pub fn motion_sample_coalesce_interval(&self) -> Nsecs {
        self.motion_sample_coalesce_interval_us as Nsecs * 1000
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::channel::DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            inbound: false,
            outbound: false,
            batching: false,
            dispatch_cycle: false,
            focus: false,
            injection: false,
            throttling: false,
            app_switch: false,
            hover: false,
            registration: false,
            anr: false,
        }
    }
}

impl LoggingConfig {
    /// Log targets raised to debug level by this configuration
    pub fn debug_targets(&self) -> Vec<&'static str> {
        [
            (self.inbound, targets::INBOUND),
            (self.outbound, targets::OUTBOUND),
            (self.batching, targets::BATCHING),
            (self.dispatch_cycle, targets::DISPATCH_CYCLE),
            (self.focus, targets::FOCUS),
            (self.injection, targets::INJECTION),
            (self.throttling, targets::THROTTLING),
            (self.app_switch, targets::APP_SWITCH),
            (self.hover, targets::HOVER),
            (self.registration, targets::REGISTRATION),
            (self.anr, targets::ANR),
        ]
        .into_iter()
        .filter_map(|(enabled, target)| enabled.then_some(target))
        .collect()
    }
}

/// Expands a leading `~` to the home directory
pub fn expand_home<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.to_string_lossy().starts_with('~') {
        let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
        Ok(Path::new(&home).join(path.strip_prefix("~").unwrap_or(path)))
    } else {
        Ok(path.to_path_buf())
    }
}

impl DispatcherConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let expanded_path = expand_home(path)?;

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: DispatcherConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.key_repeat_timeout_ms == 0 {
            anyhow::bail!("Invalid key_repeat_timeout_ms: must be greater than 0");
        }
        if self.dispatcher.key_repeat_delay_ms == 0 {
            anyhow::bail!("Invalid key_repeat_delay_ms: must be greater than 0");
        }
        if self.dispatcher.max_events_per_second > 1000 {
            anyhow::bail!("Invalid max_events_per_second: must be at most 1000");
        }

        if self.timeouts.default_dispatching_timeout_ms == 0 {
            anyhow::bail!("Invalid default_dispatching_timeout_ms: must be greater than 0");
        }
        if self.timeouts.app_switch_timeout_ms == 0 {
            anyhow::bail!("Invalid app_switch_timeout_ms: must be greater than 0");
        }
        if self.timeouts.stale_event_timeout_ms == 0 {
            anyhow::bail!("Invalid stale_event_timeout_ms: must be greater than 0");
        }

        let min_buffer = crate::channel::min_buffer_size();
        if self.channel.buffer_size < min_buffer {
            anyhow::bail!(
                "Invalid channel buffer_size {}: must be at least {} bytes",
                self.channel.buffer_size,
                min_buffer
            );
        }

        let valid_levels = ["off", "error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;
