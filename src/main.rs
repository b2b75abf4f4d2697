//! # input-dispatcher
//!
//! Runs the input dispatcher on its own thread with the default policy and a
//! logging monitor channel until interrupted, then prints the final state.

use anyhow::{Context, Result};
use clap::Parser;
use input_dispatcher::channel::{open_pair_with_buffer, InputMessage};
use input_dispatcher::config::DispatcherConfig;
use input_dispatcher::{logging, DefaultDispatcherPolicy, InputDispatcher, InputDispatcherThread, MonotonicClock};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "input-dispatcher")]
#[command(about = "Routes input events to windows over per-window channels")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/input-dispatcher/dispatcher.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the final dispatcher state as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,

    /// Poll interval of the monitor channel (ms)
    #[arg(long, default_value_t = 10)]
    monitor_interval_ms: u64,
}

fn build_info() -> String {
    format!(
        "{} ({}, {}, built {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_COMMIT").unwrap_or("unknown"),
        env!("TARGET_TRIPLE"),
        env!("BUILD_DATE")
    )
}

fn describe(message: &InputMessage) -> String {
    match message {
        InputMessage::Key(key) => format!(
            "key device={} action={:?} keyCode={} repeatCount={}",
            key.device_id, key.action, key.key_code, key.repeat_count
        ),
        InputMessage::Motion(motion) => format!(
            "motion device={} action={:?} pointers={} samples={}",
            motion.device_id,
            motion.action,
            motion.pointer_properties.len(),
            motion.samples.len()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = DispatcherConfig::load(&cli.config);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => DispatcherConfig::default(),
    };

    logging::init(&config.logging, cli.debug)?;

    info!("🚀 Starting input dispatcher");
    info!("📄 Version: {}", build_info());

    match loaded {
        Ok(_) => info!("✅ Configuration loaded from: {}", cli.config),
        Err(e) if cli.check_config => return Err(e),
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
        }
    }

    if cli.check_config {
        println!("{}", toml::to_string_pretty(&config).context("Failed to serialize configuration")?);
        return Ok(());
    }

    let buffer_size = config.channel.buffer_size;
    let policy = Arc::new(DefaultDispatcherPolicy::new(config));
    let dispatcher = Arc::new(InputDispatcher::new(policy, Arc::new(MonotonicClock::new())));

    let (monitor, consumer) = open_pair_with_buffer("monitor", buffer_size);
    dispatcher.register_input_channel(monitor, None, true)?;

    let mut thread = InputDispatcherThread::new(Arc::clone(&dispatcher));
    thread.start().context("Failed to start dispatcher thread")?;

    let interval = Duration::from_millis(cli.monitor_interval_ms.max(1));
    let monitor_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match consumer.consume() {
                Ok(Some(message)) => {
                    debug!("📥 monitor: {}", describe(&message));
                    if let Err(e) = consumer.send_finished_signal(true) {
                        warn!("Monitor channel failed to acknowledge: {}", e);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Monitor channel closed: {}", e);
                    break;
                }
            }
        }
    });

    info!("✨ Input dispatcher is ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    monitor_task.abort();
    thread.stop();

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&dispatcher.snapshot()).context("Failed to serialize dispatcher state")?
        );
    } else {
        println!("{}", dispatcher.dump());
    }

    info!("👋 Input dispatcher shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["input-dispatcher"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.json);
        assert!(!cli.check_config);
        assert_eq!(cli.monitor_interval_ms, 10);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "input-dispatcher",
            "--debug",
            "--json",
            "--check-config",
            "--config",
            "/tmp/dispatcher.toml",
        ])
        .unwrap();
        assert!(cli.debug);
        assert!(cli.json);
        assert!(cli.check_config);
        assert_eq!(cli.config, "/tmp/dispatcher.toml");
    }
}
