//! # Input Dispatcher Library
//!
//! Routes key and motion events produced by input devices to the windows
//! that should receive them, one event at a time, over per-window channels.
//!
//! ## Architecture
//!
//! - `dispatcher`: inbound queue, target resolution, per-connection dispatch
//!   cycles, ANR supervision and injection
//! - `channel`: in-process channel pairs, the publisher and the `Looper`
//! - `input`: event vocabulary and boundary validation
//! - `window`: window and application snapshots handed over by the window manager
//! - `policy`: the collaborator consulted before queueing and dispatching
//! - `config`: TOML configuration
//! - `logging`: env_logger setup with per-subsystem debug targets
//!
//! ## Usage
//!
//! ```rust,no_run
//! use input_dispatcher::{
//!     DefaultDispatcherPolicy, DispatcherConfig, InputDispatcher, InputDispatcherThread, MonotonicClock,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let policy = Arc::new(DefaultDispatcherPolicy::new(DispatcherConfig::default()));
//!     let dispatcher = Arc::new(InputDispatcher::new(policy, Arc::new(MonotonicClock::new())));
//!     let mut thread = InputDispatcherThread::new(dispatcher);
//!     thread.start()?;
//!     thread.stop();
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod input;
pub mod logging;
pub mod policy;
pub mod window;

// Re-export main types for easy access
pub use channel::{open_pair, InputChannel, InputConsumer, Looper};
pub use clock::{Clock, ManualClock, MonotonicClock, Nsecs};
pub use config::DispatcherConfig;
pub use dispatcher::{
    DispatcherSnapshot, InjectionResult, InjectionSyncMode, InputDispatcher, InputDispatcherThread, NotifyKeyArgs,
    NotifyMotionArgs,
};
pub use error::DispatchError;
pub use input::{InputEvent, KeyEvent, MotionEvent};
pub use policy::{DefaultDispatcherPolicy, DispatcherPolicy};
pub use window::{InputApplication, InputWindow, WindowHandle};

/// Version information for the input dispatcher
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
