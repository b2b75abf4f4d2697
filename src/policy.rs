//! Policy collaborator consulted by the dispatcher.
//!
//! The dispatcher never calls the policy while holding its state lock, except
//! for the quick non-reentrant queries (`is_key_repeat_enabled`,
//! `check_inject_events_permission`). Everything else runs from the command
//! queue with the lock released.

use crate::clock::Nsecs;
use crate::config::DispatcherConfig;
use crate::input::{InputEvent, KeyEvent, PolicyFlags, UserActivityType};
use crate::window::{InputApplication, WindowHandle};
use log::{info, warn};
use std::sync::Arc;

pub trait DispatcherPolicy: Send + Sync {
    /// Configuration read once when the dispatcher is created.
    fn dispatcher_configuration(&self) -> DispatcherConfig {
        DispatcherConfig::default()
    }

    fn notify_configuration_changed(&self, _when: Nsecs) {}

    /// Called when a window or application fails to become ready in time.
    /// Returns a new timeout to keep waiting, or 0 to give up.
    fn notify_anr(
        &self,
        application: Option<&Arc<InputApplication>>,
        window: Option<&WindowHandle>,
    ) -> Nsecs;

    fn notify_input_channel_broken(&self, _window: Option<&WindowHandle>) {}

    fn notify_switch(&self, _when: Nsecs, _switch_code: i32, _switch_value: i32, _policy_flags: PolicyFlags) {}

    fn is_key_repeat_enabled(&self) -> bool {
        true
    }

    /// Returns false to consume the event before it reaches the inbound queue.
    fn filter_input_event(&self, _event: &InputEvent, _policy_flags: PolicyFlags) -> bool {
        true
    }

    fn intercept_key_before_queueing(&self, _event: &KeyEvent, policy_flags: &mut PolicyFlags) {
        *policy_flags |= PolicyFlags::PASS_TO_USER;
    }

    fn intercept_motion_before_queueing(&self, _when: Nsecs, policy_flags: &mut PolicyFlags) {
        *policy_flags |= PolicyFlags::PASS_TO_USER;
    }

    /// Returns true when the policy consumed the key and it must not be dispatched.
    fn intercept_key_before_dispatching(
        &self,
        _window: Option<&WindowHandle>,
        _event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> bool {
        false
    }

    /// Returns the fallback key to deliver in place of an unhandled key, if any.
    fn dispatch_unhandled_key(
        &self,
        _window: Option<&WindowHandle>,
        _event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> Option<KeyEvent> {
        None
    }

    fn poke_user_activity(&self, _event_time: Nsecs, _activity: UserActivityType) {}

    fn check_inject_events_permission(&self, _injector_pid: i32, _injector_uid: i32) -> bool {
        false
    }
}

/// Policy used by the standalone binary: passes everything to the user,
/// keeps waiting on ANR once and logs the rest.
#[derive(Debug, Clone, Default)]
pub struct DefaultDispatcherPolicy {
    config: DispatcherConfig,
}

impl DefaultDispatcherPolicy {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config }
    }
}

impl DispatcherPolicy for DefaultDispatcherPolicy {
    fn dispatcher_configuration(&self) -> DispatcherConfig {
        self.config.clone()
    }

    fn notify_configuration_changed(&self, when: Nsecs) {
        info!("🔧 Input configuration changed at {}", when);
    }

    fn notify_anr(
        &self,
        application: Option<&Arc<InputApplication>>,
        window: Option<&WindowHandle>,
    ) -> Nsecs {
        warn!(
            "⏳ Application not responding: application={}, window={}",
            application.map_or("<none>", |app| app.name()),
            window.map_or("<none>".to_string(), |w| w.to_string())
        );
        0
    }

    fn notify_input_channel_broken(&self, window: Option<&WindowHandle>) {
        warn!(
            "💔 Input channel broken for window {}",
            window.map_or("<none>".to_string(), |w| w.to_string())
        );
    }
}
