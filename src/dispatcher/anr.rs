//! Waiting on unready targets and application-not-responding supervision.

use super::entry::InjectionResult;
use super::input_state::{CancelationMode, CancelationOptions};
use super::{Command, DispatcherState};
use crate::channel::ChannelId;
use crate::clock::{to_millis_f64, Nsecs};
use crate::logging::targets;
use crate::window::{InputApplication, InputWindow};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputTargetWaitCause {
    None,
    SystemNotReady,
    ApplicationNotReady,
}

/// What the dispatcher is currently waiting on, if anything.
#[derive(Debug, Clone)]
pub struct AnrState {
    pub cause: InputTargetWaitCause,
    pub start_time: Nsecs,
    pub timeout_time: Nsecs,
    pub timeout_expired: bool,
    pub application: Option<Arc<InputApplication>>,
}

impl Default for AnrState {
    fn default() -> Self {
        Self {
            cause: InputTargetWaitCause::None,
            start_time: 0,
            timeout_time: Nsecs::MAX,
            timeout_expired: false,
            application: None,
        }
    }
}

impl AnrState {
    fn begin(&mut self, cause: InputTargetWaitCause, now: Nsecs, timeout_time: Nsecs) {
        self.cause = cause;
        self.start_time = now;
        self.timeout_time = timeout_time;
        self.timeout_expired = false;
        self.application = None;
    }
}

/// Human readable name of whatever the dispatcher is waiting on.
pub fn application_window_label(
    application: Option<&InputApplication>,
    window: Option<&InputWindow>,
) -> String {
    match (application, window) {
        (Some(app), Some(window)) => format!("{} - {}", app.name(), window.name()),
        (Some(app), None) => app.name().to_string(),
        (None, Some(window)) => window.name().to_string(),
        (None, None) => "<unknown application or window>".to_string(),
    }
}

impl DispatcherState {
    /// Starts or continues waiting for a target to become ready.
    ///
    /// Returns `TimedOut` once the policy gave up on the current wait and
    /// `Pending` otherwise, pulling `next_wakeup` in to the wait deadline.
    pub(super) fn handle_targets_not_ready(
        &mut self,
        now: Nsecs,
        event_time: Nsecs,
        application: Option<&Arc<InputApplication>>,
        window: Option<&Arc<InputWindow>>,
        next_wakeup: &mut Nsecs,
    ) -> InjectionResult {
        if application.is_none() && window.is_none() {
            if self.anr.cause != InputTargetWaitCause::SystemNotReady {
                debug!(target: targets::ANR, "Waiting for system to become ready for input.");
                self.anr.begin(InputTargetWaitCause::SystemNotReady, now, Nsecs::MAX);
            }
        } else if self.anr.cause != InputTargetWaitCause::ApplicationNotReady {
            debug!(
                target: targets::ANR,
                "Waiting for application to become ready for input: {}",
                application_window_label(application.map(Arc::as_ref), window.map(Arc::as_ref))
            );
            let timeout = window
                .map(|window| window.dispatching_timeout)
                .or_else(|| application.map(|app| app.dispatching_timeout))
                .unwrap_or_else(|| self.config.timeouts.default_dispatching_timeout());

            self.anr.begin(
                InputTargetWaitCause::ApplicationNotReady,
                now,
                now.saturating_add(timeout),
            );
            self.anr.application = window
                .and_then(|window| window.application.clone())
                .or_else(|| application.cloned());
        }

        if self.anr.timeout_expired {
            return InjectionResult::TimedOut;
        }

        if now >= self.anr.timeout_time {
            self.on_anr(now, application, window, event_time);
            *next_wakeup = Nsecs::MIN;
        } else {
            *next_wakeup = (*next_wakeup).min(self.anr.timeout_time);
        }
        InjectionResult::Pending
    }

    fn on_anr(
        &mut self,
        now: Nsecs,
        application: Option<&Arc<InputApplication>>,
        window: Option<&Arc<InputWindow>>,
        event_time: Nsecs,
    ) {
        info!(
            "Application is not responding: {}.  {:.1}ms since event, {:.1}ms since wait started",
            application_window_label(application.map(Arc::as_ref), window.map(Arc::as_ref)),
            to_millis_f64(now.saturating_sub(event_time)),
            to_millis_f64(now - self.anr.start_time)
        );

        self.commands.push_back(Command::NotifyAnr {
            application: application.cloned(),
            window: window.map(|window| window.handle.clone()),
            channel: window.map(|window| window.channel),
        });
    }

    /// Applies the policy's verdict after an ANR notification.
    ///
    /// A positive timeout extends the wait. Anything else gives up: the wait
    /// is marked expired so the pending event is dropped as timed out, the
    /// touch state is reset and the unresponsive window's channel is
    /// cancelled.
    pub(super) fn resume_after_targets_not_ready_timeout(
        &mut self,
        now: Nsecs,
        new_timeout: Nsecs,
        channel: Option<ChannelId>,
    ) {
        if new_timeout > 0 {
            self.anr.timeout_time = now.saturating_add(new_timeout);
            return;
        }

        self.anr.timeout_expired = true;
        self.touch_state.reset();

        if let Some(channel) = channel {
            let normal = self
                .connections
                .get(&channel)
                .is_some_and(|connection| connection.status == super::ConnectionStatus::Normal);
            if normal {
                let options = CancelationOptions::new(CancelationMode::All, "application not responding");
                self.synthesize_cancelation_events_for_connection(now, channel, &options);
            }
        }
    }

    pub(super) fn time_spent_waiting_for_application(&self, now: Nsecs) -> Nsecs {
        if self.anr.cause == InputTargetWaitCause::ApplicationNotReady {
            now - self.anr.start_time
        } else {
            0
        }
    }

    pub(super) fn reset_anr_timeouts(&mut self) {
        debug!(target: targets::ANR, "Resetting ANR timeouts.");
        self.anr.cause = InputTargetWaitCause::None;
        self.anr.application = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::window::{Rectangle, WindowHandle};

    #[test]
    fn test_label_combines_application_and_window() {
        let app = InputApplication::new("app");
        let window = InputWindow::new(WindowHandle::new("win"), ChannelId(1), Rectangle::new(0, 0, 1, 1));
        assert_eq!(application_window_label(Some(&app), Some(&window)), "app - win");
        assert_eq!(application_window_label(Some(&app), None), "app");
        assert_eq!(application_window_label(None, Some(&window)), "win");
        assert_eq!(application_window_label(None, None), "<unknown application or window>");
    }

    #[test]
    fn test_begin_clears_previous_wait() {
        let mut state = AnrState::default();
        state.timeout_expired = true;
        state.application = Some(Arc::new(InputApplication::new("old")));
        state.begin(InputTargetWaitCause::ApplicationNotReady, 10, 20);
        assert_eq!(state.cause, InputTargetWaitCause::ApplicationNotReady);
        assert_eq!(state.start_time, 10);
        assert_eq!(state.timeout_time, 20);
        assert!(!state.timeout_expired);
        assert!(state.application.is_none());
    }
}
