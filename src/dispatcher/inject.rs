//! Injection of synthetic events by other processes.
//!
//! Injected events share the notify path but carry an [`InjectionState`]
//! that the dispatcher fills in once it has decided the event's fate. Callers
//! can return straight away, wait for that decision, or also wait until every
//! foreground window has acknowledged the event.

use super::entry::{EventEntry, EventRef, InjectionResult, InjectionState, KeyEntry, MotionEntry, MotionSample};
use super::{DispatcherState, InputDispatcher};
use crate::error::DispatchError;
use crate::input::{validate_motion_event, InputEvent, KeyFlags, MotionEvent, PolicyFlags};
use crate::logging::targets;
use log::{debug, warn};
use parking_lot::Condvar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long `inject_input_event` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectionSyncMode {
    /// Return as soon as the event is queued.
    None,
    /// Wait until targets were resolved or the event was dropped.
    WaitForResult,
    /// Also wait until every foreground target acknowledged the event.
    WaitForFinished,
}

/// Condition variables injectors wait on, paired with the dispatcher lock.
#[derive(Debug, Default)]
pub(super) struct InjectionSignals {
    pub result_available: Condvar,
    pub sync_finished: Condvar,
}

fn validate_injected_motion(motion: &MotionEvent) -> Result<(), DispatchError> {
    validate_motion_event(motion.action.to_raw(), &motion.pointer_properties)?;
    if motion.samples.is_empty() {
        return Err(DispatchError::MissingSamples);
    }
    let expected = motion.pointer_count();
    if let Some(sample) = motion
        .samples
        .iter()
        .find(|sample| sample.pointer_coords.len() != expected)
    {
        return Err(DispatchError::SampleSizeMismatch {
            expected,
            actual: sample.pointer_coords.len(),
        });
    }
    Ok(())
}

impl InputDispatcher {
    /// Queues a synthetic event on behalf of `injector_pid` / `injector_uid`.
    ///
    /// Malformed events are rejected with `Failed`. With a sync mode other
    /// than `None` the call blocks for at most `timeout`.
    pub fn inject_input_event(
        &self,
        event: &InputEvent,
        injector_pid: i32,
        injector_uid: i32,
        sync_mode: InjectionSyncMode,
        timeout: Duration,
        policy_flags: PolicyFlags,
    ) -> InjectionResult {
        debug!(
            target: targets::INJECTION,
            "injectInputEvent - injectorPid={}, injectorUid={}, syncMode={:?}, timeoutMillis={}, policyFlags=0x{:08x}",
            injector_pid,
            injector_uid,
            sync_mode,
            timeout.as_millis(),
            policy_flags.bits()
        );

        // Timeouts too large to represent wait without a deadline.
        let end_time = Instant::now().checked_add(timeout);

        let mut policy_flags = policy_flags | PolicyFlags::INJECTED;
        if injector_uid == 0 || self.policy.check_inject_events_permission(injector_pid, injector_uid) {
            policy_flags |= PolicyFlags::TRUSTED;
        }

        let entry = match self.obtain_injected_entry(event, &mut policy_flags) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Rejecting injected event from pid {} uid {}: {}", injector_pid, injector_uid, err);
                return InjectionResult::Failed;
            }
        };

        let injection_state = Arc::new(InjectionState::new(
            injector_pid,
            injector_uid,
            sync_mode == InjectionSyncMode::None,
        ));
        entry.lock().injection_state = Some(Arc::clone(&injection_state));

        let need_wake = self.state.lock().enqueue_inbound_event(entry);
        if need_wake {
            self.looper.wake();
        }

        let result = if sync_mode == InjectionSyncMode::None {
            InjectionResult::Succeeded
        } else {
            self.wait_for_injection(&injection_state, sync_mode, end_time)
        };

        debug!(
            target: targets::INJECTION,
            "injectInputEvent - Finished with result {:?}.  injectorPid={}, injectorUid={}",
            result,
            injector_pid,
            injector_uid
        );
        result
    }

    fn obtain_injected_entry(&self, event: &InputEvent, policy_flags: &mut PolicyFlags) -> Result<EventRef, DispatchError> {
        match event {
            InputEvent::Key(key) => {
                let mut flags = key.flags;
                if flags.contains(KeyFlags::VIRTUAL_HARD_KEY) {
                    *policy_flags |= PolicyFlags::VIRTUAL;
                }
                if !policy_flags.contains(PolicyFlags::FILTERED) {
                    self.policy.intercept_key_before_queueing(key, policy_flags);
                }
                if policy_flags.contains(PolicyFlags::WOKE_HERE) {
                    flags |= KeyFlags::WOKE_HERE;
                }

                let mut entry = KeyEntry::from_event(key);
                entry.flags = flags;
                Ok(self.allocator.obtain_key(key.event_time, *policy_flags, entry))
            }
            InputEvent::Motion(motion) => {
                validate_injected_motion(motion)?;
                if !policy_flags.contains(PolicyFlags::FILTERED) {
                    self.policy
                        .intercept_motion_before_queueing(motion.event_time(), policy_flags);
                }

                let samples: Vec<MotionSample> = motion
                    .samples
                    .iter()
                    .map(|sample| MotionSample::new(sample.event_time, sample.pointer_coords.clone()))
                    .collect();
                let event_time = samples[0].event_time;
                let entry = MotionEntry {
                    device_id: motion.device_id,
                    source: motion.source,
                    action: motion.action,
                    flags: motion.flags,
                    meta_state: motion.meta_state,
                    button_state: motion.button_state,
                    edge_flags: motion.edge_flags,
                    x_precision: motion.x_precision,
                    y_precision: motion.y_precision,
                    down_time: motion.down_time,
                    pointer_properties: motion.pointer_properties.clone(),
                    samples,
                };
                Ok(self.allocator.obtain_motion(event_time, *policy_flags, entry))
            }
        }
    }

    fn wait_for_injection(
        &self,
        injection_state: &InjectionState,
        sync_mode: InjectionSyncMode,
        end_time: Option<Instant>,
    ) -> InjectionResult {
        let mut state = self.state.lock();

        let mut result = loop {
            let result = injection_state.result();
            if result != InjectionResult::Pending {
                break result;
            }
            if deadline_passed(end_time) {
                debug!(
                    target: targets::INJECTION,
                    "injectInputEvent - Timed out waiting for injection result to become available."
                );
                break InjectionResult::TimedOut;
            }
            match end_time {
                Some(end_time) => {
                    let _ = self.signals.result_available.wait_until(&mut state, end_time);
                }
                None => self.signals.result_available.wait(&mut state),
            }
        };

        if result == InjectionResult::Succeeded && sync_mode == InjectionSyncMode::WaitForFinished {
            loop {
                let pending = injection_state.pending_foreground_dispatches();
                if pending == 0 {
                    break;
                }
                debug!(
                    target: targets::INJECTION,
                    "injectInputEvent - Waiting for {} pending foreground dispatches.",
                    pending
                );
                if deadline_passed(end_time) {
                    debug!(
                        target: targets::INJECTION,
                        "injectInputEvent - Timed out waiting for pending foreground dispatches to finish."
                    );
                    result = InjectionResult::TimedOut;
                    break;
                }
                match end_time {
                    Some(end_time) => {
                        let _ = self.signals.sync_finished.wait_until(&mut state, end_time);
                    }
                    None => self.signals.sync_finished.wait(&mut state),
                }
            }
        }

        result
    }
}

fn deadline_passed(end_time: Option<Instant>) -> bool {
    end_time.is_some_and(|end_time| Instant::now() >= end_time)
}

impl DispatcherState {
    /// Records the outcome for an injected event and wakes its injector.
    pub(super) fn set_injection_result(&self, entry: &EventEntry, result: InjectionResult) {
        let Some(injection_state) = &entry.injection_state else {
            return;
        };

        debug!(
            target: targets::INJECTION,
            "Setting input event injection result to {:?}.  injectorPid={}, injectorUid={}",
            result,
            injection_state.injector_pid,
            injection_state.injector_uid
        );

        if injection_state.injection_is_async && !entry.policy_flags.contains(PolicyFlags::FILTERED) {
            match result {
                InjectionResult::Succeeded => {
                    debug!(target: targets::INJECTION, "Asynchronous input event injection succeeded.")
                }
                InjectionResult::Failed => warn!("Asynchronous input event injection failed."),
                InjectionResult::PermissionDenied => {
                    warn!("Asynchronous input event injection permission denied.")
                }
                InjectionResult::TimedOut => warn!("Asynchronous input event injection timed out."),
                InjectionResult::Pending => {}
            }
        }

        injection_state.set_result(result);
        self.signals.result_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, Nsecs};
    use crate::input::{
        InputSource, KeyAction, KeyEvent, MotionAction, MotionEventSample, MotionFlags, MetaState, PointerCoords,
        PointerProperties,
    };
    use crate::policy::DispatcherPolicy;
    use crate::window::{InputApplication, WindowHandle};

    struct DenyingPolicy;

    impl DispatcherPolicy for DenyingPolicy {
        fn notify_anr(&self, _application: Option<&Arc<InputApplication>>, _window: Option<&WindowHandle>) -> Nsecs {
            0
        }
    }

    fn motion(samples: Vec<MotionEventSample>) -> MotionEvent {
        MotionEvent {
            device_id: 1,
            source: InputSource::TOUCHSCREEN,
            action: MotionAction::Down,
            flags: MotionFlags::empty(),
            edge_flags: 0,
            meta_state: MetaState::empty(),
            button_state: 0,
            x_offset: 0.0,
            y_offset: 0.0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time: 5,
            pointer_properties: vec![PointerProperties::finger(0)],
            samples,
        }
    }

    /// Test motion events without samples are refused
    #[test]
    fn test_injected_motion_requires_samples() {
        assert!(matches!(validate_injected_motion(&motion(vec![])), Err(DispatchError::MissingSamples)));
        let bad = motion(vec![MotionEventSample {
            event_time: 5,
            pointer_coords: vec![],
        }]);
        assert!(matches!(
            validate_injected_motion(&bad),
            Err(DispatchError::SampleSizeMismatch { expected: 1, actual: 0 })
        ));
    }

    /// Test asynchronous injection succeeds immediately and queues the event
    #[test]
    fn test_async_injection_queues_event() {
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let dispatcher = InputDispatcher::new(Arc::new(DenyingPolicy), clock.clone());
        let key = KeyEvent::new(1, InputSource::KEYBOARD, KeyAction::Down, 29, clock.now());

        let result = dispatcher.inject_input_event(
            &InputEvent::Key(key),
            100,
            1000,
            InjectionSyncMode::None,
            Duration::from_millis(10),
            PolicyFlags::empty(),
        );
        assert_eq!(result, InjectionResult::Succeeded);

        let state = dispatcher.state.lock();
        let entry = state.inbound_queue[0].lock();
        assert!(entry.policy_flags.contains(PolicyFlags::INJECTED));
        assert!(!entry.policy_flags.contains(PolicyFlags::TRUSTED));
        assert!(entry.injection_state.as_ref().unwrap().injection_is_async);
    }

    /// Test an unrepresentable timeout is accepted as no deadline
    #[test]
    fn test_injection_with_unbounded_timeout() {
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let dispatcher = InputDispatcher::new(Arc::new(DenyingPolicy), clock.clone());
        let key = KeyEvent::new(1, InputSource::KEYBOARD, KeyAction::Down, 29, clock.now());

        let result = dispatcher.inject_input_event(
            &InputEvent::Key(key),
            1,
            0,
            InjectionSyncMode::None,
            Duration::MAX,
            PolicyFlags::empty(),
        );
        assert_eq!(result, InjectionResult::Succeeded);
        assert_eq!(dispatcher.state.lock().inbound_queue.len(), 1);
        assert!(!deadline_passed(None));
    }

    /// Test a synchronous injection times out when nothing dispatches it
    #[test]
    fn test_sync_injection_times_out_without_dispatch_thread() {
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let dispatcher = InputDispatcher::new(Arc::new(DenyingPolicy), clock.clone());
        let sample = MotionEventSample {
            event_time: clock.now(),
            pointer_coords: vec![PointerCoords::at(1.0, 1.0)],
        };

        let result = dispatcher.inject_input_event(
            &InputEvent::Motion(motion(vec![sample])),
            0,
            0,
            InjectionSyncMode::WaitForResult,
            Duration::from_millis(20),
            PolicyFlags::empty(),
        );
        assert_eq!(result, InjectionResult::TimedOut);
    }
}
