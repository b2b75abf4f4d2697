//! The dispatch engine.
//!
//! Producers hand events to [`InputDispatcher`] through the `notify_*` and
//! `inject_input_event` entry points. A single dispatch thread drains the
//! inbound queue in [`InputDispatcher::dispatch_once`], resolves targets for
//! each event and feeds the outbound queue of every target connection.
//!
//! All mutable state lives in one [`DispatcherState`] behind one lock.
//! Policy callbacks that may take a while are queued as [`Command`]s and run
//! after each loop iteration with the lock released.

mod anr;
mod connection;
mod dump;
mod entry;
mod inject;
mod input_state;
mod targets;
mod thread;
mod touch;

pub use anr::{application_window_label, InputTargetWaitCause};
pub use connection::{split_motion_event, Connection, ConnectionStatus};
pub use dump::{ConnectionSnapshot, DispatcherSnapshot, TouchedWindowSnapshot, WindowSnapshot};
pub use entry::{
    DispatchEntry, EventAllocator, EventEntry, EventKind, EventRef, InjectionResult, InjectionState,
    InterceptKeyResult, KeyEntry, MotionEntry, MotionSample, ResolvedEvent,
};
pub use inject::InjectionSyncMode;
pub use input_state::{CancelationMode, CancelationOptions, InputState};
pub use thread::InputDispatcherThread;
pub use touch::{DispatchMode, DispatchModes, InputTarget, TargetFlags, TouchState, TouchedWindow};

use crate::channel::{ChannelError, ChannelId, InputChannel, Looper, PollEvents};
use crate::clock::{poll_timeout, to_millis_f64, Clock, Nsecs};
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::input::{
    keycodes, validate_key_action, validate_motion_event, InputEvent, InputSource, KeyAction, KeyEvent,
    KeyFlags, MetaState, MotionAction, MotionEvent, MotionEventSample, MotionFlags, PointerCoords,
    PointerProperties, PolicyFlags, UserActivityType,
};
use crate::logging::targets as log_targets;
use crate::policy::DispatcherPolicy;
use crate::window::{InputApplication, InputWindow, WindowHandle};
use anr::AnrState;
use inject::InjectionSignals;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A key transition reported by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyKeyArgs {
    pub event_time: Nsecs,
    pub device_id: i32,
    pub source: InputSource,
    pub policy_flags: PolicyFlags,
    /// Raw action code, validated on entry.
    pub action: i32,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: MetaState,
    pub down_time: Nsecs,
}

impl NotifyKeyArgs {
    pub fn new(event_time: Nsecs, device_id: i32, source: InputSource, action: KeyAction, key_code: i32) -> Self {
        Self {
            event_time,
            device_id,
            source,
            policy_flags: PolicyFlags::empty(),
            action: action.to_raw(),
            flags: KeyFlags::empty(),
            key_code,
            scan_code: 0,
            meta_state: MetaState::empty(),
            down_time: event_time,
        }
    }
}

/// One motion sample reported by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyMotionArgs {
    pub event_time: Nsecs,
    pub device_id: i32,
    pub source: InputSource,
    pub policy_flags: PolicyFlags,
    /// Raw action code including the pointer index, validated on entry.
    pub action: i32,
    pub flags: MotionFlags,
    pub meta_state: MetaState,
    pub button_state: u32,
    pub edge_flags: u32,
    pub pointer_properties: Vec<PointerProperties>,
    pub pointer_coords: Vec<PointerCoords>,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nsecs,
}

impl NotifyMotionArgs {
    pub fn new(
        event_time: Nsecs,
        device_id: i32,
        source: InputSource,
        action: MotionAction,
        pointer_properties: Vec<PointerProperties>,
        pointer_coords: Vec<PointerCoords>,
    ) -> Self {
        Self {
            event_time,
            device_id,
            source,
            policy_flags: PolicyFlags::empty(),
            action: action.to_raw(),
            flags: MotionFlags::empty(),
            meta_state: MetaState::empty(),
            button_state: 0,
            edge_flags: 0,
            pointer_properties,
            pointer_coords,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time: event_time,
        }
    }

    fn to_motion_event(&self, action: MotionAction) -> MotionEvent {
        MotionEvent {
            device_id: self.device_id,
            source: self.source,
            action,
            flags: self.flags,
            edge_flags: self.edge_flags,
            meta_state: self.meta_state,
            button_state: self.button_state,
            x_offset: 0.0,
            y_offset: 0.0,
            x_precision: self.x_precision,
            y_precision: self.y_precision,
            down_time: self.down_time,
            pointer_properties: self.pointer_properties.clone(),
            samples: vec![MotionEventSample {
                event_time: self.event_time,
                pointer_coords: self.pointer_coords.clone(),
            }],
        }
    }
}

/// Work deferred until the state lock can be released.
enum Command {
    NotifyConfigurationChanged {
        event_time: Nsecs,
    },
    NotifyInputChannelBroken {
        channel: ChannelId,
        window: Option<WindowHandle>,
    },
    NotifyAnr {
        application: Option<Arc<InputApplication>>,
        window: Option<WindowHandle>,
        channel: Option<ChannelId>,
    },
    InterceptKeyBeforeDispatching {
        entry: EventRef,
        window: Option<WindowHandle>,
    },
    DispatchCycleFinished {
        channel: ChannelId,
        handled: bool,
    },
    PokeUserActivity {
        event_time: Nsecs,
        activity: UserActivityType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Policy,
    AppSwitch,
    Disabled,
    Blocked,
    Stale,
}

#[derive(Debug, Default)]
struct KeyRepeatState {
    last_key_entry: Option<EventRef>,
    next_repeat_time: Nsecs,
}

#[derive(Debug)]
struct ThrottleState {
    min_time_between_events: Option<Nsecs>,
    last_event_time: Nsecs,
    last_device_id: i32,
    last_source: InputSource,
    original_sample_count: usize,
}

/// Outcome of trying to fold a move sample into an existing event.
enum Batching {
    Batched,
    Streamed,
    NotBatched,
}

/// Everything guarded by the dispatcher lock.
struct DispatcherState {
    policy: Arc<dyn DispatcherPolicy>,
    config: DispatcherConfig,
    allocator: EventAllocator,
    signals: Arc<InjectionSignals>,

    inbound_queue: VecDeque<EventRef>,
    pending_event: Option<EventRef>,
    commands: VecDeque<Command>,

    app_switch_saw_key_down: bool,
    app_switch_due_time: Nsecs,
    next_unblocked_event: Option<EventRef>,

    key_repeat: KeyRepeatState,
    throttle: ThrottleState,

    dispatch_enabled: bool,
    dispatch_frozen: bool,
    input_filter_enabled: bool,

    connections: BTreeMap<ChannelId, Connection>,
    active_connections: Vec<ChannelId>,
    monitoring_channels: Vec<ChannelId>,

    windows: Vec<Arc<InputWindow>>,
    focused_window: Option<Arc<InputWindow>>,
    focused_application: Option<Arc<InputApplication>>,

    touch_state: TouchState,
    last_hover_window: Option<Arc<InputWindow>>,

    current_input_targets_valid: bool,
    current_input_targets: Vec<InputTarget>,

    anr: AnrState,
}

fn is_app_switch_key_code(key_code: i32) -> bool {
    key_code == keycodes::HOME || key_code == keycodes::ENDCALL
}

/// Meta state implied by modifier policy flags set by the device reader.
fn meta_state_for_policy_flags(policy_flags: PolicyFlags) -> MetaState {
    let mut meta_state = MetaState::empty();
    if policy_flags.contains(PolicyFlags::ALT) {
        meta_state |= MetaState::ALT_ON | MetaState::ALT_LEFT_ON;
    }
    if policy_flags.contains(PolicyFlags::ALT_GR) {
        meta_state |= MetaState::ALT_ON | MetaState::ALT_RIGHT_ON;
    }
    if policy_flags.contains(PolicyFlags::SHIFT) {
        meta_state |= MetaState::SHIFT_ON | MetaState::SHIFT_LEFT_ON;
    }
    if policy_flags.contains(PolicyFlags::CAPS_LOCK) {
        meta_state |= MetaState::CAPS_LOCK_ON;
    }
    if policy_flags.contains(PolicyFlags::FUNCTION) {
        meta_state |= MetaState::FUNCTION_ON;
    }
    meta_state
}

impl DispatcherState {
    fn new(
        policy: Arc<dyn DispatcherPolicy>,
        config: DispatcherConfig,
        allocator: EventAllocator,
        signals: Arc<InjectionSignals>,
    ) -> Self {
        let min_time_between_events = config.dispatcher.min_time_between_events();
        Self {
            policy,
            config,
            allocator,
            signals,
            inbound_queue: VecDeque::new(),
            pending_event: None,
            commands: VecDeque::new(),
            app_switch_saw_key_down: false,
            app_switch_due_time: Nsecs::MAX,
            next_unblocked_event: None,
            key_repeat: KeyRepeatState::default(),
            throttle: ThrottleState {
                min_time_between_events,
                last_event_time: 0,
                last_device_id: -1,
                last_source: InputSource::empty(),
                original_sample_count: 0,
            },
            dispatch_enabled: true,
            dispatch_frozen: false,
            input_filter_enabled: false,
            connections: BTreeMap::new(),
            active_connections: Vec::new(),
            monitoring_channels: Vec::new(),
            windows: Vec::new(),
            focused_window: None,
            focused_application: None,
            touch_state: TouchState::default(),
            last_hover_window: None,
            current_input_targets_valid: false,
            current_input_targets: Vec::new(),
            anr: AnrState::default(),
        }
    }

    /// One pass of the dispatch loop: picks the next event and dispatches it,
    /// pulling `next_wakeup` in to the earliest deadline that needs attention.
    fn dispatch_once_inner(&mut self, now: Nsecs, next_wakeup: &mut Nsecs) {
        if !self.policy.is_key_repeat_enabled() {
            self.reset_key_repeat();
        }

        if self.dispatch_frozen {
            debug!(target: log_targets::INBOUND, "Dispatch frozen.  Waiting some more.");
            return;
        }

        let mut is_app_switch_due = self.app_switch_due_time <= now;
        if self.app_switch_due_time < *next_wakeup {
            *next_wakeup = self.app_switch_due_time;
        }

        if self.pending_event.is_none() {
            if self.inbound_queue.is_empty() {
                if is_app_switch_due {
                    // The app switch key went away before the event it was racing.
                    self.reset_pending_app_switch(false);
                    is_app_switch_due = false;
                }

                if self.key_repeat.last_key_entry.is_some() {
                    if now >= self.key_repeat.next_repeat_time {
                        self.pending_event = self.synthesize_key_repeat(now);
                    } else if self.key_repeat.next_repeat_time < *next_wakeup {
                        *next_wakeup = self.key_repeat.next_repeat_time;
                    }
                }

                if self.pending_event.is_none() {
                    return;
                }
            } else {
                if self.throttle_inbound_motion(now, is_app_switch_due, next_wakeup) {
                    return;
                }
                self.pending_event = self.inbound_queue.pop_front();
            }
        }

        let Some(event) = self.pending_event.clone() else {
            return;
        };

        let (policy_flags, event_time, is_key, is_app_switch_key, is_motion) = {
            let entry = event.lock();
            let app_switch_key = entry
                .as_key()
                .is_some_and(|key| Self::is_app_switch_key_event(key, entry.policy_flags));
            (
                entry.policy_flags,
                entry.event_time,
                entry.as_key().is_some(),
                app_switch_key,
                entry.as_motion().is_some(),
            )
        };

        let mut drop_reason = if !policy_flags.contains(PolicyFlags::PASS_TO_USER) {
            Some(DropReason::Policy)
        } else if !self.dispatch_enabled {
            Some(DropReason::Disabled)
        } else {
            None
        };

        if self
            .next_unblocked_event
            .as_ref()
            .is_some_and(|unblocked| unblocked.ptr_eq(&event))
        {
            self.next_unblocked_event = None;
        }

        let done = if is_key {
            if is_app_switch_due {
                if is_app_switch_key {
                    self.reset_pending_app_switch(true);
                } else if drop_reason.is_none() {
                    drop_reason = Some(DropReason::AppSwitch);
                }
            }
            if drop_reason.is_none() && self.is_stale_event(now, event_time) {
                drop_reason = Some(DropReason::Stale);
            }
            if drop_reason.is_none() && self.next_unblocked_event.is_some() {
                drop_reason = Some(DropReason::Blocked);
            }
            self.dispatch_key(now, &event, &mut drop_reason, next_wakeup)
        } else if is_motion {
            if drop_reason.is_none() && is_app_switch_due {
                drop_reason = Some(DropReason::AppSwitch);
            }
            if drop_reason.is_none() && self.is_stale_event(now, event_time) {
                drop_reason = Some(DropReason::Stale);
            }
            if drop_reason.is_none() && self.next_unblocked_event.is_some() {
                drop_reason = Some(DropReason::Blocked);
            }
            self.dispatch_motion(now, &event, &mut drop_reason, next_wakeup)
        } else {
            drop_reason = None;
            self.dispatch_configuration_changed(event_time)
        };

        if done {
            if let Some(reason) = drop_reason {
                self.drop_inbound_event(now, &event, reason);
            }
            self.release_pending_event();
            *next_wakeup = Nsecs::MIN;
        }
    }

    /// Holds back a lone move that arrives faster than the configured rate.
    /// Returns true when the loop should wait instead of dequeuing.
    fn throttle_inbound_motion(&mut self, now: Nsecs, is_app_switch_due: bool, next_wakeup: &mut Nsecs) -> bool {
        let Some(min_time_between_events) = self.throttle.min_time_between_events else {
            return false;
        };
        let Some(head) = self.inbound_queue.front() else {
            return false;
        };
        let entry = head.lock();
        let Some(motion) = entry.as_motion() else {
            return false;
        };
        if is_app_switch_due
            || !self.dispatch_enabled
            || !entry.policy_flags.contains(PolicyFlags::PASS_TO_USER)
            || entry.is_injected()
        {
            self.throttle.original_sample_count = 0;
            return false;
        }

        let device_id = motion.device_id;
        let source = motion.source;
        if self.inbound_queue.len() == 1
            && matches!(motion.action, MotionAction::Move | MotionAction::HoverMove)
            && device_id == self.throttle.last_device_id
            && source == self.throttle.last_source
        {
            let next_time = self.throttle.last_event_time.saturating_add(min_time_between_events);
            if now < next_time {
                debug!(
                    target: log_targets::THROTTLING,
                    "Throttling - Delaying motion event for device {}, source 0x{:08x} by up to {:.3}ms.",
                    device_id,
                    source.bits(),
                    to_millis_f64(next_time - now)
                );
                if next_time < *next_wakeup {
                    *next_wakeup = next_time;
                }
                if self.throttle.original_sample_count == 0 {
                    self.throttle.original_sample_count = motion.samples.len();
                }
                return true;
            }
        }

        if self.throttle.original_sample_count != 0 {
            debug!(
                target: log_targets::THROTTLING,
                "Throttling - Motion event sample count grew by {} from {} in {:.3}ms.",
                motion.samples.len().saturating_sub(self.throttle.original_sample_count),
                self.throttle.original_sample_count,
                to_millis_f64(now.saturating_sub(self.throttle.last_event_time))
            );
            self.throttle.original_sample_count = 0;
        }

        self.throttle.last_event_time = now;
        self.throttle.last_device_id = device_id;
        self.throttle.last_source = source;
        false
    }

    /// Appends to the inbound queue. Returns true when the dispatch thread
    /// needs a wake to notice.
    fn enqueue_inbound_event(&mut self, event: EventRef) -> bool {
        let mut need_wake = self.inbound_queue.is_empty();

        {
            let entry = event.lock();
            match &entry.kind {
                EventKind::Key(key) if Self::is_app_switch_key_event(key, entry.policy_flags) => match key.action {
                    KeyAction::Down => self.app_switch_saw_key_down = true,
                    KeyAction::Up => {
                        if self.app_switch_saw_key_down {
                            debug!(target: log_targets::APP_SWITCH, "App switch is pending!");
                            self.app_switch_due_time =
                                entry.event_time.saturating_add(self.config.timeouts.app_switch_timeout());
                            self.app_switch_saw_key_down = false;
                            need_wake = true;
                        }
                    }
                },
                EventKind::Motion(motion)
                    if motion.action == MotionAction::Down
                        && motion.source.is_pointer()
                        && self.anr.cause == InputTargetWaitCause::ApplicationNotReady =>
                {
                    // A touch outside the unresponsive application lets the
                    // user switch away without waiting for the ANR timeout.
                    if let Some(waiting_for) = self.anr.application.clone() {
                        let (x, y) = motion.first_point(0);
                        let touched_elsewhere = self
                            .find_touched_window_at(x, y)
                            .is_some_and(|window| !window.same_application(&waiting_for));
                        if touched_elsewhere {
                            debug!(
                                target: log_targets::APP_SWITCH,
                                "Pruning input queue because user touched a different application."
                            );
                            self.next_unblocked_event = Some(event.clone());
                            need_wake = true;
                        }
                    }
                }
                _ => {}
            }
        }

        self.inbound_queue.push_back(event);
        need_wake
    }

    fn is_app_switch_key_event(key: &KeyEntry, policy_flags: PolicyFlags) -> bool {
        !key.flags.contains(KeyFlags::CANCELED)
            && is_app_switch_key_code(key.key_code)
            && policy_flags.contains(PolicyFlags::TRUSTED)
            && policy_flags.contains(PolicyFlags::PASS_TO_USER)
    }

    fn is_app_switch_pending(&self) -> bool {
        self.app_switch_due_time != Nsecs::MAX
    }

    fn reset_pending_app_switch(&mut self, handled: bool) {
        self.app_switch_due_time = Nsecs::MAX;
        if handled {
            debug!(target: log_targets::APP_SWITCH, "App switch has arrived.");
        } else {
            debug!(target: log_targets::APP_SWITCH, "App switch was abandoned.");
        }
    }

    fn is_stale_event(&self, now: Nsecs, event_time: Nsecs) -> bool {
        now.saturating_sub(event_time) >= self.config.timeouts.stale_event_timeout()
    }

    fn drop_inbound_event(&mut self, now: Nsecs, event: &EventRef, reason: DropReason) {
        let reason_text = match reason {
            DropReason::Policy => {
                debug!(target: log_targets::INBOUND, "Dropped event because policy consumed it.");
                "inbound event was dropped because the policy consumed it"
            }
            DropReason::Disabled => {
                info!("Dropped event because input dispatch is disabled.");
                "inbound event was dropped because input dispatch is disabled"
            }
            DropReason::AppSwitch => {
                info!("Dropped event because of pending overdue app switch.");
                "inbound event was dropped because of pending overdue app switch"
            }
            DropReason::Blocked => {
                info!(
                    "Dropped event because the current application is not responding and the user \
                     has started interacting with a different application."
                );
                "inbound event was dropped because the current application is not responding \
                 and the user has started interacting with a different application"
            }
            DropReason::Stale => {
                info!("Dropped event because it is stale.");
                "inbound event was dropped because it is stale"
            }
        };

        let mode = {
            let entry = event.lock();
            match &entry.kind {
                EventKind::Key(_) => Some(CancelationMode::NonPointer),
                EventKind::Motion(motion) if motion.source.is_pointer() => Some(CancelationMode::Pointer),
                EventKind::Motion(_) => Some(CancelationMode::NonPointer),
                EventKind::ConfigurationChanged => None,
            }
        };
        if let Some(mode) = mode {
            let options = CancelationOptions::new(mode, reason_text);
            self.synthesize_cancelation_events_for_all_connections(now, &options);
        }
    }

    /// Lets go of the pending event. The current targets stay valid so later
    /// samples can stream into the dispatch that is still in flight.
    fn release_pending_event(&mut self) {
        if let Some(event) = self.pending_event.take() {
            self.release_inbound_event(event);
        }
    }

    fn release_inbound_event(&mut self, event: EventRef) {
        {
            let entry = event.lock();
            let pending = entry
                .injection_state
                .as_ref()
                .is_some_and(|state| state.result() == InjectionResult::Pending);
            if pending {
                debug!(target: log_targets::INJECTION, "Injected inbound event was dropped.");
                self.set_injection_result(&entry, InjectionResult::Failed);
            }
        }
        if self
            .next_unblocked_event
            .as_ref()
            .is_some_and(|unblocked| unblocked.ptr_eq(&event))
        {
            self.next_unblocked_event = None;
        }
    }

    fn drain_inbound_queue(&mut self) {
        while let Some(event) = self.inbound_queue.pop_front() {
            self.release_inbound_event(event);
        }
    }

    fn reset_key_repeat(&mut self) {
        self.key_repeat.last_key_entry = None;
    }

    /// Produces the next repeat of the last key, reusing its entry when no
    /// queue still holds it.
    fn synthesize_key_repeat(&mut self, now: Nsecs) -> Option<EventRef> {
        let last = self.key_repeat.last_key_entry.take()?;
        let policy_flags = {
            let entry = last.lock();
            (entry.policy_flags & PolicyFlags::RAW_MASK) | PolicyFlags::PASS_TO_USER | PolicyFlags::TRUSTED
        };

        let repeat = if last.holders() == 1 {
            {
                let mut entry = last.lock();
                entry.event_time = now;
                entry.policy_flags = policy_flags;
                entry.dispatch_in_progress = false;
                entry.injection_state = None;
                let key = entry.as_key_mut()?;
                key.repeat_count += 1;
                key.synthetic_repeat = true;
                key.intercept_key_result = InterceptKeyResult::Unknown;
            }
            last
        } else {
            let mut key = last.lock().as_key()?.clone();
            key.repeat_count += 1;
            key.synthetic_repeat = true;
            key.intercept_key_result = InterceptKeyResult::Unknown;
            self.allocator.obtain_key(now, policy_flags, key)
        };

        self.key_repeat.last_key_entry = Some(repeat.clone());
        self.key_repeat.next_repeat_time = now + self.config.dispatcher.key_repeat_delay();

        debug!(target: log_targets::INBOUND, "synthesizeKeyRepeat - {}", *repeat.lock());
        Some(repeat)
    }

    fn dispatch_configuration_changed(&mut self, event_time: Nsecs) -> bool {
        debug!(target: log_targets::OUTBOUND, "dispatchConfigurationChanged - eventTime={}", event_time);

        // Reset key repeating in case a keyboard device was added or removed.
        self.reset_key_repeat();
        self.commands
            .push_back(Command::NotifyConfigurationChanged { event_time });
        true
    }

    fn dispatch_key(
        &mut self,
        now: Nsecs,
        event: &EventRef,
        drop_reason: &mut Option<DropReason>,
        next_wakeup: &mut Nsecs,
    ) -> bool {
        let preprocess = !event.lock().dispatch_in_progress;
        if preprocess {
            self.preprocess_key(event);
        }

        let (intercept, policy_flags) = {
            let entry = event.lock();
            let Some(key) = entry.as_key() else {
                return true;
            };
            (key.intercept_key_result, entry.policy_flags)
        };

        match intercept {
            InterceptKeyResult::Unknown => {
                if policy_flags.contains(PolicyFlags::PASS_TO_USER) {
                    self.commands.push_back(Command::InterceptKeyBeforeDispatching {
                        entry: event.clone(),
                        window: self.focused_window.as_ref().map(|window| window.handle.clone()),
                    });
                    // Resumed once the policy has decided.
                    return false;
                }
                if let Some(key) = event.lock().as_key_mut() {
                    key.intercept_key_result = InterceptKeyResult::Continue;
                }
            }
            InterceptKeyResult::Skip => {
                if drop_reason.is_none() {
                    *drop_reason = Some(DropReason::Policy);
                }
            }
            InterceptKeyResult::Continue => {}
        }

        if let Some(reason) = *drop_reason {
            self.reset_targets();
            let result = if reason == DropReason::Policy {
                InjectionResult::Succeeded
            } else {
                InjectionResult::Failed
            };
            self.set_injection_result(&event.lock(), result);
            return true;
        }

        if !self.current_input_targets_valid {
            let result = self.find_focused_window_targets(now, event, next_wakeup);
            if result == InjectionResult::Pending {
                return false;
            }

            self.set_injection_result(&event.lock(), result);
            if result != InjectionResult::Succeeded {
                return true;
            }

            self.add_monitoring_targets();
            self.commit_targets();
        }

        self.dispatch_event_to_current_targets(now, event, false);
        true
    }

    /// First look at a key: repeat bookkeeping and the long press flag.
    fn preprocess_key(&mut self, event: &EventRef) {
        let key_repeat_timeout = self.config.dispatcher.key_repeat_timeout();
        let previous_repeat = {
            let entry = event.lock();
            let Some(key) = entry.as_key() else {
                return;
            };
            let candidate = key.repeat_count == 0
                && key.action == KeyAction::Down
                && entry.policy_flags.contains(PolicyFlags::TRUSTED)
                && !entry.policy_flags.contains(PolicyFlags::DISABLE_KEY_REPEAT);
            if candidate {
                let key_code = key.key_code;
                let previous = self
                    .key_repeat
                    .last_key_entry
                    .as_ref()
                    .filter(|last| !last.ptr_eq(event))
                    .and_then(|last| {
                        let last = last.lock();
                        last.as_key()
                            .filter(|last_key| last_key.key_code == key_code)
                            .map(|last_key| last_key.repeat_count)
                    });
                Some((previous, entry.event_time))
            } else {
                None
            }
        };

        let mut entry = event.lock();
        let event_time = entry.event_time;
        match previous_repeat {
            Some((Some(previous_count), _)) => {
                // The device is generating repeats itself, so stop synthesizing them.
                if let Some(key) = entry.as_key_mut() {
                    key.repeat_count = previous_count + 1;
                }
                self.key_repeat.last_key_entry = Some(event.clone());
                self.key_repeat.next_repeat_time = Nsecs::MAX;
            }
            Some((None, first_event_time)) => {
                self.key_repeat.last_key_entry = Some(event.clone());
                self.key_repeat.next_repeat_time = first_event_time.saturating_add(key_repeat_timeout);
            }
            None => {
                let synthetic = entry.as_key().is_some_and(|key| key.synthetic_repeat);
                if !synthetic {
                    self.key_repeat.last_key_entry = None;
                }
            }
        }

        if let Some(key) = entry.as_key_mut() {
            if key.repeat_count == 1 {
                key.flags |= KeyFlags::LONG_PRESS;
            }
        }
        entry.dispatch_in_progress = true;
        debug!(target: log_targets::OUTBOUND, "dispatchKey - eventTime={}, {}", event_time, *entry);
        drop(entry);

        self.reset_targets();
    }

    fn dispatch_motion(
        &mut self,
        now: Nsecs,
        event: &EventRef,
        drop_reason: &mut Option<DropReason>,
        next_wakeup: &mut Nsecs,
    ) -> bool {
        let is_pointer_event = {
            let mut entry = event.lock();
            if !entry.dispatch_in_progress {
                entry.dispatch_in_progress = true;
                debug!(target: log_targets::OUTBOUND, "dispatchMotion - {}", *entry);
                drop(entry);
                self.reset_targets();
                entry = event.lock();
            }

            if let Some(reason) = *drop_reason {
                let result = if reason == DropReason::Policy {
                    InjectionResult::Succeeded
                } else {
                    InjectionResult::Failed
                };
                drop(entry);
                self.reset_targets();
                self.set_injection_result(&event.lock(), result);
                return true;
            }

            entry.as_motion().is_some_and(|motion| motion.source.is_pointer())
        };

        let mut conflicting_pointer_actions = false;
        if !self.current_input_targets_valid {
            let (result, split_batch_after_sample) = if is_pointer_event {
                let resolution = self.find_touched_window_targets(now, event, next_wakeup);
                conflicting_pointer_actions = resolution.conflicting_pointer_actions;
                (resolution.result, resolution.split_batch_after_sample)
            } else {
                (self.find_focused_window_targets(now, event, next_wakeup), None)
            };
            if result == InjectionResult::Pending {
                return false;
            }

            self.set_injection_result(&event.lock(), result);
            if result != InjectionResult::Succeeded {
                return true;
            }

            self.add_monitoring_targets();
            self.commit_targets();

            if let Some(last_sample_index) = split_batch_after_sample {
                self.split_batch(event, last_sample_index);
            }
        }

        if conflicting_pointer_actions {
            let options = CancelationOptions::new(CancelationMode::Pointer, "conflicting pointer actions");
            self.synthesize_cancelation_events_for_all_connections(now, &options);
        }

        self.dispatch_event_to_current_targets(now, event, false);
        true
    }

    /// Moves every sample after `last_sample_index` into a new event at the
    /// head of the inbound queue. Used when the touched windows changed
    /// partway through a batch.
    fn split_batch(&mut self, event: &EventRef, last_sample_index: usize) {
        let next = {
            let mut entry = event.lock();
            let policy_flags = entry.policy_flags;
            let injection_state = entry.injection_state.clone();
            let Some(motion) = entry.as_motion_mut() else {
                return;
            };
            if last_sample_index + 1 >= motion.samples.len() {
                return;
            }

            let original_sample_count = motion.samples.len();
            let rest = motion.samples.split_off(last_sample_index + 1);
            let event_time = rest[0].event_time;
            let rest_count = rest.len();
            let next_motion = MotionEntry {
                samples: rest,
                ..motion.clone()
            };

            debug!(
                target: log_targets::BATCHING,
                "Split batch of {} samples into two parts, first part has {} samples, second part has {} samples.",
                original_sample_count,
                original_sample_count - rest_count,
                rest_count
            );

            let next = self.allocator.obtain_motion(event_time, policy_flags, next_motion);
            next.lock().injection_state = injection_state;
            next
        };
        self.inbound_queue.push_front(next);
    }

    fn dispatch_event_to_current_targets(&mut self, now: Nsecs, event: &EventRef, resume_with_appended_motion_sample: bool) {
        debug!(target: log_targets::DISPATCH_CYCLE, "dispatchEventToCurrentInputTargets");

        self.poke_user_activity(&event.lock());

        let targets = std::mem::take(&mut self.current_input_targets);
        for target in &targets {
            if self.connections.contains_key(&target.channel) {
                self.prepare_dispatch_cycle(now, target.channel, event, target, resume_with_appended_motion_sample);
            } else {
                debug!(
                    target: log_targets::DISPATCH_CYCLE,
                    "Dropping event delivery to target with channel {} because it is no longer registered with the input dispatcher.",
                    target.channel
                );
            }
        }
        self.current_input_targets = targets;
    }

    fn poke_user_activity(&mut self, entry: &EventEntry) {
        let activity = match &entry.kind {
            EventKind::Motion(motion) => {
                if motion.action == MotionAction::Cancel {
                    return;
                }
                let is_touch = motion.source.is_pointer()
                    && !motion.action.is_hover()
                    && motion.action != MotionAction::Scroll;
                if is_touch {
                    UserActivityType::Touch
                } else {
                    UserActivityType::Other
                }
            }
            EventKind::Key(key) => {
                if key.flags.contains(KeyFlags::CANCELED) {
                    return;
                }
                UserActivityType::Button
            }
            EventKind::ConfigurationChanged => UserActivityType::Other,
        };
        self.commands.push_back(Command::PokeUserActivity {
            event_time: entry.event_time,
            activity,
        });
    }

    fn reset_targets(&mut self) {
        self.current_input_targets_valid = false;
        self.current_input_targets.clear();
        self.anr.cause = InputTargetWaitCause::None;
        self.anr.application = None;
    }

    fn commit_targets(&mut self) {
        self.current_input_targets_valid = true;
    }

    /// Tries to fold a move into the inbound queue, the pending event or
    /// the event currently being dispatched.
    fn batch_motion_sample(&mut self, now: Nsecs, args: &NotifyMotionArgs, action: MotionAction) -> Batching {
        if !matches!(action, MotionAction::Move | MotionAction::HoverMove) {
            return Batching::NotBatched;
        }

        let queued = self.inbound_queue.iter().rev().find(|event| {
            event
                .lock()
                .as_motion()
                .is_some_and(|motion| motion.device_id == args.device_id && motion.source == args.source)
        });
        if let Some(event) = queued {
            let mut entry = event.lock();
            let injected = entry.is_injected();
            let Some(motion) = entry.as_motion_mut() else {
                return Batching::NotBatched;
            };
            if !motion.can_append_samples(action, &args.pointer_properties, injected) {
                return Batching::NotBatched;
            }
            self.batch_motion(
                motion,
                args,
                "most recent motion event for this device and source in the inbound queue",
            );
            return Batching::Batched;
        }

        if let Some(event) = &self.pending_event {
            let mut entry = event.lock();
            let batchable = !entry.dispatch_in_progress || !self.current_input_targets_valid;
            let injected = entry.is_injected();
            if let Some(motion) = entry.as_motion_mut().filter(|_| batchable) {
                if motion.device_id == args.device_id && motion.source == args.source {
                    if !motion.can_append_samples(action, &args.pointer_properties, injected) {
                        return Batching::NotBatched;
                    }
                    self.batch_motion(motion, args, "pending motion event");
                    return Batching::Batched;
                }
            }
        }

        if !self.current_input_targets_valid {
            return Batching::NotBatched;
        }

        let mut streamed_event = None;
        for target in &self.current_input_targets {
            if !target.flags.contains(TargetFlags::FOREGROUND) {
                continue;
            }
            let Some(connection) = self.connections.get(&target.channel) else {
                continue;
            };
            let Some(head) = connection.outbound_queue.front() else {
                continue;
            };
            if !head.in_progress || head.is_split() {
                continue;
            }

            let event = head.event.clone();
            {
                let entry = event.lock();
                let compatible = entry.as_motion().is_some_and(|motion| {
                    motion.action == action
                        && motion.device_id == args.device_id
                        && motion.source == args.source
                        && motion.pointer_count() == args.pointer_properties.len()
                }) && !entry.is_injected();
                if !compatible {
                    continue;
                }
            }

            if action == MotionAction::HoverMove {
                let Some(last_hover) = &self.last_hover_window else {
                    debug!(target: log_targets::BATCHING, "Not streaming hover move because there is no last hovered window.");
                    return Batching::NotBatched;
                };
                let coords = &args.pointer_coords[0];
                let hover = self.find_touched_window_at(coords.x as i32, coords.y as i32);
                if hover.as_ref().map(|window| &window.handle) != Some(&last_hover.handle) {
                    debug!(
                        target: log_targets::BATCHING,
                        "Not streaming hover move because the last hovered window is '{}' but the currently hovered window is '{}'.",
                        last_hover.name(),
                        hover.as_ref().map_or("<null>", |window| window.name())
                    );
                    return Batching::NotBatched;
                }
            }

            streamed_event = Some(event);
            break;
        }

        let Some(event) = streamed_event else {
            return Batching::NotBatched;
        };
        if let Some(motion) = event.lock().as_motion_mut() {
            motion.append_sample(args.event_time, args.pointer_coords.clone());
        }
        debug!(
            target: log_targets::BATCHING,
            "Appended motion sample onto batch for most recently dispatched motion event for this device and source in the outbound queues.  Attempting to stream the motion sample."
        );
        self.dispatch_event_to_current_targets(now, &event, true);
        Batching::Streamed
    }

    /// Appends a sample to `motion`, or overwrites its last sample when the
    /// two arrived within the coalesce interval.
    fn batch_motion(&self, motion: &mut MotionEntry, args: &NotifyMotionArgs, description: &str) {
        motion.meta_state |= args.meta_state;

        let coalesce_interval = self.config.timeouts.motion_sample_coalesce_interval();
        let last_index = motion.last_sample_index();
        let interval = args
            .event_time
            .saturating_sub(motion.samples[last_index].event_time_before_coalescing);
        if interval <= coalesce_interval {
            let last = &mut motion.samples[last_index];
            last.pointer_coords = args.pointer_coords.clone();
            last.event_time = args.event_time;
            debug!(
                target: log_targets::BATCHING,
                "Coalesced motion into last sample of batch for {}, events were {:.3} ms apart",
                description,
                to_millis_f64(interval)
            );
        } else {
            motion.append_sample(args.event_time, args.pointer_coords.clone());
            debug!(
                target: log_targets::BATCHING,
                "Appended motion sample onto batch for {}, events were {:.3} ms apart",
                description,
                to_millis_f64(interval)
            );
        }
    }

    fn window_for_channel(&self, channel: ChannelId) -> Option<Arc<InputWindow>> {
        self.windows.iter().find(|window| window.channel == channel).cloned()
    }

    fn reset_and_drop_everything(&mut self, now: Nsecs, reason: &'static str) {
        debug!(target: log_targets::FOCUS, "Resetting and dropping all events ({}).", reason);

        let options = CancelationOptions::new(CancelationMode::All, reason);
        self.synthesize_cancelation_events_for_all_connections(now, &options);

        self.reset_key_repeat();
        self.release_pending_event();
        self.drain_inbound_queue();
        self.reset_targets();

        self.touch_state.reset();
        self.last_hover_window = None;
    }
}

/// Routes input events from producers to the windows that should receive them.
pub struct InputDispatcher {
    state: Mutex<DispatcherState>,
    policy: Arc<dyn DispatcherPolicy>,
    clock: Arc<dyn Clock>,
    looper: Arc<Looper>,
    allocator: EventAllocator,
    signals: Arc<InjectionSignals>,
}

impl InputDispatcher {
    pub fn new(policy: Arc<dyn DispatcherPolicy>, clock: Arc<dyn Clock>) -> Self {
        let config = policy.dispatcher_configuration();
        info!(
            "🔧 Input dispatcher configured: max {} events/s, key repeat {}ms/{}ms",
            config.dispatcher.max_events_per_second,
            config.dispatcher.key_repeat_timeout_ms,
            config.dispatcher.key_repeat_delay_ms
        );

        let allocator = EventAllocator::new();
        let signals = Arc::new(InjectionSignals::default());
        let state = DispatcherState::new(Arc::clone(&policy), config, allocator.clone(), Arc::clone(&signals));

        Self {
            state: Mutex::new(state),
            policy,
            clock,
            looper: Looper::new(),
            allocator,
            signals,
        }
    }

    /// The poll primitive the dispatch thread sleeps on.
    pub fn looper(&self) -> &Arc<Looper> {
        &self.looper
    }

    pub fn config(&self) -> DispatcherConfig {
        self.state.lock().config.clone()
    }

    /// Number of event records still alive anywhere in the dispatcher.
    pub fn live_entries(&self) -> usize {
        self.allocator.live_entries()
    }

    /// Runs one iteration of the dispatch loop, then sleeps until the next
    /// deadline, a wake or channel readiness, and handles whatever became
    /// ready.
    pub fn dispatch_once(&self) {
        let next_wakeup = self.run_iteration();
        let timeout = poll_timeout(self.clock.now(), next_wakeup);
        let ready = self.looper.poll_once(timeout);
        self.handle_ready_channels(ready);
    }

    /// Handles channel readiness already posted and runs one iteration
    /// without sleeping. Returns the next wakeup time, `Nsecs::MIN` when more
    /// work is immediately due.
    pub fn dispatch_pending(&self) -> Nsecs {
        let ready = self.looper.poll_once(Some(Duration::ZERO));
        let had_ready = !ready.is_empty();
        self.handle_ready_channels(ready);
        let next_wakeup = self.run_iteration();
        if had_ready {
            Nsecs::MIN
        } else {
            next_wakeup
        }
    }

    fn run_iteration(&self) -> Nsecs {
        let mut state = self.state.lock();
        let mut next_wakeup = Nsecs::MAX;
        state.dispatch_once_inner(self.clock.now(), &mut next_wakeup);
        if self.run_commands(&mut state) {
            next_wakeup = Nsecs::MIN;
        }
        next_wakeup
    }

    fn handle_ready_channels(&self, ready: Vec<(ChannelId, PollEvents)>) {
        for (channel, events) in ready {
            self.handle_receive_callback(channel, events);
        }
    }

    pub fn notify_configuration_changed(&self, event_time: Nsecs) {
        debug!(target: log_targets::INBOUND, "notifyConfigurationChanged - eventTime={}", event_time);

        let need_wake = {
            let mut state = self.state.lock();
            let entry = state.allocator.obtain_configuration_changed(event_time);
            state.enqueue_inbound_event(entry)
        };
        if need_wake {
            self.looper.wake();
        }
    }

    pub fn notify_key(&self, args: NotifyKeyArgs) -> Result<(), DispatchError> {
        debug!(
            target: log_targets::INBOUND,
            "notifyKey - eventTime={}, deviceId={}, source=0x{:x}, policyFlags=0x{:x}, action=0x{:x}, flags=0x{:x}, keyCode=0x{:x}, scanCode=0x{:x}, metaState=0x{:x}, downTime={}",
            args.event_time,
            args.device_id,
            args.source.bits(),
            args.policy_flags.bits(),
            args.action,
            args.flags.bits(),
            args.key_code,
            args.scan_code,
            args.meta_state.bits(),
            args.down_time
        );
        let action = validate_key_action(args.action)?;

        let mut policy_flags = args.policy_flags;
        let mut flags = args.flags;
        if policy_flags.contains(PolicyFlags::VIRTUAL) || flags.contains(KeyFlags::VIRTUAL_HARD_KEY) {
            policy_flags |= PolicyFlags::VIRTUAL;
            flags |= KeyFlags::VIRTUAL_HARD_KEY;
        }
        let meta_state = args.meta_state | meta_state_for_policy_flags(policy_flags);
        policy_flags |= PolicyFlags::TRUSTED;

        let mut event = KeyEvent {
            device_id: args.device_id,
            source: args.source,
            action,
            flags,
            key_code: args.key_code,
            scan_code: args.scan_code,
            meta_state,
            repeat_count: 0,
            down_time: args.down_time,
            event_time: args.event_time,
        };
        self.policy.intercept_key_before_queueing(&event, &mut policy_flags);
        if policy_flags.contains(PolicyFlags::WOKE_HERE) {
            event.flags |= KeyFlags::WOKE_HERE;
        }

        let need_wake = {
            let mut state = self.state.lock();
            if state.input_filter_enabled {
                policy_flags |= PolicyFlags::FILTERED;
                let filtered = InputEvent::Key(event.clone());
                let keep = MutexGuard::unlocked(&mut state, || self.policy.filter_input_event(&filtered, policy_flags));
                if !keep {
                    return Ok(());
                }
            }

            let entry = state
                .allocator
                .obtain_key(args.event_time, policy_flags, KeyEntry::from_event(&event));
            state.enqueue_inbound_event(entry)
        };
        if need_wake {
            self.looper.wake();
        }
        Ok(())
    }

    pub fn notify_motion(&self, args: NotifyMotionArgs) -> Result<(), DispatchError> {
        debug!(
            target: log_targets::INBOUND,
            "notifyMotion - eventTime={}, deviceId={}, source=0x{:x}, policyFlags=0x{:x}, action=0x{:x}, flags=0x{:x}, metaState=0x{:x}, buttonState=0x{:x}, edgeFlags=0x{:x}, xPrecision={}, yPrecision={}, downTime={}",
            args.event_time,
            args.device_id,
            args.source.bits(),
            args.policy_flags.bits(),
            args.action,
            args.flags.bits(),
            args.meta_state.bits(),
            args.button_state,
            args.edge_flags,
            args.x_precision,
            args.y_precision,
            args.down_time
        );
        let action = validate_motion_event(args.action, &args.pointer_properties)?;
        if args.pointer_coords.len() != args.pointer_properties.len() {
            return Err(DispatchError::SampleSizeMismatch {
                expected: args.pointer_properties.len(),
                actual: args.pointer_coords.len(),
            });
        }

        let mut policy_flags = args.policy_flags | PolicyFlags::TRUSTED;
        self.policy.intercept_motion_before_queueing(args.event_time, &mut policy_flags);

        let mut state = self.state.lock();
        if state.input_filter_enabled {
            policy_flags |= PolicyFlags::FILTERED;
            let filtered = InputEvent::Motion(args.to_motion_event(action));
            let keep = MutexGuard::unlocked(&mut state, || self.policy.filter_input_event(&filtered, policy_flags));
            if !keep {
                return Ok(());
            }
        }

        match state.batch_motion_sample(self.clock.now(), &args, action) {
            Batching::Batched => return Ok(()),
            Batching::Streamed => {
                self.run_commands(&mut state);
                return Ok(());
            }
            Batching::NotBatched => {}
        }

        let motion = MotionEntry {
            device_id: args.device_id,
            source: args.source,
            action,
            flags: args.flags,
            meta_state: args.meta_state,
            button_state: args.button_state,
            edge_flags: args.edge_flags,
            x_precision: args.x_precision,
            y_precision: args.y_precision,
            down_time: args.down_time,
            pointer_properties: args.pointer_properties,
            samples: vec![MotionSample::new(args.event_time, args.pointer_coords)],
        };
        let entry = state.allocator.obtain_motion(args.event_time, policy_flags, motion);
        let need_wake = state.enqueue_inbound_event(entry);
        drop(state);

        if need_wake {
            self.looper.wake();
        }
        Ok(())
    }

    pub fn notify_switch(&self, when: Nsecs, switch_code: i32, switch_value: i32, policy_flags: PolicyFlags) {
        debug!(
            target: log_targets::INBOUND,
            "notifySwitch - switchCode={}, switchValue={}, policyFlags=0x{:x}",
            switch_code,
            switch_value,
            policy_flags.bits()
        );
        self.policy
            .notify_switch(when, switch_code, switch_value, policy_flags | PolicyFlags::TRUSTED);
    }

    /// Drains the command queue, releasing the lock around each policy call.
    /// Returns true if any command ran.
    fn run_commands(&self, state: &mut MutexGuard<'_, DispatcherState>) -> bool {
        let mut ran = false;
        while let Some(command) = state.commands.pop_front() {
            ran = true;
            self.run_command(state, command);
        }
        ran
    }

    fn run_command(&self, state: &mut MutexGuard<'_, DispatcherState>, command: Command) {
        match command {
            Command::NotifyConfigurationChanged { event_time } => {
                MutexGuard::unlocked(state, || self.policy.notify_configuration_changed(event_time));
            }
            Command::NotifyInputChannelBroken { channel, window } => {
                let alive = state
                    .connections
                    .get(&channel)
                    .is_some_and(|connection| connection.status != ConnectionStatus::Zombie);
                if alive {
                    MutexGuard::unlocked(state, || self.policy.notify_input_channel_broken(window.as_ref()));
                }
            }
            Command::NotifyAnr {
                application,
                window,
                channel,
            } => {
                let new_timeout =
                    MutexGuard::unlocked(state, || self.policy.notify_anr(application.as_ref(), window.as_ref()));
                let now = self.clock.now();
                state.resume_after_targets_not_ready_timeout(now, new_timeout, channel);
            }
            Command::InterceptKeyBeforeDispatching { entry, window } => {
                let request = {
                    let locked = entry.lock();
                    locked
                        .as_key()
                        .map(|key| (key.to_event(locked.event_time), locked.policy_flags))
                };
                let Some((event, policy_flags)) = request else {
                    return;
                };
                let consumed = MutexGuard::unlocked(state, || {
                    self.policy
                        .intercept_key_before_dispatching(window.as_ref(), &event, policy_flags)
                });
                if let Some(key) = entry.lock().as_key_mut() {
                    key.intercept_key_result = if consumed {
                        InterceptKeyResult::Skip
                    } else {
                        InterceptKeyResult::Continue
                    };
                }
            }
            Command::DispatchCycleFinished { channel, handled } => {
                self.dispatch_cycle_finished(state, channel, handled);
            }
            Command::PokeUserActivity { event_time, activity } => {
                MutexGuard::unlocked(state, || self.policy.poke_user_activity(event_time, activity));
            }
        }
    }

    fn dispatch_cycle_finished(&self, state: &mut MutexGuard<'_, DispatcherState>, channel: ChannelId, handled: bool) {
        let Some(connection) = state.connections.get(&channel) else {
            return;
        };
        let key_in_progress = connection
            .outbound_queue
            .front()
            .is_some_and(|head| head.in_progress && head.event.lock().as_key().is_some());

        let restarted = key_in_progress && self.after_key_event(state, channel, handled);
        if !restarted {
            let now = self.clock.now();
            state.start_next_dispatch_cycle(now, channel);
        }
    }

    /// Fallback key handling once a key has been acknowledged. Returns true
    /// when the head entry was replaced by a fallback key and its cycle
    /// restarted.
    fn after_key_event(&self, state: &mut MutexGuard<'_, DispatcherState>, channel: ChannelId, handled: bool) -> bool {
        let Some(connection) = state.connections.get_mut(&channel) else {
            return false;
        };
        let Some(head) = connection.outbound_queue.front() else {
            return false;
        };
        let has_foreground_target = head.has_foreground_target();
        let event = head.event.clone();
        let (key, event_time, policy_flags, injection_state) = {
            let entry = event.lock();
            let Some(key) = entry.as_key() else {
                return false;
            };
            (key.clone(), entry.event_time, entry.policy_flags, entry.injection_state.clone())
        };
        if key.flags.contains(KeyFlags::FALLBACK) {
            return false;
        }

        let original_key_code = key.key_code;
        let mut fallback_key_code = connection.input_state.fallback_key(original_key_code);
        if key.action == KeyAction::Up {
            connection.input_state.remove_fallback_key(original_key_code);
        }

        if handled || !has_foreground_target {
            // The application handled the key or lost focus, so any fallback
            // in flight for it has to go.
            if let Some(code) = fallback_key_code {
                if code != keycodes::UNKNOWN {
                    debug!(
                        target: log_targets::OUTBOUND,
                        "Unhandled key event: Canceling fallback key {} for original key {}.",
                        code,
                        original_key_code
                    );
                    let options = CancelationOptions::new(
                        CancelationMode::Fallback,
                        "application handled the original non-fallback key or is no longer a foreground target, canceling previously dispatched fallback key",
                    )
                    .for_key_code(code);
                    let now = self.clock.now();
                    state.synthesize_cancelation_events_for_connection(now, channel, &options);
                }
                if let Some(connection) = state.connections.get_mut(&channel) {
                    connection.input_state.remove_fallback_key(original_key_code);
                }
            }
            return false;
        }

        let initial_down = key.action == KeyAction::Down && key.repeat_count == 0;
        if fallback_key_code.is_none() && !initial_down {
            debug!(
                target: log_targets::OUTBOUND,
                "Unhandled key event: Skipping unhandled key event processing since this is not an initial down.  keyCode={}, action={:?}, repeatCount={}",
                original_key_code,
                key.action,
                key.repeat_count
            );
            return false;
        }

        debug!(target: log_targets::OUTBOUND, "Unhandled key event: Asking policy to perform fallback action.");
        let window = connection.window.clone();
        let key_event = key.to_event(event_time);
        let fallback_event = MutexGuard::unlocked(state, || {
            self.policy
                .dispatch_unhandled_key(window.as_ref(), &key_event, policy_flags)
        });

        let now = self.clock.now();
        let Some(connection) = state.connections.get_mut(&channel) else {
            return true;
        };
        if connection.status != ConnectionStatus::Normal {
            connection.input_state.remove_fallback_key(original_key_code);
            return true;
        }
        let same_head = connection
            .outbound_queue
            .front()
            .is_some_and(|head| head.event.ptr_eq(&event));
        if !same_head {
            return false;
        }

        // Latch the policy's answer on the initial down so the rest of the
        // key sequence gets the same fallback.
        if initial_down {
            let code = fallback_event.as_ref().map_or(keycodes::UNKNOWN, |event| event.key_code);
            connection.input_state.set_fallback_key(original_key_code, code);
            fallback_key_code = Some(code);
        }

        let mut fallback_key_code = fallback_key_code.unwrap_or(keycodes::UNKNOWN);
        let mut fallback_event = fallback_event;
        if fallback_key_code != keycodes::UNKNOWN
            && fallback_event
                .as_ref()
                .map_or(true, |event| event.key_code != fallback_key_code)
        {
            debug!(
                target: log_targets::OUTBOUND,
                "Unhandled key event: Policy requested to cancel fallback key {} for original key {}.",
                fallback_key_code,
                original_key_code
            );
            let options = CancelationOptions::new(CancelationMode::Fallback, "canceling fallback, policy no longer desires it")
                .for_key_code(fallback_key_code);
            state.synthesize_cancelation_events_for_connection(now, channel, &options);

            fallback_event = None;
            fallback_key_code = keycodes::UNKNOWN;
            if key.action != KeyAction::Up {
                if let Some(connection) = state.connections.get_mut(&channel) {
                    connection
                        .input_state
                        .set_fallback_key(original_key_code, fallback_key_code);
                }
            }
        }

        let Some(fallback) = fallback_event.filter(|_| fallback_key_code != keycodes::UNKNOWN) else {
            debug!(target: log_targets::OUTBOUND, "Unhandled key event: No fallback key.");
            return false;
        };

        debug!(
            target: log_targets::OUTBOUND,
            "Unhandled key event: Dispatching fallback key.  originalKeyCode={}, fallbackKeyCode={}, fallbackMetaState=0x{:x}",
            original_key_code,
            fallback_key_code,
            fallback.meta_state.bits()
        );

        let flags = fallback.flags | KeyFlags::FALLBACK;
        let fallback_key = KeyEntry {
            device_id: fallback.device_id,
            source: fallback.source,
            action: key.action,
            flags,
            key_code: fallback_key_code,
            scan_code: fallback.scan_code,
            meta_state: fallback.meta_state,
            repeat_count: fallback.repeat_count,
            down_time: fallback.down_time,
            synthetic_repeat: false,
            intercept_key_result: InterceptKeyResult::Continue,
        };

        let Some(connection) = state.connections.get_mut(&channel) else {
            return true;
        };
        if !connection.input_state.track_key(&fallback_key, key.action, flags) {
            return false;
        }

        let fallback_entry = state
            .allocator
            .obtain_key(fallback.event_time, policy_flags, fallback_key);
        fallback_entry.lock().injection_state = injection_state;

        let Some(head) = state
            .connections
            .get_mut(&channel)
            .and_then(|connection| connection.outbound_queue.front_mut())
        else {
            return true;
        };
        head.event = fallback_entry;
        head.resolved = ResolvedEvent::Key {
            action: key.action,
            flags,
        };
        head.in_progress = false;
        head.head_motion_sample = None;
        head.tail_motion_sample = None;

        state.start_dispatch_cycle(now, channel);
        true
    }

    /// Handles readiness of a channel: an acknowledgement or a hangup.
    fn handle_receive_callback(&self, channel: ChannelId, events: PollEvents) {
        let mut state = self.state.lock();
        let Some(connection) = state.connections.get(&channel) else {
            error!("Received spurious receive callback for unknown input channel {}.", channel);
            return;
        };
        let name = connection.name().to_string();
        let now = self.clock.now();

        if events.intersects(PollEvents::ERROR | PollEvents::HANGUP) {
            error!(
                "channel '{}' ~ Consumer closed input channel or an error occurred.  events={:?}",
                name, events
            );
            self.looper.remove_channel(channel);
            state.abort_broken_dispatch_cycle(now, channel);
            self.run_commands(&mut state);
            return;
        }

        if !events.contains(PollEvents::INPUT) {
            warn!(
                "channel '{}' ~ Received spurious callback for unhandled poll event.  events={:?}",
                name, events
            );
            return;
        }

        let finished = connection.publisher.receive_finished_signal();
        match finished {
            Ok(handled) => state.finish_dispatch_cycle(now, channel, handled),
            Err(ChannelError::WouldBlock) => {
                debug!(target: log_targets::DISPATCH_CYCLE, "channel '{}' ~ No finished signal yet.", name);
            }
            Err(err) => {
                error!("channel '{}' ~ Failed to receive finished signal.  error={}", name, err);
                state.abort_broken_dispatch_cycle(now, channel);
            }
        }
        self.run_commands(&mut state);
    }

    /// Replaces the window list. Windows are ordered front to back.
    pub fn set_input_windows(&self, windows: Vec<InputWindow>) {
        debug!(target: log_targets::FOCUS, "setInputWindows");
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let now = self.clock.now();

            let old_focused_channel = state.focused_window.as_ref().map(|window| window.channel);
            let old_hover_channel = state.last_hover_window.as_ref().map(|window| window.channel);

            state.windows = windows.into_iter().map(Arc::new).collect();
            state.focused_window = state.windows.iter().find(|window| window.has_focus).cloned();

            let new_focused_channel = state.focused_window.as_ref().map(|window| window.channel);
            if let Some(old_channel) = old_focused_channel {
                if new_focused_channel != Some(old_channel) {
                    debug!(target: log_targets::FOCUS, "Focus left window {}", old_channel);
                    let options = CancelationOptions::new(CancelationMode::NonPointer, "focus left window");
                    state.synthesize_cancelation_events_for_connection(now, old_channel, &options);
                }
            }
            if let Some(window) = &state.focused_window {
                if old_focused_channel != Some(window.channel) {
                    debug!(target: log_targets::FOCUS, "Focus entered window '{}'", window.name());
                }
            }

            let mut index = 0;
            while index < state.touch_state.windows.len() {
                let channel = state.touch_state.windows[index].channel();
                match state.window_for_channel(channel) {
                    Some(window) => {
                        state.touch_state.windows[index].window = window;
                        index += 1;
                    }
                    None => {
                        debug!(
                            target: log_targets::FOCUS,
                            "Touched window was removed: {}",
                            state.touch_state.windows[index].window.name()
                        );
                        let options = CancelationOptions::new(CancelationMode::Pointer, "touched window was removed");
                        state.synthesize_cancelation_events_for_connection(now, channel, &options);
                        state.touch_state.windows.remove(index);
                    }
                }
            }

            state.last_hover_window = old_hover_channel.and_then(|channel| state.window_for_channel(channel));
        }
        self.looper.wake();
    }

    pub fn set_focused_application(&self, application: Option<InputApplication>) {
        debug!(target: log_targets::FOCUS, "setFocusedApplication");
        {
            let mut state = self.state.lock();
            state.focused_application = application.map(Arc::new);
        }
        self.looper.wake();
    }

    pub fn set_input_dispatch_mode(&self, enabled: bool, frozen: bool) {
        debug!(target: log_targets::FOCUS, "setInputDispatchMode: enabled={}, frozen={}", enabled, frozen);

        let changed = {
            let mut state = self.state.lock();
            if state.dispatch_enabled == enabled && state.dispatch_frozen == frozen {
                false
            } else {
                if state.dispatch_frozen && !frozen {
                    state.reset_anr_timeouts();
                }
                if state.dispatch_enabled && !enabled {
                    let now = self.clock.now();
                    state.reset_and_drop_everything(now, "dispatcher is being disabled");
                }
                state.dispatch_enabled = enabled;
                state.dispatch_frozen = frozen;
                true
            }
        };
        if changed {
            self.looper.wake();
        }
    }

    pub fn set_input_filter_enabled(&self, enabled: bool) {
        debug!(target: log_targets::FOCUS, "setInputFilterEnabled: enabled={}", enabled);
        {
            let mut state = self.state.lock();
            if state.input_filter_enabled == enabled {
                return;
            }
            state.input_filter_enabled = enabled;
            let now = self.clock.now();
            state.reset_and_drop_everything(now, "input filter is being enabled or disabled");
        }
        self.looper.wake();
    }

    /// Moves the current touch gesture from one window to another. Returns
    /// false when `from` is not currently touched or either window is unknown.
    pub fn transfer_touch_focus(&self, from: ChannelId, to: ChannelId) -> bool {
        debug!(target: log_targets::FOCUS, "transferTouchFocus: fromChannel={}, toChannel={}", from, to);
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (Some(from_window), Some(to_window)) = (state.window_for_channel(from), state.window_for_channel(to))
            else {
                debug!(target: log_targets::FOCUS, "Cannot transfer focus because from or to window not found.");
                return false;
            };
            if from_window.handle == to_window.handle {
                debug!(target: log_targets::FOCUS, "Trivial transfer to same window.");
                return true;
            }

            let Some(index) = state
                .touch_state
                .windows
                .iter()
                .position(|touched| touched.window.handle == from_window.handle)
            else {
                debug!(target: log_targets::FOCUS, "Focus transfer failed because from window did not have focus.");
                return false;
            };

            let touched = state.touch_state.windows.remove(index);
            let flags = touched.flags & (TargetFlags::FOREGROUND | TargetFlags::SPLIT);
            let modes = touched.modes & DispatchModes::AS_IS;
            state
                .touch_state
                .add_or_update_window(&to_window, flags, modes, touched.pointer_ids);

            if state.connections.contains_key(&from) {
                if let Some(mut destination) = state.connections.remove(&to) {
                    if let Some(source) = state.connections.get(&from) {
                        source.input_state.copy_pointer_state_to(&mut destination.input_state);
                    }
                    state.connections.insert(to, destination);
                }

                let now = self.clock.now();
                let options = CancelationOptions::new(
                    CancelationMode::Pointer,
                    "transferring touch focus from this window to another window",
                );
                state.synthesize_cancelation_events_for_connection(now, from, &options);
            }
        }
        self.looper.wake();
        true
    }

    /// Registers the dispatcher end of a channel. Monitor channels receive a
    /// copy of every dispatched event.
    pub fn register_input_channel(
        &self,
        channel: InputChannel,
        window: Option<WindowHandle>,
        monitor: bool,
    ) -> Result<(), DispatchError> {
        debug!(
            target: log_targets::REGISTRATION,
            "channel '{}' ~ registerInputChannel - monitor={}",
            channel.name(),
            monitor
        );

        let mut state = self.state.lock();
        let id = channel.id();
        if state.connections.contains_key(&id) {
            warn!("Attempted to register already registered input channel '{}'", channel.name());
            return Err(DispatchError::ChannelAlreadyRegistered(channel.name().to_string()));
        }

        channel.attach(&self.looper);
        self.looper.add_channel(id);
        state.connections.insert(id, Connection::new(channel, window, monitor));
        if monitor {
            state.monitoring_channels.push(id);
        }

        self.run_commands(&mut state);
        Ok(())
    }

    pub fn unregister_input_channel(&self, channel: ChannelId) -> Result<(), DispatchError> {
        debug!(target: log_targets::REGISTRATION, "channel {} ~ unregisterInputChannel", channel);
        {
            let mut state = self.state.lock();
            let Some(connection) = state.remove_connection(channel) else {
                warn!("Attempted to unregister already unregistered input channel {}", channel);
                return Err(DispatchError::ChannelNotRegistered(channel));
            };
            debug!(
                target: log_targets::REGISTRATION,
                "channel '{}' ~ unregistered, status={}",
                connection.name(),
                connection.status.label()
            );
            self.looper.remove_channel(channel);
            self.run_commands(&mut state);
        }
        self.looper.wake();
        Ok(())
    }
}

impl Drop for InputDispatcher {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.reset_key_repeat();
        state.release_pending_event();
        state.drain_inbound_queue();
        let channels: Vec<ChannelId> = state.connections.keys().copied().collect();
        for channel in channels {
            state.remove_connection(channel);
        }
    }
}
