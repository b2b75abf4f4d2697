//! Shared fixtures for the dispatcher integration tests.
//!
//! A [`Harness`] drives an [`InputDispatcher`] on a [`ManualClock`] from the
//! test thread, and each [`FakeWindow`] plays the application end of a real
//! channel pair.

#![allow(dead_code)]

use input_dispatcher::channel::{open_pair, open_pair_with_buffer, InputChannel, InputMessage, KeyMessage, MotionMessage};
use input_dispatcher::config::DispatcherConfig;
use input_dispatcher::input::{
    InputEvent, InputSource, KeyAction, KeyEvent, MotionAction, PointerCoords, PointerProperties, PolicyFlags,
    UserActivityType,
};
use input_dispatcher::window::{InputApplication, InputWindow, Rectangle, WindowFlags, WindowHandle};
use input_dispatcher::{
    Clock, DispatcherPolicy, InjectionResult, InjectionSyncMode, InputConsumer, InputDispatcher, ManualClock, Nsecs,
    NotifyKeyArgs, NotifyMotionArgs,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Start of every test clock, far enough from zero that deadlines never underflow.
pub const START_TIME: Nsecs = 1_000_000_000_000;

pub const TOUCH_DEVICE: i32 = 1;
pub const KEYBOARD_DEVICE: i32 = 2;

/// A policy callback observed by [`FakePolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyCall {
    ConfigurationChanged(Nsecs),
    Anr { application: Option<String>, window: Option<String> },
    ChannelBroken(Option<String>),
    Switch { code: i32, value: i32 },
    FilterInputEvent,
    InterceptKeyBeforeDispatching(i32),
    UnhandledKey(i32),
    PokeUserActivity(UserActivityType),
}

/// Policy that records every callback and answers from test-controlled knobs.
#[derive(Debug)]
pub struct FakePolicy {
    config: DispatcherConfig,
    calls: Mutex<Vec<PolicyCall>>,
    anr_response: AtomicI64,
    consumed_keys: Mutex<HashSet<i32>>,
    fallbacks: Mutex<HashMap<i32, i32>>,
    inject_permission: AtomicBool,
    key_repeat_enabled: AtomicBool,
    filter_keeps_events: AtomicBool,
}

impl FakePolicy {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(Vec::new()),
            anr_response: AtomicI64::new(0),
            consumed_keys: Mutex::new(HashSet::new()),
            fallbacks: Mutex::new(HashMap::new()),
            inject_permission: AtomicBool::new(false),
            key_repeat_enabled: AtomicBool::new(true),
            filter_keeps_events: AtomicBool::new(true),
        }
    }

    pub fn calls(&self) -> Vec<PolicyCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<PolicyCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn anr_calls(&self) -> Vec<PolicyCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, PolicyCall::Anr { .. }))
            .collect()
    }

    /// Timeout returned from `notify_anr`; 0 gives up on the wait.
    pub fn set_anr_response(&self, timeout: Nsecs) {
        self.anr_response.store(timeout, Ordering::SeqCst);
    }

    pub fn consume_key_before_dispatching(&self, key_code: i32) {
        self.consumed_keys.lock().insert(key_code);
    }

    pub fn set_fallback(&self, key_code: i32, fallback_key_code: i32) {
        self.fallbacks.lock().insert(key_code, fallback_key_code);
    }

    pub fn clear_fallback(&self, key_code: i32) {
        self.fallbacks.lock().remove(&key_code);
    }

    pub fn set_inject_permission(&self, granted: bool) {
        self.inject_permission.store(granted, Ordering::SeqCst);
    }

    pub fn set_key_repeat_enabled(&self, enabled: bool) {
        self.key_repeat_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_filter_keeps_events(&self, keep: bool) {
        self.filter_keeps_events.store(keep, Ordering::SeqCst);
    }

    fn record(&self, call: PolicyCall) {
        self.calls.lock().push(call);
    }
}

impl DispatcherPolicy for FakePolicy {
    fn dispatcher_configuration(&self) -> DispatcherConfig {
        self.config.clone()
    }

    fn notify_configuration_changed(&self, when: Nsecs) {
        self.record(PolicyCall::ConfigurationChanged(when));
    }

    fn notify_anr(&self, application: Option<&Arc<InputApplication>>, window: Option<&WindowHandle>) -> Nsecs {
        self.record(PolicyCall::Anr {
            application: application.map(|app| app.name().to_string()),
            window: window.map(|window| window.name.to_string()),
        });
        self.anr_response.load(Ordering::SeqCst)
    }

    fn notify_input_channel_broken(&self, window: Option<&WindowHandle>) {
        self.record(PolicyCall::ChannelBroken(window.map(|window| window.name.to_string())));
    }

    fn notify_switch(&self, _when: Nsecs, switch_code: i32, switch_value: i32, _policy_flags: PolicyFlags) {
        self.record(PolicyCall::Switch {
            code: switch_code,
            value: switch_value,
        });
    }

    fn is_key_repeat_enabled(&self) -> bool {
        self.key_repeat_enabled.load(Ordering::SeqCst)
    }

    fn filter_input_event(&self, _event: &InputEvent, _policy_flags: PolicyFlags) -> bool {
        self.record(PolicyCall::FilterInputEvent);
        self.filter_keeps_events.load(Ordering::SeqCst)
    }

    fn intercept_key_before_dispatching(
        &self,
        _window: Option<&WindowHandle>,
        event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> bool {
        self.record(PolicyCall::InterceptKeyBeforeDispatching(event.key_code));
        self.consumed_keys.lock().contains(&event.key_code)
    }

    fn dispatch_unhandled_key(
        &self,
        _window: Option<&WindowHandle>,
        event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> Option<KeyEvent> {
        self.record(PolicyCall::UnhandledKey(event.key_code));
        let fallback = *self.fallbacks.lock().get(&event.key_code)?;
        Some(KeyEvent {
            key_code: fallback,
            ..event.clone()
        })
    }

    fn poke_user_activity(&self, _event_time: Nsecs, activity: UserActivityType) {
        self.record(PolicyCall::PokeUserActivity(activity));
    }

    fn check_inject_events_permission(&self, _injector_pid: i32, _injector_uid: i32) -> bool {
        self.inject_permission.load(Ordering::SeqCst)
    }
}

/// Configuration used by most tests: motion throttling off so moves are
/// dispatched as soon as they arrive.
pub fn test_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.dispatcher.max_events_per_second = 0;
    config
}

/// Application end of a registered window channel.
pub struct FakeWindow {
    pub window: InputWindow,
    pub consumer: InputConsumer,
}

impl FakeWindow {
    pub fn name(&self) -> &str {
        self.window.name()
    }

    /// Takes the next signaled message, if any.
    pub fn try_receive(&self) -> Option<InputMessage> {
        self.consumer.consume().expect("channel should be open")
    }

    pub fn receive(&self) -> InputMessage {
        self.try_receive()
            .unwrap_or_else(|| panic!("window '{}' expected an event", self.name()))
    }

    pub fn receive_key(&self) -> KeyMessage {
        match self.receive() {
            InputMessage::Key(key) => key,
            other => panic!("window '{}' expected a key, got {:?}", self.name(), other),
        }
    }

    pub fn receive_motion(&self) -> MotionMessage {
        match self.receive() {
            InputMessage::Motion(motion) => motion,
            other => panic!("window '{}' expected a motion, got {:?}", self.name(), other),
        }
    }

    pub fn finish(&self, handled: bool) {
        self.consumer
            .send_finished_signal(handled)
            .expect("finished signal should be accepted");
    }

    pub fn assert_idle(&self) {
        if let Some(message) = self.try_receive() {
            panic!("window '{}' received unexpected {:?}", self.name(), message);
        }
    }
}

/// Dispatcher on a manual clock, pumped from the test thread.
pub struct Harness {
    pub dispatcher: Arc<InputDispatcher>,
    pub clock: Arc<ManualClock>,
    pub policy: Arc<FakePolicy>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = Arc::new(ManualClock::new(START_TIME));
        let policy = Arc::new(FakePolicy::new(config));
        let dispatcher = Arc::new(InputDispatcher::new(policy.clone(), clock.clone()));
        Self {
            dispatcher,
            clock,
            policy,
        }
    }

    pub fn now(&self) -> Nsecs {
        self.clock.now()
    }

    /// Runs dispatch iterations until nothing more is immediately due.
    pub fn pump(&self) {
        for _ in 0..100 {
            if self.dispatcher.dispatch_pending() != Nsecs::MIN {
                return;
            }
        }
        panic!("dispatcher did not settle after 100 iterations");
    }

    /// Next wakeup the dispatcher asks for once settled.
    pub fn settle(&self) -> Nsecs {
        for _ in 0..100 {
            let next = self.dispatcher.dispatch_pending();
            if next != Nsecs::MIN {
                return next;
            }
        }
        panic!("dispatcher did not settle after 100 iterations");
    }

    /// Registers a channel for a window that hit-tests by region.
    pub fn add_window(&self, name: &str, frame: Rectangle) -> FakeWindow {
        self.add_window_on(open_pair(name), frame)
    }

    /// Like [`Harness::add_window`] with a publish buffer of `buffer_size` bytes.
    pub fn add_window_with_buffer(&self, name: &str, frame: Rectangle, buffer_size: usize) -> FakeWindow {
        self.add_window_on(open_pair_with_buffer(name, buffer_size), frame)
    }

    fn add_window_on(&self, (channel, consumer): (InputChannel, InputConsumer), frame: Rectangle) -> FakeWindow {
        let handle = WindowHandle::new(channel.name());
        let mut window = InputWindow::new(handle.clone(), channel.id(), frame);
        window.flags = WindowFlags::NOT_TOUCH_MODAL;
        self.dispatcher
            .register_input_channel(channel, Some(handle), false)
            .expect("channel should register");
        FakeWindow { window, consumer }
    }

    pub fn add_monitor(&self, name: &str) -> InputConsumer {
        let (channel, consumer) = open_pair(name);
        self.dispatcher
            .register_input_channel(channel, None, true)
            .expect("monitor should register");
        consumer
    }

    pub fn set_windows(&self, windows: &[&FakeWindow]) {
        self.dispatcher
            .set_input_windows(windows.iter().map(|fake| fake.window.clone()).collect());
    }

    pub fn key(&self, action: KeyAction, key_code: i32) -> NotifyKeyArgs {
        NotifyKeyArgs::new(self.now(), KEYBOARD_DEVICE, InputSource::KEYBOARD, action, key_code)
    }

    pub fn notify_key(&self, action: KeyAction, key_code: i32) {
        self.dispatcher
            .notify_key(self.key(action, key_code))
            .expect("key should be accepted");
    }

    /// Touchscreen motion with `(pointer id, x, y)` per pointer.
    pub fn touch(&self, action: MotionAction, pointers: &[(i32, f32, f32)]) -> NotifyMotionArgs {
        let properties = pointers.iter().map(|&(id, _, _)| PointerProperties::finger(id)).collect();
        let coords = pointers.iter().map(|&(_, x, y)| PointerCoords::at(x, y)).collect();
        let mut args = NotifyMotionArgs::new(
            self.now(),
            TOUCH_DEVICE,
            InputSource::TOUCHSCREEN,
            action,
            properties,
            coords,
        );
        if action != MotionAction::Down {
            args.down_time = START_TIME;
        }
        args
    }

    pub fn notify_touch(&self, action: MotionAction, pointers: &[(i32, f32, f32)]) {
        self.dispatcher
            .notify_motion(self.touch(action, pointers))
            .expect("motion should be accepted");
    }

    pub fn key_event(&self, action: KeyAction, key_code: i32) -> InputEvent {
        InputEvent::Key(KeyEvent::new(KEYBOARD_DEVICE, InputSource::KEYBOARD, action, key_code, self.now()))
    }

    /// Injects `event` from another thread so the test thread can keep
    /// pumping while the injector blocks.
    pub fn inject_in_background(
        &self,
        event: InputEvent,
        injector_uid: i32,
        sync_mode: InjectionSyncMode,
    ) -> thread::JoinHandle<InjectionResult> {
        let dispatcher = Arc::clone(&self.dispatcher);
        thread::spawn(move || {
            dispatcher.inject_input_event(
                &event,
                4242,
                injector_uid,
                sync_mode,
                Duration::from_secs(10),
                PolicyFlags::empty(),
            )
        })
    }

    /// Pumps until `done` holds, yielding to other threads in between.
    pub fn pump_until(&self, mut done: impl FnMut() -> bool) {
        for _ in 0..2000 {
            self.pump();
            if done() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition was not reached while pumping");
    }
}
