//! Event records flowing through the inbound and outbound queues.
//!
//! An [`EventRef`] is shared by every queue that currently holds the event:
//! the inbound queue, the pending slot, the key repeat state and any number
//! of connection outbound queues. The record is freed when the last holder
//! drops its reference. All mutation happens while the dispatcher state lock
//! is held, so the inner mutex is never contended.

use crate::clock::Nsecs;
use crate::dispatcher::touch::{DispatchMode, TargetFlags};
use crate::input::{
    InputSource, KeyAction, KeyEvent, KeyFlags, MetaState, MotionAction, MotionFlags, PointerCoords,
    PointerProperties, PolicyFlags,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Outcome reported to an injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InjectionResult {
    Pending,
    Succeeded,
    Failed,
    PermissionDenied,
    TimedOut,
}

#[derive(Debug)]
struct InjectionProgress {
    result: InjectionResult,
    pending_foreground_dispatches: i32,
}

/// Completion state shared by an injected event and every split copy of it.
#[derive(Debug)]
pub struct InjectionState {
    pub injector_pid: i32,
    pub injector_uid: i32,
    pub injection_is_async: bool,
    progress: Mutex<InjectionProgress>,
}

impl InjectionState {
    pub fn new(injector_pid: i32, injector_uid: i32, injection_is_async: bool) -> Self {
        Self {
            injector_pid,
            injector_uid,
            injection_is_async,
            progress: Mutex::new(InjectionProgress {
                result: InjectionResult::Pending,
                pending_foreground_dispatches: 0,
            }),
        }
    }

    pub fn result(&self) -> InjectionResult {
        self.progress.lock().result
    }

    pub fn set_result(&self, result: InjectionResult) {
        self.progress.lock().result = result;
    }

    pub fn pending_foreground_dispatches(&self) -> i32 {
        self.progress.lock().pending_foreground_dispatches
    }

    pub fn increment_pending_foreground_dispatches(&self) {
        self.progress.lock().pending_foreground_dispatches += 1;
    }

    /// Returns true when the counter dropped to zero.
    pub fn decrement_pending_foreground_dispatches(&self) -> bool {
        let mut progress = self.progress.lock();
        progress.pending_foreground_dispatches -= 1;
        progress.pending_foreground_dispatches == 0
    }
}

/// Result of asking the policy whether to intercept a key before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterceptKeyResult {
    Unknown,
    Skip,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyEntry {
    pub device_id: i32,
    pub source: InputSource,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: MetaState,
    pub repeat_count: i32,
    pub down_time: Nsecs,
    pub synthetic_repeat: bool,
    pub intercept_key_result: InterceptKeyResult,
}

impl KeyEntry {
    pub fn from_event(event: &KeyEvent) -> Self {
        Self {
            device_id: event.device_id,
            source: event.source,
            action: event.action,
            flags: event.flags,
            key_code: event.key_code,
            scan_code: event.scan_code,
            meta_state: event.meta_state,
            repeat_count: event.repeat_count,
            down_time: event.down_time,
            synthetic_repeat: false,
            intercept_key_result: InterceptKeyResult::Unknown,
        }
    }

    pub fn to_event(&self, event_time: Nsecs) -> KeyEvent {
        KeyEvent {
            device_id: self.device_id,
            source: self.source,
            action: self.action,
            flags: self.flags,
            key_code: self.key_code,
            scan_code: self.scan_code,
            meta_state: self.meta_state,
            repeat_count: self.repeat_count,
            down_time: self.down_time,
            event_time,
        }
    }
}

/// One timestamped set of per-pointer coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSample {
    pub event_time: Nsecs,
    /// Time the sample was first appended, before later samples were
    /// coalesced into it.
    pub event_time_before_coalescing: Nsecs,
    pub pointer_coords: Vec<PointerCoords>,
}

impl MotionSample {
    pub fn new(event_time: Nsecs, pointer_coords: Vec<PointerCoords>) -> Self {
        Self {
            event_time,
            event_time_before_coalescing: event_time,
            pointer_coords,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionEntry {
    pub device_id: i32,
    pub source: InputSource,
    pub action: MotionAction,
    pub flags: MotionFlags,
    pub meta_state: MetaState,
    pub button_state: u32,
    pub edge_flags: u32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nsecs,
    pub pointer_properties: Vec<PointerProperties>,
    /// Never empty.
    pub samples: Vec<MotionSample>,
}

impl MotionEntry {
    pub fn pointer_count(&self) -> usize {
        self.pointer_properties.len()
    }

    pub fn first_sample(&self) -> &MotionSample {
        &self.samples[0]
    }

    pub fn last_sample(&self) -> &MotionSample {
        &self.samples[self.samples.len() - 1]
    }

    pub fn last_sample_index(&self) -> usize {
        self.samples.len() - 1
    }

    pub fn append_sample(&mut self, event_time: Nsecs, pointer_coords: Vec<PointerCoords>) {
        self.samples.push(MotionSample::new(event_time, pointer_coords));
    }

    /// Samples can only be appended to an uninjected event with the same
    /// action and identical pointers.
    pub fn can_append_samples(
        &self,
        action: MotionAction,
        pointer_properties: &[PointerProperties],
        injected: bool,
    ) -> bool {
        self.action == action && !injected && self.pointer_properties == pointer_properties
    }

    /// Coordinates of the first sample at `(x, y)` rounded toward zero,
    /// matching how windows are hit tested.
    pub fn first_point(&self, pointer_index: usize) -> (i32, i32) {
        let coords = &self.first_sample().pointer_coords[pointer_index];
        (coords.x as i32, coords.y as i32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ConfigurationChanged,
    Key(KeyEntry),
    Motion(MotionEntry),
}

/// Base record of an event in flight.
#[derive(Debug)]
pub struct EventEntry {
    pub seq: u64,
    pub event_time: Nsecs,
    pub policy_flags: PolicyFlags,
    pub dispatch_in_progress: bool,
    pub injection_state: Option<Arc<InjectionState>>,
    pub kind: EventKind,
    _live: LiveToken,
}

impl EventEntry {
    pub fn is_injected(&self) -> bool {
        self.injection_state.is_some()
    }

    pub fn type_label(&self) -> &'static str {
        match self.kind {
            EventKind::ConfigurationChanged => "ConfigurationChanged",
            EventKind::Key(_) => "Key",
            EventKind::Motion(_) => "Motion",
        }
    }

    pub fn as_key(&self) -> Option<&KeyEntry> {
        match &self.kind {
            EventKind::Key(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_key_mut(&mut self) -> Option<&mut KeyEntry> {
        match &mut self.kind {
            EventKind::Key(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_motion(&self) -> Option<&MotionEntry> {
        match &self.kind {
            EventKind::Motion(motion) => Some(motion),
            _ => None,
        }
    }

    pub fn as_motion_mut(&mut self) -> Option<&mut MotionEntry> {
        match &mut self.kind {
            EventKind::Motion(motion) => Some(motion),
            _ => None,
        }
    }
}

impl fmt::Display for EventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::ConfigurationChanged => write!(f, "ConfigurationChangedEvent()"),
            EventKind::Key(key) => write!(
                f,
                "KeyEvent(action={:?}, deviceId={}, source={:#010x}, keyCode={}, repeatCount={})",
                key.action,
                key.device_id,
                key.source.bits(),
                key.key_code,
                key.repeat_count
            ),
            EventKind::Motion(motion) => write!(
                f,
                "MotionEvent(action={}, deviceId={}, source={:#010x}, pointers={}, samples={})",
                motion.action,
                motion.device_id,
                motion.source.bits(),
                motion.pointer_count(),
                motion.samples.len()
            ),
        }
    }
}

/// Shared handle to an [`EventEntry`]. Equality is identity.
#[derive(Debug, Clone)]
pub struct EventRef(Arc<Mutex<EventEntry>>);

impl EventRef {
    pub fn lock(&self) -> MutexGuard<'_, EventEntry> {
        self.0.lock()
    }

    pub fn ptr_eq(&self, other: &EventRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of queues and slots currently holding this event.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[derive(Debug)]
struct LiveToken(Arc<AtomicUsize>);

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Creates event records, numbering them and counting how many are alive.
#[derive(Debug, Clone, Default)]
pub struct EventAllocator {
    next_seq: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
}

impl EventAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn obtain(&self, event_time: Nsecs, policy_flags: PolicyFlags, kind: EventKind) -> EventRef {
        self.live.fetch_add(1, Ordering::Relaxed);
        EventRef(Arc::new(Mutex::new(EventEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
            event_time,
            policy_flags,
            dispatch_in_progress: false,
            injection_state: None,
            kind,
            _live: LiveToken(Arc::clone(&self.live)),
        })))
    }

    pub fn obtain_configuration_changed(&self, event_time: Nsecs) -> EventRef {
        self.obtain(event_time, PolicyFlags::empty(), EventKind::ConfigurationChanged)
    }

    pub fn obtain_key(&self, event_time: Nsecs, policy_flags: PolicyFlags, key: KeyEntry) -> EventRef {
        self.obtain(event_time, policy_flags, EventKind::Key(key))
    }

    pub fn obtain_motion(
        &self,
        event_time: Nsecs,
        policy_flags: PolicyFlags,
        motion: MotionEntry,
    ) -> EventRef {
        self.obtain(event_time, policy_flags, EventKind::Motion(motion))
    }

    /// Number of event records not yet freed.
    pub fn live_entries(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// Action and flags of a dispatch entry after its dispatch mode was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedEvent {
    Key { action: KeyAction, flags: KeyFlags },
    Motion { action: MotionAction, flags: MotionFlags },
}

/// One delivery of an event to one connection.
#[derive(Debug)]
pub struct DispatchEntry {
    pub event: EventRef,
    pub target_flags: TargetFlags,
    pub mode: DispatchMode,
    pub x_offset: f32,
    pub y_offset: f32,
    pub scale_factor: f32,
    pub in_progress: bool,
    pub resolved: ResolvedEvent,
    /// First sample to publish on the next cycle, when not the event's first.
    pub head_motion_sample: Option<usize>,
    /// First sample that did not fit into the channel during the current cycle.
    pub tail_motion_sample: Option<usize>,
}

impl DispatchEntry {
    pub fn has_foreground_target(&self) -> bool {
        self.target_flags.contains(TargetFlags::FOREGROUND)
    }

    pub fn is_split(&self) -> bool {
        self.target_flags.contains(TargetFlags::SPLIT)
    }
}

/// Increments the injector's foreground dispatch counter, if the event was injected.
pub fn increment_pending_foreground_dispatches(event: &EventEntry) {
    if let Some(state) = &event.injection_state {
        state.increment_pending_foreground_dispatches();
    }
}

/// Decrements the injector's foreground dispatch counter and wakes waiting
/// injectors once it reaches zero.
pub fn decrement_pending_foreground_dispatches(event: &EventEntry, sync_finished: &Condvar) {
    if let Some(state) = &event.injection_state {
        if state.decrement_pending_foreground_dispatches() {
            sync_finished.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::PointerProperties;

    fn motion(action: MotionAction, ids: &[i32]) -> MotionEntry {
        MotionEntry {
            device_id: 1,
            source: InputSource::TOUCHSCREEN,
            action,
            flags: MotionFlags::empty(),
            meta_state: MetaState::empty(),
            button_state: 0,
            edge_flags: 0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time: 0,
            pointer_properties: ids.iter().copied().map(PointerProperties::finger).collect(),
            samples: vec![MotionSample::new(
                0,
                ids.iter().map(|_| PointerCoords::at(1.0, 2.0)).collect(),
            )],
        }
    }

    #[test]
    fn test_allocator_counts_live_entries() {
        let allocator = EventAllocator::new();
        let first = allocator.obtain_configuration_changed(1);
        let second = allocator.obtain_configuration_changed(2);
        assert_eq!(allocator.live_entries(), 2);
        assert!(first.lock().seq < second.lock().seq);

        let shared = first.clone();
        drop(first);
        assert_eq!(allocator.live_entries(), 2);
        drop(shared);
        drop(second);
        assert_eq!(allocator.live_entries(), 0);
    }

    #[test]
    fn test_event_ref_identity() {
        let allocator = EventAllocator::new();
        let a = allocator.obtain_configuration_changed(1);
        let b = allocator.obtain_configuration_changed(1);
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
        assert_eq!(a.holders(), 1);
    }

    #[test]
    fn test_can_append_samples_requires_same_pointers() {
        let entry = motion(MotionAction::Move, &[0, 1]);
        let same = [PointerProperties::finger(0), PointerProperties::finger(1)];
        let other = [PointerProperties::finger(0), PointerProperties::finger(2)];
        assert!(entry.can_append_samples(MotionAction::Move, &same, false));
        assert!(!entry.can_append_samples(MotionAction::Move, &same, true));
        assert!(!entry.can_append_samples(MotionAction::HoverMove, &same, false));
        assert!(!entry.can_append_samples(MotionAction::Move, &other, false));
        assert!(!entry.can_append_samples(MotionAction::Move, &same[..1], false));
    }

    #[test]
    fn test_injection_counter_wakes_at_zero() {
        let allocator = EventAllocator::new();
        let entry = allocator.obtain_configuration_changed(1);
        let state = Arc::new(InjectionState::new(1, 1000, false));
        entry.lock().injection_state = Some(Arc::clone(&state));

        let cond = Condvar::new();
        increment_pending_foreground_dispatches(&entry.lock());
        increment_pending_foreground_dispatches(&entry.lock());
        assert_eq!(state.pending_foreground_dispatches(), 2);
        decrement_pending_foreground_dispatches(&entry.lock(), &cond);
        assert_eq!(state.pending_foreground_dispatches(), 1);
        assert!(state.decrement_pending_foreground_dispatches());
        assert_eq!(state.pending_foreground_dispatches(), 0);
        assert_eq!(state.result(), InjectionResult::Pending);
    }
}
