//! Per-connection ledger of what the consumer currently believes is down.
//!
//! Every dispatch entry passes through [`InputState::track_key`] or
//! [`InputState::track_motion`] before it is queued. Transitions the ledger
//! cannot explain are dropped. When a connection has to be resynchronized the
//! ledger produces the UP / CANCEL / HOVER_EXIT events that return it to
//! neutral.

use crate::clock::Nsecs;
use crate::dispatcher::entry::{EventAllocator, EventRef, KeyEntry, InterceptKeyResult, MotionEntry, MotionSample};
use crate::input::{
    InputSource, KeyAction, KeyFlags, MetaState, MotionAction, MotionFlags, PointerCoords,
    PointerProperties, PolicyFlags,
};
use crate::logging::targets;
use log::debug;
use std::collections::BTreeMap;

/// Which mementos a cancelation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelationMode {
    All,
    Pointer,
    NonPointer,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelationOptions {
    pub mode: CancelationMode,
    pub reason: &'static str,
    /// Restricts key cancelation to one key code.
    pub key_code: Option<i32>,
}

impl CancelationOptions {
    pub fn new(mode: CancelationMode, reason: &'static str) -> Self {
        Self {
            mode,
            reason,
            key_code: None,
        }
    }

    pub fn for_key_code(mut self, key_code: i32) -> Self {
        self.key_code = Some(key_code);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
struct KeyMemento {
    device_id: i32,
    source: InputSource,
    key_code: i32,
    scan_code: i32,
    flags: KeyFlags,
    down_time: Nsecs,
}

#[derive(Debug, Clone, PartialEq)]
struct MotionMemento {
    device_id: i32,
    source: InputSource,
    flags: MotionFlags,
    x_precision: f32,
    y_precision: f32,
    down_time: Nsecs,
    pointer_properties: Vec<PointerProperties>,
    pointer_coords: Vec<PointerCoords>,
    hovering: bool,
}

impl MotionMemento {
    fn set_pointers(&mut self, entry: &MotionEntry) {
        self.pointer_properties = entry.pointer_properties.clone();
        self.pointer_coords = entry.last_sample().pointer_coords.clone();
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputState {
    key_mementos: Vec<KeyMemento>,
    motion_mementos: Vec<MotionMemento>,
    fallback_keys: BTreeMap<i32, i32>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_neutral(&self) -> bool {
        self.key_mementos.is_empty() && self.motion_mementos.is_empty()
    }

    pub fn is_hovering(&self, device_id: i32, source: InputSource) -> bool {
        self.motion_mementos
            .iter()
            .any(|m| m.device_id == device_id && m.source == source && m.hovering)
    }

    /// Number of keys currently down.
    pub fn key_down_count(&self) -> usize {
        self.key_mementos.len()
    }

    /// Number of (device, source) pairs currently down or hovering.
    pub fn motion_down_count(&self) -> usize {
        self.motion_mementos.len()
    }

    /// Records a key transition. Returns false for an UP with no matching DOWN.
    pub fn track_key(&mut self, entry: &KeyEntry, action: KeyAction, flags: KeyFlags) -> bool {
        match action {
            KeyAction::Up => {
                if entry.flags.contains(KeyFlags::FALLBACK) {
                    self.fallback_keys
                        .retain(|_, fallback| *fallback != entry.key_code);
                }
                match self.find_key_memento(entry) {
                    Some(index) => {
                        self.key_mementos.remove(index);
                        true
                    }
                    None => {
                        debug!(
                            target: targets::OUTBOUND,
                            "Dropping inconsistent key up event: deviceId={}, source={:#010x}, keyCode={}, scanCode={}",
                            entry.device_id,
                            entry.source.bits(),
                            entry.key_code,
                            entry.scan_code
                        );
                        false
                    }
                }
            }
            KeyAction::Down => {
                if let Some(index) = self.find_key_memento(entry) {
                    self.key_mementos.remove(index);
                }
                self.key_mementos.push(KeyMemento {
                    device_id: entry.device_id,
                    source: entry.source,
                    key_code: entry.key_code,
                    scan_code: entry.scan_code,
                    flags,
                    down_time: entry.down_time,
                });
                true
            }
        }
    }

    /// Records a motion transition. Returns false when the transition does
    /// not follow from the recorded state.
    pub fn track_motion(&mut self, entry: &MotionEntry, action: MotionAction, flags: MotionFlags) -> bool {
        match action {
            MotionAction::Up | MotionAction::Cancel => match self.find_motion_memento(entry, false) {
                Some(index) => {
                    self.motion_mementos.remove(index);
                    true
                }
                None => {
                    Self::log_inconsistent(entry, action);
                    false
                }
            },
            MotionAction::Down => {
                if let Some(index) = self.find_motion_memento(entry, false) {
                    self.motion_mementos.remove(index);
                }
                self.add_motion_memento(entry, flags, false);
                true
            }
            MotionAction::PointerUp(_) | MotionAction::PointerDown(_) | MotionAction::Move => {
                match self.find_motion_memento(entry, false) {
                    Some(index) => {
                        self.motion_mementos[index].set_pointers(entry);
                        true
                    }
                    None => {
                        Self::log_inconsistent(entry, action);
                        false
                    }
                }
            }
            MotionAction::HoverExit => match self.find_motion_memento(entry, true) {
                Some(index) => {
                    self.motion_mementos.remove(index);
                    true
                }
                None => {
                    Self::log_inconsistent(entry, action);
                    false
                }
            },
            MotionAction::HoverEnter | MotionAction::HoverMove => {
                if let Some(index) = self.find_motion_memento(entry, true) {
                    self.motion_mementos.remove(index);
                }
                self.add_motion_memento(entry, flags, true);
                true
            }
            MotionAction::Outside | MotionAction::Scroll => true,
        }
    }

    fn log_inconsistent(entry: &MotionEntry, action: MotionAction) {
        debug!(
            target: targets::OUTBOUND,
            "Dropping inconsistent motion {} event: deviceId={}, source={:#010x}",
            action,
            entry.device_id,
            entry.source.bits()
        );
    }

    fn find_key_memento(&self, entry: &KeyEntry) -> Option<usize> {
        self.key_mementos.iter().position(|m| {
            m.device_id == entry.device_id
                && m.source == entry.source
                && m.key_code == entry.key_code
                && m.scan_code == entry.scan_code
        })
    }

    fn find_motion_memento(&self, entry: &MotionEntry, hovering: bool) -> Option<usize> {
        self.motion_mementos.iter().position(|m| {
            m.device_id == entry.device_id && m.source == entry.source && m.hovering == hovering
        })
    }

    fn add_motion_memento(&mut self, entry: &MotionEntry, flags: MotionFlags, hovering: bool) {
        self.motion_mementos.push(MotionMemento {
            device_id: entry.device_id,
            source: entry.source,
            flags,
            x_precision: entry.x_precision,
            y_precision: entry.y_precision,
            down_time: entry.down_time,
            pointer_properties: entry.pointer_properties.clone(),
            pointer_coords: entry.last_sample().pointer_coords.clone(),
            hovering,
        });
    }

    /// Builds the events that cancel every memento selected by `options`.
    /// The mementos themselves are removed when the events are tracked.
    pub fn synthesize_cancelation_events(
        &self,
        now: Nsecs,
        allocator: &EventAllocator,
        options: &CancelationOptions,
    ) -> Vec<EventRef> {
        let keys = self
            .key_mementos
            .iter()
            .filter(|m| Self::should_cancel_key(m, options))
            .map(|m| {
                allocator.obtain_key(
                    now,
                    PolicyFlags::empty(),
                    KeyEntry {
                        device_id: m.device_id,
                        source: m.source,
                        action: KeyAction::Up,
                        flags: m.flags | KeyFlags::CANCELED,
                        key_code: m.key_code,
                        scan_code: m.scan_code,
                        meta_state: MetaState::empty(),
                        repeat_count: 0,
                        down_time: m.down_time,
                        synthetic_repeat: false,
                        intercept_key_result: InterceptKeyResult::Unknown,
                    },
                )
            });

        let motions = self
            .motion_mementos
            .iter()
            .filter(|m| Self::should_cancel_motion(m, options))
            .map(|m| {
                allocator.obtain_motion(
                    now,
                    PolicyFlags::empty(),
                    MotionEntry {
                        device_id: m.device_id,
                        source: m.source,
                        action: if m.hovering {
                            MotionAction::HoverExit
                        } else {
                            MotionAction::Cancel
                        },
                        flags: m.flags,
                        meta_state: MetaState::empty(),
                        button_state: 0,
                        edge_flags: 0,
                        x_precision: m.x_precision,
                        y_precision: m.y_precision,
                        down_time: m.down_time,
                        pointer_properties: m.pointer_properties.clone(),
                        samples: vec![MotionSample::new(now, m.pointer_coords.clone())],
                    },
                )
            });

        keys.chain(motions).collect()
    }

    pub fn clear(&mut self) {
        self.key_mementos.clear();
        self.motion_mementos.clear();
        self.fallback_keys.clear();
    }

    /// Copies pointer mementos into `other`, replacing its mementos for the
    /// same device and source. Used when touch focus moves between windows.
    pub fn copy_pointer_state_to(&self, other: &mut InputState) {
        for memento in self.motion_mementos.iter().filter(|m| m.source.is_pointer()) {
            other
                .motion_mementos
                .retain(|o| !(o.device_id == memento.device_id && o.source == memento.source));
            other.motion_mementos.push(memento.clone());
        }
    }

    /// Fallback key code latched for `original_key_code`. `Some(UNKNOWN)`
    /// means the policy declined to provide one.
    pub fn fallback_key(&self, original_key_code: i32) -> Option<i32> {
        self.fallback_keys.get(&original_key_code).copied()
    }

    pub fn set_fallback_key(&mut self, original_key_code: i32, fallback_key_code: i32) {
        self.fallback_keys.insert(original_key_code, fallback_key_code);
    }

    pub fn remove_fallback_key(&mut self, original_key_code: i32) {
        self.fallback_keys.remove(&original_key_code);
    }

    pub fn fallback_keys(&self) -> &BTreeMap<i32, i32> {
        &self.fallback_keys
    }

    fn should_cancel_key(memento: &KeyMemento, options: &CancelationOptions) -> bool {
        if options.key_code.is_some_and(|code| code != memento.key_code) {
            return false;
        }
        match options.mode {
            CancelationMode::All | CancelationMode::NonPointer => true,
            CancelationMode::Fallback => memento.flags.contains(KeyFlags::FALLBACK),
            CancelationMode::Pointer => false,
        }
    }

    fn should_cancel_motion(memento: &MotionMemento, options: &CancelationOptions) -> bool {
        match options.mode {
            CancelationMode::All => true,
            CancelationMode::Pointer => memento.source.is_pointer(),
            CancelationMode::NonPointer => !memento.source.is_pointer(),
            CancelationMode::Fallback => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::keycodes;

    fn key(action: KeyAction, key_code: i32) -> KeyEntry {
        KeyEntry {
            device_id: 1,
            source: InputSource::KEYBOARD,
            action,
            flags: KeyFlags::empty(),
            key_code,
            scan_code: 0,
            meta_state: MetaState::empty(),
            repeat_count: 0,
            down_time: 10,
            synthetic_repeat: false,
            intercept_key_result: InterceptKeyResult::Unknown,
        }
    }

    fn touch(action: MotionAction, source: InputSource) -> MotionEntry {
        MotionEntry {
            device_id: 2,
            source,
            action,
            flags: MotionFlags::empty(),
            meta_state: MetaState::empty(),
            button_state: 0,
            edge_flags: 0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time: 20,
            pointer_properties: vec![PointerProperties::finger(0)],
            samples: vec![MotionSample::new(20, vec![PointerCoords::at(5.0, 6.0)])],
        }
    }

    #[test]
    fn test_orphan_up_is_rejected() {
        let mut state = InputState::new();
        let up = key(KeyAction::Up, keycodes::A);
        assert!(!state.track_key(&up, KeyAction::Up, up.flags));

        let down = key(KeyAction::Down, keycodes::A);
        assert!(state.track_key(&down, KeyAction::Down, down.flags));
        assert!(!state.is_neutral());
        assert!(state.track_key(&up, KeyAction::Up, up.flags));
        assert!(state.is_neutral());
    }

    #[test]
    fn test_move_without_down_is_rejected() {
        let mut state = InputState::new();
        let moved = touch(MotionAction::Move, InputSource::TOUCHSCREEN);
        assert!(!state.track_motion(&moved, MotionAction::Move, moved.flags));

        let down = touch(MotionAction::Down, InputSource::TOUCHSCREEN);
        assert!(state.track_motion(&down, MotionAction::Down, down.flags));
        assert!(state.track_motion(&moved, MotionAction::Move, moved.flags));
        assert!(!state.is_hovering(2, InputSource::TOUCHSCREEN));
    }

    #[test]
    fn test_hover_tracking() {
        let mut state = InputState::new();
        let hover = touch(MotionAction::HoverMove, InputSource::MOUSE);
        assert!(state.track_motion(&hover, MotionAction::HoverEnter, hover.flags));
        assert!(state.is_hovering(2, InputSource::MOUSE));
        assert!(state.track_motion(&hover, MotionAction::HoverExit, hover.flags));
        assert!(!state.track_motion(&hover, MotionAction::HoverExit, hover.flags));
        assert!(state.is_neutral());
    }

    #[test]
    fn test_cancelation_returns_state_to_neutral() {
        let allocator = EventAllocator::new();
        let mut state = InputState::new();
        let down = key(KeyAction::Down, keycodes::A);
        state.track_key(&down, KeyAction::Down, down.flags);
        let touch_down = touch(MotionAction::Down, InputSource::TOUCHSCREEN);
        state.track_motion(&touch_down, MotionAction::Down, touch_down.flags);
        let hover = touch(MotionAction::HoverMove, InputSource::MOUSE);
        state.track_motion(&hover, MotionAction::HoverMove, hover.flags);

        let options = CancelationOptions::new(CancelationMode::All, "test");
        let events = state.synthesize_cancelation_events(100, &allocator, &options);
        assert_eq!(events.len(), 3);

        for event in &events {
            let entry = event.lock();
            match &entry.kind {
                crate::dispatcher::entry::EventKind::Key(k) => {
                    assert_eq!(k.action, KeyAction::Up);
                    assert!(k.flags.contains(KeyFlags::CANCELED));
                    assert!(state.track_key(k, k.action, k.flags));
                }
                crate::dispatcher::entry::EventKind::Motion(m) => {
                    assert!(matches!(m.action, MotionAction::Cancel | MotionAction::HoverExit));
                    assert_eq!(m.samples[0].pointer_coords[0], PointerCoords::at(5.0, 6.0));
                    assert!(state.track_motion(m, m.action, m.flags));
                }
                _ => unreachable!(),
            }
        }
        assert!(state.is_neutral());
    }

    #[test]
    fn test_cancelation_modes_select_mementos() {
        let allocator = EventAllocator::new();
        let mut state = InputState::new();
        let down = key(KeyAction::Down, keycodes::A);
        state.track_key(&down, KeyAction::Down, down.flags);
        let touch_down = touch(MotionAction::Down, InputSource::TOUCHSCREEN);
        state.track_motion(&touch_down, MotionAction::Down, touch_down.flags);
        let ball = touch(MotionAction::Down, InputSource::TRACKBALL);
        state.track_motion(&ball, MotionAction::Down, ball.flags);

        let pointer = CancelationOptions::new(CancelationMode::Pointer, "test");
        assert_eq!(state.synthesize_cancelation_events(1, &allocator, &pointer).len(), 1);
        let non_pointer = CancelationOptions::new(CancelationMode::NonPointer, "test");
        assert_eq!(state.synthesize_cancelation_events(1, &allocator, &non_pointer).len(), 2);
        let fallback = CancelationOptions::new(CancelationMode::Fallback, "test");
        assert!(state.synthesize_cancelation_events(1, &allocator, &fallback).is_empty());
        let other_key = CancelationOptions::new(CancelationMode::All, "test").for_key_code(keycodes::B);
        assert_eq!(state.synthesize_cancelation_events(1, &allocator, &other_key).len(), 2);
    }

    #[test]
    fn test_fallback_up_clears_latched_fallback() {
        let mut state = InputState::new();
        state.set_fallback_key(keycodes::A, keycodes::ENTER);
        assert_eq!(state.fallback_key(keycodes::A), Some(keycodes::ENTER));

        let mut fallback_down = key(KeyAction::Down, keycodes::ENTER);
        fallback_down.flags |= KeyFlags::FALLBACK;
        state.track_key(&fallback_down, KeyAction::Down, fallback_down.flags);
        let mut fallback_up = fallback_down.clone();
        fallback_up.action = KeyAction::Up;
        assert!(state.track_key(&fallback_up, KeyAction::Up, fallback_up.flags));
        assert_eq!(state.fallback_key(keycodes::A), None);
    }

    #[test]
    fn test_copy_pointer_state_only_copies_pointers() {
        let mut from = InputState::new();
        let down = touch(MotionAction::Down, InputSource::TOUCHSCREEN);
        from.track_motion(&down, MotionAction::Down, down.flags);
        let key_down = key(KeyAction::Down, keycodes::A);
        from.track_key(&key_down, KeyAction::Down, key_down.flags);

        let mut to = InputState::new();
        from.copy_pointer_state_to(&mut to);
        assert_eq!(to.motion_down_count(), 1);
        assert_eq!(to.key_down_count(), 0);
    }
}
