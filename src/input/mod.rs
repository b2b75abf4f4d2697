//! Input event vocabulary shared by producers, the dispatcher and consumers.
//!
//! Raw action codes arrive from device drivers as integers and are validated
//! into [`KeyAction`] / [`MotionAction`] at the dispatcher boundary. Flag words
//! use `bitflags` so unknown bits survive a round trip.

mod bitset;

pub use bitset::PointerIdBits;

use crate::clock::Nsecs;
use crate::error::DispatchError;
use bitflags::bitflags;
use std::fmt;

/// Maximum number of pointers in a single motion event.
pub const MAX_POINTERS: usize = 16;

/// Largest pointer id a driver may assign.
pub const MAX_POINTER_ID: u32 = 31;

/// Key codes the dispatcher itself cares about.
pub mod keycodes {
    pub const UNKNOWN: i32 = 0;
    pub const SOFT_LEFT: i32 = 1;
    pub const SOFT_RIGHT: i32 = 2;
    pub const HOME: i32 = 3;
    pub const BACK: i32 = 4;
    pub const CALL: i32 = 5;
    pub const ENDCALL: i32 = 6;
    pub const DPAD_UP: i32 = 19;
    pub const DPAD_DOWN: i32 = 20;
    pub const DPAD_CENTER: i32 = 23;
    pub const A: i32 = 29;
    pub const B: i32 = 30;
    pub const ENTER: i32 = 66;
    pub const ESCAPE: i32 = 111;
}

bitflags! {
    /// Event source classes and concrete sources.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputSource: u32 {
        const CLASS_BUTTON = 0x0000_0001;
        const CLASS_POINTER = 0x0000_0002;
        const CLASS_NAVIGATION = 0x0000_0004;
        const CLASS_POSITION = 0x0000_0008;
        const CLASS_JOYSTICK = 0x0000_0010;

        const KEYBOARD = 0x0000_0100 | Self::CLASS_BUTTON.bits();
        const DPAD = 0x0000_0200 | Self::CLASS_BUTTON.bits();
        const GAMEPAD = 0x0000_0400 | Self::CLASS_BUTTON.bits();
        const TOUCHSCREEN = 0x0000_1000 | Self::CLASS_POINTER.bits();
        const MOUSE = 0x0000_2000 | Self::CLASS_POINTER.bits();
        const STYLUS = 0x0000_4000 | Self::CLASS_POINTER.bits();
        const TRACKBALL = 0x0001_0000 | Self::CLASS_NAVIGATION.bits();
        const TOUCHPAD = 0x0010_0000 | Self::CLASS_POSITION.bits();
        const JOYSTICK = 0x0100_0000 | Self::CLASS_JOYSTICK.bits();

        const _ = !0;
    }
}

impl InputSource {
    pub fn is_pointer(self) -> bool {
        self.contains(Self::CLASS_POINTER)
    }
}

bitflags! {
    /// Flags attached to key events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyFlags: u32 {
        const WOKE_HERE = 0x1;
        const SOFT_KEYBOARD = 0x2;
        const KEEP_TOUCH_MODE = 0x4;
        const FROM_SYSTEM = 0x8;
        const EDITOR_ACTION = 0x10;
        const CANCELED = 0x20;
        const VIRTUAL_HARD_KEY = 0x40;
        const LONG_PRESS = 0x80;
        const CANCELED_LONG_PRESS = 0x100;
        const TRACKING = 0x200;
        const FALLBACK = 0x400;

        const _ = !0;
    }
}

bitflags! {
    /// Flags attached to motion events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MotionFlags: u32 {
        const WINDOW_IS_OBSCURED = 0x1;

        const _ = !0;
    }
}

bitflags! {
    /// Modifier key state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaState: u32 {
        const SHIFT_ON = 0x01;
        const ALT_ON = 0x02;
        const SYM_ON = 0x04;
        const FUNCTION_ON = 0x08;
        const ALT_LEFT_ON = 0x10;
        const ALT_RIGHT_ON = 0x20;
        const SHIFT_LEFT_ON = 0x40;
        const SHIFT_RIGHT_ON = 0x80;
        const CTRL_ON = 0x1000;
        const CTRL_LEFT_ON = 0x2000;
        const CTRL_RIGHT_ON = 0x4000;
        const META_ON = 0x1_0000;
        const CAPS_LOCK_ON = 0x10_0000;
        const NUM_LOCK_ON = 0x20_0000;
        const SCROLL_LOCK_ON = 0x40_0000;

        const _ = !0;
    }
}

bitflags! {
    /// Flags the policy and the dispatcher attach to an event on its way through.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PolicyFlags: u32 {
        const WAKE = 0x0000_0001;
        const WAKE_DROPPED = 0x0000_0002;
        const SHIFT = 0x0000_0004;
        const CAPS_LOCK = 0x0000_0008;
        const ALT = 0x0000_0010;
        const ALT_GR = 0x0000_0020;
        const MENU = 0x0000_0040;
        const LAUNCHER = 0x0000_0080;
        const VIRTUAL = 0x0000_0100;
        const FUNCTION = 0x0000_0200;

        const RAW_MASK = 0x0000_ffff;

        /// Event was injected rather than read from a device.
        const INJECTED = 0x0100_0000;
        /// Event came from a trusted source (a device or a permitted injector).
        const TRUSTED = 0x0200_0000;
        /// Event has already passed through the input filter.
        const FILTERED = 0x0400_0000;
        /// Injected key must not auto-repeat.
        const DISABLE_KEY_REPEAT = 0x0800_0000;
        const WOKE_HERE = 0x1000_0000;
        const BRIGHT_HERE = 0x2000_0000;
        /// Event should be dispatched to applications.
        const PASS_TO_USER = 0x4000_0000;

        const _ = !0;
    }
}

/// Key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAction {
    Down,
    Up,
}

impl KeyAction {
    pub const RAW_DOWN: i32 = 0;
    pub const RAW_UP: i32 = 1;
    pub const RAW_MULTIPLE: i32 = 2;

    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            Self::RAW_DOWN => Some(Self::Down),
            Self::RAW_UP => Some(Self::Up),
            _ => None,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Self::Down => Self::RAW_DOWN,
            Self::Up => Self::RAW_UP,
        }
    }
}

/// Motion transition, with the pointer index for secondary pointer changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionAction {
    Down,
    Up,
    Move,
    Cancel,
    Outside,
    PointerDown(usize),
    PointerUp(usize),
    HoverMove,
    Scroll,
    HoverEnter,
    HoverExit,
}

impl MotionAction {
    pub const MASK: i32 = 0xff;
    pub const POINTER_INDEX_MASK: i32 = 0xff00;
    pub const POINTER_INDEX_SHIFT: i32 = 8;

    /// Decodes a raw action code, checking pointer indices against `pointer_count`.
    pub fn from_raw(raw: i32, pointer_count: usize) -> Option<Self> {
        let index = ((raw & Self::POINTER_INDEX_MASK) >> Self::POINTER_INDEX_SHIFT) as usize;
        let action = match raw & Self::MASK {
            0 => Self::Down,
            1 => Self::Up,
            2 => Self::Move,
            3 => Self::Cancel,
            4 => Self::Outside,
            5 if index < pointer_count => Self::PointerDown(index),
            6 if index < pointer_count => Self::PointerUp(index),
            7 => Self::HoverMove,
            8 => Self::Scroll,
            9 => Self::HoverEnter,
            10 => Self::HoverExit,
            _ => return None,
        };
        Some(action)
    }

    pub fn to_raw(self) -> i32 {
        let pointer = |base: i32, index: usize| base | ((index as i32) << Self::POINTER_INDEX_SHIFT);
        match self {
            Self::Down => 0,
            Self::Up => 1,
            Self::Move => 2,
            Self::Cancel => 3,
            Self::Outside => 4,
            Self::PointerDown(index) => pointer(5, index),
            Self::PointerUp(index) => pointer(6, index),
            Self::HoverMove => 7,
            Self::Scroll => 8,
            Self::HoverEnter => 9,
            Self::HoverExit => 10,
        }
    }

    pub fn is_hover(self) -> bool {
        matches!(self, Self::HoverMove | Self::HoverEnter | Self::HoverExit)
    }

    /// Moves are the only actions whose extra samples may be appended to a
    /// published message.
    pub fn accepts_appended_samples(self) -> bool {
        matches!(self, Self::Move | Self::HoverMove)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Down => "DOWN",
            Self::Up => "UP",
            Self::Move => "MOVE",
            Self::Cancel => "CANCEL",
            Self::Outside => "OUTSIDE",
            Self::PointerDown(_) => "POINTER_DOWN",
            Self::PointerUp(_) => "POINTER_UP",
            Self::HoverMove => "HOVER_MOVE",
            Self::Scroll => "SCROLL",
            Self::HoverEnter => "HOVER_ENTER",
            Self::HoverExit => "HOVER_EXIT",
        }
    }
}

impl fmt::Display for MotionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PointerDown(index) | Self::PointerUp(index) => {
                write!(f, "{}({})", self.label(), index)
            }
            _ => f.write_str(self.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ToolType {
    #[default]
    Unknown,
    Finger,
    Stylus,
    Mouse,
    Eraser,
}

/// Identity of one pointer within a gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PointerProperties {
    pub id: i32,
    pub tool_type: ToolType,
}

impl PointerProperties {
    pub fn finger(id: i32) -> Self {
        Self {
            id,
            tool_type: ToolType::Finger,
        }
    }

    /// Pointer id as a bit index; only meaningful after validation.
    pub fn bit(&self) -> u32 {
        self.id.clamp(0, MAX_POINTER_ID as i32) as u32
    }
}

/// Per-pointer axis values of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointerCoords {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub size: f32,
    pub touch_major: f32,
    pub touch_minor: f32,
    pub tool_major: f32,
    pub tool_minor: f32,
    pub orientation: f32,
    pub vscroll: f32,
    pub hscroll: f32,
}

impl PointerCoords {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            pressure: 1.0,
            size: 1.0,
            ..Self::default()
        }
    }

    /// Scales the geometric axes by a window scale factor.
    pub fn scale(&mut self, factor: f32) {
        self.x *= factor;
        self.y *= factor;
        self.touch_major *= factor;
        self.touch_minor *= factor;
        self.tool_major *= factor;
        self.tool_minor *= factor;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A key event as seen by the policy and by injectors.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub device_id: i32,
    pub source: InputSource,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: MetaState,
    pub repeat_count: i32,
    pub down_time: Nsecs,
    pub event_time: Nsecs,
}

impl KeyEvent {
    pub fn new(device_id: i32, source: InputSource, action: KeyAction, key_code: i32, time: Nsecs) -> Self {
        Self {
            device_id,
            source,
            action,
            flags: KeyFlags::empty(),
            key_code,
            scan_code: 0,
            meta_state: MetaState::empty(),
            repeat_count: 0,
            down_time: time,
            event_time: time,
        }
    }
}

/// One historical or current sample of a [`MotionEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct MotionEventSample {
    pub event_time: Nsecs,
    pub pointer_coords: Vec<PointerCoords>,
}

/// A motion event as seen by the policy and by injectors.
///
/// `samples` runs oldest first; the last sample is the current position.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionEvent {
    pub device_id: i32,
    pub source: InputSource,
    pub action: MotionAction,
    pub flags: MotionFlags,
    pub edge_flags: u32,
    pub meta_state: MetaState,
    pub button_state: u32,
    pub x_offset: f32,
    pub y_offset: f32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nsecs,
    pub pointer_properties: Vec<PointerProperties>,
    pub samples: Vec<MotionEventSample>,
}

impl MotionEvent {
    pub fn pointer_count(&self) -> usize {
        self.pointer_properties.len()
    }

    pub fn event_time(&self) -> Nsecs {
        self.samples.last().map_or(self.down_time, |sample| sample.event_time)
    }
}

/// Any event accepted by the filter and injection paths.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Key(KeyEvent),
    Motion(MotionEvent),
}

/// Kind of user activity reported to the policy for each dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserActivityType {
    Other,
    Button,
    Touch,
}

/// Validates a raw key action.
pub fn validate_key_action(raw: i32) -> Result<KeyAction, DispatchError> {
    KeyAction::from_raw(raw).ok_or(DispatchError::InvalidKeyAction(raw))
}

/// Validates a raw motion action together with its pointer set.
pub fn validate_motion_event(
    raw_action: i32,
    pointer_properties: &[PointerProperties],
) -> Result<MotionAction, DispatchError> {
    let pointer_count = pointer_properties.len();
    let action = MotionAction::from_raw(raw_action, pointer_count)
        .ok_or(DispatchError::InvalidMotionAction(raw_action))?;
    validate_pointers(pointer_properties)?;
    Ok(action)
}

/// Checks pointer count, id range and id uniqueness.
pub fn validate_pointers(pointer_properties: &[PointerProperties]) -> Result<(), DispatchError> {
    let count = pointer_properties.len();
    if count < 1 || count > MAX_POINTERS {
        return Err(DispatchError::InvalidPointerCount(count));
    }
    let mut seen = PointerIdBits::empty();
    for properties in pointer_properties {
        let id = properties.id;
        if id < 0 || id > MAX_POINTER_ID as i32 {
            return Err(DispatchError::InvalidPointerId(id));
        }
        if seen.has(id as u32) {
            return Err(DispatchError::DuplicatePointerId(id));
        }
        seen.mark(id as u32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_action_round_trips_pointer_index() {
        let raw = MotionAction::PointerDown(2).to_raw();
        assert_eq!(raw, 0x0205);
        assert_eq!(MotionAction::from_raw(raw, 3), Some(MotionAction::PointerDown(2)));
        assert_eq!(MotionAction::from_raw(raw, 2), None);
        assert_eq!(MotionAction::from_raw(42, 1), None);
    }

    #[test]
    fn test_validation_rejects_bad_pointers() {
        let ok = [PointerProperties::finger(0), PointerProperties::finger(1)];
        assert!(validate_motion_event(MotionAction::Move.to_raw(), &ok).is_ok());

        assert!(matches!(
            validate_motion_event(0, &[]),
            Err(DispatchError::InvalidPointerCount(0))
        ));
        assert!(matches!(
            validate_pointers(&[PointerProperties::finger(32)]),
            Err(DispatchError::InvalidPointerId(32))
        ));
        assert!(matches!(
            validate_pointers(&[PointerProperties::finger(-1)]),
            Err(DispatchError::InvalidPointerId(-1))
        ));
        assert!(matches!(
            validate_pointers(&[PointerProperties::finger(3), PointerProperties::finger(3)]),
            Err(DispatchError::DuplicatePointerId(3))
        ));
        let too_many: Vec<_> = (0..17).map(PointerProperties::finger).collect();
        assert!(matches!(
            validate_pointers(&too_many),
            Err(DispatchError::InvalidPointerCount(17))
        ));
    }

    #[test]
    fn test_key_action_validation() {
        assert_eq!(validate_key_action(0).ok(), Some(KeyAction::Down));
        assert!(matches!(
            validate_key_action(KeyAction::RAW_MULTIPLE),
            Err(DispatchError::InvalidKeyAction(2))
        ));
    }

    #[test]
    fn test_pointer_coords_scale_keeps_pressure() {
        let mut coords = PointerCoords::at(10.0, 20.0);
        coords.touch_major = 4.0;
        coords.scale(0.5);
        assert_eq!(coords.x, 5.0);
        assert_eq!(coords.y, 10.0);
        assert_eq!(coords.touch_major, 2.0);
        assert_eq!(coords.pressure, 1.0);
    }
}
