//! Window and application snapshots consumed by the dispatcher.
//!
//! The window manager owns geometry and focus decisions. It hands the
//! dispatcher an ordered list of [`InputWindow`]s (front to back) plus the
//! focused [`InputApplication`], and the dispatcher only reads them.

use crate::channel::ChannelId;
use crate::clock::{millis, Nsecs};
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Dispatch timeout used when neither window nor application specifies one.
pub const DEFAULT_INPUT_DISPATCHING_TIMEOUT: Nsecs = millis(5000);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opaque identity of a window, handed back to the policy in callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowHandle {
    pub id: u64,
    pub name: Arc<str>,
}

impl WindowHandle {
    pub fn new(name: &str) -> Self {
        Self {
            id: next_handle_id(),
            name: Arc::from(name),
        }
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Opaque identity of an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplicationHandle {
    pub id: u64,
    pub name: Arc<str>,
}

impl ApplicationHandle {
    pub fn new(name: &str) -> Self {
        Self {
            id: next_handle_id(),
            name: Arc::from(name),
        }
    }
}

impl fmt::Display for ApplicationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Axis aligned rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rectangle {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rectangle {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_loc_and_size((x, y): (i32, i32), (width, height): (u32, u32)) -> Self {
        Self::new(x, y, x + width as i32, y + height as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Half-open containment, matching region semantics.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

/// Union of rectangles.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    pub rects: Vec<Rectangle>,
}

impl Region {
    pub fn from_rect(rect: Rectangle) -> Self {
        Self { rects: vec![rect] }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.iter().all(Rectangle::is_empty)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|rect| rect.contains(x, y))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        for (i, rect) in self.rects.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}", rect)?;
        }
        Ok(())
    }
}

bitflags! {
    /// Window manager layout flags relevant to input.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WindowFlags: u32 {
        const NOT_FOCUSABLE = 0x0000_0008;
        const NOT_TOUCHABLE = 0x0000_0010;
        const NOT_TOUCH_MODAL = 0x0000_0020;
        const TOUCHABLE_WHEN_WAKING = 0x0000_0040;
        const WATCH_OUTSIDE_TOUCH = 0x0004_0000;
        const SPLIT_TOUCH = 0x0080_0000;
        const SLIPPERY = 0x2000_0000;
        const SYSTEM_ERROR = 0x4000_0000;

        const _ = !0;
    }
}

bitflags! {
    /// Input features a window opts into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputFeatures: u32 {
        const DISABLE_TOUCH_PAD_GESTURES = 0x1;

        const _ = !0;
    }
}

/// Window type as far as input routing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WindowType {
    #[default]
    Application,
    Wallpaper,
    StatusBar,
    InputMethod,
    InputMethodDialog,
    SecureSystemOverlay,
    SystemError,
    Other(i32),
}

/// Application that owns one or more windows.
#[derive(Debug, Clone, PartialEq)]
pub struct InputApplication {
    pub handle: ApplicationHandle,
    pub dispatching_timeout: Nsecs,
}

impl InputApplication {
    pub fn new(name: &str) -> Self {
        Self {
            handle: ApplicationHandle::new(name),
            dispatching_timeout: DEFAULT_INPUT_DISPATCHING_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }
}

/// Snapshot of one window's input-relevant state.
#[derive(Debug, Clone, PartialEq)]
pub struct InputWindow {
    pub handle: WindowHandle,
    pub channel: ChannelId,
    pub flags: WindowFlags,
    pub window_type: WindowType,
    pub dispatching_timeout: Nsecs,
    pub frame: Rectangle,
    pub scale_factor: f32,
    pub touchable_region: Region,
    pub visible: bool,
    pub can_receive_keys: bool,
    pub has_focus: bool,
    pub has_wallpaper: bool,
    pub paused: bool,
    pub layer: i32,
    pub owner_pid: i32,
    pub owner_uid: i32,
    pub input_features: InputFeatures,
    pub application: Option<Arc<InputApplication>>,
}

impl InputWindow {
    /// Creates a visible, focusable application window whose touchable
    /// region is its whole frame.
    pub fn new(handle: WindowHandle, channel: ChannelId, frame: Rectangle) -> Self {
        Self {
            handle,
            channel,
            flags: WindowFlags::empty(),
            window_type: WindowType::Application,
            dispatching_timeout: DEFAULT_INPUT_DISPATCHING_TIMEOUT,
            frame,
            scale_factor: 1.0,
            touchable_region: Region::from_rect(frame),
            visible: true,
            can_receive_keys: true,
            has_focus: false,
            has_wallpaper: false,
            paused: false,
            layer: 0,
            owner_pid: 0,
            owner_uid: 0,
            input_features: InputFeatures::empty(),
            application: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn touchable_region_contains_point(&self, x: i32, y: i32) -> bool {
        self.touchable_region.contains(x, y)
    }

    /// Inclusive frame test used for occlusion.
    pub fn frame_contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.frame.left && x <= self.frame.right && y >= self.frame.top && y <= self.frame.bottom
    }

    /// Trusted overlays never count as obscuring the windows below them.
    pub fn is_trusted_overlay(&self) -> bool {
        matches!(
            self.window_type,
            WindowType::InputMethod | WindowType::InputMethodDialog | WindowType::SecureSystemOverlay
        )
    }

    pub fn supports_split_touch(&self) -> bool {
        self.flags.contains(WindowFlags::SPLIT_TOUCH)
    }

    pub fn is_touch_modal(&self) -> bool {
        !self.flags.intersects(WindowFlags::NOT_FOCUSABLE | WindowFlags::NOT_TOUCH_MODAL)
    }

    pub fn same_application(&self, other: &InputApplication) -> bool {
        self.application
            .as_ref()
            .is_some_and(|app| app.handle == other.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_contains_is_half_open() {
        let rect = Rectangle::from_loc_and_size((0, 0), (100, 50));
        assert!(rect.contains(0, 0));
        assert!(rect.contains(99, 49));
        assert!(!rect.contains(100, 10));
        assert!(!rect.contains(10, 50));
    }

    #[test]
    fn test_touch_modal_requires_focusable_and_modal() {
        let mut window = InputWindow::new(
            WindowHandle::new("w"),
            ChannelId(1),
            Rectangle::new(0, 0, 10, 10),
        );
        assert!(window.is_touch_modal());
        window.flags = WindowFlags::NOT_TOUCH_MODAL;
        assert!(!window.is_touch_modal());
        window.flags = WindowFlags::NOT_FOCUSABLE;
        assert!(!window.is_touch_modal());
    }

    #[test]
    fn test_region_display() {
        let region = Region {
            rects: vec![Rectangle::new(0, 0, 5, 5), Rectangle::new(10, 10, 20, 20)],
        };
        assert_eq!(region.to_string(), "[0,0][5,5]|[10,10][20,20]");
        assert_eq!(Region::default().to_string(), "<empty>");
    }
}
