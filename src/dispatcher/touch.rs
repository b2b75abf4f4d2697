//! Delivery targets and the gesture-scoped touch state.

use crate::channel::ChannelId;
use crate::input::{InputSource, PointerIdBits};
use crate::window::{InputWindow, WindowFlags};
use bitflags::bitflags;
use serde::Serialize;
use std::sync::Arc;

bitflags! {
    /// Properties of a target that hold across every dispatch mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TargetFlags: u32 {
        /// The window receives the event because it is the one being touched
        /// or focused, as opposed to a monitor or outside observer.
        const FOREGROUND = 0x01;
        /// Another visible window overlaps the touch point.
        const WINDOW_IS_OBSCURED = 0x02;
        /// The event is split across windows by pointer id.
        const SPLIT = 0x04;
        /// Coordinates are hidden from the target.
        const ZERO_COORDS = 0x08;
    }
}

bitflags! {
    /// Set of dispatch modes requested for one target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DispatchModes: u32 {
        const AS_IS = 0x01;
        const OUTSIDE = 0x02;
        const HOVER_ENTER = 0x04;
        const HOVER_EXIT = 0x08;
        const SLIPPERY_EXIT = 0x10;
        const SLIPPERY_ENTER = 0x20;
    }
}

/// How one dispatch entry rewrites the event it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DispatchMode {
    HoverExit,
    Outside,
    HoverEnter,
    AsIs,
    SlipperyExit,
    SlipperyEnter,
}

impl DispatchMode {
    /// Order in which a target's modes are enqueued.
    pub const ORDER: [DispatchMode; 6] = [
        DispatchMode::HoverExit,
        DispatchMode::Outside,
        DispatchMode::HoverEnter,
        DispatchMode::AsIs,
        DispatchMode::SlipperyExit,
        DispatchMode::SlipperyEnter,
    ];

    pub fn bit(self) -> DispatchModes {
        match self {
            Self::HoverExit => DispatchModes::HOVER_EXIT,
            Self::Outside => DispatchModes::OUTSIDE,
            Self::HoverEnter => DispatchModes::HOVER_ENTER,
            Self::AsIs => DispatchModes::AS_IS,
            Self::SlipperyExit => DispatchModes::SLIPPERY_EXIT,
            Self::SlipperyEnter => DispatchModes::SLIPPERY_ENTER,
        }
    }
}

impl DispatchModes {
    pub fn iter_ordered(self) -> impl Iterator<Item = DispatchMode> {
        DispatchMode::ORDER
            .into_iter()
            .filter(move |mode| self.contains(mode.bit()))
    }
}

/// A resolved delivery of the current event to one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTarget {
    pub channel: ChannelId,
    pub flags: TargetFlags,
    pub modes: DispatchModes,
    pub x_offset: f32,
    pub y_offset: f32,
    pub scale_factor: f32,
    /// Pointers delivered to this target when the event is split.
    pub pointer_ids: PointerIdBits,
}

impl InputTarget {
    pub fn for_window(
        window: &InputWindow,
        flags: TargetFlags,
        modes: DispatchModes,
        pointer_ids: PointerIdBits,
    ) -> Self {
        Self {
            channel: window.channel,
            flags,
            modes,
            x_offset: -(window.frame.left as f32),
            y_offset: -(window.frame.top as f32),
            scale_factor: window.scale_factor,
            pointer_ids,
        }
    }

    pub fn for_monitor(channel: ChannelId) -> Self {
        Self {
            channel,
            flags: TargetFlags::empty(),
            modes: DispatchModes::AS_IS,
            x_offset: 0.0,
            y_offset: 0.0,
            scale_factor: 1.0,
            pointer_ids: PointerIdBits::empty(),
        }
    }
}

/// A window taking part in the current gesture.
#[derive(Debug, Clone)]
pub struct TouchedWindow {
    pub window: Arc<InputWindow>,
    pub flags: TargetFlags,
    pub modes: DispatchModes,
    pub pointer_ids: PointerIdBits,
}

impl TouchedWindow {
    pub fn channel(&self) -> ChannelId {
        self.window.channel
    }
}

#[derive(Debug, Clone)]
pub struct TouchState {
    pub down: bool,
    pub split: bool,
    pub device_id: i32,
    pub source: InputSource,
    pub windows: Vec<TouchedWindow>,
}

impl Default for TouchState {
    fn default() -> Self {
        Self {
            down: false,
            split: false,
            device_id: -1,
            source: InputSource::empty(),
            windows: Vec::new(),
        }
    }
}

impl TouchState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn add_or_update_window(
        &mut self,
        window: &Arc<InputWindow>,
        flags: TargetFlags,
        modes: DispatchModes,
        pointer_ids: PointerIdBits,
    ) {
        if flags.contains(TargetFlags::SPLIT) {
            self.split = true;
        }

        if let Some(touched) = self
            .windows
            .iter_mut()
            .find(|touched| touched.window.handle == window.handle)
        {
            touched.flags |= flags;
            touched.modes |= modes;
            if modes.contains(DispatchModes::SLIPPERY_EXIT) {
                touched.modes.remove(DispatchModes::AS_IS);
            }
            touched.pointer_ids = touched.pointer_ids.union(pointer_ids);
            return;
        }

        self.windows.push(TouchedWindow {
            window: Arc::clone(window),
            flags,
            modes,
            pointer_ids,
        });
    }

    /// Drops one-shot outside and hover targets and turns slippery entries
    /// into plain as-is targets for the rest of the gesture.
    pub fn filter_non_as_is_touch_windows(&mut self) {
        self.windows.retain_mut(|touched| {
            if touched
                .modes
                .intersects(DispatchModes::AS_IS | DispatchModes::SLIPPERY_ENTER)
            {
                touched.modes = DispatchModes::AS_IS;
                true
            } else {
                false
            }
        });
    }

    pub fn first_foreground_window(&self) -> Option<&Arc<InputWindow>> {
        self.windows
            .iter()
            .find(|touched| touched.flags.contains(TargetFlags::FOREGROUND))
            .map(|touched| &touched.window)
    }

    /// True when exactly one foreground window is touched and it is slippery.
    pub fn is_slippery(&self) -> bool {
        let mut foreground = self
            .windows
            .iter()
            .filter(|touched| touched.flags.contains(TargetFlags::FOREGROUND));
        match (foreground.next(), foreground.next()) {
            (Some(only), None) => only.window.flags.contains(WindowFlags::SLIPPERY),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{Rectangle, WindowHandle};

    fn window(name: &str, channel: u64) -> Arc<InputWindow> {
        Arc::new(InputWindow::new(
            WindowHandle::new(name),
            ChannelId(channel),
            Rectangle::new(0, 0, 100, 100),
        ))
    }

    #[test]
    fn test_modes_iterate_in_fixed_order() {
        let modes = DispatchModes::SLIPPERY_ENTER | DispatchModes::AS_IS | DispatchModes::HOVER_EXIT;
        let ordered: Vec<_> = modes.iter_ordered().collect();
        assert_eq!(
            ordered,
            vec![DispatchMode::HoverExit, DispatchMode::AsIs, DispatchMode::SlipperyEnter]
        );
    }

    #[test]
    fn test_add_or_update_merges_pointer_ids() {
        let w = window("w", 1);
        let mut state = TouchState::default();
        state.add_or_update_window(
            &w,
            TargetFlags::FOREGROUND | TargetFlags::SPLIT,
            DispatchModes::AS_IS,
            PointerIdBits::from_ids([0]),
        );
        state.add_or_update_window(
            &w,
            TargetFlags::FOREGROUND | TargetFlags::SPLIT,
            DispatchModes::AS_IS,
            PointerIdBits::from_ids([2]),
        );
        assert!(state.split);
        assert_eq!(state.windows.len(), 1);
        assert_eq!(state.windows[0].pointer_ids, PointerIdBits::from_ids([0, 2]));
    }

    #[test]
    fn test_slippery_exit_clears_as_is_and_filter_drops_it() {
        let old = window("old", 1);
        let new = window("new", 2);
        let outside = window("outside", 3);
        let mut state = TouchState::default();
        state.add_or_update_window(&old, TargetFlags::FOREGROUND, DispatchModes::AS_IS, PointerIdBits::empty());
        state.add_or_update_window(&outside, TargetFlags::empty(), DispatchModes::OUTSIDE, PointerIdBits::empty());
        state.add_or_update_window(&old, TargetFlags::empty(), DispatchModes::SLIPPERY_EXIT, PointerIdBits::empty());
        state.add_or_update_window(
            &new,
            TargetFlags::FOREGROUND,
            DispatchModes::SLIPPERY_ENTER,
            PointerIdBits::empty(),
        );

        state.filter_non_as_is_touch_windows();
        assert_eq!(state.windows.len(), 1);
        assert_eq!(state.windows[0].window.handle, new.handle);
        assert_eq!(state.windows[0].modes, DispatchModes::AS_IS);
    }

    #[test]
    fn test_is_slippery_needs_single_slippery_foreground() {
        let mut slippery = InputWindow::new(
            WindowHandle::new("slippery"),
            ChannelId(1),
            Rectangle::new(0, 0, 10, 10),
        );
        slippery.flags |= WindowFlags::SLIPPERY;
        let slippery = Arc::new(slippery);
        let plain = window("plain", 2);

        let mut state = TouchState::default();
        assert!(!state.is_slippery());
        state.add_or_update_window(&slippery, TargetFlags::FOREGROUND, DispatchModes::AS_IS, PointerIdBits::empty());
        assert!(state.is_slippery());
        state.add_or_update_window(&plain, TargetFlags::FOREGROUND, DispatchModes::AS_IS, PointerIdBits::empty());
        assert!(!state.is_slippery());
    }
}
