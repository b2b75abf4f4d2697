//! Resolving which windows receive the current event.
//!
//! Key and non-pointer motion events go to the focused window. Pointer
//! events are hit tested against the window list, front to back, and the
//! result is folded into the gesture-scoped [`TouchState`]. The touch state
//! is only committed once the injector is known to be allowed to touch the
//! windows involved.

use super::entry::{EventRef, InjectionResult, InjectionState};
use super::touch::{DispatchModes, InputTarget, TargetFlags, TouchState};
use super::DispatcherState;
use crate::clock::{to_millis_f64, Nsecs};
use crate::input::{MotionAction, PointerIdBits};
use crate::logging::targets;
use crate::window::{InputWindow, WindowFlags, WindowType};
use log::{debug, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectionPermission {
    Unknown,
    Granted,
    Denied,
}

/// Result of resolving touch targets for one motion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct TouchResolution {
    pub result: InjectionResult,
    /// A new gesture started while a previous one was still down.
    pub conflicting_pointer_actions: bool,
    /// Only samples up to and including this index belong to this dispatch;
    /// the rest must be requeued as a separate event.
    pub split_batch_after_sample: Option<usize>,
}

/// Whether resolution should commit the temporary touch state.
enum Exit {
    Commit,
    Unresponsive,
}

fn same_window(a: Option<&Arc<InputWindow>>, b: Option<&Arc<InputWindow>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.handle == b.handle,
        (None, None) => true,
        _ => false,
    }
}

impl DispatcherState {
    pub(super) fn find_focused_window_targets(
        &mut self,
        now: Nsecs,
        event: &EventRef,
        next_wakeup: &mut Nsecs,
    ) -> InjectionResult {
        self.current_input_targets.clear();
        let (event_time, injection_state) = {
            let entry = event.lock();
            (entry.event_time, entry.injection_state.clone())
        };

        let result = 'find: {
            let Some(window) = self.focused_window.clone() else {
                if let Some(application) = self.focused_application.clone() {
                    debug!(
                        target: targets::FOCUS,
                        "Waiting because there is no focused window but there is a focused application that may eventually add a window: {}.",
                        application.name()
                    );
                    break 'find self.handle_targets_not_ready(now, event_time, Some(&application), None, next_wakeup);
                }
                info!("Dropping event because there is no focused window or focused application.");
                break 'find InjectionResult::Failed;
            };

            if !self.check_injection_permission(Some(window.as_ref()), injection_state.as_deref()) {
                break 'find InjectionResult::PermissionDenied;
            }

            if window.paused {
                debug!(target: targets::FOCUS, "Waiting because focused window is paused.");
                let application = self.focused_application.clone();
                break 'find self.handle_targets_not_ready(now, event_time, application.as_ref(), Some(&window), next_wakeup);
            }

            if !self.is_window_finished_with_previous_input(&window) {
                debug!(target: targets::FOCUS, "Waiting because focused window still processing previous input.");
                let application = self.focused_application.clone();
                break 'find self.handle_targets_not_ready(now, event_time, application.as_ref(), Some(&window), next_wakeup);
            }

            self.add_window_target(&window, TargetFlags::FOREGROUND, DispatchModes::AS_IS, PointerIdBits::empty());
            InjectionResult::Succeeded
        };

        debug!(
            target: targets::FOCUS,
            "findFocusedWindow finished: injectionResult={:?}, timeSpentWaitingForApplication={:.1}ms",
            result,
            to_millis_f64(self.time_spent_waiting_for_application(now))
        );
        result
    }

    pub(super) fn find_touched_window_targets(
        &mut self,
        now: Nsecs,
        event: &EventRef,
        next_wakeup: &mut Nsecs,
    ) -> TouchResolution {
        self.current_input_targets.clear();

        let entry = event.lock();
        let event_time = entry.event_time;
        let injection_state = entry.injection_state.clone();
        let Some(motion) = entry.as_motion() else {
            return TouchResolution {
                result: InjectionResult::Failed,
                conflicting_pointer_actions: false,
                split_batch_after_sample: None,
            };
        };

        let action = motion.action;
        let mut outcome = TouchResolution {
            result: InjectionResult::Pending,
            conflicting_pointer_actions: false,
            split_batch_after_sample: None,
        };
        let mut permission = InjectionPermission::Unknown;
        let mut new_hover_window: Option<Arc<InputWindow>> = None;
        let mut temp = TouchState::default();

        let mut is_split = self.touch_state.split;
        let mut switched_device =
            self.touch_state.device_id != motion.device_id || self.touch_state.source != motion.source;
        let is_hover_action = action.is_hover();
        let new_gesture = matches!(action, MotionAction::Down | MotionAction::Scroll) || is_hover_action;
        let mut wrong_device = false;

        let exit = 'resolve: {
            if new_gesture {
                let down = action == MotionAction::Down;
                if switched_device && self.touch_state.down && !down {
                    debug!(
                        target: targets::FOCUS,
                        "Dropping event because a pointer for a different device is already down."
                    );
                    temp = self.touch_state.clone();
                    outcome.result = InjectionResult::Failed;
                    switched_device = false;
                    wrong_device = true;
                    break 'resolve Exit::Commit;
                }
                temp.down = down;
                temp.device_id = motion.device_id;
                temp.source = motion.source;
                is_split = false;
            } else {
                temp = self.touch_state.clone();
            }

            if new_gesture || (is_split && matches!(action, MotionAction::PointerDown(_))) {
                // New splittable pointer going down, or a target is needed for hover or scroll.
                let pointer_index = match action {
                    MotionAction::PointerDown(index) | MotionAction::PointerUp(index) => index,
                    _ => 0,
                };
                let (x, y) = motion.first_point(pointer_index);

                let mut new_touched_window: Option<Arc<InputWindow>> = None;
                let mut top_error_window: Option<Arc<InputWindow>> = None;
                let mut is_touch_modal = false;

                for window in &self.windows {
                    if window.flags.contains(WindowFlags::SYSTEM_ERROR) && top_error_window.is_none() {
                        top_error_window = Some(Arc::clone(window));
                    }

                    if !window.visible {
                        continue;
                    }

                    if !window.flags.contains(WindowFlags::NOT_TOUCHABLE) {
                        is_touch_modal = window.is_touch_modal();
                        if is_touch_modal || window.touchable_region_contains_point(x, y) {
                            new_touched_window = Some(Arc::clone(window));
                            break;
                        }
                    }

                    if action == MotionAction::Down && window.flags.contains(WindowFlags::WATCH_OUTSIDE_TOUCH) {
                        let mut flags = TargetFlags::empty();
                        if self.is_window_obscured_at_point(window, x, y) {
                            flags |= TargetFlags::WINDOW_IS_OBSCURED;
                        }
                        temp.add_or_update_window(window, flags, DispatchModes::OUTSIDE, PointerIdBits::empty());
                    }
                }

                // An error window that is not taking the touch (usually because it
                // is invisible) is waited for; everything else may be in ANR.
                if let Some(error_window) = &top_error_window {
                    if !same_window(new_touched_window.as_ref(), Some(error_window)) {
                        debug!(target: targets::FOCUS, "Waiting because system error window is pending.");
                        outcome.result = self.handle_targets_not_ready(now, event_time, None, None, next_wakeup);
                        permission = InjectionPermission::Unknown;
                        break 'resolve Exit::Unresponsive;
                    }
                }

                if new_touched_window
                    .as_ref()
                    .is_some_and(|window| window.supports_split_touch())
                {
                    is_split = true;
                } else if is_split {
                    // Already split but the new window cannot take part; give the
                    // pointer to the first foreground window instead.
                    new_touched_window = temp.first_foreground_window().cloned();
                }

                let Some(new_touched_window) = new_touched_window else {
                    if let Some(application) = self.focused_application.clone() {
                        debug!(
                            target: targets::FOCUS,
                            "Waiting because there is no touched window but there is a focused application that may eventually add a new window: {}.",
                            application.name()
                        );
                        outcome.result =
                            self.handle_targets_not_ready(now, event_time, Some(&application), None, next_wakeup);
                        break 'resolve Exit::Unresponsive;
                    }
                    info!("Dropping event because there is no touched window or focused application.");
                    outcome.result = InjectionResult::Failed;
                    break 'resolve Exit::Commit;
                };

                let mut flags = TargetFlags::FOREGROUND;
                if is_split {
                    flags |= TargetFlags::SPLIT;
                }
                if self.is_window_obscured_at_point(&new_touched_window, x, y) {
                    flags |= TargetFlags::WINDOW_IS_OBSCURED;
                }

                if is_hover_action {
                    // Later samples that leave the hovered window belong to a
                    // separate dispatch.
                    if !is_touch_modal {
                        for (index, pair) in motion.samples.windows(2).enumerate() {
                            let next = &pair[1].pointer_coords[0];
                            if !new_touched_window.touchable_region_contains_point(next.x as i32, next.y as i32) {
                                outcome.split_batch_after_sample = Some(index);
                                break;
                            }
                        }
                    }
                    new_hover_window = Some(Arc::clone(&new_touched_window));
                } else if action == MotionAction::Scroll {
                    new_hover_window = self.last_hover_window.clone();
                }

                let mut pointer_ids = PointerIdBits::empty();
                if is_split {
                    pointer_ids.mark(motion.pointer_properties[pointer_index].bit());
                }
                temp.add_or_update_window(&new_touched_window, flags, DispatchModes::AS_IS, pointer_ids);
            } else {
                // Pointer move, up, cancel or a non-splittable pointer down.
                if !temp.down {
                    debug!(
                        target: targets::FOCUS,
                        "Dropping event because the pointer is not down or we previously dropped the pointer down event."
                    );
                    outcome.result = InjectionResult::Failed;
                    break 'resolve Exit::Commit;
                }

                if action == MotionAction::Move && motion.pointer_count() == 1 && temp.is_slippery() {
                    let (x, y) = motion.first_point(0);
                    let old_touched_window = temp.first_foreground_window().cloned();
                    let new_touched_window = self.find_touched_window_at(x, y);

                    if let (Some(old), Some(new)) = (old_touched_window, new_touched_window) {
                        if old.handle != new.handle {
                            debug!(
                                target: targets::FOCUS,
                                "Touch is slipping out of window {} into window {}.",
                                old.name(),
                                new.name()
                            );
                            temp.add_or_update_window(
                                &old,
                                TargetFlags::empty(),
                                DispatchModes::SLIPPERY_EXIT,
                                PointerIdBits::empty(),
                            );

                            if new.supports_split_touch() {
                                is_split = true;
                            }
                            let mut flags = TargetFlags::FOREGROUND;
                            if is_split {
                                flags |= TargetFlags::SPLIT;
                            }
                            if self.is_window_obscured_at_point(&new, x, y) {
                                flags |= TargetFlags::WINDOW_IS_OBSCURED;
                            }
                            let mut pointer_ids = PointerIdBits::empty();
                            if is_split {
                                pointer_ids.mark(motion.pointer_properties[0].bit());
                            }
                            temp.add_or_update_window(&new, flags, DispatchModes::SLIPPERY_ENTER, pointer_ids);

                            // Exactly one sample crosses the boundary.
                            outcome.split_batch_after_sample = Some(0);
                        }
                    }
                }
            }

            if !same_window(new_hover_window.as_ref(), self.last_hover_window.as_ref()) {
                // ENTER and EXIT carry exactly one sample.
                outcome.split_batch_after_sample = Some(0);

                if let Some(last) = &self.last_hover_window {
                    debug!(target: targets::HOVER, "Sending hover exit event to window {}.", last.name());
                    temp.add_or_update_window(last, TargetFlags::empty(), DispatchModes::HOVER_EXIT, PointerIdBits::empty());
                }
                if let Some(new) = &new_hover_window {
                    debug!(target: targets::HOVER, "Sending hover enter event to window {}.", new.name());
                    temp.add_or_update_window(new, TargetFlags::empty(), DispatchModes::HOVER_ENTER, PointerIdBits::empty());
                }
            }

            let mut have_foreground_window = false;
            for touched in temp.windows.iter().filter(|t| t.flags.contains(TargetFlags::FOREGROUND)) {
                have_foreground_window = true;
                if !self.check_injection_permission(Some(touched.window.as_ref()), injection_state.as_deref()) {
                    outcome.result = InjectionResult::PermissionDenied;
                    permission = InjectionPermission::Denied;
                    break 'resolve Exit::Commit;
                }
            }
            if !have_foreground_window {
                debug!(
                    target: targets::FOCUS,
                    "Dropping event because there is no touched foreground window to receive it."
                );
                outcome.result = InjectionResult::Failed;
                break 'resolve Exit::Commit;
            }
            permission = InjectionPermission::Granted;

            // Outside watchers owned by someone else must not learn where the touch landed.
            if action == MotionAction::Down {
                if let Some(foreground_uid) = temp.first_foreground_window().map(|w| w.owner_uid) {
                    let outsiders: Vec<Arc<InputWindow>> = temp
                        .windows
                        .iter()
                        .filter(|t| t.modes.contains(DispatchModes::OUTSIDE) && t.window.owner_uid != foreground_uid)
                        .map(|t| Arc::clone(&t.window))
                        .collect();
                    for window in &outsiders {
                        temp.add_or_update_window(
                            window,
                            TargetFlags::ZERO_COORDS,
                            DispatchModes::empty(),
                            PointerIdBits::empty(),
                        );
                    }
                }
            }

            let unready = temp
                .windows
                .iter()
                .filter(|t| t.flags.contains(TargetFlags::FOREGROUND))
                .find_map(|t| {
                    if t.window.paused {
                        Some((Arc::clone(&t.window), "Waiting because touched window is paused."))
                    } else if !self.is_window_finished_with_previous_input(&t.window) {
                        Some((
                            Arc::clone(&t.window),
                            "Waiting because touched window still processing previous input.",
                        ))
                    } else {
                        None
                    }
                });
            if let Some((window, reason)) = unready {
                debug!(target: targets::FOCUS, "{}", reason);
                outcome.result = self.handle_targets_not_ready(now, event_time, None, Some(&window), next_wakeup);
                break 'resolve Exit::Unresponsive;
            }

            // Wallpapers are locked in for the whole gesture when the first
            // pointer goes down on a window that shows one.
            if action == MotionAction::Down
                && temp.first_foreground_window().is_some_and(|w| w.has_wallpaper)
            {
                let wallpapers: Vec<Arc<InputWindow>> = self
                    .windows
                    .iter()
                    .filter(|w| w.window_type == WindowType::Wallpaper)
                    .cloned()
                    .collect();
                for wallpaper in &wallpapers {
                    temp.add_or_update_window(
                        wallpaper,
                        TargetFlags::WINDOW_IS_OBSCURED,
                        DispatchModes::AS_IS,
                        PointerIdBits::empty(),
                    );
                }
            }

            outcome.result = InjectionResult::Succeeded;
            for touched in &temp.windows {
                self.add_window_target(&touched.window, touched.flags, touched.modes, touched.pointer_ids);
            }
            temp.filter_non_as_is_touch_windows();
            Exit::Commit
        };

        if let Exit::Commit = exit {
            if permission == InjectionPermission::Unknown {
                permission = if self.check_injection_permission(None, injection_state.as_deref()) {
                    InjectionPermission::Granted
                } else {
                    InjectionPermission::Denied
                };
            }

            if permission == InjectionPermission::Granted {
                if !wrong_device {
                    if switched_device {
                        debug!(target: targets::FOCUS, "Conflicting pointer actions: Switched to a different device.");
                        outcome.conflicting_pointer_actions = true;
                    }

                    if is_hover_action {
                        // Started hovering, so nothing is down any more.
                        if self.touch_state.down {
                            debug!(
                                target: targets::FOCUS,
                                "Conflicting pointer actions: Hover received while pointer was down."
                            );
                            outcome.conflicting_pointer_actions = true;
                        }
                        self.touch_state.reset();
                        if matches!(action, MotionAction::HoverEnter | MotionAction::HoverMove) {
                            self.touch_state.device_id = motion.device_id;
                            self.touch_state.source = motion.source;
                        }
                    } else {
                        match action {
                            MotionAction::Up | MotionAction::Cancel => self.touch_state.reset(),
                            MotionAction::Down => {
                                if self.touch_state.down {
                                    debug!(
                                        target: targets::FOCUS,
                                        "Conflicting pointer actions: Down received while already down."
                                    );
                                    outcome.conflicting_pointer_actions = true;
                                }
                                self.touch_state = temp;
                            }
                            MotionAction::PointerUp(index) => {
                                if is_split {
                                    let pointer_id = motion.pointer_properties[index].bit();
                                    temp.windows.retain_mut(|touched| {
                                        if touched.flags.contains(TargetFlags::SPLIT) {
                                            touched.pointer_ids.clear(pointer_id);
                                            return !touched.pointer_ids.is_empty();
                                        }
                                        true
                                    });
                                }
                                self.touch_state = temp;
                            }
                            // Only valid for this action.
                            MotionAction::Scroll => {}
                            _ => self.touch_state = temp,
                        }
                    }

                    self.last_hover_window = new_hover_window;
                }
            } else {
                debug!(target: targets::FOCUS, "Not updating touch focus because injection was denied.");
            }
        }

        debug!(
            target: targets::FOCUS,
            "findTouchedWindow finished: injectionResult={:?}, injectionPermission={:?}, timeSpentWaitingForApplication={:.1}ms",
            outcome.result,
            permission,
            to_millis_f64(self.time_spent_waiting_for_application(now))
        );
        outcome
    }

    /// Topmost visible touchable window at a point, stopping at a system
    /// error window.
    pub(super) fn find_touched_window_at(&self, x: i32, y: i32) -> Option<Arc<InputWindow>> {
        for window in &self.windows {
            if window.visible
                && !window.flags.contains(WindowFlags::NOT_TOUCHABLE)
                && (window.is_touch_modal() || window.touchable_region_contains_point(x, y))
            {
                return Some(Arc::clone(window));
            }
            if window.flags.contains(WindowFlags::SYSTEM_ERROR) {
                // Error window is on top but not visible, so touch is dropped.
                return None;
            }
        }
        None
    }

    pub(super) fn add_window_target(
        &mut self,
        window: &InputWindow,
        flags: TargetFlags,
        modes: DispatchModes,
        pointer_ids: PointerIdBits,
    ) {
        self.current_input_targets
            .push(InputTarget::for_window(window, flags, modes, pointer_ids));
    }

    pub(super) fn add_monitoring_targets(&mut self) {
        let monitors = self.monitoring_channels.iter().copied().map(InputTarget::for_monitor);
        self.current_input_targets.extend(monitors);
    }

    pub(super) fn check_injection_permission(
        &self,
        window: Option<&InputWindow>,
        injection_state: Option<&InjectionState>,
    ) -> bool {
        let Some(state) = injection_state else {
            return true;
        };
        if window.is_some_and(|window| window.owner_uid == state.injector_uid) {
            return true;
        }
        if self.has_injection_permission(state.injector_pid, state.injector_uid) {
            return true;
        }

        match window {
            Some(window) => warn!(
                "Permission denied: injecting event from pid {} uid {} to window with input channel {} owned by uid {}",
                state.injector_pid,
                state.injector_uid,
                self.connections
                    .get(&window.channel)
                    .map_or_else(|| window.channel.to_string(), |c| c.name().to_string()),
                window.owner_uid
            ),
            None => warn!(
                "Permission denied: injecting event from pid {} uid {}",
                state.injector_pid, state.injector_uid
            ),
        }
        false
    }

    pub(super) fn has_injection_permission(&self, injector_pid: i32, injector_uid: i32) -> bool {
        injector_uid == 0 || self.policy.check_inject_events_permission(injector_pid, injector_uid)
    }

    /// True when a visible, untrusted window above `window` covers the point.
    pub(super) fn is_window_obscured_at_point(&self, window: &InputWindow, x: i32, y: i32) -> bool {
        self.windows
            .iter()
            .take_while(|other| other.handle != window.handle)
            .any(|other| other.visible && !other.is_trusted_overlay() && other.frame_contains_point(x, y))
    }

    /// A window is ready for new input once everything previously sent to it
    /// has been acknowledged.
    pub(super) fn is_window_finished_with_previous_input(&self, window: &InputWindow) -> bool {
        self.connections
            .get(&window.channel)
            .map_or(true, |connection| connection.outbound_queue.is_empty())
    }
}
