//! Diagnostic view of the dispatcher state.

use super::anr::InputTargetWaitCause;
use super::connection::ConnectionStatus;
use super::{DispatcherState, InputDispatcher};
use crate::clock::{to_millis_f64, Nsecs};
use crate::channel::ChannelId;
use crate::config::DispatcherConfig;
use crate::window::{InputWindow, Region};
use serde::Serialize;
use std::fmt::{self, Write};

const INDENT: &str = "  ";
const INDENT2: &str = "    ";

#[derive(Debug, Clone, Serialize)]
pub struct TouchedWindowSnapshot {
    pub name: String,
    pub pointer_ids: u32,
    pub target_flags: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub name: String,
    pub paused: bool,
    pub has_focus: bool,
    pub has_wallpaper: bool,
    pub visible: bool,
    pub can_receive_keys: bool,
    pub flags: u32,
    pub window_type: String,
    pub layer: i32,
    /// left, top, right, bottom
    pub frame: [i32; 4],
    pub scale_factor: f32,
    pub touchable_region: Vec<[i32; 4]>,
    pub input_features: u32,
    pub owner_pid: i32,
    pub owner_uid: i32,
    pub dispatching_timeout_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub status: ConnectionStatus,
    pub monitor: bool,
    pub outbound_queue_length: usize,
    pub input_state_is_neutral: bool,
}

/// Everything `dump()` prints, in serialisable form.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub dispatch_enabled: bool,
    pub dispatch_frozen: bool,
    pub input_filter_enabled: bool,
    pub focused_application: Option<String>,
    pub focused_application_timeout_ms: Option<f64>,
    pub focused_window: Option<String>,
    pub touch_down: bool,
    pub touch_split: bool,
    pub touch_device_id: i32,
    pub touch_source: u32,
    pub touched_windows: Vec<TouchedWindowSnapshot>,
    pub windows: Vec<WindowSnapshot>,
    pub monitoring_channels: Vec<String>,
    pub inbound_queue_length: usize,
    pub pending_event: bool,
    pub active_connections: Vec<ConnectionSnapshot>,
    /// Time until the pending app switch is due, if one is pending.
    pub app_switch_due_in_ms: Option<f64>,
    pub input_target_wait_cause: InputTargetWaitCause,
    pub time_spent_waiting_for_application_ms: f64,
    pub live_entries: usize,
    pub config: DispatcherConfig,
}

fn region_rects(region: &Region) -> Vec<[i32; 4]> {
    region
        .rects
        .iter()
        .map(|rect| [rect.left, rect.top, rect.right, rect.bottom])
        .collect()
}

fn window_snapshot(window: &InputWindow) -> WindowSnapshot {
    WindowSnapshot {
        name: window.name().to_string(),
        paused: window.paused,
        has_focus: window.has_focus,
        has_wallpaper: window.has_wallpaper,
        visible: window.visible,
        can_receive_keys: window.can_receive_keys,
        flags: window.flags.bits(),
        window_type: format!("{:?}", window.window_type),
        layer: window.layer,
        frame: [window.frame.left, window.frame.top, window.frame.right, window.frame.bottom],
        scale_factor: window.scale_factor,
        touchable_region: region_rects(&window.touchable_region),
        input_features: window.input_features.bits(),
        owner_pid: window.owner_pid,
        owner_uid: window.owner_uid,
        dispatching_timeout_ms: to_millis_f64(window.dispatching_timeout),
    }
}

impl DispatcherState {
    fn snapshot(&self, now: Nsecs, live_entries: usize) -> DispatcherSnapshot {
        let channel_name = |channel: ChannelId| {
            self.connections
                .get(&channel)
                .map_or_else(|| format!("{}", channel), |connection| connection.name().to_string())
        };

        DispatcherSnapshot {
            dispatch_enabled: self.dispatch_enabled,
            dispatch_frozen: self.dispatch_frozen,
            input_filter_enabled: self.input_filter_enabled,
            focused_application: self.focused_application.as_ref().map(|app| app.name().to_string()),
            focused_application_timeout_ms: self
                .focused_application
                .as_ref()
                .map(|app| to_millis_f64(app.dispatching_timeout)),
            focused_window: self.focused_window.as_ref().map(|window| window.name().to_string()),
            touch_down: self.touch_state.down,
            touch_split: self.touch_state.split,
            touch_device_id: self.touch_state.device_id,
            touch_source: self.touch_state.source.bits(),
            touched_windows: self
                .touch_state
                .windows
                .iter()
                .map(|touched| TouchedWindowSnapshot {
                    name: touched.window.name().to_string(),
                    pointer_ids: touched.pointer_ids.bits(),
                    target_flags: touched.flags.bits(),
                })
                .collect(),
            windows: self.windows.iter().map(|window| window_snapshot(window)).collect(),
            monitoring_channels: self.monitoring_channels.iter().map(|&channel| channel_name(channel)).collect(),
            inbound_queue_length: self.inbound_queue.len(),
            pending_event: self.pending_event.is_some(),
            active_connections: self
                .active_connections
                .iter()
                .filter_map(|channel| self.connections.get(channel))
                .map(|connection| ConnectionSnapshot {
                    name: connection.name().to_string(),
                    status: connection.status,
                    monitor: connection.monitor,
                    outbound_queue_length: connection.outbound_queue.len(),
                    input_state_is_neutral: connection.input_state.is_neutral(),
                })
                .collect(),
            app_switch_due_in_ms: self
                .is_app_switch_pending()
                .then(|| to_millis_f64(self.app_switch_due_time - now)),
            input_target_wait_cause: self.anr.cause,
            time_spent_waiting_for_application_ms: to_millis_f64(self.time_spent_waiting_for_application(now)),
            live_entries,
            config: self.config.clone(),
        }
    }
}

impl fmt::Display for DispatcherSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Input Dispatcher State:")?;
        writeln!(f, "{INDENT}DispatchEnabled: {}", self.dispatch_enabled)?;
        writeln!(f, "{INDENT}DispatchFrozen: {}", self.dispatch_frozen)?;
        writeln!(f, "{INDENT}InputFilterEnabled: {}", self.input_filter_enabled)?;

        match (&self.focused_application, self.focused_application_timeout_ms) {
            (Some(name), Some(timeout)) => writeln!(
                f,
                "{INDENT}FocusedApplication: name='{}', dispatchingTimeout={:.3}ms",
                name, timeout
            )?,
            _ => writeln!(f, "{INDENT}FocusedApplication: <null>")?,
        }
        writeln!(
            f,
            "{INDENT}FocusedWindow: name='{}'",
            self.focused_window.as_deref().unwrap_or("<null>")
        )?;

        writeln!(f, "{INDENT}TouchDown: {}", self.touch_down)?;
        writeln!(f, "{INDENT}TouchSplit: {}", self.touch_split)?;
        writeln!(f, "{INDENT}TouchDeviceId: {}", self.touch_device_id)?;
        writeln!(f, "{INDENT}TouchSource: 0x{:08x}", self.touch_source)?;
        if self.touched_windows.is_empty() {
            writeln!(f, "{INDENT}TouchedWindows: <none>")?;
        } else {
            writeln!(f, "{INDENT}TouchedWindows:")?;
            for (i, touched) in self.touched_windows.iter().enumerate() {
                writeln!(
                    f,
                    "{INDENT2}{}: name='{}', pointerIds=0x{:x}, targetFlags=0x{:x}",
                    i, touched.name, touched.pointer_ids, touched.target_flags
                )?;
            }
        }

        if self.windows.is_empty() {
            writeln!(f, "{INDENT}Windows: <none>")?;
        } else {
            writeln!(f, "{INDENT}Windows:")?;
            for (i, window) in self.windows.iter().enumerate() {
                let mut region = String::new();
                if window.touchable_region.is_empty() {
                    region.push_str("<empty>");
                }
                for (j, [left, top, right, bottom]) in window.touchable_region.iter().enumerate() {
                    if j > 0 {
                        region.push('|');
                    }
                    write!(region, "[{},{}][{},{}]", left, top, right, bottom)?;
                }
                let [left, top, right, bottom] = window.frame;
                writeln!(
                    f,
                    "{INDENT2}{}: name='{}', paused={}, hasFocus={}, hasWallpaper={}, visible={}, canReceiveKeys={}, \
                     flags=0x{:08x}, type={}, layer={}, frame=[{},{}][{},{}], scale={:.6}, touchableRegion={}, \
                     inputFeatures=0x{:08x}, ownerPid={}, ownerUid={}, dispatchingTimeout={:.3}ms",
                    i,
                    window.name,
                    window.paused,
                    window.has_focus,
                    window.has_wallpaper,
                    window.visible,
                    window.can_receive_keys,
                    window.flags,
                    window.window_type,
                    window.layer,
                    left,
                    top,
                    right,
                    bottom,
                    window.scale_factor,
                    region,
                    window.input_features,
                    window.owner_pid,
                    window.owner_uid,
                    window.dispatching_timeout_ms
                )?;
            }
        }

        if self.monitoring_channels.is_empty() {
            writeln!(f, "{INDENT}MonitoringChannels: <none>")?;
        } else {
            writeln!(f, "{INDENT}MonitoringChannels:")?;
            for (i, name) in self.monitoring_channels.iter().enumerate() {
                writeln!(f, "{INDENT2}{}: '{}'", i, name)?;
            }
        }

        writeln!(f, "{INDENT}InboundQueue: length={}", self.inbound_queue_length)?;

        if self.active_connections.is_empty() {
            writeln!(f, "{INDENT}ActiveConnections: <none>")?;
        } else {
            writeln!(f, "{INDENT}ActiveConnections:")?;
            for (i, connection) in self.active_connections.iter().enumerate() {
                writeln!(
                    f,
                    "{INDENT2}{}: '{}', status={}, outboundQueueLength={}, inputState.isNeutral={}",
                    i,
                    connection.name,
                    connection.status.label(),
                    connection.outbound_queue_length,
                    connection.input_state_is_neutral
                )?;
            }
        }

        match self.app_switch_due_in_ms {
            Some(due_in) => writeln!(f, "{INDENT}AppSwitch: pending, due in {:.1}ms", due_in)?,
            None => writeln!(f, "{INDENT}AppSwitch: not pending")?,
        }

        writeln!(
            f,
            "{INDENT}InputTargetWait: cause={:?}, timeSpentWaitingForApplication={:.1}ms",
            self.input_target_wait_cause, self.time_spent_waiting_for_application_ms
        )?;
        writeln!(f, "{INDENT}LiveEventEntries: {}", self.live_entries)?;

        writeln!(f, "{INDENT}Configuration:")?;
        writeln!(
            f,
            "{INDENT2}MaxEventsPerSecond: {}",
            self.config.dispatcher.max_events_per_second
        )?;
        writeln!(
            f,
            "{INDENT2}KeyRepeatDelay: {:.1}ms",
            to_millis_f64(self.config.dispatcher.key_repeat_delay())
        )?;
        writeln!(
            f,
            "{INDENT2}KeyRepeatTimeout: {:.1}ms",
            to_millis_f64(self.config.dispatcher.key_repeat_timeout())
        )
    }
}

impl InputDispatcher {
    /// Point-in-time copy of the dispatcher state.
    pub fn snapshot(&self) -> DispatcherSnapshot {
        let now = self.clock.now();
        self.state.lock().snapshot(now, self.allocator.live_entries())
    }

    /// Human readable report of the dispatcher state.
    pub fn dump(&self) -> String {
        self.snapshot().to_string()
    }
}
