//! Per-window connections and the publish / acknowledge dispatch cycle.
//!
//! A connection owns the publisher end of one channel, the queue of dispatch
//! entries waiting for that channel and the ledger of what the consumer
//! believes is down. Only the head of the outbound queue is ever in flight.

use super::entry::{
    decrement_pending_foreground_dispatches, increment_pending_foreground_dispatches, DispatchEntry,
    EventAllocator, EventKind, EventRef, MotionEntry, MotionSample, ResolvedEvent,
};
use super::input_state::{CancelationOptions, InputState};
use super::touch::{DispatchMode, DispatchModes, InputTarget, TargetFlags};
use super::{Command, DispatcherState};
use crate::channel::{
    ChannelError, ChannelId, InputChannel, InputPublisher, KeyMessage, MotionMessage, MotionMessageSample,
};
use crate::clock::{to_millis_f64, Nsecs};
use crate::input::{MotionAction, MotionFlags, PointerCoords, PointerIdBits};
use crate::logging::targets;
use crate::window::WindowHandle;
use log::{debug, error, warn};
use parking_lot::Condvar;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    /// Everything is peachy.
    Normal,
    /// An unrecoverable communication error occurred.
    Broken,
    /// The channel was unregistered while an event was in flight.
    Zombie,
}

impl ConnectionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Broken => "BROKEN",
            Self::Zombie => "ZOMBIE",
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub status: ConnectionStatus,
    pub publisher: InputPublisher,
    pub window: Option<WindowHandle>,
    pub monitor: bool,
    pub outbound_queue: VecDeque<DispatchEntry>,
    pub input_state: InputState,
    pub last_event_time: Nsecs,
    pub last_dispatch_time: Nsecs,
}

impl Connection {
    pub fn new(channel: InputChannel, window: Option<WindowHandle>, monitor: bool) -> Self {
        Self {
            status: ConnectionStatus::Normal,
            publisher: InputPublisher::new(channel),
            window,
            monitor,
            outbound_queue: VecDeque::new(),
            input_state: InputState::new(),
            last_event_time: Nsecs::MAX,
            last_dispatch_time: Nsecs::MAX,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.publisher.channel().id()
    }

    pub fn name(&self) -> &str {
        self.publisher.channel().name()
    }

    pub fn event_latency_millis(&self, now: Nsecs) -> f64 {
        to_millis_f64(now.saturating_sub(self.last_event_time))
    }

    pub fn dispatch_latency_millis(&self, now: Nsecs) -> f64 {
        to_millis_f64(now.saturating_sub(self.last_dispatch_time))
    }

    /// Queues one delivery of `event` in `mode`, unless the ledger rejects it.
    fn enqueue_dispatch_entry(&mut self, event: &EventRef, target: &InputTarget, resume: bool, mode: DispatchMode) {
        if !target.modes.contains(mode.bit()) {
            return;
        }

        let entry = event.lock();
        let resolved = match &entry.kind {
            EventKind::Key(key) => {
                if !self.input_state.track_key(key, key.action, key.flags) {
                    debug!(
                        target: targets::DISPATCH_CYCLE,
                        "channel '{}' ~ enqueueDispatchEntry: skipping inconsistent key event",
                        self.name()
                    );
                    return;
                }
                ResolvedEvent::Key {
                    action: key.action,
                    flags: key.flags,
                }
            }
            EventKind::Motion(motion) => {
                let mut action = match mode {
                    DispatchMode::Outside => MotionAction::Outside,
                    DispatchMode::HoverExit => MotionAction::HoverExit,
                    DispatchMode::HoverEnter => MotionAction::HoverEnter,
                    DispatchMode::SlipperyExit => MotionAction::Cancel,
                    DispatchMode::SlipperyEnter => MotionAction::Down,
                    DispatchMode::AsIs => motion.action,
                };
                if action == MotionAction::HoverMove
                    && !self.input_state.is_hovering(motion.device_id, motion.source)
                {
                    debug!(
                        target: targets::DISPATCH_CYCLE,
                        "channel '{}' ~ enqueueDispatchEntry: filling in missing hover enter event",
                        self.name()
                    );
                    action = MotionAction::HoverEnter;
                }

                let mut flags = motion.flags;
                if target.flags.contains(TargetFlags::WINDOW_IS_OBSCURED) {
                    flags |= MotionFlags::WINDOW_IS_OBSCURED;
                }

                if !self.input_state.track_motion(motion, action, flags) {
                    debug!(
                        target: targets::DISPATCH_CYCLE,
                        "channel '{}' ~ enqueueDispatchEntry: skipping inconsistent motion event",
                        self.name()
                    );
                    return;
                }
                ResolvedEvent::Motion { action, flags }
            }
            EventKind::ConfigurationChanged => return,
        };

        // Samples that could not be streamed start the next cycle at the
        // freshly appended one.
        let head_motion_sample = if resume {
            entry.as_motion().map(MotionEntry::last_sample_index)
        } else {
            None
        };

        if target.flags.contains(TargetFlags::FOREGROUND) {
            increment_pending_foreground_dispatches(&entry);
        }
        drop(entry);

        self.outbound_queue.push_back(DispatchEntry {
            event: event.clone(),
            target_flags: target.flags,
            mode,
            x_offset: target.x_offset,
            y_offset: target.y_offset,
            scale_factor: target.scale_factor,
            in_progress: false,
            resolved,
            head_motion_sample,
            tail_motion_sample: None,
        });
    }

    /// Publishes the head of the outbound queue and signals the consumer.
    fn start_dispatch_cycle(&mut self, now: Nsecs) -> Result<(), ChannelError> {
        let Some(dispatch) = self.outbound_queue.front_mut() else {
            return Ok(());
        };
        debug!(target: targets::DISPATCH_CYCLE, "channel '{}' ~ startDispatchCycle", self.publisher.channel().name());

        dispatch.in_progress = true;
        let event = dispatch.event.clone();
        let entry = event.lock();

        match (&entry.kind, dispatch.resolved) {
            (EventKind::Key(key), ResolvedEvent::Key { action, flags }) => {
                self.publisher.publish_key_event(KeyMessage {
                    device_id: key.device_id,
                    source: key.source,
                    action,
                    flags,
                    key_code: key.key_code,
                    scan_code: key.scan_code,
                    meta_state: key.meta_state,
                    repeat_count: key.repeat_count,
                    down_time: key.down_time,
                    event_time: entry.event_time,
                })?;
            }
            (EventKind::Motion(motion), ResolvedEvent::Motion { action, flags }) => {
                let zero_coords = dispatch.target_flags.contains(TargetFlags::ZERO_COORDS);
                let (x_offset, y_offset, scale_factor) = if motion.source.is_pointer() && !zero_coords {
                    let scale = dispatch.scale_factor;
                    (dispatch.x_offset * scale, dispatch.y_offset * scale, scale)
                } else {
                    (0.0, 0.0, 1.0)
                };
                let coords_of = |sample: &MotionSample| -> Vec<PointerCoords> {
                    let mut coords = sample.pointer_coords.clone();
                    if zero_coords {
                        coords.iter_mut().for_each(PointerCoords::clear);
                    } else if scale_factor != 1.0 {
                        coords.iter_mut().for_each(|c| c.scale(scale_factor));
                    }
                    coords
                };

                let first = dispatch
                    .head_motion_sample
                    .filter(|&index| index < motion.samples.len())
                    .unwrap_or(0);
                let first_sample = &motion.samples[first];
                self.publisher.publish_motion_event(MotionMessage {
                    device_id: motion.device_id,
                    source: motion.source,
                    action,
                    flags,
                    edge_flags: motion.edge_flags,
                    meta_state: motion.meta_state,
                    button_state: motion.button_state,
                    x_offset,
                    y_offset,
                    x_precision: motion.x_precision,
                    y_precision: motion.y_precision,
                    down_time: motion.down_time,
                    pointer_properties: motion.pointer_properties.clone(),
                    samples: vec![MotionMessageSample {
                        event_time: first_sample.event_time,
                        pointer_coords: coords_of(first_sample),
                    }],
                })?;

                if action.accepts_appended_samples() {
                    let mut next = first + 1;
                    while let Some(sample) = motion.samples.get(next) {
                        match self.publisher.append_motion_sample(sample.event_time, coords_of(sample)) {
                            Ok(()) => next += 1,
                            Err(ChannelError::BufferFull) => {
                                debug!(
                                    target: targets::DISPATCH_CYCLE,
                                    "channel '{}' ~ Shared buffer full. Some motion samples will be sent in the next dispatch cycle.",
                                    self.publisher.channel().name()
                                );
                                break;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    dispatch.tail_motion_sample = (next < motion.samples.len()).then_some(next);
                }
            }
            _ => {
                return Err(ChannelError::InvalidOperation(
                    "dispatch entry does not match its event",
                ))
            }
        }

        let event_time = entry.event_time;
        drop(entry);

        self.publisher.send_dispatch_signal()?;
        self.last_event_time = event_time;
        self.last_dispatch_time = now;
        Ok(())
    }

    fn drain_outbound_queue(&mut self, sync_finished: &Condvar) {
        while let Some(dispatch) = self.outbound_queue.pop_front() {
            release_dispatch_entry(dispatch, sync_finished);
        }
    }
}

fn release_dispatch_entry(dispatch: DispatchEntry, sync_finished: &Condvar) {
    if dispatch.has_foreground_target() {
        decrement_pending_foreground_dispatches(&dispatch.event.lock(), sync_finished);
    }
}

/// Copies the pointers named in `pointer_ids` out of a motion event.
///
/// Secondary pointer transitions are remapped: the last claimed pointer going
/// down or up becomes a plain DOWN or UP, and a transition of an unclaimed
/// pointer becomes a MOVE.
pub fn split_motion_event(allocator: &EventAllocator, original: &EventRef, pointer_ids: PointerIdBits) -> Option<EventRef> {
    let entry = original.lock();
    let motion = entry.as_motion()?;

    let mut index_map = Vec::with_capacity(pointer_ids.count());
    let mut properties = Vec::with_capacity(pointer_ids.count());
    for (index, pointer) in motion.pointer_properties.iter().enumerate() {
        if pointer_ids.has(pointer.bit()) {
            index_map.push(index);
            properties.push(*pointer);
        }
    }

    if properties.len() != pointer_ids.count() {
        // Can happen when the device sends a broken sequence of pointer ids.
        warn!(
            "Dropping split motion event because the pointer count is {} but we expected there to be {} pointers.",
            properties.len(),
            pointer_ids.count()
        );
        return None;
    }

    let action = match motion.action {
        MotionAction::PointerDown(index) | MotionAction::PointerUp(index) => {
            let id = motion.pointer_properties[index].bit();
            let going_down = matches!(motion.action, MotionAction::PointerDown(_));
            match properties.iter().position(|p| p.bit() == id) {
                Some(_) if properties.len() == 1 => {
                    if going_down {
                        MotionAction::Down
                    } else {
                        MotionAction::Up
                    }
                }
                Some(split_index) if going_down => MotionAction::PointerDown(split_index),
                Some(split_index) => MotionAction::PointerUp(split_index),
                None => MotionAction::Move,
            }
        }
        action => action,
    };

    let samples = motion
        .samples
        .iter()
        .map(|sample| MotionSample {
            event_time: sample.event_time,
            event_time_before_coalescing: sample.event_time_before_coalescing,
            pointer_coords: index_map.iter().map(|&index| sample.pointer_coords[index]).collect(),
        })
        .collect();

    let split = allocator.obtain_motion(
        entry.event_time,
        entry.policy_flags,
        MotionEntry {
            device_id: motion.device_id,
            source: motion.source,
            action,
            flags: motion.flags,
            meta_state: motion.meta_state,
            button_state: motion.button_state,
            edge_flags: motion.edge_flags,
            x_precision: motion.x_precision,
            y_precision: motion.y_precision,
            down_time: motion.down_time,
            pointer_properties: properties,
            samples,
        },
    );
    split.lock().injection_state = entry.injection_state.clone();
    Some(split)
}

impl DispatcherState {
    /// Queues `event` for one target on its connection and starts the cycle
    /// if the connection was idle.
    pub(super) fn prepare_dispatch_cycle(
        &mut self,
        now: Nsecs,
        channel: ChannelId,
        event: &EventRef,
        target: &InputTarget,
        resume_with_appended_motion_sample: bool,
    ) {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        debug!(
            target: targets::DISPATCH_CYCLE,
            "channel '{}' ~ prepareDispatchCycle - flags={:?}, xOffset={}, yOffset={}, scaleFactor={}, pointerIds={}, resume={}",
            connection.name(),
            target.flags,
            target.x_offset,
            target.y_offset,
            target.scale_factor,
            target.pointer_ids,
            resume_with_appended_motion_sample
        );

        if connection.status != ConnectionStatus::Normal {
            debug!(
                target: targets::DISPATCH_CYCLE,
                "channel '{}' ~ Dropping event because the channel status is {}",
                connection.name(),
                connection.status.label()
            );
            return;
        }

        let split_event;
        let mut event = event;
        if target.flags.contains(TargetFlags::SPLIT) {
            let pointer_count = event.lock().as_motion().map(MotionEntry::pointer_count);
            if pointer_count.is_some_and(|count| count != target.pointer_ids.count()) {
                match split_motion_event(&self.allocator, event, target.pointer_ids) {
                    Some(split) => {
                        debug!(target: targets::FOCUS, "channel '{}' ~ Split motion event.", connection.name());
                        split_event = split;
                        event = &split_event;
                    }
                    None => return,
                }
            }
        }

        let was_empty = connection.outbound_queue.is_empty();

        if !was_empty && resume_with_appended_motion_sample {
            let queued = connection
                .outbound_queue
                .iter_mut()
                .rev()
                .find(|dispatch| dispatch.event.ptr_eq(event));
            if let Some(dispatch) = queued {
                if !dispatch.in_progress {
                    debug!(
                        target: targets::BATCHING,
                        "Not streaming because the motion event has not yet been dispatched."
                    );
                    return;
                }
                if dispatch.tail_motion_sample.is_some() {
                    debug!(
                        target: targets::BATCHING,
                        "Not streaming because no new samples can be appended in this dispatch cycle."
                    );
                    return;
                }
                if dispatch.mode != DispatchMode::AsIs {
                    debug!(
                        target: targets::BATCHING,
                        "Not streaming because the motion event was not being dispatched as-is."
                    );
                    return;
                }

                let entry = event.lock();
                let Some(motion) = entry.as_motion() else {
                    return;
                };
                let sample = motion.last_sample();
                let mut coords = sample.pointer_coords.clone();
                if dispatch.scale_factor != 1.0 {
                    coords.iter_mut().for_each(|c| c.scale(dispatch.scale_factor));
                }
                match connection.publisher.append_motion_sample(sample.event_time, coords) {
                    Ok(()) => {
                        debug!(target: targets::BATCHING, "Successfully streamed new motion sample.");
                    }
                    Err(err) => {
                        debug!(
                            target: targets::BATCHING,
                            "Could not append motion sample to currently dispatched move event: {}. Waiting for next dispatch cycle to start.",
                            err
                        );
                        dispatch.tail_motion_sample = Some(motion.last_sample_index());
                    }
                }
                return;
            }
        }

        for mode in target.modes.iter_ordered() {
            connection.enqueue_dispatch_entry(event, target, resume_with_appended_motion_sample, mode);
        }

        if was_empty && !connection.outbound_queue.is_empty() {
            self.activate_connection(channel);
            self.start_dispatch_cycle(now, channel);
        }
    }

    pub(super) fn start_dispatch_cycle(&mut self, now: Nsecs, channel: ChannelId) {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        if let Err(err) = connection.start_dispatch_cycle(now) {
            error!("channel '{}' ~ Could not publish event: {}", connection.name(), err);
            self.abort_broken_dispatch_cycle(now, channel);
        }
    }

    pub(super) fn finish_dispatch_cycle(&mut self, now: Nsecs, channel: ChannelId, handled: bool) {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        debug!(
            target: targets::DISPATCH_CYCLE,
            "channel '{}' ~ finishDispatchCycle - {:.1}ms since event, {:.1}ms since dispatch, handled={}",
            connection.name(),
            connection.event_latency_millis(now),
            connection.dispatch_latency_millis(now),
            handled
        );

        if connection.status != ConnectionStatus::Normal {
            return;
        }

        if let Err(err) = connection.publisher.reset() {
            error!("channel '{}' ~ Could not reset publisher: {}", connection.name(), err);
            self.abort_broken_dispatch_cycle(now, channel);
            return;
        }

        self.commands
            .push_back(Command::DispatchCycleFinished { channel, handled });
    }

    /// Advances past the acknowledged head entry, resuming its unsent
    /// samples first.
    pub(super) fn start_next_dispatch_cycle(&mut self, now: Nsecs, channel: ChannelId) {
        loop {
            let Some(connection) = self.connections.get_mut(&channel) else {
                return;
            };
            let Some(head) = connection.outbound_queue.front_mut() else {
                break;
            };

            if !head.in_progress {
                self.start_dispatch_cycle(now, channel);
                return;
            }

            if let Some(tail) = head.tail_motion_sample.take() {
                head.in_progress = false;
                head.head_motion_sample = Some(tail);
                self.start_dispatch_cycle(now, channel);
                return;
            }

            if let Some(finished) = connection.outbound_queue.pop_front() {
                release_dispatch_entry(finished, &self.signals.sync_finished);
            }
        }

        self.deactivate_connection(channel);
    }

    /// Drops everything queued for a connection and marks it broken.
    pub(super) fn abort_broken_dispatch_cycle(&mut self, _now: Nsecs, channel: ChannelId) {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        debug!(target: targets::DISPATCH_CYCLE, "channel '{}' ~ abortBrokenDispatchCycle", connection.name());

        connection.drain_outbound_queue(&self.signals.sync_finished);

        if connection.status == ConnectionStatus::Normal {
            connection.status = ConnectionStatus::Broken;
            error!(
                "channel '{}' ~ Channel is unrecoverably broken and will be disposed!",
                connection.name()
            );
            self.commands.push_back(Command::NotifyInputChannelBroken {
                channel,
                window: connection.window.clone(),
            });
        }

        self.deactivate_connection(channel);
    }

    /// Removes a connection for good, dropping whatever it still had queued.
    pub(super) fn remove_connection(&mut self, channel: ChannelId) -> Option<Connection> {
        let mut connection = self.connections.remove(&channel)?;
        connection.status = ConnectionStatus::Zombie;
        connection.drain_outbound_queue(&self.signals.sync_finished);
        self.monitoring_channels.retain(|&monitor| monitor != channel);
        self.deactivate_connection(channel);
        Some(connection)
    }

    pub(super) fn activate_connection(&mut self, channel: ChannelId) {
        if !self.active_connections.contains(&channel) {
            self.active_connections.push(channel);
        }
    }

    pub(super) fn deactivate_connection(&mut self, channel: ChannelId) {
        self.active_connections.retain(|&active| active != channel);
    }

    pub(super) fn synthesize_cancelation_events_for_all_connections(&mut self, now: Nsecs, options: &CancelationOptions) {
        let channels: Vec<ChannelId> = self.connections.keys().copied().collect();
        for channel in channels {
            self.synthesize_cancelation_events_for_connection(now, channel, options);
        }
    }

    /// Queues the UP / CANCEL / HOVER_EXIT events that bring a connection's
    /// ledger back to neutral for everything `options` selects.
    pub(super) fn synthesize_cancelation_events_for_connection(
        &mut self,
        now: Nsecs,
        channel: ChannelId,
        options: &CancelationOptions,
    ) {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        let events = connection
            .input_state
            .synthesize_cancelation_events(now, &self.allocator, options);
        if events.is_empty() || connection.status == ConnectionStatus::Broken {
            return;
        }

        debug!(
            target: targets::OUTBOUND,
            "channel '{}' ~ Synthesized {} cancelation events to bring channel back in sync with reality: {}, mode={:?}.",
            connection.name(),
            events.len(),
            options.reason,
            options.mode
        );

        let window = self.windows.iter().find(|window| window.channel == channel);
        let target = InputTarget {
            channel,
            flags: TargetFlags::empty(),
            modes: DispatchModes::AS_IS,
            x_offset: window.map_or(0.0, |w| -(w.frame.left as f32)),
            y_offset: window.map_or(0.0, |w| -(w.frame.top as f32)),
            scale_factor: window.map_or(1.0, |w| w.scale_factor),
            pointer_ids: PointerIdBits::empty(),
        };

        for event in &events {
            connection.enqueue_dispatch_entry(event, &target, false, DispatchMode::AsIs);
        }

        let idle_head = connection
            .outbound_queue
            .front()
            .is_some_and(|head| !head.in_progress);
        if idle_head {
            self.activate_connection(channel);
            self.start_dispatch_cycle(now, channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::open_pair;
    use crate::dispatcher::entry::{InjectionState, MotionSample};
    use crate::input::{InputSource, MetaState, PointerProperties, PolicyFlags};
    use std::sync::Arc;

    fn two_finger_event(allocator: &EventAllocator, action: MotionAction) -> EventRef {
        allocator.obtain_motion(
            5,
            PolicyFlags::PASS_TO_USER,
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
                down_time: 1,
                pointer_properties: vec![PointerProperties::finger(0), PointerProperties::finger(1)],
                samples: vec![
                    MotionSample::new(5, vec![PointerCoords::at(1.0, 1.0), PointerCoords::at(50.0, 50.0)]),
                    MotionSample::new(9, vec![PointerCoords::at(2.0, 2.0), PointerCoords::at(51.0, 51.0)]),
                ],
            },
        )
    }

    #[test]
    fn test_split_pointer_down_becomes_down_for_new_window() {
        let allocator = EventAllocator::new();
        let event = two_finger_event(&allocator, MotionAction::PointerDown(1));
        let state = Arc::new(InjectionState::new(1, 0, true));
        event.lock().injection_state = Some(Arc::clone(&state));

        let split = split_motion_event(&allocator, &event, PointerIdBits::from_ids([1])).expect("split");
        let entry = split.lock();
        let motion = entry.as_motion().expect("motion");
        assert_eq!(motion.action, MotionAction::Down);
        assert_eq!(motion.pointer_count(), 1);
        assert_eq!(motion.samples.len(), 2);
        assert_eq!(motion.samples[1].pointer_coords[0], PointerCoords::at(51.0, 51.0));
        assert!(entry
            .injection_state
            .as_ref()
            .is_some_and(|shared| Arc::ptr_eq(shared, &state)));
    }

    #[test]
    fn test_split_unrelated_pointer_transition_becomes_move() {
        let allocator = EventAllocator::new();
        let event = two_finger_event(&allocator, MotionAction::PointerUp(1));
        let split = split_motion_event(&allocator, &event, PointerIdBits::from_ids([0])).expect("split");
        assert_eq!(split.lock().as_motion().map(|m| m.action), Some(MotionAction::Move));
    }

    #[test]
    fn test_split_with_missing_pointer_is_dropped() {
        let allocator = EventAllocator::new();
        let event = two_finger_event(&allocator, MotionAction::Move);
        assert!(split_motion_event(&allocator, &event, PointerIdBits::from_ids([0, 7])).is_none());
    }

    #[test]
    fn test_start_cycle_streams_samples_and_records_times() {
        let allocator = EventAllocator::new();
        let (channel, consumer) = open_pair("test");
        let mut connection = Connection::new(channel, None, false);
        let event = two_finger_event(&allocator, MotionAction::Move);

        let mut target = InputTarget::for_monitor(connection.channel_id());
        target.flags = TargetFlags::FOREGROUND;

        // Ledger needs a DOWN before it accepts moves.
        let down = two_finger_event(&allocator, MotionAction::Down);
        connection.enqueue_dispatch_entry(&down, &target, false, DispatchMode::AsIs);
        connection.outbound_queue.clear();

        connection.enqueue_dispatch_entry(&event, &target, false, DispatchMode::AsIs);
        assert_eq!(connection.outbound_queue.len(), 1);
        connection.start_dispatch_cycle(42).expect("publish");

        let head = connection.outbound_queue.front().expect("head");
        assert!(head.in_progress);
        assert_eq!(head.tail_motion_sample, None);
        assert_eq!(connection.last_dispatch_time, 42);

        let message = consumer.consume().expect("consume").expect("message");
        let motion = message.as_motion().expect("motion");
        assert_eq!(motion.samples.len(), 2);
    }
}
