//! Wake-able poll primitive for the dispatch thread.
//!
//! The dispatch loop sleeps in [`Looper::poll_once`] until its next deadline,
//! an explicit [`Looper::wake`], or readiness posted by the consumer end of a
//! registered channel.

use super::ChannelId;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
    /// Readiness reported for a channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: u32 {
        const INPUT = 0x1;
        const HANGUP = 0x2;
        const ERROR = 0x4;
    }
}

#[derive(Debug, Default)]
struct LooperState {
    wake_pending: bool,
    ready: Vec<(ChannelId, PollEvents)>,
    watched: HashSet<ChannelId>,
}

#[derive(Debug, Default)]
pub struct Looper {
    state: Mutex<LooperState>,
    cond: Condvar,
}

impl Looper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the current or next `poll_once` return immediately.
    pub fn wake(&self) {
        let mut state = self.state.lock();
        state.wake_pending = true;
        self.cond.notify_all();
    }

    pub fn add_channel(&self, id: ChannelId) {
        self.state.lock().watched.insert(id);
    }

    pub fn remove_channel(&self, id: ChannelId) {
        let mut state = self.state.lock();
        state.watched.remove(&id);
        state.ready.retain(|(ready_id, _)| *ready_id != id);
    }

    /// Records readiness for a watched channel and wakes the poller.
    pub fn post(&self, id: ChannelId, events: PollEvents) {
        let mut state = self.state.lock();
        if !state.watched.contains(&id) {
            return;
        }
        match state.ready.iter_mut().find(|(ready_id, _)| *ready_id == id) {
            Some((_, pending)) => *pending |= events,
            None => state.ready.push((id, events)),
        }
        self.cond.notify_all();
    }

    /// Waits up to `timeout` (forever when `None`) for a wake or readiness and
    /// returns the channels that became ready.
    pub fn poll_once(&self, timeout: Option<Duration>) -> Vec<(ChannelId, PollEvents)> {
        let mut state = self.state.lock();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while !state.wake_pending && state.ready.is_empty() {
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    let _ = self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
        state.wake_pending = false;
        std::mem::take(&mut state.ready)
    }
}
