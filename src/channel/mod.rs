//! In-process input channels.
//!
//! A channel pair models the publish/acknowledge protocol between the
//! dispatcher and one window: the dispatcher owns the [`InputChannel`] end
//! (wrapped in an [`InputPublisher`]) and the application owns the
//! [`InputConsumer`] end. Only one message is in flight at a time. While a
//! published motion message is still unread, further samples may be appended
//! to it until the shared buffer is full.

mod looper;

pub use looper::{Looper, PollEvents};

use crate::clock::Nsecs;
use crate::input::{
    InputSource, KeyAction, KeyFlags, MetaState, MotionAction, MotionFlags, PointerCoords,
    PointerProperties,
};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Size of the shared publish buffer unless configured otherwise.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

const MESSAGE_HEADER_SIZE: usize = 64;
const POINTER_PROPERTIES_SIZE: usize = 8;
const POINTER_COORDS_SIZE: usize = 48;
const SAMPLE_HEADER_SIZE: usize = 8;

/// Bytes one motion sample occupies in the shared buffer.
pub fn motion_sample_size(pointer_count: usize) -> usize {
    SAMPLE_HEADER_SIZE + pointer_count * POINTER_COORDS_SIZE
}

/// Smallest buffer able to carry a one-pointer motion message.
pub fn min_buffer_size() -> usize {
    MESSAGE_HEADER_SIZE + POINTER_PROPERTIES_SIZE + motion_sample_size(1)
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a channel pair, stable for the pair's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("shared buffer is full")]
    BufferFull,

    #[error("published event was already consumed")]
    AlreadyConsumed,

    #[error("no signal available")]
    WouldBlock,

    #[error("channel '{0}' is closed")]
    Closed(String),

    #[error("invalid channel operation: {0}")]
    InvalidOperation(&'static str),
}

/// Key event as written to the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMessage {
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

#[derive(Debug, Clone, PartialEq)]
pub struct MotionMessageSample {
    pub event_time: Nsecs,
    pub pointer_coords: Vec<PointerCoords>,
}

/// Motion event as written to the channel. `samples` grows while the message
/// is unread.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionMessage {
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
    pub samples: Vec<MotionMessageSample>,
}

impl MotionMessage {
    pub fn pointer_ids(&self) -> Vec<i32> {
        self.pointer_properties.iter().map(|p| p.id).collect()
    }

    pub fn last_sample(&self) -> Option<&MotionMessageSample> {
        self.samples.last()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputMessage {
    Key(KeyMessage),
    Motion(MotionMessage),
}

impl InputMessage {
    pub fn as_key(&self) -> Option<&KeyMessage> {
        match self {
            Self::Key(key) => Some(key),
            Self::Motion(_) => None,
        }
    }

    pub fn as_motion(&self) -> Option<&MotionMessage> {
        match self {
            Self::Motion(motion) => Some(motion),
            Self::Key(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    message: Option<InputMessage>,
    used_bytes: usize,
    signaled: bool,
    consumed: bool,
    finished: VecDeque<bool>,
    publisher_closed: bool,
    consumer_closed: bool,
}

#[derive(Debug)]
struct ChannelShared {
    id: ChannelId,
    name: String,
    buffer_size: usize,
    state: Mutex<ChannelState>,
    looper: Mutex<Option<Weak<Looper>>>,
}

impl ChannelShared {
    fn notify(&self, events: PollEvents) {
        let looper = self.looper.lock().as_ref().and_then(Weak::upgrade);
        if let Some(looper) = looper {
            looper.post(self.id, events);
        }
    }

    fn closed(&self) -> ChannelError {
        ChannelError::Closed(self.name.clone())
    }
}

/// Opens a connected channel pair with the default buffer size.
pub fn open_pair(name: &str) -> (InputChannel, InputConsumer) {
    open_pair_with_buffer(name, DEFAULT_BUFFER_SIZE)
}

/// Opens a connected channel pair whose shared buffer holds `buffer_size` bytes.
pub fn open_pair_with_buffer(name: &str, buffer_size: usize) -> (InputChannel, InputConsumer) {
    let shared = Arc::new(ChannelShared {
        id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
        name: name.to_string(),
        buffer_size: buffer_size.max(min_buffer_size()),
        state: Mutex::new(ChannelState::default()),
        looper: Mutex::new(None),
    });
    (
        InputChannel {
            shared: Arc::clone(&shared),
        },
        InputConsumer { shared },
    )
}

/// Dispatcher end of a channel pair.
#[derive(Debug)]
pub struct InputChannel {
    shared: Arc<ChannelShared>,
}

impl InputChannel {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Routes consumer readiness to `looper`.
    pub fn attach(&self, looper: &Arc<Looper>) {
        *self.shared.looper.lock() = Some(Arc::downgrade(looper));
    }
}

impl Drop for InputChannel {
    fn drop(&mut self) {
        self.shared.state.lock().publisher_closed = true;
    }
}

/// Writes events into an [`InputChannel`] and reads acknowledgements back.
#[derive(Debug)]
pub struct InputPublisher {
    channel: InputChannel,
}

impl InputPublisher {
    pub fn new(channel: InputChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &InputChannel {
        &self.channel
    }

    fn with_open_state<T>(
        &self,
        f: impl FnOnce(&mut ChannelState, &ChannelShared) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let shared = &self.channel.shared;
        let mut state = shared.state.lock();
        if state.consumer_closed {
            return Err(shared.closed());
        }
        f(&mut state, shared)
    }

    pub fn publish_key_event(&self, message: KeyMessage) -> Result<(), ChannelError> {
        self.with_open_state(|state, _| {
            if state.message.is_some() {
                return Err(ChannelError::InvalidOperation("publisher has not been reset"));
            }
            state.used_bytes = MESSAGE_HEADER_SIZE;
            state.message = Some(InputMessage::Key(message));
            Ok(())
        })
    }

    /// Publishes a motion message carrying exactly its first sample.
    pub fn publish_motion_event(&self, message: MotionMessage) -> Result<(), ChannelError> {
        self.with_open_state(|state, shared| {
            if state.message.is_some() {
                return Err(ChannelError::InvalidOperation("publisher has not been reset"));
            }
            let pointer_count = message.pointer_properties.len();
            let size = MESSAGE_HEADER_SIZE
                + pointer_count * POINTER_PROPERTIES_SIZE
                + message.samples.len() * motion_sample_size(pointer_count);
            if size > shared.buffer_size {
                return Err(ChannelError::BufferFull);
            }
            state.used_bytes = size;
            state.message = Some(InputMessage::Motion(message));
            Ok(())
        })
    }

    /// Appends a sample to the published, still unread motion message.
    pub fn append_motion_sample(
        &self,
        event_time: Nsecs,
        pointer_coords: Vec<PointerCoords>,
    ) -> Result<(), ChannelError> {
        self.with_open_state(|state, shared| {
            if state.consumed {
                return Err(ChannelError::AlreadyConsumed);
            }
            let sample_size = motion_sample_size(pointer_coords.len());
            if state.used_bytes + sample_size > shared.buffer_size {
                return Err(ChannelError::BufferFull);
            }
            let motion = match state.message.as_mut() {
                Some(InputMessage::Motion(motion)) if motion.action.accepts_appended_samples() => motion,
                _ => {
                    return Err(ChannelError::InvalidOperation(
                        "no published move event to append to",
                    ))
                }
            };
            motion.samples.push(MotionMessageSample {
                event_time,
                pointer_coords,
            });
            state.used_bytes += sample_size;
            Ok(())
        })
    }

    pub fn send_dispatch_signal(&self) -> Result<(), ChannelError> {
        self.with_open_state(|state, _| {
            if state.message.is_none() {
                return Err(ChannelError::InvalidOperation("nothing has been published"));
            }
            state.signaled = true;
            Ok(())
        })
    }

    /// Returns the `handled` flag of the next acknowledgement.
    pub fn receive_finished_signal(&self) -> Result<bool, ChannelError> {
        let shared = &self.channel.shared;
        let mut state = shared.state.lock();
        if let Some(handled) = state.finished.pop_front() {
            return Ok(handled);
        }
        if state.consumer_closed {
            return Err(shared.closed());
        }
        Err(ChannelError::WouldBlock)
    }

    /// Clears the published message so the next cycle can publish.
    pub fn reset(&self) -> Result<(), ChannelError> {
        let mut state = self.channel.shared.state.lock();
        state.message = None;
        state.used_bytes = 0;
        state.signaled = false;
        state.consumed = false;
        Ok(())
    }
}

/// Application end of a channel pair.
#[derive(Debug)]
pub struct InputConsumer {
    shared: Arc<ChannelShared>,
}

impl InputConsumer {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Takes the signaled message, if any. Later appends to it will fail.
    pub fn consume(&self) -> Result<Option<InputMessage>, ChannelError> {
        let mut state = self.shared.state.lock();
        if state.publisher_closed {
            return Err(self.shared.closed());
        }
        if !state.signaled || state.consumed {
            return Ok(None);
        }
        state.consumed = true;
        Ok(state.message.clone())
    }

    /// True when a signaled message is waiting to be consumed.
    pub fn has_pending(&self) -> bool {
        let state = self.shared.state.lock();
        state.signaled && !state.consumed
    }

    /// Acknowledges the consumed message.
    pub fn send_finished_signal(&self, handled: bool) -> Result<(), ChannelError> {
        {
            let mut state = self.shared.state.lock();
            if state.publisher_closed {
                return Err(self.shared.closed());
            }
            state.finished.push_back(handled);
        }
        self.shared.notify(PollEvents::INPUT);
        Ok(())
    }

    /// Closes the consumer end; the dispatcher sees a hangup.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.consumer_closed {
                return;
            }
            state.consumer_closed = true;
        }
        debug!("channel '{}' closed by consumer", self.shared.name);
        self.shared.notify(PollEvents::HANGUP);
    }
}

impl Drop for InputConsumer {
    fn drop(&mut self) {
        self.close();
    }
}
