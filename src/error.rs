//! Error types for the dispatcher boundary.
//!
//! Only the producer, injection and registration entry points return errors.
//! Everything past the inbound queue degrades to drop-and-resynchronize and is
//! reported through the log instead.

use crate::channel::{ChannelError, ChannelId};
use crate::input::{MAX_POINTERS, MAX_POINTER_ID};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("key event has invalid action code {0:#x}")]
    InvalidKeyAction(i32),

    #[error("motion event has invalid action code {0:#x}")]
    InvalidMotionAction(i32),

    #[error("motion event has invalid pointer count {0}; value must be between 1 and {}", MAX_POINTERS)]
    InvalidPointerCount(usize),

    #[error("motion event has invalid pointer id {0}; value must be between 0 and {}", MAX_POINTER_ID)]
    InvalidPointerId(i32),

    #[error("motion event has duplicate pointer id {0}")]
    DuplicatePointerId(i32),

    #[error("motion event has no samples")]
    MissingSamples,

    #[error("motion sample has {actual} pointer coordinates but the event has {expected} pointers")]
    SampleSizeMismatch { expected: usize, actual: usize },

    #[error("input channel '{0}' is already registered")]
    ChannelAlreadyRegistered(String),

    #[error("input channel {0} is not registered")]
    ChannelNotRegistered(ChannelId),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
