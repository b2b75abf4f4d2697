//! Monotonic time source used for every dispatcher deadline.
//!
//! Event timestamps are monotonic nanoseconds supplied by the producer, so the
//! dispatcher compares them against a [`Clock`] using the same unit. Tests drive
//! the dispatcher with a [`ManualClock`].

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic timestamp in nanoseconds.
pub type Nsecs = i64;

pub const NSECS_PER_MS: Nsecs = 1_000_000;
pub const NSECS_PER_SEC: Nsecs = 1_000_000_000;

/// Converts milliseconds to nanoseconds.
pub const fn millis(ms: i64) -> Nsecs {
    ms * NSECS_PER_MS
}

/// Converts nanoseconds to fractional milliseconds, for logs and dumps.
pub fn to_millis_f64(nsecs: Nsecs) -> f64 {
    nsecs as f64 / NSECS_PER_MS as f64
}

pub fn duration_to_nsecs(duration: Duration) -> Nsecs {
    Nsecs::try_from(duration.as_nanos()).unwrap_or(Nsecs::MAX)
}

/// Source of the current monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Nsecs;
}

/// Real monotonic clock measured from construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Nsecs {
        // Offset by one second so no event is ever stamped at zero.
        duration_to_nsecs(self.origin.elapsed()).saturating_add(NSECS_PER_SEC)
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Nsecs) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Nsecs) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Nsecs) -> Nsecs {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nsecs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Converts an absolute wake deadline into a poll timeout.
///
/// `Nsecs::MAX` means "sleep until woken" and yields `None`. Deadlines in the
/// past yield a zero timeout. Partial milliseconds round up so the loop never
/// wakes just before its deadline.
pub fn poll_timeout(now: Nsecs, deadline: Nsecs) -> Option<Duration> {
    if deadline == Nsecs::MAX {
        return None;
    }
    if deadline <= now {
        return Some(Duration::ZERO);
    }
    let delta = deadline - now;
    let millis = (delta + NSECS_PER_MS - 1) / NSECS_PER_MS;
    Some(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout(0, Nsecs::MAX), None);
        assert_eq!(poll_timeout(10, 5), Some(Duration::ZERO));
        assert_eq!(poll_timeout(0, 1), Some(Duration::from_millis(1)));
        assert_eq!(poll_timeout(0, millis(3)), Some(Duration::from_millis(3)));
        assert_eq!(
            poll_timeout(0, millis(3) + 1),
            Some(Duration::from_millis(4))
        );
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.advance(50), 150);
        assert_eq!(clock.now(), 150);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }
}
