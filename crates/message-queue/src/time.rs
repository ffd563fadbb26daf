//! Monotonic clock used for delayed messages and latency diagnostics
//!
//! Queues read time through the [`Clock`] trait so tests can drive delayed
//! delivery deterministically with a [`FakeClock`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic time
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> Instant;

    /// Instant `delay` after now
    fn time_after(&self, delay: Duration) -> Instant {
        self.now() + delay
    }

    /// Time remaining until `later`, zero if it has already passed
    fn time_until(&self, later: Instant) -> Duration {
        later.saturating_duration_since(self.now())
    }

    /// Time elapsed since `earlier`
    fn time_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Difference `later - earlier`, saturating at zero
pub fn time_diff(later: Instant, earlier: Instant) -> Duration {
    later.saturating_duration_since(earlier)
}

/// The process monotonic clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
///
/// Blocking waits inside the multiplexer still use real time, so queues driven
/// by a fake clock are normally polled with a zero wait.
#[derive(Debug)]
pub struct FakeClock {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl FakeClock {
    /// Create a fake clock frozen at the current real instant
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// Move the clock forward, saturating at about 584 years past the base
    pub fn advance(&self, delta: Duration) {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .offset_nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |offset| {
                Some(offset.saturating_add(nanos))
            });
    }

    /// Total time the clock has been advanced
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}
