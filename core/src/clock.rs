//! Time sources for windows and wait intervals
//!
//! All time-window and wait-duration logic reads time through [`Clock`], so
//! tests can drive a breaker with [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of "now", expressed as the time elapsed since the clock's epoch
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time since the clock's epoch
    fn now(&self) -> Duration;

    /// Whole seconds since the clock's epoch (time-window bucket key)
    fn epoch_second(&self) -> u64 {
        self.now().as_secs()
    }
}

/// Wall clock anchored at the Unix epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Manually advanced clock for deterministic tests
///
/// # Example
///
/// ```rust
/// use circuit_guard::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(Duration::from_secs(100));
/// clock.advance(Duration::from_millis(1500));
/// assert_eq!(clock.epoch_second(), 101);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(duration_to_nanos(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(duration_to_nanos(by), Ordering::AcqRel);
    }

    /// Jump to an absolute time (may move backwards)
    pub fn set(&self, to: Duration) {
        self.nanos.store(duration_to_nanos(to), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

pub(crate) fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
