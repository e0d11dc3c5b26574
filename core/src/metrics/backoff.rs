//! Bounded spin-then-park backoff for compare-and-swap retry loops
//!
//! A failed CAS first goes through the spin and yield steps of
//! `crossbeam_utils::Backoff`. Once those are used up the thread parks for a
//! short, jittered, exponentially growing interval capped at `max_park`,
//! then starts spinning again. Every park has a timeout, so a backing-off
//! thread always resumes within `max_park`.

use crossbeam_utils::Backoff;
use std::time::Duration;

/// Park bounds for [`CasBackoff`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Park interval of the first park phase
    pub min_park: Duration,
    /// Upper bound for any single park
    pub max_park: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_park: Duration::from_micros(1),
            max_park: Duration::from_micros(50),
        }
    }
}

/// Per-call backoff state; create one per CAS loop
#[derive(Debug)]
pub struct CasBackoff {
    policy: BackoffPolicy,
    spin: Backoff,
    parks: u32,
}

impl CasBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            spin: Backoff::new(),
            parks: 0,
        }
    }

    /// Wait before the next CAS attempt
    pub fn snooze(&mut self) {
        if !self.spin.is_completed() {
            self.spin.snooze();
            return;
        }

        let park = self.next_park();
        tracing::trace!(
            parks = self.parks,
            park_nanos = park.as_nanos() as u64,
            "CAS contention, parking"
        );
        std::thread::park_timeout(park);
        self.parks = self.parks.saturating_add(1);
        self.spin.reset();
    }

    /// Number of park phases this loop went through
    pub fn parks(&self) -> u32 {
        self.parks
    }

    fn next_park(&self) -> Duration {
        let min = self.policy.min_park.max(Duration::from_nanos(1));
        let max = self.policy.max_park.max(min);
        let grown = min
            .checked_mul(1u32 << self.parks.min(20))
            .unwrap_or(max)
            .min(max);

        // Uniform in [grown / 2, grown] so concurrent losers wake apart.
        let nanos = grown.as_nanos() as u64;
        let half = nanos / 2;
        Duration::from_nanos(half + fastrand::u64(0..=nanos - half))
    }
}

impl Default for CasBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
