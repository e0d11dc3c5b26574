//! Sliding window metrics
//!
//! A window accumulates call [`Outcome`]s into a bounded aggregate and hands
//! out point-in-time [`Snapshot`]s:
//! - [`FixedSizeWindow`] / [`LockFreeFixedSizeWindow`]: the N most recent calls
//! - [`SlidingTimeWindow`] / [`LockFreeSlidingTimeWindow`]: the N most recent
//!   epoch seconds, one bucket per second
//!
//! The mutex-guarded and lock-free variants have the same observable
//! behavior. The lock-free ones retry a compare-and-swap over an immutable
//! versioned record and back off with [`CasBackoff`] under contention.

mod backoff;
mod fixed_window;
mod time_window;

pub use backoff::{BackoffPolicy, CasBackoff};
pub use fixed_window::{FixedSizeWindow, LockFreeFixedSizeWindow};
pub use time_window::{LockFreeSlidingTimeWindow, SlidingTimeWindow};

use crate::clock::{Clock, duration_to_nanos};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Classification of a completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Error,
    SlowSuccess,
    SlowError,
}

impl Outcome {
    /// Classify a call from its duration and success flag.
    ///
    /// A call is slow when `duration >= slow_threshold`, whatever its result.
    pub fn classify(duration: Duration, succeeded: bool, slow_threshold: Duration) -> Self {
        let slow = duration >= slow_threshold;
        match (succeeded, slow) {
            (true, false) => Outcome::Success,
            (true, true) => Outcome::SlowSuccess,
            (false, false) => Outcome::Error,
            (false, true) => Outcome::SlowError,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Error | Outcome::SlowError)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowError)
    }
}

/// Counts and total duration for a set of calls.
///
/// Used for a single ring slot (one call), a per-second bucket, and the
/// running total of a window. Successful and failed counts include their
/// slow share, so `successful + failed` is the number of calls represented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub successful: u64,
    pub failed: u64,
    pub slow_successful: u64,
    pub slow_failed: u64,
    pub total_duration_nanos: u64,
}

impl Measurement {
    /// Measurement for exactly one call
    pub fn of(duration: Duration, outcome: Outcome) -> Self {
        let mut m = Measurement {
            total_duration_nanos: duration_to_nanos(duration),
            ..Default::default()
        };
        match outcome {
            Outcome::Success => m.successful = 1,
            Outcome::Error => m.failed = 1,
            Outcome::SlowSuccess => {
                m.successful = 1;
                m.slow_successful = 1;
            }
            Outcome::SlowError => {
                m.failed = 1;
                m.slow_failed = 1;
            }
        }
        m
    }

    pub fn calls(&self) -> u64 {
        self.successful + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.calls() == 0
    }

    pub fn slow_calls(&self) -> u64 {
        self.slow_successful + self.slow_failed
    }

    pub fn plus(&self, other: &Measurement) -> Measurement {
        Measurement {
            successful: self.successful + other.successful,
            failed: self.failed + other.failed,
            slow_successful: self.slow_successful + other.slow_successful,
            slow_failed: self.slow_failed + other.slow_failed,
            total_duration_nanos: self
                .total_duration_nanos
                .saturating_add(other.total_duration_nanos),
        }
    }

    pub fn minus(&self, other: &Measurement) -> Measurement {
        Measurement {
            successful: self.successful.saturating_sub(other.successful),
            failed: self.failed.saturating_sub(other.failed),
            slow_successful: self.slow_successful.saturating_sub(other.slow_successful),
            slow_failed: self.slow_failed.saturating_sub(other.slow_failed),
            total_duration_nanos: self
                .total_duration_nanos
                .saturating_sub(other.total_duration_nanos),
        }
    }

    /// Split into one `(duration, outcome)` per call, durations averaged.
    ///
    /// Used when replaying aggregated contents into a window of another shape.
    pub fn expand(&self) -> Vec<(Duration, Outcome)> {
        let calls = self.calls();
        if calls == 0 {
            return Vec::new();
        }
        let avg = Duration::from_nanos(self.total_duration_nanos / calls);
        let fast_successful = self.successful.saturating_sub(self.slow_successful);
        let fast_failed = self.failed.saturating_sub(self.slow_failed);

        let mut calls_out = Vec::with_capacity(calls as usize);
        for (count, outcome) in [
            (fast_successful, Outcome::Success),
            (self.slow_successful, Outcome::SlowSuccess),
            (fast_failed, Outcome::Error),
            (self.slow_failed, Outcome::SlowError),
        ] {
            calls_out.extend(std::iter::repeat_n((avg, outcome), count as usize));
        }
        calls_out
    }

    /// Outcome of a single-call measurement, `None` for empty or aggregated ones
    pub fn single_outcome(&self) -> Option<Outcome> {
        if self.calls() != 1 {
            return None;
        }
        Some(match (self.failed == 1, self.slow_calls() == 1) {
            (false, false) => Outcome::Success,
            (false, true) => Outcome::SlowSuccess,
            (true, false) => Outcome::Error,
            (true, true) => Outcome::SlowError,
        })
    }
}

/// Point-in-time read of a window's aggregate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub total_number_of_calls: u64,
    pub number_of_successful_calls: u64,
    pub number_of_failed_calls: u64,
    pub number_of_slow_calls: u64,
    pub number_of_slow_successful_calls: u64,
    pub number_of_slow_failed_calls: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    /// Failed calls in percent, 0 with no calls
    pub failure_rate: f32,
    /// Slow calls in percent, 0 with no calls
    pub slow_call_rate: f32,
    /// Average calls per second over the non-empty span (time-based windows only)
    pub calls_per_second: Option<f64>,
}

impl Snapshot {
    pub fn from_measurement(total: &Measurement) -> Self {
        let calls = total.calls();
        let (average_duration, failure_rate, slow_call_rate) = if calls == 0 {
            (Duration::ZERO, 0.0, 0.0)
        } else {
            (
                Duration::from_nanos(total.total_duration_nanos / calls),
                total.failed as f32 * 100.0 / calls as f32,
                total.slow_calls() as f32 * 100.0 / calls as f32,
            )
        };

        Snapshot {
            total_number_of_calls: calls,
            number_of_successful_calls: total.successful,
            number_of_failed_calls: total.failed,
            number_of_slow_calls: total.slow_calls(),
            number_of_slow_successful_calls: total.slow_successful,
            number_of_slow_failed_calls: total.slow_failed,
            total_duration: Duration::from_nanos(total.total_duration_nanos),
            average_duration,
            failure_rate,
            slow_call_rate,
            calls_per_second: None,
        }
    }

    pub(crate) fn with_calls_per_second(mut self, cps: f64) -> Self {
        self.calls_per_second = Some(cps);
        self
    }
}

/// Kind of sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SlidingWindowType {
    /// The last N calls
    #[default]
    CountBased,
    /// The calls of the last N seconds
    TimeBased,
}

/// How a window serializes concurrent writers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WindowSynchronization {
    /// Mutex around the ring and the total
    #[default]
    Synchronized,
    /// Compare-and-swap over a versioned aggregate with bounded backoff
    LockFree,
}

/// One per-second bucket of a time-based window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub epoch_second: u64,
    pub measurement: Measurement,
}

/// Ordered contents of a window, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowContents {
    /// One single-call measurement per occupied ring slot
    Calls(Vec<Measurement>),
    /// Non-empty buckets still inside the window
    Buckets(Vec<Bucket>),
}

impl WindowContents {
    /// Aggregate of everything in the window
    pub fn total(&self) -> Measurement {
        match self {
            WindowContents::Calls(calls) => calls
                .iter()
                .fold(Measurement::default(), |acc, m| acc.plus(m)),
            WindowContents::Buckets(buckets) => buckets
                .iter()
                .fold(Measurement::default(), |acc, b| acc.plus(&b.measurement)),
        }
    }

    /// Individual calls, oldest first (buckets are expanded)
    pub fn calls(&self) -> Vec<(Duration, Outcome)> {
        match self {
            WindowContents::Calls(calls) => calls
                .iter()
                .filter_map(|m| {
                    m.single_outcome()
                        .map(|o| (Duration::from_nanos(m.total_duration_nanos), o))
                })
                .collect(),
            WindowContents::Buckets(buckets) => buckets
                .iter()
                .flat_map(|b| b.measurement.expand())
                .collect(),
        }
    }
}

/// A bounded, continuously evicting aggregate of call outcomes
pub trait SlidingWindow: Send + Sync + std::fmt::Debug {
    /// Record one call and return the resulting snapshot
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot;

    /// Current snapshot, without changing the window
    fn snapshot(&self) -> Snapshot;

    /// Ordered contents, for snapshot/restore
    fn contents(&self) -> WindowContents;

    fn window_type(&self) -> SlidingWindowType;

    /// Window size in calls or seconds
    fn size(&self) -> u32;
}

/// Shape of a window to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub window_type: SlidingWindowType,
    pub size: u32,
    pub synchronization: WindowSynchronization,
}

impl WindowSpec {
    pub fn count_based(size: u32, synchronization: WindowSynchronization) -> Self {
        Self {
            window_type: SlidingWindowType::CountBased,
            size,
            synchronization,
        }
    }

    /// Build an empty window
    pub fn build(&self, clock: &Arc<dyn Clock>) -> Box<dyn SlidingWindow> {
        self.build_seeded(clock, None)
    }

    /// Build a window, optionally seeded with previous contents.
    ///
    /// Count-based windows replay the newest calls that fit. Time-based
    /// windows keep buckets that are still inside the window; calls without
    /// a timestamp land in the current second.
    pub fn build_seeded(
        &self,
        clock: &Arc<dyn Clock>,
        seed: Option<&WindowContents>,
    ) -> Box<dyn SlidingWindow> {
        let size = self.size.max(1);
        match (self.window_type, self.synchronization) {
            (SlidingWindowType::CountBased, WindowSynchronization::Synchronized) => {
                let window = FixedSizeWindow::new(size);
                replay_calls(&window, size, seed);
                Box::new(window)
            }
            (SlidingWindowType::CountBased, WindowSynchronization::LockFree) => {
                let window = LockFreeFixedSizeWindow::new(size);
                replay_calls(&window, size, seed);
                Box::new(window)
            }
            (SlidingWindowType::TimeBased, WindowSynchronization::Synchronized) => {
                Box::new(SlidingTimeWindow::seeded(size, Arc::clone(clock), seed))
            }
            (SlidingWindowType::TimeBased, WindowSynchronization::LockFree) => Box::new(
                LockFreeSlidingTimeWindow::seeded(size, Arc::clone(clock), seed),
            ),
        }
    }
}

fn replay_calls(window: &dyn SlidingWindow, size: u32, seed: Option<&WindowContents>) {
    let Some(seed) = seed else { return };
    let calls = seed.calls();
    let skip = calls.len().saturating_sub(size as usize);
    for (duration, outcome) in calls.into_iter().skip(skip) {
        window.record(duration, outcome);
    }
}

/// Live buckets of a time window at `now`, in window order
pub(crate) fn bucket_in_window(epoch_second: u64, now_second: u64, size: u32) -> bool {
    epoch_second <= now_second && now_second - epoch_second < u64::from(size)
}

/// Average calls per second over `[first_second, head_second]`, capped at the window
pub(crate) fn calls_per_second(
    total: &Measurement,
    first_second: Option<u64>,
    head_second: u64,
    size: u32,
) -> f64 {
    match first_second {
        Some(first) if !total.is_empty() => {
            let span = head_second
                .saturating_sub(first)
                .saturating_add(1)
                .clamp(1, u64::from(size));
            total.calls() as f64 / span as f64
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification_boundary() {
        let threshold = Duration::from_millis(100);

        assert_eq!(
            Outcome::classify(Duration::from_millis(99), true, threshold),
            Outcome::Success
        );
        assert_eq!(
            Outcome::classify(Duration::from_millis(100), true, threshold),
            Outcome::SlowSuccess
        );
        assert_eq!(
            Outcome::classify(Duration::from_millis(10), false, threshold),
            Outcome::Error
        );
        assert_eq!(
            Outcome::classify(Duration::from_secs(1), false, threshold),
            Outcome::SlowError
        );
    }

    #[test]
    fn test_measurement_counts_slow_within_result() {
        let m = Measurement::of(Duration::from_millis(5), Outcome::SlowError);
        assert_eq!(m.calls(), 1);
        assert_eq!(m.failed, 1);
        assert_eq!(m.slow_failed, 1);
        assert_eq!(m.single_outcome(), Some(Outcome::SlowError));

        let sum = m.plus(&Measurement::of(Duration::from_millis(5), Outcome::Success));
        assert_eq!(sum.calls(), 2);
        assert_eq!(sum.single_outcome(), None);
        assert_eq!(sum.minus(&m), Measurement::of(Duration::from_millis(5), Outcome::Success));
    }

    #[test]
    fn test_snapshot_rates() {
        let total = [
            Measurement::of(Duration::from_secs(10), Outcome::SlowSuccess),
            Measurement::of(Duration::from_secs(10), Outcome::SlowError),
            Measurement::of(Duration::from_millis(100), Outcome::Success),
            Measurement::of(Duration::from_millis(100), Outcome::Success),
            Measurement::of(Duration::from_millis(100), Outcome::Success),
        ]
        .iter()
        .fold(Measurement::default(), |acc, m| acc.plus(m));

        let snapshot = Snapshot::from_measurement(&total);
        assert_eq!(snapshot.total_number_of_calls, 5);
        assert_eq!(snapshot.number_of_successful_calls, 4);
        assert_eq!(snapshot.number_of_slow_calls, 2);
        assert_eq!(snapshot.total_duration, Duration::from_millis(20_300));
        assert_eq!(snapshot.average_duration, Duration::from_millis(4_060));
        assert_eq!(snapshot.slow_call_rate, 40.0);
        assert_eq!(snapshot.failure_rate, 20.0);
    }

    #[test]
    fn test_empty_snapshot_reports_zero_rates() {
        let snapshot = Snapshot::from_measurement(&Measurement::default());
        assert_eq!(snapshot.total_number_of_calls, 0);
        assert_eq!(snapshot.failure_rate, 0.0);
        assert_eq!(snapshot.slow_call_rate, 0.0);
        assert_eq!(snapshot.average_duration, Duration::ZERO);
    }

    #[test]
    fn test_expand_preserves_counts() {
        let bucket = Measurement {
            successful: 3,
            failed: 2,
            slow_successful: 1,
            slow_failed: 1,
            total_duration_nanos: 500,
        };
        let calls = bucket.expand();
        assert_eq!(calls.len(), 5);
        let replayed = calls
            .iter()
            .fold(Measurement::default(), |acc, (d, o)| acc.plus(&Measurement::of(*d, *o)));
        assert_eq!(replayed.successful, 3);
        assert_eq!(replayed.failed, 2);
        assert_eq!(replayed.slow_successful, 1);
        assert_eq!(replayed.slow_failed, 1);
        assert_eq!(replayed.total_duration_nanos, 500);
    }

    #[test]
    fn test_build_seeded_count_window_keeps_newest() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::ManualClock::default());
        let seed = WindowContents::Calls(vec![
            Measurement::of(Duration::ZERO, Outcome::Error),
            Measurement::of(Duration::ZERO, Outcome::Error),
            Measurement::of(Duration::ZERO, Outcome::Success),
            Measurement::of(Duration::ZERO, Outcome::Success),
        ]);

        let window = WindowSpec::count_based(2, WindowSynchronization::Synchronized)
            .build_seeded(&clock, Some(&seed));

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_number_of_calls, 2);
        assert_eq!(snapshot.number_of_failed_calls, 0);
    }
}
