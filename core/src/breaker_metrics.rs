//! Per-state metrics: a sliding window plus threshold evaluation

use crate::clock::Clock;
use crate::config::Config;
use crate::metrics::{
    Outcome, SlidingWindow, SlidingWindowType, Snapshot, WindowContents, WindowSpec,
};
use crossbeam_utils::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Result of checking a snapshot against the thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThresholdCheck {
    BelowMinimumCalls,
    BelowThresholds,
    FailureRateExceeded,
    SlowCallRateExceeded,
    BothExceeded,
}

impl ThresholdCheck {
    pub(crate) fn exceeded(self) -> bool {
        matches!(
            self,
            ThresholdCheck::FailureRateExceeded
                | ThresholdCheck::SlowCallRateExceeded
                | ThresholdCheck::BothExceeded
        )
    }
}

const SEALED: u64 = 1 << 63;

/// Admission of writers into one state's metrics and permits.
///
/// A writer holds the gate for a single update. Sealing turns new writers
/// away and waits for those already inside to leave; after that the state
/// can be copied without missing an update.
#[derive(Debug, Default)]
pub(crate) struct WriteGate {
    // Sealed flag in the top bit, writers inside in the rest
    word: AtomicU64,
}

impl WriteGate {
    /// `None` once the gate is sealed
    pub(crate) fn enter(&self) -> Option<GateGuard<'_>> {
        if self.word.fetch_add(1, Ordering::AcqRel) & SEALED != 0 {
            self.word.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(GateGuard { gate: self })
    }

    /// Seal and wait until no writer is inside.
    ///
    /// Returns false, without waiting, if someone else sealed it first.
    pub(crate) fn seal(&self) -> bool {
        if self.word.fetch_or(SEALED, Ordering::AcqRel) & SEALED != 0 {
            return false;
        }
        let backoff = Backoff::new();
        while self.word.load(Ordering::Acquire) & !SEALED != 0 {
            backoff.snooze();
        }
        true
    }

    pub(crate) fn unseal(&self) {
        self.word.fetch_and(!SEALED, Ordering::AcqRel);
    }
}

/// A writer inside a [`WriteGate`]; leaves on drop
pub(crate) struct GateGuard<'a> {
    gate: &'a WriteGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.word.fetch_sub(1, Ordering::Release);
    }
}

/// The metrics engine owned by one state instance
#[derive(Debug)]
pub(crate) struct BreakerMetrics {
    window: Box<dyn SlidingWindow>,
    minimum_number_of_calls: u32,
    failure_rate_threshold: f32,
    slow_call_rate_threshold: f32,
    slow_call_duration_threshold: Duration,
    not_permitted: AtomicU64,
    gate: WriteGate,
}

impl BreakerMetrics {
    /// Window of the configured shape, optionally seeded from earlier contents
    pub(crate) fn with_config(
        config: &Config,
        clock: &Arc<dyn Clock>,
        seed: Option<&WindowContents>,
    ) -> Self {
        Self::new(
            config.window_spec().build_seeded(clock, seed),
            config.minimum_number_of_calls(),
            config,
        )
    }

    /// Count-based window holding exactly the trial calls of one HalfOpen visit
    pub(crate) fn for_half_open(
        config: &Config,
        clock: &Arc<dyn Clock>,
        seed: Option<&WindowContents>,
    ) -> Self {
        let permitted = config.permitted_number_of_calls_in_half_open_state();
        let spec = WindowSpec::count_based(permitted, config.window_synchronization());
        Self::new(spec.build_seeded(clock, seed), permitted, config)
    }

    fn new(window: Box<dyn SlidingWindow>, minimum_number_of_calls: u32, config: &Config) -> Self {
        Self {
            window,
            minimum_number_of_calls,
            failure_rate_threshold: config.failure_rate_threshold(),
            slow_call_rate_threshold: config.slow_call_rate_threshold(),
            slow_call_duration_threshold: config.slow_call_duration_threshold(),
            not_permitted: AtomicU64::new(0),
            gate: WriteGate::default(),
        }
    }

    pub(crate) fn with_not_permitted(self, count: u64) -> Self {
        self.not_permitted.store(count, Ordering::Relaxed);
        self
    }

    pub(crate) fn on_success(&self, duration: Duration) -> (ThresholdCheck, Snapshot) {
        self.record(duration, true)
    }

    pub(crate) fn on_error(&self, duration: Duration) -> (ThresholdCheck, Snapshot) {
        self.record(duration, false)
    }

    fn record(&self, duration: Duration, succeeded: bool) -> (ThresholdCheck, Snapshot) {
        let outcome = Outcome::classify(duration, succeeded, self.slow_call_duration_threshold);
        let snapshot = self.window.record(duration, outcome);
        (self.check(&snapshot), snapshot)
    }

    pub(crate) fn on_call_not_permitted(&self) {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Compare rates to thresholds; equality trips
    pub(crate) fn check(&self, snapshot: &Snapshot) -> ThresholdCheck {
        if snapshot.total_number_of_calls < u64::from(self.minimum_number_of_calls) {
            return ThresholdCheck::BelowMinimumCalls;
        }
        let failures = snapshot.failure_rate >= self.failure_rate_threshold;
        let slow = snapshot.slow_call_rate >= self.slow_call_rate_threshold;
        match (failures, slow) {
            (false, false) => ThresholdCheck::BelowThresholds,
            (true, false) => ThresholdCheck::FailureRateExceeded,
            (false, true) => ThresholdCheck::SlowCallRateExceeded,
            (true, true) => ThresholdCheck::BothExceeded,
        }
    }

    pub(crate) fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            snapshot: self.window.snapshot(),
            window_type: self.window.window_type(),
            minimum_number_of_calls: self.minimum_number_of_calls,
            number_of_not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn contents(&self) -> WindowContents {
        self.window.contents()
    }

    pub(crate) fn gate(&self) -> &WriteGate {
        &self.gate
    }
}

/// Public view of a breaker's metrics at one instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    snapshot: Snapshot,
    window_type: SlidingWindowType,
    minimum_number_of_calls: u32,
    number_of_not_permitted_calls: u64,
}

impl CircuitMetrics {
    /// Failure rate in percent, or `-1.0` while there are too few calls.
    ///
    /// Time-based windows report `0.0` instead of `-1.0` when empty.
    pub fn failure_rate(&self) -> f32 {
        self.rate(self.snapshot.failure_rate)
    }

    /// Slow call rate in percent, with the same sentinel rules as [`failure_rate`](Self::failure_rate)
    pub fn slow_call_rate(&self) -> f32 {
        self.rate(self.snapshot.slow_call_rate)
    }

    fn rate(&self, raw: f32) -> f32 {
        let calls = self.snapshot.total_number_of_calls;
        if self.window_type == SlidingWindowType::TimeBased && calls == 0 {
            return 0.0;
        }
        if calls < u64::from(self.minimum_number_of_calls) {
            return -1.0;
        }
        raw
    }

    /// Calls currently in the window
    pub fn number_of_buffered_calls(&self) -> u64 {
        self.snapshot.total_number_of_calls
    }

    pub fn number_of_successful_calls(&self) -> u64 {
        self.snapshot.number_of_successful_calls
    }

    pub fn number_of_failed_calls(&self) -> u64 {
        self.snapshot.number_of_failed_calls
    }

    pub fn number_of_slow_calls(&self) -> u64 {
        self.snapshot.number_of_slow_calls
    }

    pub fn number_of_slow_successful_calls(&self) -> u64 {
        self.snapshot.number_of_slow_successful_calls
    }

    pub fn number_of_slow_failed_calls(&self) -> u64 {
        self.snapshot.number_of_slow_failed_calls
    }

    /// Calls rejected by the current state
    pub fn number_of_not_permitted_calls(&self) -> u64 {
        self.number_of_not_permitted_calls
    }

    pub fn total_duration(&self) -> Duration {
        self.snapshot.total_duration
    }

    pub fn average_duration(&self) -> Duration {
        self.snapshot.average_duration
    }

    /// Only reported by time-based windows
    pub fn calls_per_second(&self) -> Option<f64> {
        self.snapshot.calls_per_second
    }

    pub fn window_type(&self) -> SlidingWindowType {
        self.window_type
    }

    /// Raw window snapshot (rates without sentinels)
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}
