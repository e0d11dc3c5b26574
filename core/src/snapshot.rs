//! Serializable breaker snapshots
//!
//! A snapshot captures the state, its attempt counter, the Open deadline and
//! the window contents, so a breaker restored from it (possibly in another
//! process, via serde) makes the same admission decisions.

use crate::breaker_metrics::CircuitMetrics;
use crate::metrics::{Bucket, Measurement, SlidingWindowType, WindowContents};
use crate::state::CircuitState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Point-in-time copy of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub metrics: MetricsSnapshot,
    /// Consecutive Open entries
    pub attempts: u32,
    /// Clock time after which an Open breaker permits calls again
    pub retry_after_wait_until: Option<Duration>,
    /// HalfOpen trial permits held when the snapshot was taken, including
    /// calls that had not reported an outcome yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_open_permits_in_use: Option<u32>,
}

/// Metrics part of a [`CircuitBreakerSnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub window_type: SlidingWindowType,
    pub number_of_successful_calls: u64,
    pub number_of_failed_calls: u64,
    pub number_of_slow_successful_calls: u64,
    pub number_of_slow_failed_calls: u64,
    pub number_of_not_permitted_calls: u64,
    pub total_duration: Duration,
    /// Ordered window contents the counts above were taken from
    pub contents: WindowContents,
}

impl MetricsSnapshot {
    pub(crate) fn capture(metrics: &CircuitMetrics, contents: WindowContents) -> Self {
        let total = contents.total();
        Self {
            window_type: metrics.window_type(),
            number_of_successful_calls: total.successful,
            number_of_failed_calls: total.failed,
            number_of_slow_successful_calls: total.slow_successful,
            number_of_slow_failed_calls: total.slow_failed,
            number_of_not_permitted_calls: metrics.number_of_not_permitted_calls(),
            total_duration: Duration::from_nanos(total.total_duration_nanos),
            contents,
        }
    }

    pub fn number_of_buffered_calls(&self) -> u64 {
        self.number_of_successful_calls + self.number_of_failed_calls
    }

    pub fn number_of_slow_calls(&self) -> u64 {
        self.number_of_slow_successful_calls + self.number_of_slow_failed_calls
    }

    /// Contents to seed a restored window with.
    ///
    /// Snapshots assembled by hand may carry counts without contents; those
    /// counts are placed in the current second.
    pub(crate) fn seed(&self, now_second: u64) -> WindowContents {
        if !self.contents.total().is_empty() || self.number_of_buffered_calls() == 0 {
            return self.contents.clone();
        }
        let measurement = Measurement {
            successful: self.number_of_successful_calls,
            failed: self.number_of_failed_calls,
            slow_successful: self
                .number_of_slow_successful_calls
                .min(self.number_of_successful_calls),
            slow_failed: self
                .number_of_slow_failed_calls
                .min(self.number_of_failed_calls),
            total_duration_nanos: crate::clock::duration_to_nanos(self.total_duration),
        };
        WindowContents::Buckets(vec![Bucket {
            epoch_second: now_second,
            measurement,
        }])
    }
}
