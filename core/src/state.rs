//! Circuit states and their per-variant payloads
//!
//! A state value is created on every transition and never mutated in place
//! apart from its atomic counters; the breaker swaps whole states.

use crate::breaker_metrics::{BreakerMetrics, WriteGate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// The six states of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow, outcomes are evaluated
    Closed,
    /// Calls are rejected until the wait interval passes
    Open,
    /// A bounded number of trial calls decide between Closed and Open
    HalfOpen,
    /// Calls flow, nothing is recorded
    Disabled,
    /// Calls are rejected until a manual transition
    ForcedOpen,
    /// Calls flow and are recorded, but the breaker never trips
    MetricsOnly,
}

impl CircuitState {
    /// Human readable name, as used by `state_name()`
    pub fn name(self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
            CircuitState::Disabled => "Disabled",
            CircuitState::ForcedOpen => "ForcedOpen",
            CircuitState::MetricsOnly => "MetricsOnly",
        }
    }

    /// Whether non-forced events are published while in this state
    pub fn allows_publish(self) -> bool {
        !matches!(self, CircuitState::Disabled | CircuitState::ForcedOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Disabled => "DISABLED",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::MetricsOnly => "METRICS_ONLY",
        })
    }
}

/// Answer of a state to a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Permission {
    Permitted,
    Rejected,
    /// Open's wait interval is over; move to HalfOpen and ask again
    OpenWaitElapsed,
    /// HalfOpen waited too long for its trial calls
    HalfOpenWaitElapsed,
}

#[derive(Debug)]
pub(crate) struct OpenState {
    pub(crate) metrics: BreakerMetrics,
    pub(crate) attempts: u32,
    /// Clock time after which calls are permitted again
    pub(crate) retry_after: Duration,
}

#[derive(Debug)]
pub(crate) struct HalfOpenState {
    pub(crate) metrics: BreakerMetrics,
    pub(crate) attempts: u32,
    pub(crate) permitted: u32,
    pub(crate) permits: AtomicU32,
    /// Clock time after which HalfOpen gives up waiting
    pub(crate) deadline: Option<Duration>,
}

impl HalfOpenState {
    fn try_take_permit(&self) -> bool {
        self.permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
            .is_ok()
    }

    fn return_permit(&self) {
        let permitted = self.permitted;
        let _ = self
            .permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                (p < permitted).then_some(p + 1)
            });
    }
}

#[derive(Debug)]
pub(crate) struct MetricsOnlyState {
    pub(crate) metrics: BreakerMetrics,
    rate_exceeded_published: AtomicBool,
}

impl MetricsOnlyState {
    pub(crate) fn new(metrics: BreakerMetrics) -> Self {
        Self {
            metrics,
            rate_exceeded_published: AtomicBool::new(false),
        }
    }

    /// True exactly once, for the first caller that sees a threshold crossed
    pub(crate) fn claim_rate_exceeded_event(&self) -> bool {
        !self.rate_exceeded_published.swap(true, Ordering::AcqRel)
    }
}

/// The state currently installed in a breaker
#[derive(Debug)]
pub(crate) enum BreakerState {
    Closed { metrics: BreakerMetrics },
    Open(OpenState),
    HalfOpen(HalfOpenState),
    Disabled { metrics: BreakerMetrics },
    ForcedOpen { metrics: BreakerMetrics, attempts: u32 },
    MetricsOnly(MetricsOnlyState),
}

impl BreakerState {
    /// HalfOpen with `available` of its `permitted` trial calls still free
    pub(crate) fn half_open(
        metrics: BreakerMetrics,
        attempts: u32,
        permitted: u32,
        available: u32,
        deadline: Option<Duration>,
    ) -> Self {
        BreakerState::HalfOpen(HalfOpenState {
            metrics,
            attempts,
            permitted,
            permits: AtomicU32::new(available.min(permitted)),
            deadline,
        })
    }

    pub(crate) fn kind(&self) -> CircuitState {
        match self {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open(_) => CircuitState::Open,
            BreakerState::HalfOpen(_) => CircuitState::HalfOpen,
            BreakerState::Disabled { .. } => CircuitState::Disabled,
            BreakerState::ForcedOpen { .. } => CircuitState::ForcedOpen,
            BreakerState::MetricsOnly(_) => CircuitState::MetricsOnly,
        }
    }

    pub(crate) fn metrics(&self) -> &BreakerMetrics {
        match self {
            BreakerState::Closed { metrics }
            | BreakerState::Disabled { metrics }
            | BreakerState::ForcedOpen { metrics, .. } => metrics,
            BreakerState::Open(open) => &open.metrics,
            BreakerState::HalfOpen(half_open) => &half_open.metrics,
            BreakerState::MetricsOnly(metrics_only) => &metrics_only.metrics,
        }
    }

    /// Consecutive Open entries; reset by Closed
    pub(crate) fn attempts(&self) -> u32 {
        match self {
            BreakerState::Open(open) => open.attempts,
            BreakerState::HalfOpen(half_open) => half_open.attempts,
            BreakerState::ForcedOpen { attempts, .. } => *attempts,
            BreakerState::Closed { .. }
            | BreakerState::Disabled { .. }
            | BreakerState::MetricsOnly(_) => 0,
        }
    }

    pub(crate) fn gate(&self) -> &WriteGate {
        self.metrics().gate()
    }

    /// HalfOpen permits taken and not given back, reported or not
    pub(crate) fn permits_in_use(&self) -> Option<u32> {
        match self {
            BreakerState::HalfOpen(half_open) => Some(
                half_open
                    .permitted
                    .saturating_sub(half_open.permits.load(Ordering::Acquire)),
            ),
            _ => None,
        }
    }

    pub(crate) fn retry_after(&self) -> Option<Duration> {
        match self {
            BreakerState::Open(open) => Some(open.retry_after),
            _ => None,
        }
    }

    /// Decide a permission request at clock time `now`.
    ///
    /// Rejections are counted here; a permitted HalfOpen request holds one
    /// permit until it is released.
    pub(crate) fn try_acquire(&self, now: Duration) -> Permission {
        match self {
            BreakerState::Closed { .. }
            | BreakerState::Disabled { .. }
            | BreakerState::MetricsOnly(_) => Permission::Permitted,
            BreakerState::Open(open) => {
                if now > open.retry_after {
                    Permission::OpenWaitElapsed
                } else {
                    open.metrics.on_call_not_permitted();
                    Permission::Rejected
                }
            }
            BreakerState::HalfOpen(half_open) => {
                if half_open.deadline.is_some_and(|deadline| now >= deadline) {
                    return Permission::HalfOpenWaitElapsed;
                }
                if half_open.try_take_permit() {
                    Permission::Permitted
                } else {
                    half_open.metrics.on_call_not_permitted();
                    Permission::Rejected
                }
            }
            BreakerState::ForcedOpen { metrics, .. } => {
                metrics.on_call_not_permitted();
                Permission::Rejected
            }
        }
    }

    /// Give back a HalfOpen permit; no-op elsewhere
    pub(crate) fn release_permission(&self) {
        if let BreakerState::HalfOpen(half_open) = self {
            half_open.return_permit();
        }
    }

    /// Whether outcomes reported in this state go into its metrics
    pub(crate) fn records_outcomes(&self) -> bool {
        !matches!(
            self,
            BreakerState::Disabled { .. } | BreakerState::ForcedOpen { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use std::sync::Arc;

    fn half_open(permitted: u32, deadline: Option<Duration>) -> BreakerState {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let config = Config::builder()
            .permitted_number_of_calls_in_half_open_state(permitted)
            .build()
            .unwrap();
        BreakerState::half_open(
            BreakerMetrics::for_half_open(&config, &clock, None),
            1,
            permitted,
            permitted,
            deadline,
        )
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CircuitState::HalfOpen.name(), "HalfOpen");
        assert_eq!(CircuitState::ForcedOpen.to_string(), "FORCED_OPEN");
        assert!(CircuitState::MetricsOnly.allows_publish());
        assert!(!CircuitState::Disabled.allows_publish());
    }

    #[test]
    fn test_half_open_permits_are_bounded() {
        let state = half_open(2, None);
        assert_eq!(state.try_acquire(Duration::ZERO), Permission::Permitted);
        assert_eq!(state.try_acquire(Duration::ZERO), Permission::Permitted);
        assert_eq!(state.try_acquire(Duration::ZERO), Permission::Rejected);

        state.release_permission();
        assert_eq!(state.try_acquire(Duration::ZERO), Permission::Permitted);
        assert_eq!(state.metrics().metrics().number_of_not_permitted_calls(), 1);
    }

    #[test]
    fn test_release_never_exceeds_budget() {
        let state = half_open(1, None);
        state.release_permission();
        state.release_permission();
        assert_eq!(state.try_acquire(Duration::ZERO), Permission::Permitted);
        assert_eq!(state.try_acquire(Duration::ZERO), Permission::Rejected);
    }

    #[test]
    fn test_half_open_deadline() {
        let state = half_open(5, Some(Duration::from_secs(10)));
        assert_eq!(state.try_acquire(Duration::from_secs(9)), Permission::Permitted);
        assert_eq!(
            state.try_acquire(Duration::from_secs(10)),
            Permission::HalfOpenWaitElapsed
        );
    }

    #[test]
    fn test_permits_in_use_counts_unreported_calls() {
        let state = half_open(3, None);
        assert_eq!(state.permits_in_use(), Some(0));
        state.try_acquire(Duration::ZERO);
        state.try_acquire(Duration::ZERO);
        assert_eq!(state.permits_in_use(), Some(2));
        state.release_permission();
        assert_eq!(state.permits_in_use(), Some(1));
    }
}
