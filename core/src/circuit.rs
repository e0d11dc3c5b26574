//! The circuit breaker state machine
//!
//! The current state lives in an [`ArcSwap`]. Every transition builds a new
//! state value and installs it with a compare-and-swap against the exact
//! state it was derived from, so concurrent triggers collapse into a single
//! transition and a single event.
//!
//! Writes into a state (outcomes, permits, rejections) pass through the
//! state's write gate. `reconfigure` seals the gate before copying the state,
//! so a write either lands in the copy or is redone against the replacement.

use crate::breaker_metrics::{BreakerMetrics, CircuitMetrics, ThresholdCheck};
use crate::builder::CircuitBuilder;
use crate::callbacks::{CircuitEvent, EventKind, EventPublisher};
use crate::classifier::{
    ErrorDisposition, FailureContext, ResultContext, classify_error, is_failure_result,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::{CallNotPermitted, CircuitError};
use crate::metrics::Snapshot;
use crate::scheduler::Scheduler;
use crate::snapshot::{CircuitBreakerSnapshot, MetricsSnapshot};
use crate::state::{BreakerState, CircuitState, MetricsOnlyState, OpenState, Permission};
use arc_swap::ArcSwap;
use crossbeam_utils::Backoff;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A thread-safe circuit breaker
///
/// Cloning is cheap and yields a handle to the same breaker.
///
/// # Example
///
/// ```rust
/// use circuit_guard::{CircuitBreaker, CircuitState, SlidingWindowType};
/// use std::time::Duration;
///
/// let circuit = CircuitBreaker::builder("inventory")
///     .sliding_window(SlidingWindowType::CountBased, 4, 4)
///     .failure_rate_threshold(50.0)
///     .build()
///     .unwrap();
///
/// for _ in 0..2 {
///     assert!(circuit.try_acquire_permission());
///     circuit.on_success(Duration::from_millis(12));
/// }
/// for _ in 0..2 {
///     assert!(circuit.try_acquire_permission());
///     circuit.on_error(Duration::from_millis(40), &"connection refused");
/// }
///
/// assert_eq!(circuit.state(), CircuitState::Open);
/// assert!(!circuit.try_acquire_permission());
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: ArcSwap<Config>,
    state: ArcSwap<BreakerState>,
    clock: Arc<dyn Clock>,
    scheduler: Option<Arc<dyn Scheduler>>,
    events: EventPublisher,
}

impl CircuitBreaker {
    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> CircuitBuilder {
        CircuitBuilder::new(name)
    }

    /// Breaker on the system clock, without a scheduler
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        Self::with_parts(
            name.into(),
            config,
            Arc::new(SystemClock),
            None,
            EventPublisher::new(),
        )
    }

    /// Restore a breaker on the system clock from a snapshot
    pub fn from_snapshot(
        name: impl Into<String>,
        config: Config,
        snapshot: &CircuitBreakerSnapshot,
    ) -> Result<Self, CircuitError> {
        Self::restored(
            name.into(),
            config,
            Arc::new(SystemClock),
            None,
            EventPublisher::new(),
            snapshot,
        )
    }

    pub(crate) fn with_parts(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        scheduler: Option<Arc<dyn Scheduler>>,
        events: EventPublisher,
    ) -> Self {
        let initial = enter_state(config.initial_state(), 0, &config, &clock);
        let circuit = Self::assemble(name, config, initial, clock, scheduler, events);
        circuit.schedule_for(&circuit.inner.state.load_full());
        circuit
    }

    pub(crate) fn restored(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        scheduler: Option<Arc<dyn Scheduler>>,
        events: EventPublisher,
        snapshot: &CircuitBreakerSnapshot,
    ) -> Result<Self, CircuitError> {
        let state = restore_state(&name, snapshot, &config, &clock)?;
        let circuit = Self::assemble(name, config, state, clock, scheduler, events);
        circuit.schedule_for(&circuit.inner.state.load_full());
        Ok(circuit)
    }

    fn assemble(
        name: String,
        config: Config,
        state: BreakerState,
        clock: Arc<dyn Clock>,
        scheduler: Option<Arc<dyn Scheduler>>,
        events: EventPublisher,
    ) -> Self {
        tracing::debug!(circuit = %name, state = %state.kind(), "circuit breaker created");
        Self {
            inner: Arc::new(Inner {
                name,
                config: ArcSwap::from_pointee(config),
                state: ArcSwap::from_pointee(state),
                clock,
                scheduler,
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> Arc<Config> {
        self.inner.config.load_full()
    }

    pub fn state(&self) -> CircuitState {
        self.inner.state.load().kind()
    }

    /// State name, e.g. `"HalfOpen"`
    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Metrics of the current state
    pub fn metrics(&self) -> CircuitMetrics {
        self.inner.state.load().metrics().metrics()
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        &self.inner.events
    }

    /// Ask whether a call may proceed.
    ///
    /// An Open breaker whose wait interval has passed moves to HalfOpen here
    /// and answers from there. A permitted HalfOpen call holds a trial permit
    /// until its outcome is recorded or [`release_permission`](Self::release_permission)
    /// is called.
    pub fn try_acquire_permission(&self) -> bool {
        loop {
            let (state, permission) =
                self.with_current(|state| state.try_acquire(self.inner.clock.now()));
            match permission {
                Permission::Permitted => return true,
                Permission::Rejected => {
                    self.publish(|| EventKind::CallNotPermitted);
                    return false;
                }
                Permission::OpenWaitElapsed => {
                    self.transition_from(&state, CircuitState::HalfOpen, None);
                }
                Permission::HalfOpenWaitElapsed => {
                    let target = self.config().transition_to_state_after_wait_duration();
                    self.transition_from(&state, target, None);
                }
            }
        }
    }

    /// Like [`try_acquire_permission`](Self::try_acquire_permission), but a
    /// rejection is returned as [`CircuitError::CallNotPermitted`]
    pub fn acquire_permission(&self) -> Result<(), CircuitError> {
        if self.try_acquire_permission() {
            return Ok(());
        }
        let config = self.config();
        Err(CallNotPermitted::new(
            &self.inner.name,
            self.state(),
            config.writable_stack_trace_enabled(),
        )
        .into())
    }

    /// Give back a permission whose call never ran
    pub fn release_permission(&self) {
        self.with_current(|state| state.release_permission());
    }

    /// Record a successful call
    pub fn on_success(&self, duration: Duration) {
        self.publish(|| EventKind::Success { elapsed: duration });
        self.record(duration, true);
    }

    /// Report a failed call.
    ///
    /// The configured classifiers decide whether the error is ignored,
    /// recorded as a failure, or counted as a success.
    pub fn on_error<E>(&self, duration: Duration, error: &E)
    where
        E: Any + fmt::Display,
    {
        let config = self.config();
        let ctx = FailureContext {
            circuit_name: &self.inner.name,
            error,
            duration,
        };
        match classify_error(config.record_error(), config.ignore_error(), &ctx) {
            ErrorDisposition::Ignore => {
                self.release_permission();
                self.publish(|| EventKind::IgnoredError {
                    elapsed: duration,
                    cause: error.to_string(),
                });
            }
            ErrorDisposition::RecordFailure => {
                self.publish(|| EventKind::Error {
                    elapsed: duration,
                    cause: error.to_string(),
                });
                self.record(duration, false);
            }
            ErrorDisposition::RecordSuccess => self.on_success(duration),
        }
    }

    /// Report a call that returned normally; the result classifier may still
    /// record it as a failure
    pub fn on_result<R: Any>(&self, duration: Duration, result: &R) {
        let config = self.config();
        let ctx = ResultContext {
            circuit_name: &self.inner.name,
            result,
            duration,
        };
        if is_failure_result(config.record_result(), &ctx) {
            self.publish(|| EventKind::Error {
                elapsed: duration,
                cause: "result recorded as failure".to_string(),
            });
            self.record(duration, false);
        } else {
            self.on_success(duration);
        }
    }

    fn record(&self, duration: Duration, succeeded: bool) {
        let (state, recorded) = self.with_current(|state| {
            if !state.records_outcomes() {
                return None;
            }
            let metrics = state.metrics();
            Some(if succeeded {
                metrics.on_success(duration)
            } else {
                metrics.on_error(duration)
            })
        });
        let Some((check, snapshot)) = recorded else {
            return;
        };

        match &*state {
            BreakerState::Closed { .. } if check.exceeded() => {
                self.transition_from(&state, CircuitState::Open, Some((check, &snapshot)));
            }
            BreakerState::HalfOpen(_) => match check {
                ThresholdCheck::BelowMinimumCalls => {}
                ThresholdCheck::BelowThresholds => {
                    self.transition_from(&state, CircuitState::Closed, None);
                }
                _ => {
                    self.transition_from(&state, CircuitState::Open, Some((check, &snapshot)));
                }
            },
            BreakerState::MetricsOnly(metrics_only)
                if check.exceeded() && metrics_only.claim_rate_exceeded_event() =>
            {
                self.publish_rate_exceeded(check, &snapshot);
            }
            _ => {}
        }
    }

    pub fn transition_to_closed_state(&self) {
        self.transition_manually(CircuitState::Closed);
    }

    pub fn transition_to_open_state(&self) {
        self.transition_manually(CircuitState::Open);
    }

    pub fn transition_to_half_open_state(&self) {
        self.transition_manually(CircuitState::HalfOpen);
    }

    pub fn transition_to_disabled_state(&self) {
        self.transition_manually(CircuitState::Disabled);
    }

    pub fn transition_to_forced_open_state(&self) {
        self.transition_manually(CircuitState::ForcedOpen);
    }

    pub fn transition_to_metrics_only_state(&self) {
        self.transition_manually(CircuitState::MetricsOnly);
    }

    /// Move to `target` unless already there
    fn transition_manually(&self, target: CircuitState) {
        loop {
            let current = self.inner.state.load_full();
            if current.kind() == target {
                return;
            }
            if self.transition_from(&current, target, None) {
                return;
            }
        }
    }

    /// Back to a fresh Closed state, whatever the current state
    pub fn reset(&self) {
        let config = self.config();
        let fresh = enter_state(CircuitState::Closed, 0, &config, &self.inner.clock);
        let previous = self.inner.state.swap(Arc::new(fresh));
        let from = previous.kind();
        tracing::debug!(circuit = %self.inner.name, from = %from, "circuit breaker reset");
        if from != CircuitState::Closed {
            self.publish(|| EventKind::StateTransition {
                from,
                to: CircuitState::Closed,
            });
        }
        self.publish(|| EventKind::Reset);
    }

    /// Capture the current state for a later [`from_snapshot`](Self::from_snapshot)
    pub fn create_snapshot(&self) -> CircuitBreakerSnapshot {
        snapshot_of(&self.inner.state.load())
    }

    /// Swap in a new configuration, keeping the current state and metrics.
    ///
    /// Outcomes and permits taken while the state is being rebuilt are
    /// carried into the rebuilt state.
    pub fn reconfigure(&self, config: Config) -> Result<(), CircuitError> {
        self.inner.config.store(Arc::new(config));
        let backoff = Backoff::new();
        loop {
            let current = self.inner.state.load_full();
            // Another reconfiguration is already replacing this state
            if !current.gate().seal() {
                backoff.snooze();
                continue;
            }
            let config = self.config();
            let next = match restore_state(
                &self.inner.name,
                &snapshot_of(&current),
                &config,
                &self.inner.clock,
            ) {
                Ok(next) => Arc::new(next),
                Err(err) => {
                    current.gate().unseal();
                    return Err(err);
                }
            };
            let previous = self.inner.state.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                tracing::debug!(circuit = %self.inner.name, state = %next.kind(), "circuit breaker reconfigured");
                self.schedule_for(&next);
                return Ok(());
            }
            // A transition replaced the sealed state first; rebuild from that one
        }
    }

    /// Apply `write` to the current state while holding its write gate.
    ///
    /// A sealed gate means a reconfiguration is replacing the state; wait for
    /// the replacement and write there instead.
    fn with_current<R>(&self, write: impl Fn(&BreakerState) -> R) -> (Arc<BreakerState>, R) {
        let backoff = Backoff::new();
        loop {
            let state = self.inner.state.load_full();
            let written = match state.gate().enter() {
                Some(_inside) => Some(write(&state)),
                None => None,
            };
            if let Some(result) = written {
                return (state, result);
            }
            backoff.snooze();
        }
    }

    /// Install `target` if `expected` is still the current state.
    ///
    /// Returns whether this call performed the transition; the loser of a
    /// race publishes nothing.
    fn transition_from(
        &self,
        expected: &Arc<BreakerState>,
        target: CircuitState,
        exceeded: Option<(ThresholdCheck, &Snapshot)>,
    ) -> bool {
        let config = self.config();
        let next = Arc::new(enter_state(
            target,
            expected.attempts(),
            &config,
            &self.inner.clock,
        ));
        let previous = self.inner.state.compare_and_swap(expected, Arc::clone(&next));
        if !Arc::ptr_eq(&previous, expected) {
            return false;
        }

        let from = expected.kind();
        tracing::debug!(
            circuit = %self.inner.name,
            from = %from,
            to = %target,
            attempts = next.attempts(),
            "circuit breaker state transition"
        );
        if let Some((check, snapshot)) = exceeded {
            self.publish_rate_exceeded(check, snapshot);
        }
        self.publish(|| EventKind::StateTransition { from, to: target });
        self.schedule_for(&next);
        true
    }

    /// Queue the timed exit of a freshly installed Open or HalfOpen state
    fn schedule_for(&self, state: &Arc<BreakerState>) {
        let Some(scheduler) = &self.inner.scheduler else {
            return;
        };
        let config = self.config();
        if !config.automatic_transition_from_open_to_half_open_enabled() {
            return;
        }
        let (delay, target) = match &**state {
            BreakerState::Open(open) => (
                open.retry_after.saturating_sub(self.inner.clock.now()),
                CircuitState::HalfOpen,
            ),
            BreakerState::HalfOpen(half_open) => match half_open.deadline {
                Some(deadline) => (
                    deadline.saturating_sub(self.inner.clock.now()),
                    config.transition_to_state_after_wait_duration(),
                ),
                None => return,
            },
            _ => return,
        };

        let circuit: Weak<Inner> = Arc::downgrade(&self.inner);
        let expected: Weak<BreakerState> = Arc::downgrade(state);
        scheduler.schedule_once(
            delay,
            Box::new(move || {
                let (Some(inner), Some(expected)) = (circuit.upgrade(), expected.upgrade()) else {
                    return;
                };
                let circuit = CircuitBreaker { inner };
                let applied = circuit.transition_from(&expected, target, None);
                tracing::debug!(circuit = %circuit.inner.name, to = %target, applied, "scheduled transition fired");
            }),
        );
    }

    fn publish_rate_exceeded(&self, check: ThresholdCheck, snapshot: &Snapshot) {
        if matches!(
            check,
            ThresholdCheck::FailureRateExceeded | ThresholdCheck::BothExceeded
        ) {
            self.publish(|| EventKind::FailureRateExceeded {
                rate: snapshot.failure_rate,
            });
        }
        if matches!(
            check,
            ThresholdCheck::SlowCallRateExceeded | ThresholdCheck::BothExceeded
        ) {
            self.publish(|| EventKind::SlowCallRateExceeded {
                rate: snapshot.slow_call_rate,
            });
        }
    }

    fn publish(&self, kind: impl FnOnce() -> EventKind) {
        let events = &self.inner.events;
        if !events.has_subscribers() {
            return;
        }
        let kind = kind();
        let state = self.state();
        if !kind.force_publish() && !state.allows_publish() {
            tracing::debug!(circuit = %self.inner.name, event = ?kind, state = %state, "event not published");
            return;
        }
        events.publish(&CircuitEvent {
            circuit_name: self.inner.name.clone(),
            created_at: self.inner.clock.now(),
            kind,
        });
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("scheduler", &self.inner.scheduler)
            .field("events", &self.inner.events)
            .finish()
    }
}

/// Build a fresh state of kind `target` with an empty window.
///
/// Seeded windows (reconfigure and snapshot restore) go through
/// `restore_state` instead.
///
/// `previous_attempts` is the attempt counter of the state being left; Open
/// and ForcedOpen count one more, HalfOpen keeps it, the others reset it.
fn enter_state(
    target: CircuitState,
    previous_attempts: u32,
    config: &Config,
    clock: &Arc<dyn Clock>,
) -> BreakerState {
    let metrics = || BreakerMetrics::with_config(config, clock, None);
    match target {
        CircuitState::Closed => BreakerState::Closed { metrics: metrics() },
        CircuitState::Open => {
            let attempts = previous_attempts.saturating_add(1);
            let wait = config.wait_interval().wait_duration(attempts);
            BreakerState::Open(OpenState {
                metrics: metrics(),
                attempts,
                retry_after: clock.now().saturating_add(wait),
            })
        }
        CircuitState::HalfOpen => {
            let permitted = config.permitted_number_of_calls_in_half_open_state();
            BreakerState::half_open(
                BreakerMetrics::for_half_open(config, clock, None),
                previous_attempts,
                permitted,
                permitted,
                half_open_deadline(config, clock),
            )
        }
        CircuitState::Disabled => BreakerState::Disabled { metrics: metrics() },
        CircuitState::ForcedOpen => BreakerState::ForcedOpen {
            metrics: metrics(),
            attempts: previous_attempts.saturating_add(1),
        },
        CircuitState::MetricsOnly => BreakerState::MetricsOnly(MetricsOnlyState::new(metrics())),
    }
}

fn half_open_deadline(config: &Config, clock: &Arc<dyn Clock>) -> Option<Duration> {
    let max_wait = config.max_wait_duration_in_half_open_state();
    (!max_wait.is_zero()).then(|| clock.now().saturating_add(max_wait))
}

fn snapshot_of(state: &BreakerState) -> CircuitBreakerSnapshot {
    let metrics = state.metrics();
    CircuitBreakerSnapshot {
        state: state.kind(),
        metrics: MetricsSnapshot::capture(&metrics.metrics(), metrics.contents()),
        attempts: state.attempts(),
        retry_after_wait_until: state.retry_after(),
        half_open_permits_in_use: state.permits_in_use(),
    }
}

/// Rebuild a state from a snapshot under `config`
fn restore_state(
    name: &str,
    snapshot: &CircuitBreakerSnapshot,
    config: &Config,
    clock: &Arc<dyn Clock>,
) -> Result<BreakerState, CircuitError> {
    let seed = snapshot.metrics.seed(clock.epoch_second());
    let not_permitted = snapshot.metrics.number_of_not_permitted_calls;
    let metrics = || {
        BreakerMetrics::with_config(config, clock, Some(&seed)).with_not_permitted(not_permitted)
    };

    let state = match snapshot.state {
        CircuitState::Closed => BreakerState::Closed { metrics: metrics() },
        CircuitState::Open => {
            let retry_after = snapshot.retry_after_wait_until.ok_or_else(|| {
                CircuitError::IllegalStateTransition {
                    name: name.to_string(),
                    from: CircuitState::Open,
                    to: CircuitState::Open,
                }
            })?;
            BreakerState::Open(OpenState {
                metrics: metrics(),
                attempts: snapshot.attempts.max(1),
                retry_after,
            })
        }
        CircuitState::HalfOpen => {
            let permitted = config.permitted_number_of_calls_in_half_open_state();
            let trial = BreakerMetrics::for_half_open(config, clock, Some(&seed))
                .with_not_permitted(not_permitted);
            let recorded =
                u32::try_from(trial.metrics().number_of_buffered_calls()).unwrap_or(u32::MAX);
            // Permits held by calls still running stay taken
            let in_use = snapshot
                .half_open_permits_in_use
                .unwrap_or(recorded)
                .max(recorded);
            BreakerState::half_open(
                trial,
                snapshot.attempts,
                permitted,
                permitted.saturating_sub(in_use),
                half_open_deadline(config, clock),
            )
        }
        CircuitState::Disabled => BreakerState::Disabled { metrics: metrics() },
        CircuitState::ForcedOpen => BreakerState::ForcedOpen {
            metrics: metrics(),
            attempts: snapshot.attempts,
        },
        CircuitState::MetricsOnly => BreakerState::MetricsOnly(MetricsOnlyState::new(metrics())),
    };
    Ok(state)
}
