//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::{CircuitEvent, EventPublisher},
    circuit::CircuitBreaker,
    classifier::{FailureClassifier, ResultClassifier},
    clock::{Clock, SystemClock},
    config::{Config, ConfigBuilder},
    errors::CircuitError,
    interval::WaitInterval,
    metrics::{SlidingWindowType, WindowSynchronization},
    scheduler::Scheduler,
    snapshot::CircuitBreakerSnapshot,
    state::CircuitState,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: ConfigBuilder,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    events: EventPublisher,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::builder(),
            clock: None,
            scheduler: None,
            events: EventPublisher::new(),
        }
    }

    /// Start from an existing configuration; later setters override it
    pub fn config(mut self, config: Config) -> Self {
        self.config = config.to_builder();
        self
    }

    /// Failure rate in percent at or above which the circuit opens
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config = self.config.failure_rate_threshold(percent);
        self
    }

    /// Slow call rate in percent at or above which the circuit opens
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config = self.config.slow_call_rate_threshold(percent);
        self
    }

    /// Calls lasting at least this long count as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config = self.config.slow_call_duration_threshold(threshold);
        self
    }

    /// Window type, size (calls or seconds) and the minimum number of calls
    /// before rates are evaluated
    pub fn sliding_window(
        mut self,
        window_type: SlidingWindowType,
        size: u32,
        minimum_number_of_calls: u32,
    ) -> Self {
        self.config = self
            .config
            .sliding_window(window_type, size, minimum_number_of_calls);
        self
    }

    pub fn window_synchronization(mut self, synchronization: WindowSynchronization) -> Self {
        self.config = self.config.window_synchronization(synchronization);
        self
    }

    /// Fixed wait in Open before trial calls are allowed
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config = self.config.wait_duration_in_open_state(wait);
        self
    }

    /// Attempt-dependent wait in Open (exponential, randomized, custom)
    pub fn wait_interval(mut self, interval: WaitInterval) -> Self {
        self.config = self.config.wait_interval(interval);
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config = self.config.permitted_number_of_calls_in_half_open_state(calls);
        self
    }

    /// Give up on HalfOpen after this long; zero waits forever
    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.config = self.config.max_wait_duration_in_half_open_state(wait);
        self
    }

    /// Leave Open on a timer instead of on the next permission request.
    ///
    /// Only takes effect together with a [`scheduler`](Self::scheduler).
    pub fn automatic_transition_from_open_to_half_open_enabled(mut self, enabled: bool) -> Self {
        self.config = self
            .config
            .automatic_transition_from_open_to_half_open_enabled(enabled);
        self
    }

    pub fn initial_state(mut self, state: CircuitState) -> Self {
        self.config = self.config.initial_state(state);
        self
    }

    /// Decide which errors count as failures
    ///
    /// # Examples
    ///
    /// ```rust
    /// use circuit_guard::{CircuitBreaker, ErrorPredicate};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .record_error(Arc::new(ErrorPredicate::new(|ctx| {
    ///         // Only slow errors count
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn record_error(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config = self.config.record_error(classifier);
        self
    }

    /// Errors matching this classifier are neither failures nor successes
    pub fn ignore_error(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config = self.config.ignore_error(classifier);
        self
    }

    pub fn record_result(mut self, classifier: Arc<dyn ResultClassifier>) -> Self {
        self.config = self.config.record_result(classifier);
        self
    }

    /// Time source; defaults to [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_open(f);
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_close(f);
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.on_half_open(f);
        self
    }

    /// Receive every event the breaker publishes
    pub fn on_event<F>(self, f: F) -> Self
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.events.on_event(f);
        self
    }

    /// Build the circuit breaker in the configured initial state
    pub fn build(self) -> Result<CircuitBreaker, CircuitError> {
        let config = self.config.build()?;
        Ok(CircuitBreaker::with_parts(
            self.name,
            config,
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.scheduler,
            self.events,
        ))
    }

    /// Build the circuit breaker in the state captured by `snapshot`
    pub fn restore(self, snapshot: &CircuitBreakerSnapshot) -> Result<CircuitBreaker, CircuitError> {
        let config = self.config.build()?;
        CircuitBreaker::restored(
            self.name,
            config,
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.scheduler,
            self.events,
            snapshot,
        )
    }
}

impl std::fmt::Debug for CircuitBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("scheduler", &self.scheduler)
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ConfigError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builder_defaults() {
        let circuit = CircuitBuilder::new("test").build().unwrap();

        assert_eq!(circuit.state_name(), "Closed");
        assert!(circuit.is_closed());
        assert_eq!(circuit.config().sliding_window_size(), 100);
    }

    #[test]
    fn test_builder_custom_config() {
        let circuit = CircuitBuilder::new("test")
            .sliding_window(SlidingWindowType::TimeBased, 30, 5)
            .failure_rate_threshold(25.0)
            .wait_duration_in_open_state(Duration::from_secs(10))
            .permitted_number_of_calls_in_half_open_state(3)
            .build()
            .unwrap();

        let config = circuit.config();
        assert_eq!(config.sliding_window_type(), SlidingWindowType::TimeBased);
        assert_eq!(config.minimum_number_of_calls(), 5);
        assert_eq!(config.failure_rate_threshold(), 25.0);
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = CircuitBuilder::new("test")
            .failure_rate_threshold(0.0)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            CircuitError::Config(ConfigError::FailureRateThreshold(_))
        ));
    }

    #[test]
    fn test_builder_with_callbacks() {
        let opened = Arc::new(AtomicUsize::new(0));
        let half_opened = Arc::new(AtomicUsize::new(0));
        let opened_clone = Arc::clone(&opened);
        let half_opened_clone = Arc::clone(&half_opened);

        let clock = Arc::new(ManualClock::new(Duration::from_secs(50)));
        let circuit = CircuitBuilder::new("test")
            .sliding_window(SlidingWindowType::CountBased, 2, 2)
            .wait_duration_in_open_state(Duration::from_secs(1))
            .clock(clock.clone())
            .on_open(move |_name| {
                opened_clone.fetch_add(1, Ordering::SeqCst);
            })
            .on_half_open(move |_name| {
                half_opened_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        circuit.on_error(Duration::ZERO, &"error 1");
        circuit.on_error(Duration::ZERO, &"error 2");
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(2));
        assert!(circuit.try_acquire_permission());
        assert_eq!(half_opened.load(Ordering::SeqCst), 1);
    }
}
