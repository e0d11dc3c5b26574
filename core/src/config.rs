//! Circuit breaker configuration
//!
//! `Config` is immutable once built and shared by reference. All validation
//! happens in [`ConfigBuilder::build`], never at call time.

use crate::classifier::{
    AcceptAllResults, FailureClassifier, MatchAllErrors, MatchNoErrors, ResultClassifier,
};
use crate::errors::ConfigError;
use crate::interval::WaitInterval;
use crate::metrics::{SlidingWindowType, WindowSpec, WindowSynchronization};
use crate::state::CircuitState;
use std::sync::Arc;
use std::time::Duration;

/// Validated circuit breaker configuration
#[derive(Debug, Clone)]
pub struct Config {
    failure_rate_threshold: f32,
    slow_call_rate_threshold: f32,
    slow_call_duration_threshold: Duration,
    sliding_window_type: SlidingWindowType,
    sliding_window_size: u32,
    minimum_number_of_calls: u32,
    permitted_number_of_calls_in_half_open_state: u32,
    wait_interval: WaitInterval,
    max_wait_duration_in_half_open_state: Duration,
    automatic_transition_from_open_to_half_open_enabled: bool,
    initial_state: CircuitState,
    transition_to_state_after_wait_duration: CircuitState,
    record_error: Arc<dyn FailureClassifier>,
    ignore_error: Arc<dyn FailureClassifier>,
    record_result: Arc<dyn ResultClassifier>,
    writable_stack_trace_enabled: bool,
    window_synchronization: WindowSynchronization,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            permitted_number_of_calls_in_half_open_state: 10,
            wait_interval: WaitInterval::default(),
            max_wait_duration_in_half_open_state: Duration::ZERO,
            automatic_transition_from_open_to_half_open_enabled: false,
            initial_state: CircuitState::Closed,
            transition_to_state_after_wait_duration: CircuitState::Open,
            record_error: Arc::new(MatchAllErrors),
            ignore_error: Arc::new(MatchNoErrors),
            record_result: Arc::new(AcceptAllResults),
            writable_stack_trace_enabled: true,
            window_synchronization: WindowSynchronization::Synchronized,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Builder pre-filled with this config's values
    pub fn to_builder(&self) -> ConfigBuilder {
        ConfigBuilder {
            config: self.clone(),
        }
    }

    /// Failure rate in percent at or above which the breaker opens
    pub fn failure_rate_threshold(&self) -> f32 {
        self.failure_rate_threshold
    }

    /// Slow call rate in percent at or above which the breaker opens
    pub fn slow_call_rate_threshold(&self) -> f32 {
        self.slow_call_rate_threshold
    }

    /// Calls at least this long count as slow
    pub fn slow_call_duration_threshold(&self) -> Duration {
        self.slow_call_duration_threshold
    }

    pub fn sliding_window_type(&self) -> SlidingWindowType {
        self.sliding_window_type
    }

    /// Calls (count-based) or seconds (time-based)
    pub fn sliding_window_size(&self) -> u32 {
        self.sliding_window_size
    }

    pub fn minimum_number_of_calls(&self) -> u32 {
        self.minimum_number_of_calls
    }

    pub fn permitted_number_of_calls_in_half_open_state(&self) -> u32 {
        self.permitted_number_of_calls_in_half_open_state
    }

    pub fn wait_interval(&self) -> &WaitInterval {
        &self.wait_interval
    }

    /// Zero means HalfOpen waits indefinitely for its trial calls
    pub fn max_wait_duration_in_half_open_state(&self) -> Duration {
        self.max_wait_duration_in_half_open_state
    }

    pub fn automatic_transition_from_open_to_half_open_enabled(&self) -> bool {
        self.automatic_transition_from_open_to_half_open_enabled
    }

    pub fn initial_state(&self) -> CircuitState {
        self.initial_state
    }

    pub fn transition_to_state_after_wait_duration(&self) -> CircuitState {
        self.transition_to_state_after_wait_duration
    }

    pub fn record_error(&self) -> &dyn FailureClassifier {
        self.record_error.as_ref()
    }

    pub fn ignore_error(&self) -> &dyn FailureClassifier {
        self.ignore_error.as_ref()
    }

    pub fn record_result(&self) -> &dyn ResultClassifier {
        self.record_result.as_ref()
    }

    pub fn writable_stack_trace_enabled(&self) -> bool {
        self.writable_stack_trace_enabled
    }

    pub fn window_synchronization(&self) -> WindowSynchronization {
        self.window_synchronization
    }

    /// Window used by Closed, Open, Disabled and MetricsOnly
    pub(crate) fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            window_type: self.sliding_window_type,
            size: self.sliding_window_size,
            synchronization: self.window_synchronization,
        }
    }
}

/// Fluent builder for [`Config`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    pub fn sliding_window_size(mut self, size: u32) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Window type, size and minimum calls in one go
    pub fn sliding_window(
        self,
        window_type: SlidingWindowType,
        size: u32,
        minimum_number_of_calls: u32,
    ) -> Self {
        self.sliding_window_type(window_type)
            .sliding_window_size(size)
            .minimum_number_of_calls(minimum_number_of_calls)
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Fixed wait in Open
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_interval = WaitInterval::fixed(wait);
        self
    }

    /// Attempt-indexed wait in Open
    pub fn wait_interval(mut self, interval: WaitInterval) -> Self {
        self.config.wait_interval = interval;
        self
    }

    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration_in_half_open_state = wait;
        self
    }

    pub fn automatic_transition_from_open_to_half_open_enabled(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open_enabled = enabled;
        self
    }

    pub fn initial_state(mut self, state: CircuitState) -> Self {
        self.config.initial_state = state;
        self
    }

    pub fn transition_to_state_after_wait_duration(mut self, state: CircuitState) -> Self {
        self.config.transition_to_state_after_wait_duration = state;
        self
    }

    /// Errors this classifier matches count as failures; others as successes
    pub fn record_error(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config.record_error = classifier;
        self
    }

    /// Errors this classifier matches are neither failures nor successes
    pub fn ignore_error(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config.ignore_error = classifier;
        self
    }

    /// Successful results this classifier matches count as failures
    pub fn record_result(mut self, classifier: Arc<dyn ResultClassifier>) -> Self {
        self.config.record_result = classifier;
        self
    }

    pub fn writable_stack_trace_enabled(mut self, enabled: bool) -> Self {
        self.config.writable_stack_trace_enabled = enabled;
        self
    }

    pub fn window_synchronization(mut self, synchronization: WindowSynchronization) -> Self {
        self.config.window_synchronization = synchronization;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Config, ConfigError> {
        let c = self.config;

        if !valid_rate(c.failure_rate_threshold) {
            return Err(ConfigError::FailureRateThreshold(c.failure_rate_threshold));
        }
        if !valid_rate(c.slow_call_rate_threshold) {
            return Err(ConfigError::SlowCallRateThreshold(c.slow_call_rate_threshold));
        }
        if c.slow_call_duration_threshold < Duration::from_nanos(1) {
            return Err(ConfigError::SlowCallDurationThreshold);
        }
        if c.sliding_window_size == 0 {
            return Err(ConfigError::SlidingWindowSize);
        }
        if c.minimum_number_of_calls == 0 {
            return Err(ConfigError::MinimumNumberOfCalls);
        }
        // A time-based window size is in seconds, so only count-based windows cap the minimum.
        if c.sliding_window_type == SlidingWindowType::CountBased
            && c.minimum_number_of_calls > c.sliding_window_size
        {
            return Err(ConfigError::MinimumCallsExceedWindow {
                minimum: c.minimum_number_of_calls,
                window: c.sliding_window_size,
            });
        }
        if c.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::PermittedCallsInHalfOpenState);
        }
        c.wait_interval.validate()?;
        if !matches!(
            c.transition_to_state_after_wait_duration,
            CircuitState::Open | CircuitState::Closed
        ) {
            return Err(ConfigError::TransitionAfterWait(
                c.transition_to_state_after_wait_duration,
            ));
        }

        Ok(c)
    }
}

fn valid_rate(percent: f32) -> bool {
    percent > 0.0 && percent <= 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config.failure_rate_threshold(), 50.0);
        assert_eq!(config.slow_call_rate_threshold(), 100.0);
        assert_eq!(config.slow_call_duration_threshold(), Duration::from_secs(60));
        assert_eq!(config.sliding_window_type(), SlidingWindowType::CountBased);
        assert_eq!(config.sliding_window_size(), 100);
        assert_eq!(config.minimum_number_of_calls(), 100);
        assert_eq!(config.permitted_number_of_calls_in_half_open_state(), 10);
        assert_eq!(config.wait_interval().wait_duration(1), Duration::from_secs(60));
        assert_eq!(config.max_wait_duration_in_half_open_state(), Duration::ZERO);
        assert!(!config.automatic_transition_from_open_to_half_open_enabled());
        assert_eq!(config.initial_state(), CircuitState::Closed);
        assert_eq!(config.transition_to_state_after_wait_duration(), CircuitState::Open);
        assert!(config.writable_stack_trace_enabled());
        assert_eq!(config.window_synchronization(), WindowSynchronization::Synchronized);
    }

    #[test]
    fn test_rate_thresholds_must_be_in_range() {
        for bad in [0.0, -1.0, 100.5, f32::NAN] {
            assert!(matches!(
                Config::builder().failure_rate_threshold(bad).build(),
                Err(ConfigError::FailureRateThreshold(_))
            ));
            assert!(matches!(
                Config::builder().slow_call_rate_threshold(bad).build(),
                Err(ConfigError::SlowCallRateThreshold(_))
            ));
        }
        assert!(Config::builder().failure_rate_threshold(100.0).build().is_ok());
        assert!(Config::builder().failure_rate_threshold(0.1).build().is_ok());
    }

    #[test]
    fn test_window_sizes() {
        assert_eq!(
            Config::builder().sliding_window_size(0).build().unwrap_err(),
            ConfigError::SlidingWindowSize
        );
        assert_eq!(
            Config::builder()
                .sliding_window(SlidingWindowType::CountBased, 10, 0)
                .build()
                .unwrap_err(),
            ConfigError::MinimumNumberOfCalls
        );
        assert_eq!(
            Config::builder()
                .sliding_window(SlidingWindowType::CountBased, 5, 6)
                .build()
                .unwrap_err(),
            ConfigError::MinimumCallsExceedWindow {
                minimum: 6,
                window: 5
            }
        );
        // Seconds and calls are different units.
        assert!(
            Config::builder()
                .sliding_window(SlidingWindowType::TimeBased, 5, 20)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_durations_and_permits() {
        assert_eq!(
            Config::builder()
                .slow_call_duration_threshold(Duration::ZERO)
                .build()
                .unwrap_err(),
            ConfigError::SlowCallDurationThreshold
        );
        assert_eq!(
            Config::builder()
                .permitted_number_of_calls_in_half_open_state(0)
                .build()
                .unwrap_err(),
            ConfigError::PermittedCallsInHalfOpenState
        );
        assert_eq!(
            Config::builder()
                .wait_duration_in_open_state(Duration::ZERO)
                .build()
                .unwrap_err(),
            ConfigError::WaitDurationInOpenState
        );
        assert!(
            Config::builder()
                .wait_duration_in_open_state(Duration::from_millis(1))
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_transition_after_wait_target() {
        assert_eq!(
            Config::builder()
                .transition_to_state_after_wait_duration(CircuitState::HalfOpen)
                .build()
                .unwrap_err(),
            ConfigError::TransitionAfterWait(CircuitState::HalfOpen)
        );
        let config = Config::builder()
            .transition_to_state_after_wait_duration(CircuitState::Closed)
            .build()
            .unwrap();
        assert_eq!(config.transition_to_state_after_wait_duration(), CircuitState::Closed);
    }

    #[test]
    fn test_to_builder_keeps_values() {
        let config = Config::builder()
            .failure_rate_threshold(25.0)
            .sliding_window(SlidingWindowType::TimeBased, 30, 10)
            .window_synchronization(WindowSynchronization::LockFree)
            .build()
            .unwrap();

        let changed = config.to_builder().failure_rate_threshold(75.0).build().unwrap();
        assert_eq!(changed.failure_rate_threshold(), 75.0);
        assert_eq!(changed.sliding_window_type(), SlidingWindowType::TimeBased);
        assert_eq!(changed.sliding_window_size(), 30);
        assert_eq!(changed.minimum_number_of_calls(), 10);
        assert_eq!(changed.window_synchronization(), WindowSynchronization::LockFree);
    }
}
