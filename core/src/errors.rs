//! Error types for circuit breaker operations

use crate::state::CircuitState;
use std::backtrace::Backtrace;
use std::fmt;
use thiserror::Error;

/// Errors surfaced by circuit breaker operations
#[derive(Debug, Error)]
pub enum CircuitError {
    /// The current state rejected the call
    #[error(transparent)]
    CallNotPermitted(#[from] CallNotPermitted),

    /// A transition the state machine cannot perform (e.g. a malformed snapshot)
    #[error("circuit '{name}' cannot transition from {from} to {to}")]
    IllegalStateTransition {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Rejection signaled by `acquire_permission`.
///
/// The backtrace is only captured when the breaker's config enables
/// writable stack traces, keeping the rejection path allocation-light.
#[derive(Error)]
#[error("circuit '{name}' is {state} and does not permit further calls")]
pub struct CallNotPermitted {
    name: String,
    state: CircuitState,
    backtrace: Option<Backtrace>,
}

impl CallNotPermitted {
    pub(crate) fn new(name: &str, state: CircuitState, capture_backtrace: bool) -> Self {
        Self {
            name: name.to_string(),
            state,
            backtrace: capture_backtrace.then(Backtrace::capture),
        }
    }

    /// Name of the rejecting circuit
    pub fn circuit_name(&self) -> &str {
        &self.name
    }

    /// State that rejected the call
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Where the rejection was raised, when stack traces are enabled
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }
}

impl fmt::Debug for CallNotPermitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallNotPermitted")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("backtrace", &self.backtrace.is_some())
            .finish()
    }
}

/// Rejected configuration values; raised by `ConfigBuilder::build`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failure rate threshold must be in (0, 100], got {0}")]
    FailureRateThreshold(f32),

    #[error("slow call rate threshold must be in (0, 100], got {0}")]
    SlowCallRateThreshold(f32),

    #[error("slow call duration threshold must be at least 1ns")]
    SlowCallDurationThreshold,

    #[error("sliding window size must be at least 1")]
    SlidingWindowSize,

    #[error("minimum number of calls must be at least 1")]
    MinimumNumberOfCalls,

    #[error(
        "minimum number of calls ({minimum}) exceeds the count-based window size ({window})"
    )]
    MinimumCallsExceedWindow { minimum: u32, window: u32 },

    #[error("permitted number of calls in half-open state must be at least 1")]
    PermittedCallsInHalfOpenState,

    #[error("wait duration in open state must be at least 1ms")]
    WaitDurationInOpenState,

    #[error("wait interval multiplier must be at least 1.0, got {0}")]
    WaitIntervalMultiplier(f64),

    #[error("randomization factor must be in [0, 1), got {0}")]
    RandomizationFactor(f64),

    #[error("state after half-open wait must be Open or Closed, got {0}")]
    TransitionAfterWait(CircuitState),
}
