//! Breaker events and their subscribers
//!
//! Every permission decision, recorded outcome and transition produces a
//! [`CircuitEvent`]. Subscribers are plain closures; a panicking subscriber
//! is logged and skipped so it never disturbs the caller or other subscribers.

use crate::state::CircuitState;
use arc_swap::ArcSwap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

/// What happened
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Success {
        elapsed: Duration,
    },
    Error {
        elapsed: Duration,
        cause: String,
    },
    /// An error matched the ignore classifier and was not recorded
    IgnoredError {
        elapsed: Duration,
        cause: String,
    },
    CallNotPermitted,
    StateTransition {
        from: CircuitState,
        to: CircuitState,
    },
    Reset,
    FailureRateExceeded {
        rate: f32,
    },
    SlowCallRateExceeded {
        rate: f32,
    },
}

impl EventKind {
    /// Published even while the breaker is Disabled or ForcedOpen
    pub fn force_publish(&self) -> bool {
        matches!(self, EventKind::StateTransition { .. } | EventKind::Reset)
    }
}

/// An event emitted by a named breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitEvent {
    pub circuit_name: String,
    /// Breaker clock time at which the event was created
    pub created_at: Duration,
    pub kind: EventKind,
}

type Subscriber = Arc<dyn Fn(&CircuitEvent) + Send + Sync>;

/// Fan-out of breaker events to registered subscribers
///
/// Registration is copy-on-write, so publishing never takes a lock.
///
/// # Example
///
/// ```rust
/// use circuit_guard::CircuitBreaker;
///
/// let circuit = CircuitBreaker::builder("inventory").build().unwrap();
/// circuit
///     .event_publisher()
///     .on_open(|name| eprintln!("circuit {name} opened"))
///     .on_call_not_permitted(|name| eprintln!("circuit {name} rejected a call"));
/// ```
#[derive(Default)]
pub struct EventPublisher {
    subscribers: ArcSwap<Vec<Subscriber>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every published event
    pub fn on_event<F>(&self, f: F) -> &Self
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(f);
        self.subscribers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&subscriber));
            next
        });
        self
    }

    /// Receive `(from, to)` for every state transition
    pub fn on_state_transition<F>(&self, f: F) -> &Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EventKind::StateTransition { from, to } = event.kind {
                f(from, to);
            }
        })
    }

    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EventKind::Success { elapsed } = event.kind {
                f(elapsed);
            }
        })
    }

    /// Receive recorded errors with their rendered cause
    pub fn on_error<F>(&self, f: F) -> &Self
    where
        F: Fn(Duration, &str) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EventKind::Error { elapsed, cause } = &event.kind {
                f(*elapsed, cause);
            }
        })
    }

    pub fn on_ignored_error<F>(&self, f: F) -> &Self
    where
        F: Fn(Duration, &str) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let EventKind::IgnoredError { elapsed, cause } = &event.kind {
                f(*elapsed, cause);
            }
        })
    }

    pub fn on_call_not_permitted<F>(&self, f: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if event.kind == EventKind::CallNotPermitted {
                f(&event.circuit_name);
            }
        })
    }

    pub fn on_reset<F>(&self, f: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if event.kind == EventKind::Reset {
                f(&event.circuit_name);
            }
        })
    }

    /// Called with the circuit name whenever the breaker enters Open
    pub fn on_open<F>(&self, f: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_entering(CircuitState::Open, f)
    }

    /// Called with the circuit name whenever the breaker enters Closed
    pub fn on_close<F>(&self, f: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_entering(CircuitState::Closed, f)
    }

    /// Called with the circuit name whenever the breaker enters HalfOpen
    pub fn on_half_open<F>(&self, f: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_entering(CircuitState::HalfOpen, f)
    }

    fn on_entering<F>(&self, target: CircuitState, f: F) -> &Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if matches!(event.kind, EventKind::StateTransition { to, .. } if to == target) {
                f(&event.circuit_name);
            }
        })
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.load().is_empty()
    }

    pub(crate) fn publish(&self, event: &CircuitEvent) {
        let subscribers = self.subscribers.load();
        for subscriber in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                tracing::warn!(
                    circuit = %event.circuit_name,
                    event = ?event.kind,
                    "event subscriber panicked"
                );
            }
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscribers", &self.subscribers.load().len())
            .finish()
    }
}
