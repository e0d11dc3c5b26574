//! circuit-guard - a lock-free circuit breaker with sliding-window metrics
//!
//! This crate provides a circuit breaker with:
//! - Six states (Closed, Open, HalfOpen, Disabled, ForcedOpen, MetricsOnly)
//!   installed atomically, so concurrent triggers cause one transition
//! - Count-based and time-based sliding windows, each mutex-guarded or lock-free
//! - Failure and slow-call rate thresholds with a minimum number of calls
//! - Fixed, randomized, exponential or custom waits in Open
//! - Serializable snapshots for restoring a breaker elsewhere
//!
//! The breaker never runs the protected call itself: ask for a permission,
//! run the call, then report its outcome.
//!
//! # Example
//!
//! ```rust
//! use circuit_guard::CircuitBreaker;
//! use std::time::{Duration, Instant};
//!
//! let circuit = CircuitBreaker::builder("my_service")
//!     .failure_rate_threshold(50.0)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//!
//! if circuit.try_acquire_permission() {
//!     let start = Instant::now();
//!     let result: Result<&str, String> = Ok("success");
//!     match result {
//!         Ok(_) => circuit.on_success(start.elapsed()),
//!         Err(err) => circuit.on_error(start.elapsed(), &err),
//!     }
//! }
//!
//! // Check circuit state
//! if circuit.is_open() {
//!     println!("Circuit is open, skipping call");
//! }
//! ```

pub mod breaker_metrics;
pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
pub mod interval;
pub mod metrics;
pub mod scheduler;
pub mod snapshot;
pub mod state;

pub use breaker_metrics::CircuitMetrics;
pub use builder::CircuitBuilder;
pub use callbacks::{CircuitEvent, EventKind, EventPublisher};
pub use circuit::CircuitBreaker;
pub use classifier::{
    AcceptAllResults, ErrorPredicate, FailureClassifier, FailureContext, MatchAllErrors,
    MatchNoErrors, ResultClassifier, ResultContext, ResultPredicate,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder};
pub use errors::{CallNotPermitted, CircuitError, ConfigError};
pub use interval::WaitInterval;
pub use metrics::{
    BackoffPolicy, Bucket, CasBackoff, FixedSizeWindow, LockFreeFixedSizeWindow,
    LockFreeSlidingTimeWindow, Measurement, Outcome, SlidingTimeWindow, SlidingWindow,
    SlidingWindowType, Snapshot, WindowContents, WindowSpec, WindowSynchronization,
};
pub use scheduler::{ManualScheduler, Scheduler, Task, TimerScheduler};
pub use snapshot::{CircuitBreakerSnapshot, MetricsSnapshot};
pub use state::CircuitState;
