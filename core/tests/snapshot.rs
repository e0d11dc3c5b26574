use circuit_guard::{
    CircuitBreaker, CircuitBreakerSnapshot, CircuitError, CircuitState, Config, ManualClock,
    SlidingWindowType,
};
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    Config::builder()
        .sliding_window(SlidingWindowType::CountBased, 10, 4)
        .failure_rate_threshold(50.0)
        .slow_call_duration_threshold(Duration::from_millis(500))
        .wait_duration_in_open_state(Duration::from_secs(5))
        .permitted_number_of_calls_in_half_open_state(3)
        .build()
        .unwrap()
}

fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
    CircuitBreaker::builder("snapshot")
        .config(config())
        .clock(clock.clone())
        .build()
        .unwrap()
}

fn restore(clock: &Arc<ManualClock>, snapshot: &CircuitBreakerSnapshot) -> CircuitBreaker {
    CircuitBreaker::builder("snapshot")
        .config(config())
        .clock(clock.clone())
        .restore(snapshot)
        .unwrap()
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Duration::from_secs(10_000)))
}

fn open(circuit: &CircuitBreaker) {
    for _ in 0..4 {
        circuit.on_error(Duration::from_millis(10), &"unavailable");
    }
    assert_eq!(circuit.state(), CircuitState::Open);
}

#[test]
fn test_metrics_survive_restore() {
    let clock = clock();
    let original = breaker(&clock);
    original.on_success(Duration::from_millis(10));
    original.on_error(Duration::from_millis(10), &"refused");
    original.on_success(Duration::from_millis(10));

    let snapshot = original.create_snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.metrics.number_of_successful_calls, 2);
    assert_eq!(snapshot.metrics.number_of_failed_calls, 1);

    let restored = restore(&clock, &snapshot);
    let metrics = restored.metrics();
    assert_eq!(restored.state(), CircuitState::Closed);
    assert_eq!(metrics.number_of_successful_calls(), 2);
    assert_eq!(metrics.number_of_failed_calls(), 1);

    // One more failure reaches the minimum with a 50% failure rate
    restored.on_error(Duration::from_millis(10), &"refused");
    assert_eq!(restored.state(), CircuitState::Open);
}

#[test]
fn test_open_state_keeps_retry_deadline() {
    let clock = clock();
    let original = breaker(&clock);
    open(&original);

    let snapshot = original.create_snapshot();
    assert_eq!(snapshot.attempts, 1);
    assert_eq!(
        snapshot.retry_after_wait_until,
        Some(Duration::from_secs(10_005))
    );

    let restored = restore(&clock, &snapshot);
    assert_eq!(restored.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(3));
    assert!(!restored.try_acquire_permission());
    assert_eq!(restored.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(3));
    assert!(restored.try_acquire_permission());
    assert_eq!(restored.state(), CircuitState::HalfOpen);
    assert_eq!(restored.create_snapshot().attempts, 1);
}

#[test]
fn test_open_without_deadline_is_rejected() {
    let clock = clock();
    let original = breaker(&clock);
    open(&original);

    let mut snapshot = original.create_snapshot();
    snapshot.retry_after_wait_until = None;
    let err = CircuitBreaker::builder("snapshot")
        .config(config())
        .clock(clock.clone())
        .restore(&snapshot)
        .unwrap_err();
    assert!(matches!(
        err,
        CircuitError::IllegalStateTransition {
            to: CircuitState::Open,
            ..
        }
    ));
}

#[test]
fn test_every_state_is_preserved() {
    let clock = clock();
    let transitions: [(CircuitState, fn(&CircuitBreaker)); 5] = [
        (CircuitState::Closed, |_| {}),
        (CircuitState::HalfOpen, CircuitBreaker::transition_to_half_open_state),
        (CircuitState::Disabled, CircuitBreaker::transition_to_disabled_state),
        (CircuitState::ForcedOpen, CircuitBreaker::transition_to_forced_open_state),
        (CircuitState::MetricsOnly, CircuitBreaker::transition_to_metrics_only_state),
    ];

    for (expected, transition) in transitions {
        let original = breaker(&clock);
        transition(&original);
        assert_eq!(original.state(), expected);

        let snapshot = original.create_snapshot();
        assert_eq!(snapshot.state, expected);
        assert_eq!(restore(&clock, &snapshot).state(), expected);
    }
}

#[test]
fn test_forced_open_counts_an_attempt() {
    let clock = clock();
    let original = breaker(&clock);
    original.transition_to_forced_open_state();
    let snapshot = original.create_snapshot();
    assert!(snapshot.attempts > 0);

    let restored = restore(&clock, &snapshot);
    assert!(!restored.try_acquire_permission());
    assert_eq!(restored.create_snapshot().attempts, snapshot.attempts);
}

#[test]
fn test_half_open_restore_keeps_used_permits() {
    let clock = clock();
    let original = breaker(&clock);
    original.transition_to_half_open_state();
    assert!(original.try_acquire_permission());
    original.on_success(Duration::from_millis(10));

    let restored = restore(&clock, &original.create_snapshot());
    assert_eq!(restored.state(), CircuitState::HalfOpen);
    assert_eq!(restored.metrics().number_of_buffered_calls(), 1);
    assert!(restored.try_acquire_permission());
    assert!(restored.try_acquire_permission());
    assert!(!restored.try_acquire_permission());

    restored.on_success(Duration::from_millis(10));
    restored.on_success(Duration::from_millis(10));
    assert_eq!(restored.state(), CircuitState::Closed);
}

#[test]
fn test_snapshot_captures_slow_calls() {
    let clock = clock();
    let original = breaker(&clock);
    original.on_success(Duration::from_millis(10));
    original.on_success(Duration::from_secs(1));
    original.on_error(Duration::from_millis(10), &"bad gateway");

    let snapshot = original.create_snapshot();
    let metrics = &snapshot.metrics;
    assert_eq!(metrics.number_of_successful_calls, 2);
    assert_eq!(metrics.number_of_failed_calls, 1);
    assert_eq!(metrics.number_of_slow_calls(), 1);
    assert_eq!(metrics.number_of_slow_successful_calls, 1);
    assert_eq!(metrics.number_of_slow_failed_calls, 0);
}

#[test]
fn test_not_permitted_calls_are_kept() {
    let clock = clock();
    let original = breaker(&clock);
    open(&original);
    assert!(!original.try_acquire_permission());
    assert!(!original.try_acquire_permission());

    let snapshot = original.create_snapshot();
    assert_eq!(snapshot.metrics.number_of_not_permitted_calls, 2);
    assert_eq!(
        restore(&clock, &snapshot)
            .metrics()
            .number_of_not_permitted_calls(),
        2
    );
}

#[test]
fn test_json_round_trip_restores_same_decisions() {
    let clock = clock();
    let original = breaker(&clock);
    open(&original);

    let json = serde_json::to_string(&original.create_snapshot()).unwrap();
    let snapshot: CircuitBreakerSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(snapshot, original.create_snapshot());

    let restored = restore(&clock, &snapshot);
    assert_eq!(restored.try_acquire_permission(), original.try_acquire_permission());
    clock.advance(Duration::from_secs(6));
    assert_eq!(restored.try_acquire_permission(), original.try_acquire_permission());
    assert_eq!(restored.state(), original.state());
}

#[test]
fn test_time_based_snapshot_keeps_buckets() {
    let clock = clock();
    let config = Config::builder()
        .sliding_window(SlidingWindowType::TimeBased, 10, 2)
        .build()
        .unwrap();
    let original = CircuitBreaker::builder("timed")
        .config(config.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    original.on_success(Duration::from_millis(10));
    clock.advance(Duration::from_secs(4));
    original.on_success(Duration::from_millis(10));

    let restored = CircuitBreaker::builder("timed")
        .config(config)
        .clock(clock.clone())
        .restore(&original.create_snapshot())
        .unwrap();
    assert_eq!(restored.metrics().number_of_successful_calls(), 2);

    // The older bucket leaves the window on schedule
    clock.advance(Duration::from_secs(6));
    assert_eq!(restored.metrics().number_of_successful_calls(), 1);
}

#[test]
fn test_half_open_restore_keeps_permits_in_flight() {
    let clock = clock();
    let original = breaker(&clock);
    original.transition_to_half_open_state();
    assert!(original.try_acquire_permission());
    assert!(original.try_acquire_permission());
    original.on_success(Duration::from_millis(10));

    // One call reported, one still running
    let snapshot = original.create_snapshot();
    assert_eq!(snapshot.half_open_permits_in_use, Some(2));

    let restored = restore(&clock, &snapshot);
    for circuit in [&original, &restored] {
        assert!(circuit.try_acquire_permission());
        assert!(!circuit.try_acquire_permission());
    }
}

#[test]
fn test_snapshot_without_permit_count_falls_back_to_recorded_calls() {
    let clock = clock();
    let original = breaker(&clock);
    original.transition_to_half_open_state();
    assert!(original.try_acquire_permission());
    original.on_success(Duration::from_millis(10));

    let mut snapshot = original.create_snapshot();
    snapshot.half_open_permits_in_use = None;
    let restored = restore(&clock, &snapshot);
    assert!(restored.try_acquire_permission());
    assert!(restored.try_acquire_permission());
    assert!(!restored.try_acquire_permission());
}

