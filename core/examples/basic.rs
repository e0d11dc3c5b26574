//! Basic circuit breaker usage example
//!
//! Run with `RUST_LOG=circuit_guard=debug` to see state transitions logged.

use circuit_guard::{CircuitBreaker, ManualClock, SlidingWindowType};
use std::sync::Arc;
use std::time::Duration;

fn charge(circuit: &CircuitBreaker, payment: u32, outcome: Result<&str, &str>) {
    if let Err(err) = circuit.acquire_permission() {
        println!("✗ payment {}: {}", payment, err);
        return;
    }
    let elapsed = Duration::from_millis(20);
    match outcome {
        Ok(receipt) => {
            circuit.on_success(elapsed);
            println!("✓ payment {}: {}", payment, receipt);
        }
        Err(err) => {
            circuit.on_error(elapsed, &err.to_string());
            println!("✗ payment {}: {}", payment, err);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    // A manual clock lets the example skip the Open wait without sleeping
    let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));

    let circuit = CircuitBreaker::builder("payment_api")
        .sliding_window(SlidingWindowType::CountBased, 4, 4)
        .failure_rate_threshold(50.0)
        .wait_duration_in_open_state(Duration::from_secs(5))
        .permitted_number_of_calls_in_half_open_state(2)
        .clock(clock.clone())
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()
        .expect("valid configuration");

    println!("Initial state: {}\n", circuit.state_name());

    println!("--- Successful calls ---");
    for i in 1..=2 {
        charge(&circuit, i, Ok("charged"));
    }
    println!("State: {}\n", circuit.state_name());

    println!("--- Triggering failures ---");
    for i in 3..=4 {
        charge(&circuit, i, Err("gateway timeout"));
    }
    let metrics = circuit.metrics();
    println!(
        "State: {} (failure rate was 50%, not permitted so far: {})\n",
        circuit.state_name(),
        metrics.number_of_not_permitted_calls()
    );

    println!("--- Attempting call while open ---");
    charge(&circuit, 5, Ok("should be rejected"));
    println!();

    println!("--- Waiting out the open state ---");
    clock.advance(Duration::from_secs(6));
    charge(&circuit, 6, Ok("charged"));
    charge(&circuit, 7, Ok("charged"));
    println!("State: {}\n", circuit.state_name());

    println!("--- Snapshot ---");
    let snapshot = circuit.create_snapshot();
    println!(
        "{:?} with {} buffered calls",
        snapshot.state,
        snapshot.metrics.number_of_buffered_calls()
    );

    println!("\n--- Resetting circuit ---");
    circuit.reset();
    println!("State after reset: {}", circuit.state_name());
}
