//! Count-based sliding windows over the N most recent calls

use super::{
    BackoffPolicy, CasBackoff, Measurement, Outcome, SlidingWindow, SlidingWindowType, Snapshot,
    WindowContents,
};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct Ring {
    slots: Box<[Measurement]>,
    head: usize,
    total: Measurement,
}

/// Mutex-guarded ring of N single-call measurements plus a running total
#[derive(Debug)]
pub struct FixedSizeWindow {
    size: u32,
    ring: Mutex<Ring>,
}

impl FixedSizeWindow {
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            ring: Mutex::new(Ring {
                slots: vec![Measurement::default(); size as usize].into_boxed_slice(),
                head: 0,
                total: Measurement::default(),
            }),
        }
    }
}

impl SlidingWindow for FixedSizeWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let measurement = Measurement::of(duration, outcome);
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);

        let head = ring.head;
        let evicted = ring.slots[head];
        ring.total = ring.total.minus(&evicted).plus(&measurement);
        ring.slots[head] = measurement;
        ring.head = (head + 1) % ring.slots.len();

        Snapshot::from_measurement(&ring.total)
    }

    fn snapshot(&self) -> Snapshot {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        Snapshot::from_measurement(&ring.total)
    }

    fn contents(&self) -> WindowContents {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let len = ring.slots.len();
        WindowContents::Calls(
            (0..len)
                .map(|i| ring.slots[(ring.head + i) % len])
                .filter(|m| !m.is_empty())
                .collect(),
        )
    }

    fn window_type(&self) -> SlidingWindowType {
        SlidingWindowType::CountBased
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// A ring slot tagged with the version of the record that wrote it
#[derive(Debug)]
struct Slot {
    version: u64,
    measurement: Measurement,
}

/// Slot write published by a successful CAS but possibly not yet applied
#[derive(Debug)]
struct PendingWrite {
    index: usize,
    slot: Arc<Slot>,
}

/// Immutable versioned aggregate swapped as a whole on every record
#[derive(Debug)]
struct RingState {
    version: u64,
    head: usize,
    total: Measurement,
    pending: Option<PendingWrite>,
}

/// Lock-free count-based window.
///
/// The running total, head index and the slot write of the latest record
/// live in one immutable [`RingState`] that writers replace with a CAS. Any
/// thread that reads a state applies its pending slot write before building
/// the next one, so by the time a state is superseded its write is in the
/// ring. Slot writes carry the record version and never overwrite a newer
/// slot, so a stalled helper cannot roll a slot back.
#[derive(Debug)]
pub struct LockFreeFixedSizeWindow {
    size: u32,
    slots: Box<[ArcSwap<Slot>]>,
    state: ArcSwap<RingState>,
    backoff: BackoffPolicy,
}

impl LockFreeFixedSizeWindow {
    pub fn new(size: u32) -> Self {
        Self::with_backoff(size, BackoffPolicy::default())
    }

    pub fn with_backoff(size: u32, backoff: BackoffPolicy) -> Self {
        let size = size.max(1);
        let slots = (0..size)
            .map(|_| {
                ArcSwap::from_pointee(Slot {
                    version: 0,
                    measurement: Measurement::default(),
                })
            })
            .collect();

        Self {
            size,
            slots,
            state: ArcSwap::from_pointee(RingState {
                version: 0,
                head: 0,
                total: Measurement::default(),
                pending: None,
            }),
            backoff,
        }
    }

    fn apply_pending(&self, state: &RingState) {
        let Some(pending) = &state.pending else {
            return;
        };
        let slot = &self.slots[pending.index];
        loop {
            let current = slot.load_full();
            if current.version >= pending.slot.version {
                return;
            }
            let previous = slot.compare_and_swap(&current, Arc::clone(&pending.slot));
            if Arc::ptr_eq(&previous, &current) {
                return;
            }
        }
    }
}

impl SlidingWindow for LockFreeFixedSizeWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let measurement = Measurement::of(duration, outcome);
        let mut backoff = CasBackoff::new(self.backoff);

        loop {
            let current = self.state.load_full();
            self.apply_pending(&current);

            let evicted = self.slots[current.head].load().measurement;
            let version = current.version + 1;
            let next = Arc::new(RingState {
                version,
                head: (current.head + 1) % self.slots.len(),
                total: current.total.minus(&evicted).plus(&measurement),
                pending: Some(PendingWrite {
                    index: current.head,
                    slot: Arc::new(Slot {
                        version,
                        measurement,
                    }),
                }),
            });

            let previous = self.state.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                self.apply_pending(&next);
                return Snapshot::from_measurement(&next.total);
            }
            backoff.snooze();
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::from_measurement(&self.state.load().total)
    }

    fn contents(&self) -> WindowContents {
        let mut backoff = CasBackoff::new(self.backoff);
        loop {
            let state = self.state.load_full();
            self.apply_pending(&state);

            let len = self.slots.len();
            let calls: Vec<Measurement> = (0..len)
                .map(|i| self.slots[(state.head + i) % len].load().measurement)
                .filter(|m| !m.is_empty())
                .collect();

            // Only a read that saw no concurrent record is consistent.
            if Arc::ptr_eq(&self.state.load(), &state) {
                return WindowContents::Calls(calls);
            }
            backoff.snooze();
        }
    }

    fn window_type(&self) -> SlidingWindowType {
        SlidingWindowType::CountBased
    }

    fn size(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windows(size: u32) -> Vec<Box<dyn SlidingWindow>> {
        vec![
            Box::new(FixedSizeWindow::new(size)),
            Box::new(LockFreeFixedSizeWindow::new(size)),
        ]
    }

    #[test]
    fn test_record_success_and_error() {
        for window in windows(5) {
            let snapshot = window.record(Duration::from_millis(100), Outcome::Success);
            assert_eq!(snapshot.total_number_of_calls, 1);
            assert_eq!(snapshot.number_of_successful_calls, 1);
            assert_eq!(snapshot.failure_rate, 0.0);

            let snapshot = window.record(Duration::from_millis(300), Outcome::Error);
            assert_eq!(snapshot.total_number_of_calls, 2);
            assert_eq!(snapshot.number_of_failed_calls, 1);
            assert_eq!(snapshot.total_duration, Duration::from_millis(400));
            assert_eq!(snapshot.average_duration, Duration::from_millis(200));
            assert_eq!(snapshot.failure_rate, 50.0);
        }
    }

    #[test]
    fn test_ring_eviction_drops_oldest_call() {
        for window in windows(4) {
            window.record(Duration::ZERO, Outcome::Error);
            window.record(Duration::ZERO, Outcome::Success);
            window.record(Duration::ZERO, Outcome::Success);
            let snapshot = window.record(Duration::ZERO, Outcome::Success);
            assert_eq!(snapshot.total_number_of_calls, 4);
            assert_eq!(snapshot.failure_rate, 25.0);

            let snapshot = window.record(Duration::ZERO, Outcome::Success);
            assert_eq!(snapshot.total_number_of_calls, 4);
            assert_eq!(snapshot.number_of_failed_calls, 0);
            assert_eq!(snapshot.failure_rate, 0.0);
        }
    }

    #[test]
    fn test_window_of_one_keeps_last_call() {
        for window in windows(1) {
            window.record(Duration::from_millis(5), Outcome::SlowError);
            let snapshot = window.record(Duration::from_millis(1), Outcome::Success);
            assert_eq!(snapshot.total_number_of_calls, 1);
            assert_eq!(snapshot.number_of_slow_calls, 0);
            assert_eq!(snapshot.total_duration, Duration::from_millis(1));
        }
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        for window in windows(3) {
            window.record(Duration::ZERO, Outcome::Error);
            let first = window.snapshot();
            let second = window.snapshot();
            assert_eq!(first, second);
            assert_eq!(first.total_number_of_calls, 1);
        }
    }

    #[test]
    fn test_contents_are_ordered_oldest_first() {
        for window in windows(3) {
            for outcome in [
                Outcome::Error,
                Outcome::Success,
                Outcome::SlowSuccess,
                Outcome::SlowError,
            ] {
                window.record(Duration::from_millis(1), outcome);
            }

            let WindowContents::Calls(calls) = window.contents() else {
                panic!("count window must export calls");
            };
            let outcomes: Vec<_> = calls.iter().filter_map(|m| m.single_outcome()).collect();
            assert_eq!(
                outcomes,
                vec![Outcome::Success, Outcome::SlowSuccess, Outcome::SlowError]
            );
        }
    }

    #[test]
    fn test_partial_window_contents_skip_empty_slots() {
        for window in windows(10) {
            window.record(Duration::ZERO, Outcome::Error);
            window.record(Duration::ZERO, Outcome::Success);
            assert_eq!(window.contents().calls().len(), 2);
        }
    }

    #[test]
    fn test_lock_free_concurrent_writers_lose_nothing() {
        let window = Arc::new(LockFreeFixedSizeWindow::new(1_000));
        let threads = 16;
        let per_thread = 50;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        let outcome = if (t + i) % 4 == 0 {
                            Outcome::Error
                        } else {
                            Outcome::Success
                        };
                        window.record(Duration::from_nanos(10), outcome);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_number_of_calls, 800);
        assert_eq!(snapshot.number_of_failed_calls, 200);
        assert_eq!(snapshot.total_duration, Duration::from_nanos(8_000));
        assert_eq!(
            window.contents().total(),
            Measurement {
                successful: 600,
                failed: 200,
                total_duration_nanos: 8_000,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_lock_free_concurrent_writers_with_wraparound() {
        let window = Arc::new(LockFreeFixedSizeWindow::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        window.record(Duration::from_nanos(1), Outcome::Error);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // The total must match exactly what the ring holds.
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_number_of_calls, 8);
        assert_eq!(snapshot.number_of_failed_calls, 8);
        assert_eq!(window.contents().total().calls(), 8);
    }
}
