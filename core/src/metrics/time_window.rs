//! Time-based sliding windows over the N most recent epoch seconds
//!
//! Both variants keep a ring of N per-second buckets plus a running total.
//! A bucket tagged with epoch second `t` counts towards the total while
//! `head - N < t <= head`, where `head` is the newest second written. Moving
//! the head forward subtracts every bucket that falls out of that range, so
//! the total always equals the sum of the live buckets.
//!
//! `snapshot()` never writes: when the clock is ahead of the head it
//! projects the total by leaving out the buckets that have expired since.

use super::{
    BackoffPolicy, Bucket, CasBackoff, Measurement, Outcome, SlidingWindow, SlidingWindowType,
    Snapshot, WindowContents, bucket_in_window, calls_per_second,
};
use crate::clock::Clock;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Initial ring with the head at `now`.
///
/// Unused buckets are tagged `now + i` (ahead of the head, so never live).
/// Seeded buckets that are still inside the window go to the index their
/// second maps to; the returned total and first second cover them.
fn initial_ring(
    size: u32,
    now: u64,
    seed: Option<&WindowContents>,
) -> (Vec<Bucket>, Measurement, Option<u64>) {
    let len = size as usize;
    let mut buckets: Vec<Bucket> = (0..len)
        .map(|i| Bucket {
            epoch_second: now + i as u64,
            measurement: Measurement::default(),
        })
        .collect();
    let mut total = Measurement::default();
    let mut first_second = None;

    match seed {
        Some(WindowContents::Buckets(seeded)) => {
            for bucket in seeded {
                let second = bucket.epoch_second.min(now);
                if bucket.measurement.is_empty() || !bucket_in_window(second, now, size) {
                    continue;
                }
                let index = (len - (now - second) as usize) % len;
                let slot = &mut buckets[index];
                if slot.epoch_second != second {
                    *slot = Bucket {
                        epoch_second: second,
                        measurement: Measurement::default(),
                    };
                }
                slot.measurement = slot.measurement.plus(&bucket.measurement);
                total = total.plus(&bucket.measurement);
                first_second = Some(first_second.map_or(second, |f: u64| f.min(second)));
            }
        }
        Some(WindowContents::Calls(calls)) => {
            let head = &mut buckets[0];
            for call in calls {
                head.measurement = head.measurement.plus(call);
                total = total.plus(call);
            }
            if !total.is_empty() {
                first_second = Some(now);
            }
        }
        None => {}
    }

    (buckets, total, first_second)
}

/// Oldest second the calls-per-second span starts from
fn clamp_first(first: Option<u64>, total: &Measurement, head: u64, size: u32) -> Option<u64> {
    if total.is_empty() {
        return None;
    }
    let window_start = head.saturating_sub(u64::from(size) - 1);
    first.map(|f| f.max(window_start))
}

/// Total as it will look at `now`, without touching the ring
fn project(
    total: Measurement,
    first_second: Option<u64>,
    head_second: u64,
    now: u64,
    size: u32,
    buckets: impl Iterator<Item = Bucket>,
) -> Snapshot {
    let (total, first, head) = if now <= head_second {
        (total, first_second, head_second)
    } else {
        let total = buckets
            .filter(|b| {
                bucket_in_window(b.epoch_second, head_second, size)
                    && !bucket_in_window(b.epoch_second, now, size)
            })
            .fold(total, |acc, b| acc.minus(&b.measurement));
        (total, clamp_first(first_second, &total, now, size), now)
    };

    Snapshot::from_measurement(&total)
        .with_calls_per_second(calls_per_second(&total, first, head, size))
}

/// Live, non-empty buckets at `now`, oldest first
fn live_buckets(
    head_index: usize,
    head_second: u64,
    now: u64,
    size: u32,
    bucket_at: impl Fn(usize) -> Bucket,
) -> Vec<Bucket> {
    let len = size as usize;
    let effective = now.max(head_second);
    (1..=len)
        .map(|offset| bucket_at((head_index + offset) % len))
        .filter(|b| {
            !b.measurement.is_empty()
                && bucket_in_window(b.epoch_second, head_second, size)
                && bucket_in_window(b.epoch_second, effective, size)
        })
        .collect()
}

#[derive(Debug)]
struct TimeRing {
    buckets: Box<[Bucket]>,
    head_index: usize,
    head_second: u64,
    total: Measurement,
    first_second: Option<u64>,
}

impl TimeRing {
    /// Move the head to `second`, zeroing and evicting every skipped bucket
    fn advance_to(&mut self, second: u64, size: u32) {
        if second <= self.head_second {
            return;
        }
        let len = self.buckets.len();
        let steps = (second - self.head_second).min(len as u64);
        for k in 1..=steps {
            let index = (self.head_index + k as usize) % len;
            let bucket = &mut self.buckets[index];
            if bucket_in_window(bucket.epoch_second, self.head_second, size) {
                self.total = self.total.minus(&bucket.measurement);
            }
            *bucket = Bucket {
                epoch_second: second - (steps - k),
                measurement: Measurement::default(),
            };
        }
        self.head_index = (self.head_index + steps as usize) % len;
        self.head_second = second;
        self.first_second = clamp_first(self.first_second, &self.total, second, size);
    }
}

/// Mutex-guarded time-based window
#[derive(Debug)]
pub struct SlidingTimeWindow {
    size: u32,
    clock: Arc<dyn Clock>,
    ring: Mutex<TimeRing>,
}

impl SlidingTimeWindow {
    pub fn new(size: u32, clock: Arc<dyn Clock>) -> Self {
        Self::seeded(size, clock, None)
    }

    /// Window pre-filled with restored contents
    pub fn seeded(size: u32, clock: Arc<dyn Clock>, seed: Option<&WindowContents>) -> Self {
        let size = size.max(1);
        let now = clock.epoch_second();
        let (buckets, total, first_second) = initial_ring(size, now, seed);
        Self {
            size,
            clock,
            ring: Mutex::new(TimeRing {
                buckets: buckets.into_boxed_slice(),
                head_index: 0,
                head_second: now,
                total,
                first_second,
            }),
        }
    }
}

impl SlidingWindow for SlidingTimeWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let measurement = Measurement::of(duration, outcome);
        let now = self.clock.epoch_second();
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);

        ring.advance_to(now, self.size);
        let head = ring.head_index;
        let head_second = ring.head_second;
        let bucket = &mut ring.buckets[head];
        bucket.measurement = bucket.measurement.plus(&measurement);
        ring.total = ring.total.plus(&measurement);
        let first = *ring.first_second.get_or_insert(head_second);

        Snapshot::from_measurement(&ring.total).with_calls_per_second(calls_per_second(
            &ring.total,
            Some(first),
            head_second,
            self.size,
        ))
    }

    fn snapshot(&self) -> Snapshot {
        let now = self.clock.epoch_second();
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        project(
            ring.total,
            ring.first_second,
            ring.head_second,
            now,
            self.size,
            ring.buckets.iter().copied(),
        )
    }

    fn contents(&self) -> WindowContents {
        let now = self.clock.epoch_second();
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        WindowContents::Buckets(live_buckets(
            ring.head_index,
            ring.head_second,
            now,
            self.size,
            |i| ring.buckets[i],
        ))
    }

    fn window_type(&self) -> SlidingWindowType {
        SlidingWindowType::TimeBased
    }

    fn size(&self) -> u32 {
        self.size
    }
}

#[derive(Debug)]
struct BucketSlot {
    version: u64,
    bucket: Bucket,
}

#[derive(Debug)]
struct PendingWrite {
    index: usize,
    slot: Arc<BucketSlot>,
}

#[derive(Debug)]
struct TimeState {
    version: u64,
    head_index: usize,
    head_second: u64,
    total: Measurement,
    first_second: Option<u64>,
    pending: Option<PendingWrite>,
}

/// Lock-free time-based window.
///
/// Same scheme as [`LockFreeFixedSizeWindow`](super::LockFreeFixedSizeWindow):
/// head position, total and the head bucket write of the latest record are
/// one immutable versioned record replaced by CAS, and every reader applies
/// the pending bucket write before using the ring. Skipped buckets are not
/// rewritten; their old tags fall outside the window once the head passes.
#[derive(Debug)]
pub struct LockFreeSlidingTimeWindow {
    size: u32,
    clock: Arc<dyn Clock>,
    slots: Box<[ArcSwap<BucketSlot>]>,
    state: ArcSwap<TimeState>,
    backoff: BackoffPolicy,
}

impl LockFreeSlidingTimeWindow {
    pub fn new(size: u32, clock: Arc<dyn Clock>) -> Self {
        Self::seeded(size, clock, None)
    }

    pub fn seeded(size: u32, clock: Arc<dyn Clock>, seed: Option<&WindowContents>) -> Self {
        let size = size.max(1);
        let now = clock.epoch_second();
        let (buckets, total, first_second) = initial_ring(size, now, seed);
        let slots = buckets
            .into_iter()
            .map(|bucket| ArcSwap::from_pointee(BucketSlot { version: 0, bucket }))
            .collect();

        Self {
            size,
            clock,
            slots,
            state: ArcSwap::from_pointee(TimeState {
                version: 0,
                head_index: 0,
                head_second: now,
                total,
                first_second,
                pending: None,
            }),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn apply_pending(&self, state: &TimeState) {
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

    fn bucket(&self, index: usize) -> Bucket {
        self.slots[index].load().bucket
    }

    /// Next record for writing `measurement` at `now` on top of `current`
    fn next_state(&self, current: &TimeState, now: u64, measurement: &Measurement) -> TimeState {
        let len = self.slots.len();
        let version = current.version + 1;

        let (head_index, head_second, evicted_total, base) = if now <= current.head_second {
            let head = self.bucket(current.head_index);
            let base = if head.epoch_second == current.head_second {
                head.measurement
            } else {
                Measurement::default()
            };
            (current.head_index, current.head_second, current.total, base)
        } else {
            let steps = (now - current.head_second).min(len as u64) as usize;
            let evicted_total = (1..=steps)
                .map(|k| self.bucket((current.head_index + k) % len))
                .filter(|b| bucket_in_window(b.epoch_second, current.head_second, self.size))
                .fold(current.total, |acc, b| acc.minus(&b.measurement));
            (
                (current.head_index + steps) % len,
                now,
                evicted_total,
                Measurement::default(),
            )
        };

        let first_second = clamp_first(current.first_second, &evicted_total, head_second, self.size)
            .or(Some(head_second));

        TimeState {
            version,
            head_index,
            head_second,
            total: evicted_total.plus(measurement),
            first_second,
            pending: Some(PendingWrite {
                index: head_index,
                slot: Arc::new(BucketSlot {
                    version,
                    bucket: Bucket {
                        epoch_second: head_second,
                        measurement: base.plus(measurement),
                    },
                }),
            }),
        }
    }

    /// Run `read` against a ring consistent with one state record
    fn read_consistent<T>(&self, read: impl Fn(&TimeState) -> T) -> T {
        let mut backoff = CasBackoff::new(self.backoff);
        loop {
            let state = self.state.load_full();
            self.apply_pending(&state);
            let value = read(state.as_ref());
            if Arc::ptr_eq(&self.state.load(), &state) {
                return value;
            }
            backoff.snooze();
        }
    }
}

impl SlidingWindow for LockFreeSlidingTimeWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let measurement = Measurement::of(duration, outcome);
        let mut backoff = CasBackoff::new(self.backoff);

        loop {
            let now = self.clock.epoch_second();
            let current = self.state.load_full();
            self.apply_pending(&current);

            let next = Arc::new(self.next_state(&current, now, &measurement));
            let previous = self.state.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                self.apply_pending(&next);
                return Snapshot::from_measurement(&next.total).with_calls_per_second(
                    calls_per_second(&next.total, next.first_second, next.head_second, self.size),
                );
            }
            backoff.snooze();
        }
    }

    fn snapshot(&self) -> Snapshot {
        let now = self.clock.epoch_second();
        let state = self.state.load_full();
        if now <= state.head_second {
            return project(
                state.total,
                state.first_second,
                state.head_second,
                now,
                self.size,
                std::iter::empty(),
            );
        }

        self.read_consistent(|state| {
            project(
                state.total,
                state.first_second,
                state.head_second,
                now,
                self.size,
                (0..self.slots.len()).map(|i| self.bucket(i)),
            )
        })
    }

    fn contents(&self) -> WindowContents {
        let now = self.clock.epoch_second();
        WindowContents::Buckets(self.read_consistent(|state| {
            live_buckets(state.head_index, state.head_second, now, self.size, |i| {
                self.bucket(i)
            })
        }))
    }

    fn window_type(&self) -> SlidingWindowType {
        SlidingWindowType::TimeBased
    }

    fn size(&self) -> u32 {
        self.size
    }
}
