//! Delayed tasks for automatic state transitions
//!
//! A breaker only needs "run this once after a delay". Without a scheduler
//! the breaker still leaves Open lazily on the next permission request.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A unit of deferred work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks once after a delay
pub trait Scheduler: Send + Sync + fmt::Debug {
    fn schedule_once(&self, delay: Duration, task: Task);
}

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest task first
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    tasks: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single background thread running tasks in due order
///
/// Dropping the scheduler stops the thread; tasks not yet due are discarded.
pub struct TimerScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TimerScheduler {
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("circuit-guard-timer".to_string())
            .spawn(move || run(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Tasks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) {
        let mut queue = self.shared.lock();
        if queue.shutdown {
            return;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.tasks.push(Entry {
            due: Instant::now() + delay,
            seq,
            task,
        });
        drop(queue);
        self.shared.wakeup.notify_one();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let now = Instant::now();
        let next_due = queue.tasks.peek().map(|entry| entry.due);
        match next_due {
            None => {
                queue = shared
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(due) if due <= now => {
                let Some(entry) = queue.tasks.pop() else {
                    continue;
                };
                drop(queue);
                if catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
                    tracing::warn!("scheduled task panicked");
                }
                queue = shared.lock();
            }
            Some(due) => {
                queue = shared
                    .wakeup
                    .wait_timeout(queue, due - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Scheduler that only runs tasks when told to, for deterministic tests
///
/// # Example
///
/// ```rust
/// use circuit_guard::{ManualScheduler, Scheduler};
/// use std::time::Duration;
///
/// let scheduler = ManualScheduler::new();
/// scheduler.schedule_once(Duration::from_secs(5), Box::new(|| println!("due")));
/// assert_eq!(scheduler.pending_delays(), vec![Duration::from_secs(5)]);
/// assert_eq!(scheduler.run_all(), 1);
/// ```
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<(Duration, Task)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested delays of the queued tasks, in submission order
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.lock().iter().map(|(delay, _)| *delay).collect()
    }

    /// Run every queued task, including tasks queued while running; returns how many ran
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                return ran;
            }
            for (_, task) in batch {
                task();
                ran += 1;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(Duration, Task)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) {
        self.lock().push((delay, task));
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.lock().len())
            .finish()
    }
}
