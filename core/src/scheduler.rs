//! Fixed-rate task scheduling over dedicated OS threads
//!
//! The manager runs two of these: a single-worker instance for the discovery
//! job and a small pool for per-governor refreshes. Tasks are plain closures
//! on a time-ordered heap; cancelling a task only flips a flag, so a run
//! already in flight finishes normally.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

type Task = Arc<dyn Fn() + Send + Sync>;

/// Cancellation handle for a scheduled task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    period: Option<Duration>,
    cancelled: Arc<AtomicBool>,
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

impl Ord for Entry {
    // BinaryHeap is a max-heap: invert so the earliest due time pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerShared {
    queue: Mutex<BinaryHeap<Entry>>,
    available: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
}

/// A bounded pool of worker threads executing scheduled closures
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Spawn `workers` named worker threads
    pub fn new(name: &str, workers: usize) -> io::Result<Self> {
        let shared = Arc::new(SchedulerShared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        });
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // wind down any workers that did start before bailing
                    shared.shutdown.store(true, AtomicOrdering::SeqCst);
                    shared.available.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Run a closure once, as soon as a worker is free
    pub fn execute(&self, task: impl Fn() + Send + Sync + 'static) -> TaskHandle {
        self.submit(Duration::ZERO, None, Arc::new(task))
    }

    /// Run a closure at a fixed rate. The first run happens after
    /// `initial_delay`; subsequent runs are spaced by `period` from the
    /// scheduled (not actual) start times.
    pub fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: impl Fn() + Send + Sync + 'static,
    ) -> TaskHandle {
        self.submit(initial_delay, Some(period.max(Duration::from_millis(1))), Arc::new(task))
    }

    fn submit(&self, delay: Duration, period: Option<Duration>, task: Task) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.shared.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            period,
            cancelled: Arc::clone(&cancelled),
            task,
        };
        self.shared.queue.lock().push(entry);
        self.shared.available.notify_one();
        TaskHandle { cancelled }
    }

    /// Stop accepting work and join the workers. Tasks already running
    /// complete; everything still queued is dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        self.shared.available.notify_all();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                error!("Scheduler worker terminated abnormally");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<SchedulerShared>) {
    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(AtomicOrdering::SeqCst) {
                    return;
                }
                match queue.peek() {
                    None => {
                        shared.available.wait(&mut queue);
                    }
                    Some(next) => {
                        let due = next.due;
                        let now = Instant::now();
                        if due <= now {
                            match queue.pop() {
                                Some(entry) => break entry,
                                None => continue,
                            }
                        }
                        shared.available.wait_for(&mut queue, due - now);
                    }
                }
            }
        };

        if entry.cancelled.load(AtomicOrdering::SeqCst) {
            continue;
        }

        let run = catch_unwind(AssertUnwindSafe(|| (entry.task)()));
        if run.is_err() {
            error!("Scheduled task panicked");
        }

        // fixed rate: keep the original cadence even when a run overruns
        if let Some(period) = entry.period {
            if !entry.cancelled.load(AtomicOrdering::SeqCst)
                && !shared.shutdown.load(AtomicOrdering::SeqCst)
            {
                let next = Entry {
                    due: entry.due + period,
                    seq: shared.sequence.fetch_add(1, AtomicOrdering::Relaxed),
                    period: entry.period,
                    cancelled: entry.cancelled,
                    task: entry.task,
                };
                shared.queue.lock().push(next);
                shared.available.notify_one();
            }
        } else {
            debug!("One-shot task completed");
        }
    }
}
