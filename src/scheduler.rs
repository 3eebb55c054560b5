//! Single-shot delayed tasks with cancellation (C4, spec §4.2).
//!
//! The original design cancels a scheduled callback through a token held
//! by the asio service. We replace that with a generation counter per task
//! id: `cancel` bumps the generation, so a timer that already fired its
//! wakeup but hasn't run yet simply finds its generation stale and becomes
//! a no-op, with no need to walk or remove from the queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct Entry {
    fire_at: Instant,
    id: u64,
    generation: u64,
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for Entry {}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so BinaryHeap (a max-heap) pops the earliest deadline first.
        other.fire_at.cmp(&self.fire_at)
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Shared {
    heap: BinaryHeap<Entry>,
    generations: HashMap<u64, u64>,
    shutdown: bool,
}

/// A single background thread driving one-shot timers: election timeouts,
/// per-peer heartbeat timeouts, leader-lease timers, snapshot retry
/// backoff.
pub struct Scheduler {
    shared: Arc<Mutex<Shared>>,
    cv: Arc<Condvar>,
    next_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            heap: BinaryHeap::new(),
            generations: HashMap::new(),
            shutdown: false,
        }));
        let cv = Arc::new(Condvar::new());

        let worker_shared = shared.clone();
        let worker_cv = cv.clone();
        let worker = thread::spawn(move || Self::run(worker_shared, worker_cv));

        Scheduler {
            shared,
            cv,
            next_id: AtomicU64::new(1),
            worker: Some(worker),
        }
    }

    /// Schedules `action` to run once, after `delay`.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> TaskId {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let mut shared = self.shared.lock().unwrap();
        let generation = *shared.generations.entry(id).or_insert(0);
        shared.heap.push(Entry {
            fire_at: Instant::now() + delay,
            id,
            generation,
            action: Some(Box::new(action)),
        });
        drop(shared);
        self.cv.notify_one();
        TaskId(id)
    }

    /// Re-arms a task: equivalent to cancelling and scheduling again under
    /// the same id for callers that want to reuse a [`TaskId`] slot, but we
    /// keep cancellation and scheduling explicit per spec §4.2 ("re-arming
    /// a task is explicit"), so this simply schedules a fresh task.
    pub fn reschedule(&self, old: TaskId, delay: Duration, action: impl FnOnce() + Send + 'static) -> TaskId {
        self.cancel(old);
        self.schedule(delay, action)
    }

    /// Cancels a pending task. A no-op if it already fired or doesn't
    /// exist.
    pub fn cancel(&self, task: TaskId) {
        let mut shared = self.shared.lock().unwrap();
        let gen = shared.generations.entry(task.0).or_insert(0);
        *gen += 1;
    }

    fn run(shared: Arc<Mutex<Shared>>, cv: Arc<Condvar>) {
        loop {
            let mut guard = shared.lock().unwrap();
            loop {
                if guard.shutdown {
                    return;
                }
                match guard.heap.peek() {
                    None => {
                        guard = cv.wait(guard).unwrap();
                    }
                    Some(top) => {
                        let now = Instant::now();
                        if top.fire_at <= now {
                            break;
                        }
                        let (g2, timeout) = (cv, top.fire_at - now);
                        let (g, _) = g2.wait_timeout(guard, timeout).unwrap();
                        guard = g;
                    }
                }
            }
            if guard.shutdown {
                return;
            }
            let mut entry = guard.heap.pop().expect("peeked Some above");
            let current_gen = *guard.generations.entry(entry.id).or_insert(0);
            drop(guard);

            if entry.generation == current_gen {
                if let Some(action) = entry.action.take() {
                    action();
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        {
            let mut guard = self.shared.lock().unwrap();
            guard.shutdown = true;
        }
        self.cv.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
