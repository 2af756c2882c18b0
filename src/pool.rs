//! Bounded, priority-scheduled worker pool (C8)
//!
//! Mirrors the reference thread pool's shape: a fixed cap on worker
//! threads, tasks ordered by `(priority, fifoCounter)` so ties break FIFO,
//! and reference-counted ownership so a pool shared by the transfer and
//! decompression paths of several files only tears down once every owner
//! has called [`PriorityThreadPool::release`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    priority: i32,
    fifo: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.fifo == other.fifo
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; among equal priorities, lower fifo (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.fifo.cmp(&self.fifo))
    }
}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    not_empty: Condvar,
    alive: AtomicBool,
    current_threads: AtomicUsize,
    next_fifo: AtomicUsize,
}

/// A bounded pool of worker threads draining a priority queue.
///
/// Cloning a `PriorityThreadPool` bumps its user count; the last clone
/// dropped (or the last explicit [`release`](Self::release)) joins the
/// worker threads.
pub struct PriorityThreadPool {
    shared: Arc<Shared>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    max_threads: usize,
    users: Arc<AtomicUsize>,
}

impl Clone for PriorityThreadPool {
    fn clone(&self) -> Self {
        self.users.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
            handles: self.handles.clone(),
            max_threads: self.max_threads,
            users: self.users.clone(),
        }
    }
}

impl PriorityThreadPool {
    /// Create a pool with `max_threads` workers and one initial user.
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        let name = name.into();
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            not_empty: Condvar::new(),
            alive: AtomicBool::new(true),
            current_threads: AtomicUsize::new(0),
            next_fifo: AtomicUsize::new(0),
        });

        let pool = Self {
            shared,
            handles: Arc::new(Mutex::new(Vec::new())),
            max_threads: max_threads.max(1),
            users: Arc::new(AtomicUsize::new(1)),
        };
        pool.add_threads(pool.max_threads, &name);
        pool
    }

    fn add_threads(&self, n: usize, name: &str) {
        let mut handles = self.handles.lock().expect("pool handles poisoned");
        for i in 0..n {
            if self.shared.current_threads.load(Ordering::Relaxed) >= self.max_threads {
                break;
            }
            let shared = self.shared.clone();
            let thread_name = format!("{name}-{i}");
            self.shared.current_threads.fetch_add(1, Ordering::AcqRel);
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || Self::work_loop(shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    fn work_loop(shared: Arc<Shared>) {
        loop {
            let task = {
                let mut queue = shared.queue.lock().expect("pool queue poisoned");
                loop {
                    if let Some(item) = queue.pop() {
                        break Some(item.task);
                    }
                    if !shared.alive.load(Ordering::Acquire) {
                        break None;
                    }
                    queue = shared.not_empty.wait(queue).expect("pool queue poisoned");
                }
            };
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Enqueue `task` at `priority` (higher runs sooner).
    pub fn add_task(&self, priority: i32, task: impl FnOnce() + Send + 'static) {
        let fifo = self.shared.next_fifo.fetch_add(1, Ordering::Relaxed) as u64;
        let mut queue = self.shared.queue.lock().expect("pool queue poisoned");
        queue.push(QueuedTask {
            priority,
            fifo,
            task: Box::new(task),
        });
        self.shared.not_empty.notify_one();
    }

    pub fn num_tasks(&self) -> usize {
        self.shared.queue.lock().expect("pool queue poisoned").len()
    }

    /// Block until the queue drains. Does not stop new tasks from arriving
    /// concurrently, so callers that need a quiescent pool must also stop
    /// submitting before calling this.
    pub fn wait(&self) {
        while self.num_tasks() > 0 {
            std::thread::yield_now();
        }
    }

    /// Release this handle's share of ownership. When the last user
    /// releases, outstanding tasks are drained (unless `force`) and worker
    /// threads are joined.
    pub fn terminate(&self, force: bool) {
        if self.users.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if !force {
            self.wait();
        }
        self.shared.alive.store(false, Ordering::Release);
        self.shared.not_empty.notify_all();
        let mut handles = self.handles.lock().expect("pool handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_priority_ordering_runs_highest_first() {
        let pool = PriorityThreadPool::new("test", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Block the single worker first so both tasks queue up together.
        let gate = Arc::new(std::sync::Barrier::new(2));
        {
            let gate = gate.clone();
            pool.add_task(0, move || {
                gate.wait();
            });
        }
        std::thread::sleep(Duration::from_millis(10));

        {
            let order = order.clone();
            pool.add_task(1, move || order.lock().unwrap().push(1));
        }
        {
            let order = order.clone();
            pool.add_task(5, move || order.lock().unwrap().push(5));
        }
        gate.wait();

        std::thread::sleep(Duration::from_millis(50));
        pool.terminate(false);
        assert_eq!(*order.lock().unwrap(), vec![5, 1]);
    }

    #[test]
    fn test_shared_pool_terminates_only_after_last_user() {
        let pool = PriorityThreadPool::new("shared", 2);
        let second = pool.clone();
        let counter = Arc::new(AtomicU32::new(0));

        {
            let counter = counter.clone();
            pool.add_task(0, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.terminate(false);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        second.terminate(false);
    }
}
