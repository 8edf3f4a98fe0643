//! Fixed-size worker pool for background and query tasks
//!
//! FIFO task queue drained by a fixed set of threads. `drain()` blocks
//! until queue and in-flight work are both empty; `shutdown()` lets
//! workers finish what is queued, then joins them. A panicking task is
//! contained to itself: the worker survives and bookkeeping stays
//! correct, so `drain()` cannot hang on a crashed task.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

type Task = Box<dyn FnOnce() + Send>;

struct PoolInner {
    queue: Mutex<VecDeque<Task>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
}

/// A named pool of worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `<name>-0`, `<name>-1`, ...
    pub fn new(name: &str, threads: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a task. Returns false if the pool is already shut down.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.inner.queue.lock();
            queue.push_back(Box::new(work));
        }
        self.inner.work_ready.notify_one();
        true
    }

    /// Block until every queued and in-flight task has completed.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active.load(Ordering::Acquire) > 0 {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Signal shutdown and join all workers. Queued tasks run first.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            // lock before notify so a worker between its shutdown check and
            // its wait cannot miss the wakeup
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active` and wakes drain waiters even if the task panicked.
struct ActiveGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let previous = self.inner.active.fetch_sub(1, Ordering::Release);
        if previous == 1 {
            let queue = self.inner.queue.lock();
            if queue.is_empty() {
                self.inner.drain_cond.notify_all();
            }
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.active.fetch_add(1, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveGuard { inner };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
            error!("worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn submit_and_drain() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            assert!(pool.submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }));
        }
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        pool.shutdown();
    }

    #[test]
    fn fifo_order_single_thread() {
        let pool = WorkerPool::new("test", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // hold the single worker so the queue builds up
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        pool.submit(move || {
            b.wait();
        });
        std::thread::sleep(std::time::Duration::from_millis(30));

        for i in 0..5 {
            let o = Arc::clone(&order);
            pool.submit(move || {
                o.lock().push(i);
            });
        }
        barrier.wait();
        pool.drain();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        pool.shutdown();
    }

    #[test]
    fn panic_does_not_hang_drain() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("intentional test panic"));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
        pool.shutdown();
    }

    #[test]
    fn shutdown_runs_queued_tasks() {
        let pool = WorkerPool::new("test", 1);
        let counter = Arc::new(AtomicUsize::new(0));

        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        pool.submit(move || {
            b.wait();
        });
        std::thread::sleep(std::time::Duration::from_millis(30));

        for _ in 0..5 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        barrier.wait();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn submit_after_shutdown_rejected() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown();
        assert!(!pool.submit(|| {}));
    }

    #[test]
    fn drain_on_idle_pool_returns() {
        let pool = WorkerPool::new("test", 2);
        pool.drain();
        pool.shutdown();
    }

    #[test]
    fn pool_usable_after_drain() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        pool.drain();

        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        pool.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        pool.shutdown();
    }
}
