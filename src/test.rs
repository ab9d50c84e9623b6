use crate::sync::{QueuedSynchronizer, Synchronizer};

/// A trait for exclusive locks exercised by the shared test suites and the
/// Loom models.
pub trait Lock: Send + Sync + 'static {
    /// The policy of the lock's synchronizer.
    type Policy: Synchronizer;

    /// Acquires the lock, blocking the current thread.
    fn lock(&self);

    /// Releases the lock held by the current thread.
    ///
    /// Panics if the current thread does not hold it.
    fn unlock(&self);

    /// Returns the lock's synchronizer.
    fn sync(&self) -> &QueuedSynchronizer<Self::Policy>;
}

/// Installs a tracing subscriber that prints every event of the current
/// test, as captured output.
#[cfg(not(loom))]
pub fn trace_init() -> tracing::dispatcher::DefaultGuard {
    use tracing_subscriber::prelude::*;
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .with_target(false)
        .with_timer(())
        .set_default()
}

/// Yields until at least `n` threads are waiting on `sync`.
#[cfg(not(loom))]
pub fn wait_for_queued<S>(sync: &QueuedSynchronizer<S>, n: usize) {
    while sync.queue_length() < n {
        std::thread::yield_now();
    }
}

/// Yields until at least `n` threads are waiting on `cond`.
#[cfg(not(loom))]
pub fn wait_for_condition_waiters(
    lock: &crate::locks::ReentrantLock,
    cond: &crate::ConditionObject,
    n: usize,
) {
    loop {
        lock.lock().unwrap();
        let len = cond.wait_queue_length(lock.sync()).unwrap();
        lock.unlock().unwrap();
        if len >= n {
            return;
        }
        std::thread::yield_now();
    }
}

#[cfg(all(not(loom), test))]
pub mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::{trace_init, wait_for_queued, Lock};

    /// Evaluates that at most one thread at a time holds the lock, and that
    /// every critical section sees the updates of the previous ones.
    pub fn mutual_exclusion<L: Lock>(new: fn() -> L) {
        const THREADS: usize = 4;
        const ITERS: usize = 500;

        let lock = Arc::new(new());
        let inside = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let count = Arc::clone(&count);
                thread::spawn(move || {
                    for n in 0..ITERS {
                        lock.lock();
                        assert!(!inside.swap(true, Ordering::Relaxed));
                        // Not an atomic increment, lost updates would show.
                        let value = count.load(Ordering::Relaxed);
                        if n % 64 == 0 {
                            thread::yield_now();
                        }
                        count.store(value + 1, Ordering::Relaxed);
                        inside.store(false, Ordering::Relaxed);
                        lock.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(count.load(Ordering::Relaxed), THREADS * ITERS);
        assert_eq!(lock.sync().state(), 0);
        assert_eq!(lock.sync().queue_length(), 0);
        assert!(!lock.sync().has_queued_threads());
    }

    /// Evaluates that every thread that blocks is eventually woken: all of
    /// them complete once a single holder releases.
    pub fn no_lost_wakeup<L: Lock>(new: fn() -> L) {
        const THREADS: usize = 16;
        let _trace = trace_init();

        let lock = Arc::new(new());
        let completions = Arc::new(AtomicUsize::new(0));
        lock.lock();
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let completions = Arc::clone(&completions);
                thread::spawn(move || {
                    lock.lock();
                    thread::sleep(Duration::from_micros(50));
                    completions.fetch_add(1, Ordering::Relaxed);
                    lock.unlock();
                })
            })
            .collect();
        wait_for_queued(lock.sync(), THREADS);
        lock.unlock();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(completions.load(Ordering::Relaxed), THREADS);
    }

    /// Evaluates that queued threads acquire in the order they queued.
    pub fn fifo_under_fairness<L: Lock>(new: fn() -> L) {
        const THREADS: usize = 6;

        let lock = Arc::new(new());
        let order = Arc::new(Mutex::new(Vec::new()));
        lock.lock();
        let mut handles = Vec::new();
        for n in 0..THREADS {
            let c_lock = Arc::clone(&lock);
            let c_order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                c_lock.lock();
                c_order.lock().unwrap().push(n);
                c_lock.unlock();
            }));
            wait_for_queued(lock.sync(), n + 1);
        }
        let first = lock.sync().first_queued_thread().unwrap();
        assert!(first.ptr_eq(&lock.sync().queued_threads()[THREADS - 1]));
        lock.unlock();
        for handle in handles {
            handle.join().unwrap();
        }
        let expected: Vec<_> = (0..THREADS).collect();
        assert_eq!(*order.lock().unwrap(), expected);
    }
}
