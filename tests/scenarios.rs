use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use queued_sync::locks::{RawMutex, RawRwLock, ReentrantLock, Semaphore};
use queued_sync::{park, Mode, QueuedSynchronizer, Result, SyncCore, SyncError, Synchronizer};

fn wait_for_queued<S>(sync: &QueuedSynchronizer<S>, n: usize) {
    while sync.queue_length() < n {
        thread::yield_now();
    }
}

/// A latch that opens once signalled, written against the public policy
/// trait only.
#[derive(Default)]
struct BooleanLatch;

// SAFETY: `is_held_exclusively` is not implemented.
unsafe impl Synchronizer for BooleanLatch {
    fn try_acquire_shared(&self, core: &SyncCore, _: i32) -> Result<i32> {
        Ok(if core.state() != 0 { 1 } else { -1 })
    }

    fn try_release_shared(&self, core: &SyncCore, _: i32) -> Result<bool> {
        core.set_state(1);
        Ok(true)
    }
}

#[test]
fn exclusive_handoff() {
    let mutex = Arc::new(RawMutex::new());
    mutex.lock();
    let (tx, rx) = channel();
    let (done_tx, done_rx) = channel::<()>();
    let c_mutex = Arc::clone(&mutex);
    let handle = thread::spawn(move || {
        c_mutex.lock();
        tx.send((c_mutex.is_held_by_current_thread(), c_mutex.sync().state())).unwrap();
        done_rx.recv().unwrap();
        c_mutex.unlock().unwrap();
    });
    wait_for_queued(mutex.sync(), 1);
    mutex.unlock().unwrap();
    assert_eq!(rx.recv().unwrap(), (true, 1));
    assert!(!mutex.is_held_by_current_thread());
    done_tx.send(()).unwrap();
    handle.join().unwrap();
    assert!(!mutex.is_locked());
}

#[test]
fn readers_release_a_writer() {
    let lock = Arc::new(RawRwLock::new());
    for count in 1..=3 {
        lock.read().unwrap();
        assert_eq!(lock.read_count(), count);
    }
    let c_lock = Arc::clone(&lock);
    let writer = thread::spawn(move || {
        c_lock.write().unwrap();
        let locked = c_lock.is_write_locked_by_current_thread();
        c_lock.write_unlock().unwrap();
        locked
    });
    wait_for_queued(lock.sync(), 1);
    assert_eq!(lock.try_write(), Ok(false));
    for count in (0..3).rev() {
        lock.read_unlock().unwrap();
        assert_eq!(lock.read_count(), count);
    }
    assert!(writer.join().unwrap());
    assert_eq!(lock.sync().state(), 0);
}

#[test]
fn signal_transfers_in_wait_order() {
    let lock = Arc::new(ReentrantLock::new());
    let cond = Arc::new(lock.new_condition());
    let woken = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    let mut handles = Vec::new();
    for name in ["x", "y", "z"] {
        let (tx, rx) = channel();
        let c_lock = Arc::clone(&lock);
        let c_cond = Arc::clone(&cond);
        let c_woken = Arc::clone(&woken);
        handles.push(thread::spawn(move || {
            c_lock.lock().unwrap();
            tx.send(park::current()).unwrap();
            c_cond.wait(c_lock.sync()).unwrap();
            c_woken.lock().unwrap().push(name);
            c_lock.unlock().unwrap();
        }));
        waiters.push(rx.recv().unwrap());
        loop {
            lock.lock().unwrap();
            let len = cond.wait_queue_length(lock.sync()).unwrap();
            lock.unlock().unwrap();
            if len == waiters.len() {
                break;
            }
            thread::yield_now();
        }
    }

    lock.lock().unwrap();
    let waiting = cond.waiting_threads(lock.sync()).unwrap();
    assert_eq!(waiting.len(), 3);
    assert!(waiting[0].ptr_eq(&waiters[0]));

    cond.signal(lock.sync()).unwrap();
    assert_eq!(cond.wait_queue_length(lock.sync()), Ok(2));
    assert_eq!(lock.sync().queue_length(), 1);
    assert!(lock.sync().is_queued(&waiters[0]));

    cond.signal_all(lock.sync()).unwrap();
    assert_eq!(cond.has_waiters(lock.sync()), Ok(false));
    assert_eq!(lock.sync().queue_length(), 3);
    let queued = lock.sync().queued_threads();
    // Most recently queued first.
    for (queued, waiter) in queued.iter().zip(waiters.iter().rev()) {
        assert!(queued.ptr_eq(waiter));
    }
    lock.unlock().unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*woken.lock().unwrap(), ["x", "y", "z"]);
}

#[test]
fn expired_waiter_leaves_the_queue() {
    let mutex = Arc::new(RawMutex::new());
    mutex.lock();
    let acquired = Arc::new(AtomicUsize::new(0));
    let c_mutex = Arc::clone(&mutex);
    let c_acquired = Arc::clone(&acquired);
    let blocked = thread::spawn(move || {
        c_mutex.lock();
        c_acquired.fetch_add(1, Ordering::SeqCst);
        c_mutex.unlock().unwrap();
    });
    wait_for_queued(mutex.sync(), 1);

    let c_mutex = Arc::clone(&mutex);
    let timed = thread::spawn(move || {
        let start = Instant::now();
        let acquired = c_mutex.try_lock_for(Duration::from_millis(50));
        (acquired, start.elapsed())
    });
    wait_for_queued(mutex.sync(), 2);
    let (result, elapsed) = timed.join().unwrap();
    assert_eq!(result, Ok(false));
    assert!(elapsed >= Duration::from_millis(50));
    assert_eq!(mutex.sync().queue_length(), 1);
    assert_eq!(acquired.load(Ordering::SeqCst), 0);
    assert!(mutex.is_held_by_current_thread());

    mutex.unlock().unwrap();
    blocked.join().unwrap();
    assert_eq!(acquired.load(Ordering::SeqCst), 1);
}

#[test]
fn interrupt_cancels_waiter() {
    let mutex = Arc::new(RawMutex::new());
    mutex.lock();
    let (tx, rx) = channel();
    let c_mutex = Arc::clone(&mutex);
    let handle = thread::spawn(move || {
        tx.send(park::current()).unwrap();
        c_mutex.lock_interruptibly()
    });
    let waiter = rx.recv().unwrap();
    wait_for_queued(mutex.sync(), 1);
    waiter.interrupt();
    assert_eq!(handle.join().unwrap(), Err(SyncError::Interrupted));
    assert_eq!(mutex.sync().queue_length(), 0);
    assert!(mutex.sync().has_contended());
    mutex.unlock().unwrap();
    assert!(mutex.try_lock());
    mutex.unlock().unwrap();
}

#[test]
fn shared_accounting() {
    const PERMITS: i32 = 4;
    const THREADS: usize = 8;
    let sem = Arc::new(Semaphore::new(PERMITS));
    let handles: Vec<_> = (0..THREADS)
        .map(|n| {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                let many = (n % 2 + 1) as u32;
                for _ in 0..200 {
                    sem.acquire_many(many).unwrap();
                    assert!(sem.available_permits() >= 0);
                    sem.release_many(many).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(sem.available_permits(), PERMITS);
    assert_eq!(sem.sync().queue_length(), 0);
}

#[test]
fn custom_policy_releases_all() {
    const WAITERS: usize = 4;
    let latch = Arc::new(QueuedSynchronizer::new(BooleanLatch));
    assert_eq!(latch.acquire(1), Err(SyncError::Unsupported(Mode::Exclusive)));
    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.acquire_shared_interruptibly(1))
        })
        .collect();
    wait_for_queued(&latch, WAITERS);
    assert_eq!(latch.shared_queued_threads().len(), WAITERS);
    assert!(latch.exclusive_queued_threads().is_empty());
    assert_eq!(latch.release_shared(1), Ok(true));
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(()));
    }
    assert!(!latch.has_queued_threads());
}

#[test]
fn round_trip() {
    let lock = ReentrantLock::fair();
    let before = lock.sync().state();
    for _ in 0..100 {
        lock.lock().unwrap();
        lock.unlock().unwrap();
    }
    assert_eq!(lock.sync().state(), before);
    assert!(!lock.sync().has_contended());
}
