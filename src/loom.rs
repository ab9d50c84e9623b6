pub mod models {
    use core::array;

    use loom::cell::UnsafeCell;
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::locks::{CountDownLatch, RawMutex};
    use crate::test::Lock;

    // Three or more threads make these models run for too long, so the
    // queue is only ever exercised with a single waiter.
    const LOCKS: usize = 2;
    const TRY_LOCKS: usize = 3;

    /// A counter only ever touched while holding `lock`.
    struct Guarded<L> {
        lock: L,
        value: UnsafeCell<usize>,
    }

    // SAFETY: `value` is only accessed while `lock` is held.
    unsafe impl<L: Lock> Sync for Guarded<L> {}

    impl<L: Lock> Guarded<L> {
        fn new(lock: L) -> Arc<Self> {
            Arc::new(Self { lock, value: UnsafeCell::new(0) })
        }

        fn inc(&self) {
            self.lock.lock();
            // SAFETY: The lock is held.
            self.value.with_mut(|value| unsafe { *value += 1 });
            self.lock.unlock();
        }

        fn get(&self) -> usize {
            self.lock.lock();
            // SAFETY: The lock is held.
            let value = self.value.with(|value| unsafe { *value });
            self.lock.unlock();
            value
        }
    }

    impl Guarded<RawMutex> {
        fn try_inc(&self) {
            if self.lock.try_lock() {
                // SAFETY: The lock is held.
                self.value.with_mut(|value| unsafe { *value += 1 });
                self.lock.unlock().unwrap();
            }
        }
    }

    /// Evaluates that concurrent `lock` calls serialize all mutations
    /// against the shared data, and that every blocked thread is woken.
    pub fn lock_join<L: Lock>(new: fn() -> L) {
        model(move || {
            let guarded = Guarded::new(new());
            let handles: [_; LOCKS] = array::from_fn(|_| {
                let guarded = Arc::clone(&guarded);
                thread::spawn(move || guarded.inc())
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(guarded.get(), LOCKS);
            assert_eq!(guarded.lock.sync().state(), 0);
        });
    }

    /// Evaluates that concurrent `try_lock` calls serialize all mutations
    /// against the shared data.
    pub fn try_lock_join(new: fn() -> RawMutex) {
        model(move || {
            let guarded = Guarded::new(new());
            let handles: [_; TRY_LOCKS] = array::from_fn(|_| {
                let guarded = Arc::clone(&guarded);
                thread::spawn(move || guarded.try_inc())
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert!((1..=TRY_LOCKS).contains(&guarded.get()));
        });
    }

    /// Evaluates that concurrent `lock` and `try_lock` calls serialize all
    /// mutations against the shared data.
    pub fn mixed_lock_join(new: fn() -> RawMutex) {
        model(move || {
            let guarded = Guarded::new(new());
            let handles: [_; LOCKS] = array::from_fn(|run| {
                let guarded = Arc::clone(&guarded);
                let f = if run % 2 == 0 { Guarded::inc } else { Guarded::try_inc };
                thread::spawn(move || f(&guarded))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert!((1..=LOCKS).contains(&guarded.get()));
        });
    }

    /// Evaluates that counting a latch down to zero releases a thread that
    /// waits on it, however the two race.
    pub fn latch_release() {
        model(|| {
            let latch = Arc::new(CountDownLatch::new(1));
            let c_latch = Arc::clone(&latch);
            let handle = thread::spawn(move || c_latch.wait().unwrap());
            latch.count_down();
            handle.join().unwrap();
            assert_eq!(latch.count(), 0);
        });
    }
}
