use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sync::{QueuedSynchronizer, SyncCore, Synchronizer};

use super::or_panic;

/// The policy of [`Semaphore`]: the state is the number of available
/// permits, and may go negative only if created so.
#[derive(Debug)]
pub struct Permits {
    fair: bool,
}

impl Permits {
    /// Takes `acquires` permits if available, queue order aside unless
    /// `fair`. Returns the permits left, negative on failure.
    fn acquire(core: &SyncCore, acquires: i32, fair: bool) -> i32 {
        loop {
            if fair && core.has_queued_predecessors() {
                return -1;
            }
            let available = core.state();
            let remaining = available.saturating_sub(acquires);
            if remaining < 0 || core.compare_and_set_state(available, remaining) {
                return remaining;
            }
        }
    }
}

// SAFETY: `is_held_exclusively` is not implemented.
unsafe impl Synchronizer for Permits {
    fn try_acquire_shared(&self, core: &SyncCore, acquires: i32) -> Result<i32> {
        Ok(Self::acquire(core, acquires, self.fair))
    }

    fn try_release_shared(&self, core: &SyncCore, releases: i32) -> Result<bool> {
        loop {
            let current = core.state();
            let next = current.checked_add(releases).ok_or(SyncError::Saturated("permit"))?;
            if core.compare_and_set_state(current, next) {
                return Ok(true);
            }
        }
    }
}

/// Converts a permit count to the state's representation.
fn permits(n: u32) -> Result<i32> {
    i32::try_from(n).map_err(|_| SyncError::Saturated("permit"))
}

/// A counting semaphore.
///
/// Holds a number of permits. Acquiring takes permits, blocking until enough
/// are available, releasing gives permits back. Permits are not tied to
/// threads, any thread may release permits it never acquired.
///
/// # Examples
///
/// ```
/// use queued_sync::locks::Semaphore;
///
/// let pool = Semaphore::new(2);
/// pool.acquire().unwrap();
/// pool.acquire().unwrap();
/// assert!(!pool.try_acquire());
/// pool.release().unwrap();
/// assert_eq!(pool.available_permits(), 1);
/// ```
#[derive(Debug)]
pub struct Semaphore {
    sync: QueuedSynchronizer<Permits>,
}

impl Semaphore {
    /// Creates a barging semaphore with `permits` initial permits, which may
    /// be negative to require releases before any acquire.
    pub fn new(permits: i32) -> Self {
        Self { sync: QueuedSynchronizer::with_state(Permits { fair: false }, permits) }
    }

    /// Creates a semaphore that hands out permits in arrival order.
    pub fn fair(permits: i32) -> Self {
        Self { sync: QueuedSynchronizer::with_state(Permits { fair: true }, permits) }
    }

    /// Acquires a permit, unless interrupted before or while waiting.
    pub fn acquire(&self) -> Result<()> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Acquires `n` permits, unless interrupted before or while waiting.
    pub fn acquire_many(&self, n: u32) -> Result<()> {
        self.sync.acquire_shared_interruptibly(permits(n)?)
    }

    /// Acquires a permit, ignoring interrupts. They are reasserted once
    /// acquired.
    pub fn acquire_uninterruptibly(&self) {
        or_panic(self.sync.acquire_shared(1));
    }

    /// Attempts to take a permit without blocking.
    ///
    /// Even a fair semaphore hands it out if one is available.
    pub fn try_acquire(&self) -> bool {
        Permits::acquire(self.sync.core(), 1, false) >= 0
    }

    /// Attempts to take a permit, waiting at most `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<bool> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    /// Attempts to take `n` permits, waiting at most `timeout`.
    pub fn try_acquire_many_for(&self, n: u32, timeout: Duration) -> Result<bool> {
        self.sync.try_acquire_shared_for(permits(n)?, timeout)
    }

    /// Gives a permit back.
    ///
    /// Fails with [`SyncError::Saturated`] if that overflows the count.
    pub fn release(&self) -> Result<()> {
        self.release_many(1)
    }

    /// Gives `n` permits back.
    pub fn release_many(&self, n: u32) -> Result<()> {
        self.sync.release_shared(permits(n)?).map(drop)
    }

    /// Returns the number of permits currently available.
    pub fn available_permits(&self) -> i32 {
        self.sync.state()
    }

    /// Takes every available permit, returning how many.
    pub fn drain_permits(&self) -> i32 {
        let core = self.sync.core();
        loop {
            let current = core.state();
            if current <= 0 || core.compare_and_set_state(current, 0) {
                return current.max(0);
            }
        }
    }

    /// Shrinks the number of available permits by `reduction` without
    /// blocking, possibly below zero.
    pub fn reduce_permits(&self, reduction: u32) -> Result<()> {
        let reduction = permits(reduction)?;
        let core = self.sync.core();
        loop {
            let current = core.state();
            let next = current.checked_sub(reduction).ok_or(SyncError::Saturated("permit"))?;
            if core.compare_and_set_state(current, next) {
                return Ok(());
            }
        }
    }

    /// Returns `true` if this semaphore hands out permits in arrival order.
    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    /// Returns the synchronizer, for queue queries.
    pub fn sync(&self) -> &QueuedSynchronizer<Permits> {
        &self.sync
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Semaphore;
    use crate::error::SyncError;
    use crate::test::wait_for_queued;

    #[test]
    fn permits_accounting() {
        let sem = Semaphore::new(3);
        sem.acquire_many(2).unwrap();
        assert_eq!(sem.available_permits(), 1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release_many(3).unwrap();
        assert_eq!(sem.drain_permits(), 3);
        assert_eq!(sem.drain_permits(), 0);
        sem.reduce_permits(2).unwrap();
        assert_eq!(sem.available_permits(), -2);
    }

    #[test]
    fn release_saturates() {
        let sem = Semaphore::new(i32::MAX);
        assert_eq!(sem.release(), Err(SyncError::Saturated("permit")));
        assert_eq!(sem.available_permits(), i32::MAX);
        assert_eq!(sem.release_many(u32::MAX), Err(SyncError::Saturated("permit")));
    }

    #[test]
    fn negative_start_needs_releases() {
        let sem = Arc::new(Semaphore::new(-1));
        let c_sem = Arc::clone(&sem);
        let handle = thread::spawn(move || c_sem.acquire().unwrap());
        wait_for_queued(sem.sync(), 1);
        sem.release().unwrap();
        assert_eq!(sem.sync().queue_length(), 1);
        sem.release().unwrap();
        handle.join().unwrap();
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn timed_acquire_expires() {
        let sem = Semaphore::fair(0);
        assert!(sem.is_fair());
        assert_eq!(sem.try_acquire_for(Duration::from_millis(10)), Ok(false));
        assert_eq!(sem.try_acquire_many_for(2, Duration::ZERO), Ok(false));
        assert_eq!(sem.sync().queue_length(), 0);
    }

    #[test]
    fn concurrent_releases_wake_both_waiters() {
        for _ in 0..200 {
            let sem = Arc::new(Semaphore::new(0));
            let waiters: Vec<_> = (0..2)
                .map(|_| {
                    let c_sem = Arc::clone(&sem);
                    thread::spawn(move || c_sem.acquire_uninterruptibly())
                })
                .collect();
            wait_for_queued(sem.sync(), 2);
            let releasers: Vec<_> = (0..2)
                .map(|_| {
                    let c_sem = Arc::clone(&sem);
                    thread::spawn(move || c_sem.release().unwrap())
                })
                .collect();
            for handle in releasers.into_iter().chain(waiters) {
                handle.join().unwrap();
            }
            assert_eq!(sem.available_permits(), 0);
            assert_eq!(sem.sync().queue_length(), 0);
        }
    }

    #[test]
    fn bounded_concurrency() {
        const PERMITS: i32 = 3;
        const THREADS: usize = 8;
        let sem = Arc::new(Semaphore::new(PERMITS));
        let inside = Arc::new(AtomicI32::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..100 {
                        sem.acquire_uninterruptibly();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        assert!(now <= PERMITS);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.release().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sem.available_permits(), PERMITS);
    }
}
