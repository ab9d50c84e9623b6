use core::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use crate::cfg::atomic::AtomicUsize;
use crate::condition::ConditionObject;
use crate::error::{Result, SyncError};
use crate::park;
use crate::sync::{QueuedSynchronizer, SyncCore, Synchronizer};

/// The policy of [`ReentrantLock`]: the state is the hold count of `owner`.
#[derive(Debug)]
pub struct Reentrant {
    fair: bool,
    owner: AtomicUsize,
}

impl Reentrant {
    fn new(fair: bool) -> Self {
        Self { fair, owner: AtomicUsize::new(0) }
    }

    /// Acquires `acquires` holds, queue order aside unless `fair`.
    fn acquire(&self, core: &SyncCore, acquires: i32, fair: bool) -> Result<bool> {
        let me = park::current_id();
        let count = core.state();
        if count == 0 {
            if fair && core.has_queued_predecessors() {
                return Ok(false);
            }
            let acquired = core.compare_and_set_state(0, acquires);
            if acquired {
                self.owner.store(me, Relaxed);
            }
            return Ok(acquired);
        }
        if self.owner.load(Relaxed) != me {
            return Ok(false);
        }
        let count = count.checked_add(acquires).ok_or(SyncError::Saturated("lock"))?;
        core.set_state(count);
        Ok(true)
    }
}

// SAFETY: `is_held_exclusively` compares the owner with the calling thread,
// and only the thread that locked stores its id in `owner`.
unsafe impl Synchronizer for Reentrant {
    fn try_acquire(&self, core: &SyncCore, acquires: i32) -> Result<bool> {
        self.acquire(core, acquires, self.fair)
    }

    fn try_release(&self, core: &SyncCore, releases: i32) -> Result<bool> {
        if !self.is_held_exclusively(core)? {
            return Err(SyncError::IllegalMonitorState);
        }
        let count = core.state() - releases;
        let free = count == 0;
        if free {
            self.owner.store(0, Relaxed);
        }
        core.set_state(count);
        Ok(free)
    }

    fn is_held_exclusively(&self, core: &SyncCore) -> Result<bool> {
        Ok(core.state() != 0 && self.owner.load(Relaxed) == park::current_id())
    }
}

/// A mutual exclusion lock that the holding thread may lock again.
///
/// Every `lock` must be paired with an `unlock`, the lock is released when
/// the hold count drops back to zero. Conditions created from it fully
/// release it while waiting and restore the hold count afterwards.
///
/// # Examples
///
/// ```
/// use queued_sync::locks::ReentrantLock;
///
/// let lock = ReentrantLock::new();
/// lock.lock().unwrap();
/// lock.lock().unwrap();
/// assert_eq!(lock.hold_count(), 2);
/// lock.unlock().unwrap();
/// lock.unlock().unwrap();
/// assert!(!lock.is_locked());
/// ```
#[derive(Debug)]
pub struct ReentrantLock {
    sync: QueuedSynchronizer<Reentrant>,
}

impl ReentrantLock {
    /// Creates a new, unlocked and barging lock.
    pub fn new() -> Self {
        Self { sync: QueuedSynchronizer::new(Reentrant::new(false)) }
    }

    /// Creates a new, unlocked lock that is granted in arrival order, except
    /// to its current holder.
    pub fn fair() -> Self {
        Self { sync: QueuedSynchronizer::new(Reentrant::new(true)) }
    }

    /// Acquires this lock, or adds a hold if the calling thread already has
    /// it. Interrupts are reasserted once locked.
    ///
    /// Fails with [`SyncError::Saturated`] if the hold count would overflow.
    pub fn lock(&self) -> Result<()> {
        self.sync.acquire(1)
    }

    /// Acquires this lock, unless interrupted before or while waiting.
    pub fn lock_interruptibly(&self) -> Result<()> {
        self.sync.acquire_interruptibly(1)
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// Even a fair lock is acquired if it is free at the time of the call.
    pub fn try_lock(&self) -> Result<bool> {
        self.sync.policy().acquire(self.sync.core(), 1, false)
    }

    /// Attempts to acquire this lock, waiting at most `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.sync.try_acquire_for(1, timeout)
    }

    /// Drops one hold of this lock.
    pub fn unlock(&self) -> Result<()> {
        self.sync.release(1).map(drop)
    }

    /// Returns the number of holds the calling thread has on this lock.
    pub fn hold_count(&self) -> i32 {
        if self.is_held_by_current_thread() {
            self.sync.state()
        } else {
            0
        }
    }

    /// Returns `true` if the calling thread holds this lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        matches!(self.sync.is_held_exclusively(), Ok(true))
    }

    /// Returns `true` if any thread holds this lock.
    pub fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }

    /// Returns `true` if this lock is granted in arrival order.
    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    /// Creates a new condition bound to this lock.
    pub fn new_condition(&self) -> ConditionObject {
        self.sync.new_condition()
    }

    /// Returns the synchronizer, to use with conditions and queue queries.
    pub fn sync(&self) -> &QueuedSynchronizer<Reentrant> {
        &self.sync
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl crate::test::Lock for ReentrantLock {
    type Policy = Reentrant;

    fn lock(&self) {
        super::or_panic(Self::lock(self));
    }

    fn unlock(&self) {
        super::or_panic(Self::unlock(self));
    }

    fn sync(&self) -> &QueuedSynchronizer<Reentrant> {
        Self::sync(self)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::ReentrantLock;
    use crate::error::SyncError;
    use crate::test::{tests, wait_for_queued};

    #[test]
    fn round_trip() {
        let lock = ReentrantLock::new();
        for _ in 0..10 {
            lock.lock().unwrap();
        }
        assert_eq!(lock.hold_count(), 10);
        for _ in 0..10 {
            lock.unlock().unwrap();
        }
        assert_eq!(lock.sync().state(), 0);
        assert_eq!(lock.unlock(), Err(SyncError::IllegalMonitorState));
    }

    #[test]
    fn hold_count_saturates() {
        let lock = ReentrantLock::new();
        lock.sync().acquire(i32::MAX).unwrap();
        assert_eq!(lock.lock(), Err(SyncError::Saturated("lock")));
        assert_eq!(lock.hold_count(), i32::MAX);
        assert!(lock.sync().release(i32::MAX).unwrap());
        assert!(!lock.is_locked());
    }

    #[test]
    fn other_thread_is_not_holder() {
        let lock = Arc::new(ReentrantLock::new());
        lock.lock().unwrap();
        let c_lock = Arc::clone(&lock);
        let (held, count, try_lock) = thread::spawn(move || {
            (c_lock.is_held_by_current_thread(), c_lock.hold_count(), c_lock.try_lock())
        })
        .join()
        .unwrap();
        assert!(!held);
        assert_eq!(count, 0);
        assert_eq!(try_lock, Ok(false));
        lock.unlock().unwrap();
    }

    #[test]
    fn fair_lock_reenters_despite_queue() {
        let lock = Arc::new(ReentrantLock::fair());
        lock.lock().unwrap();
        let c_lock = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            c_lock.lock().unwrap();
            c_lock.unlock().unwrap();
        });
        wait_for_queued(lock.sync(), 1);
        // Reentrant acquisition by the holder ignores the queue.
        lock.lock().unwrap();
        assert_eq!(lock.hold_count(), 2);
        lock.unlock().unwrap();
        lock.unlock().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn mutual_exclusion() {
        tests::mutual_exclusion(ReentrantLock::new);
        tests::mutual_exclusion(ReentrantLock::fair);
    }

    #[test]
    fn no_lost_wakeup() {
        tests::no_lost_wakeup(ReentrantLock::fair);
    }

    #[test]
    fn fifo_under_fairness() {
        tests::fifo_under_fairness(ReentrantLock::fair);
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::ReentrantLock;
    use crate::loom::models;

    #[test]
    fn lock_join() {
        models::lock_join(ReentrantLock::new);
    }
}
