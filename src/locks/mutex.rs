use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::time::Duration;

use crate::cfg::atomic::{AtomicBool, AtomicUsize};
use crate::condition::ConditionObject;
use crate::error::{Result, SyncError};
use crate::park;
use crate::sync::{QueuedSynchronizer, SyncCore, Synchronizer};

use super::or_panic;

/// The policy of [`RawMutex`]: zero is unlocked, one is locked by `owner`.
///
/// While `handoff` is set, an unfair mutex behaves as a fair one until the
/// next thread locks it.
#[derive(Debug)]
pub struct Exclusive {
    fair: bool,
    handoff: AtomicBool,
    owner: AtomicUsize,
}

impl Exclusive {
    #[cfg(not(all(loom, test)))]
    const fn new(fair: bool) -> Self {
        Self { fair, handoff: AtomicBool::new(false), owner: AtomicUsize::new(0) }
    }

    #[cfg(all(loom, test))]
    fn new(fair: bool) -> Self {
        Self { fair, handoff: AtomicBool::new(false), owner: AtomicUsize::new(0) }
    }
}

// SAFETY: `is_held_exclusively` compares the owner with the calling thread,
// and only the thread that locked stores its id in `owner`.
unsafe impl Synchronizer for Exclusive {
    fn try_acquire(&self, core: &SyncCore, _: i32) -> Result<bool> {
        if core.state() != 0 {
            return Ok(false);
        }
        // Read after the state, so a pending handoff is never missed.
        let fair = self.fair || self.handoff.load(Acquire);
        if fair && core.has_queued_predecessors() {
            return Ok(false);
        }
        let acquired = core.compare_and_set_state(0, 1);
        if acquired {
            self.owner.store(park::current_id(), Relaxed);
            if self.handoff.load(Relaxed) {
                self.handoff.store(false, Relaxed);
            }
        }
        Ok(acquired)
    }

    fn try_release(&self, core: &SyncCore, _: i32) -> Result<bool> {
        if !self.is_held_exclusively(core)? {
            return Err(SyncError::IllegalMonitorState);
        }
        self.owner.store(0, Relaxed);
        core.set_state(0);
        Ok(true)
    }

    fn is_held_exclusively(&self, core: &SyncCore) -> Result<bool> {
        Ok(core.state() != 0 && self.owner.load(Relaxed) == park::current_id())
    }
}

/// A non-reentrant mutual exclusion lock.
///
/// Threads that find it locked queue up and park. By default a new arrival
/// may acquire it before the threads already queued, a [`fair`] mutex
/// instead grants it in arrival order.
///
/// Only the thread that locked it may unlock it. Locking it again from the
/// same thread deadlocks.
///
/// # Examples
///
/// ```
/// use queued_sync::locks::RawMutex;
///
/// let mutex = RawMutex::new();
/// mutex.lock();
/// assert!(mutex.is_held_by_current_thread());
/// assert!(!mutex.try_lock());
/// mutex.unlock().unwrap();
/// assert!(!mutex.is_locked());
/// ```
///
/// [`fair`]: RawMutex::fair
#[derive(Debug)]
pub struct RawMutex {
    sync: QueuedSynchronizer<Exclusive>,
}

impl RawMutex {
    /// Creates a new, unlocked and barging mutex (const).
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { sync: QueuedSynchronizer::new(Exclusive::new(false)) }
    }

    /// Creates a new, unlocked and fair mutex (const).
    #[cfg(not(all(loom, test)))]
    pub const fn fair() -> Self {
        Self { sync: QueuedSynchronizer::new(Exclusive::new(true)) }
    }

    /// Creates a new, unlocked and barging mutex (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { sync: QueuedSynchronizer::new(Exclusive::new(false)) }
    }

    /// Creates a new, unlocked and fair mutex (non-const).
    #[cfg(all(loom, test))]
    pub fn fair() -> Self {
        Self { sync: QueuedSynchronizer::new(Exclusive::new(true)) }
    }

    /// Acquires this mutex, blocking the current thread until it is able to
    /// do so. Interrupts are reasserted once locked.
    pub fn lock(&self) {
        or_panic(self.sync.acquire(1));
    }

    /// Acquires this mutex, unless interrupted before or while waiting.
    pub fn lock_interruptibly(&self) -> Result<()> {
        self.sync.acquire_interruptibly(1)
    }

    /// Attempts to acquire this mutex without blocking.
    pub fn try_lock(&self) -> bool {
        or_panic(self.sync.policy().try_acquire(self.sync.core(), 1))
    }

    /// Attempts to acquire this mutex, waiting at most `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.sync.try_acquire_for(1, timeout)
    }

    /// Unlocks this mutex.
    ///
    /// Fails with [`SyncError::IllegalMonitorState`] unless the calling thread
    /// holds it.
    pub fn unlock(&self) -> Result<()> {
        self.sync.release(1).map(drop)
    }

    /// Unlocks this mutex, and lets the longest waiting thread lock it
    /// before any thread that did not queue yet.
    ///
    /// Same as [`unlock`](Self::unlock) for a fair mutex.
    pub fn unlock_fair(&self) -> Result<()> {
        let policy = self.sync.policy();
        if !policy.fair && self.sync.has_queued_threads() {
            if !policy.is_held_exclusively(self.sync.core())? {
                return Err(SyncError::IllegalMonitorState);
            }
            policy.handoff.store(true, Release);
        }
        self.unlock()
    }

    /// Returns `true` if this mutex is currently locked by any thread.
    pub fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }

    /// Returns `true` if this mutex is locked by the calling thread.
    pub fn is_held_by_current_thread(&self) -> bool {
        or_panic(self.sync.is_held_exclusively())
    }

    /// Returns `true` if this mutex grants the lock in arrival order.
    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    /// Creates a new condition bound to this mutex.
    pub fn new_condition(&self) -> ConditionObject {
        self.sync.new_condition()
    }

    /// Returns the synchronizer, to use with conditions and queue queries.
    pub fn sync(&self) -> &QueuedSynchronizer<Exclusive> {
        &self.sync
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl crate::test::Lock for RawMutex {
    type Policy = Exclusive;

    fn lock(&self) {
        Self::lock(self);
    }

    fn unlock(&self) {
        or_panic(Self::unlock(self));
    }

    fn sync(&self) -> &QueuedSynchronizer<Exclusive> {
        Self::sync(self)
    }
}

#[cfg(all(feature = "lock_api", not(loom)))]
unsafe impl lock_api::RawMutex for RawMutex {
    type GuardMarker = lock_api::GuardNoSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    #[inline]
    fn lock(&self) {
        Self::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        Self::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        or_panic(Self::unlock(self));
    }

    #[inline]
    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

#[cfg(all(feature = "lock_api", not(loom)))]
unsafe impl lock_api::RawMutexFair for RawMutex {
    #[inline]
    unsafe fn unlock_fair(&self) {
        or_panic(Self::unlock_fair(self));
    }

    unsafe fn bump(&self) {
        if self.sync.has_queued_threads() {
            or_panic(Self::unlock_fair(self));
            Self::lock(self);
        }
    }
}

#[cfg(all(feature = "lock_api", not(loom)))]
unsafe impl lock_api::RawMutexTimed for RawMutex {
    type Duration = Duration;
    type Instant = std::time::Instant;

    fn try_lock_for(&self, timeout: Duration) -> bool {
        timed(self.sync.try_acquire_for(1, timeout))
    }

    fn try_lock_until(&self, deadline: std::time::Instant) -> bool {
        timed(self.sync.try_acquire_until(1, deadline))
    }
}

/// Maps a timed acquire to what `lock_api` expects: an interrupt gives up
/// and stays pending.
#[cfg(all(feature = "lock_api", not(loom)))]
pub(super) fn timed(result: Result<bool>) -> bool {
    match result {
        Err(SyncError::Interrupted) => {
            park::reassert_interrupt();
            false
        }
        result => or_panic(result),
    }
}

/// A mutual exclusion primitive useful for protecting shared data, backed by
/// a [`RawMutex`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use queued_sync::locks::Mutex;
///
/// let mutex = Arc::new(Mutex::new(0));
/// let c_mutex = Arc::clone(&mutex);
///
/// thread::spawn(move || *c_mutex.lock() = 10).join().unwrap();
/// assert_eq!(*mutex.lock(), 10);
/// ```
#[cfg(all(feature = "lock_api", not(loom)))]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;

/// An RAII guard of a [`Mutex`], unlocks it when dropped.
#[cfg(all(feature = "lock_api", not(loom)))]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::RawMutex;
    use crate::error::SyncError;
    use crate::test::{tests, wait_for_queued};

    #[test]
    fn unlock_requires_owner() {
        let mutex = Arc::new(RawMutex::new());
        assert_eq!(mutex.unlock(), Err(SyncError::IllegalMonitorState));
        mutex.lock();
        let c_mutex = Arc::clone(&mutex);
        let result = thread::spawn(move || c_mutex.unlock()).join().unwrap();
        assert_eq!(result, Err(SyncError::IllegalMonitorState));
        assert!(mutex.is_held_by_current_thread());
        mutex.unlock().unwrap();
    }

    /// Frees the mutex without waking the queued thread, then tries to
    /// barge past it.
    fn barge(mutex: RawMutex) -> bool {
        let mutex = Arc::new(mutex);
        mutex.lock();
        let c_mutex = Arc::clone(&mutex);
        let handle = thread::spawn(move || {
            c_mutex.lock();
            c_mutex.unlock().unwrap();
        });
        wait_for_queued(mutex.sync(), 1);
        thread::sleep(Duration::from_millis(50));
        mutex.sync().core().set_state(0);
        let barged = mutex.try_lock();
        if !barged {
            mutex.sync().core().set_state(1);
        }
        mutex.unlock().unwrap();
        handle.join().unwrap();
        barged
    }

    #[test]
    fn barging_versus_fairness() {
        assert!(barge(RawMutex::new()));
        assert!(!barge(RawMutex::fair()));
        assert!(RawMutex::fair().is_fair());
    }

    #[test]
    fn unlock_fair_hands_over() {
        let mutex = Arc::new(RawMutex::new());
        mutex.lock();
        let (tx, rx) = channel::<()>();
        let c_mutex = Arc::clone(&mutex);
        let handle = thread::spawn(move || {
            c_mutex.lock();
            rx.recv().unwrap();
            c_mutex.unlock().unwrap();
        });
        wait_for_queued(mutex.sync(), 1);
        mutex.unlock_fair().unwrap();
        // Whether or not the waiter already woke up, it goes first.
        assert!(!mutex.try_lock());
        tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(mutex.try_lock());
        mutex.unlock().unwrap();
        assert_eq!(mutex.unlock_fair(), Err(SyncError::IllegalMonitorState));
    }

    #[test]
    fn try_lock_for_times_out() {
        let mutex = Arc::new(RawMutex::new());
        mutex.lock();
        let c_mutex = Arc::clone(&mutex);
        let acquired = thread::spawn(move || c_mutex.try_lock_for(Duration::from_millis(20)));
        assert_eq!(acquired.join().unwrap(), Ok(false));
        assert_eq!(mutex.sync().queue_length(), 0);
        mutex.unlock().unwrap();
    }

    #[test]
    fn mutual_exclusion() {
        tests::mutual_exclusion(RawMutex::new);
        tests::mutual_exclusion(RawMutex::fair);
    }

    #[test]
    fn no_lost_wakeup() {
        tests::no_lost_wakeup(RawMutex::new);
    }

    #[test]
    fn fifo_under_fairness() {
        tests::fifo_under_fairness(RawMutex::fair);
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::RawMutex;
    use crate::loom::models;

    #[test]
    fn lock_join() {
        models::lock_join(RawMutex::new);
    }

    #[test]
    fn fair_lock_join() {
        models::lock_join(RawMutex::fair);
    }

    #[test]
    fn try_lock_join() {
        models::try_lock_join(RawMutex::new);
    }

    #[test]
    fn mixed_lock_join() {
        models::mixed_lock_join(RawMutex::new);
    }
}
