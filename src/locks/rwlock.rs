use core::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use crate::cfg::atomic::AtomicUsize;
use crate::condition::ConditionObject;
use crate::error::{Result, SyncError};
use crate::park;
use crate::sync::{QueuedSynchronizer, SyncCore, Synchronizer};

use super::or_panic;

const SHARED_SHIFT: u32 = 16;
const SHARED_UNIT: i32 = 1 << SHARED_SHIFT;
const MAX_COUNT: i32 = (1 << SHARED_SHIFT) - 1;
const EXCLUSIVE_MASK: i32 = (1 << SHARED_SHIFT) - 1;

/// Number of read holds in `state`.
fn shared_count(state: i32) -> i32 {
    // Logical shift, the sign bit is part of the count.
    ((state as u32) >> SHARED_SHIFT) as i32
}

/// Number of write holds in `state`.
fn exclusive_count(state: i32) -> i32 {
    state & EXCLUSIVE_MASK
}

/// The policy of [`RawRwLock`].
///
/// The upper half of the state counts read holds, the lower half counts the
/// write holds of `owner`. Both saturate at 65535.
#[derive(Debug)]
pub struct ReadWrite {
    fair: bool,
    owner: AtomicUsize,
}

impl ReadWrite {
    #[cfg(not(all(loom, test)))]
    const fn new(fair: bool) -> Self {
        Self { fair, owner: AtomicUsize::new(0) }
    }

    #[cfg(all(loom, test))]
    fn new(fair: bool) -> Self {
        Self { fair, owner: AtomicUsize::new(0) }
    }

    fn is_owner(&self) -> bool {
        self.owner.load(Relaxed) == park::current_id()
    }

    /// Whether a reader that could acquire should queue instead.
    ///
    /// An unfair lock still lets a queued writer go first, so that a steady
    /// flow of readers can't starve it.
    fn reader_should_block(&self, core: &SyncCore) -> bool {
        if self.fair {
            core.has_queued_predecessors()
        } else {
            core.apparently_first_queued_is_exclusive()
        }
    }

    fn writer_should_block(&self, core: &SyncCore) -> bool {
        self.fair && core.has_queued_predecessors()
    }

    /// Takes a read hold unless another thread holds the write lock, or
    /// `queue` is set and [`reader_should_block`](Self::reader_should_block).
    fn acquire_read(&self, core: &SyncCore, queue: bool) -> Result<i32> {
        loop {
            let state = core.state();
            if exclusive_count(state) != 0 {
                // The writer may downgrade, blocking it would deadlock.
                if !self.is_owner() {
                    return Ok(-1);
                }
            } else if queue && self.reader_should_block(core) {
                return Ok(-1);
            }
            if shared_count(state) == MAX_COUNT {
                return Err(SyncError::Saturated("read lock"));
            }
            if core.compare_and_set_state(state, state.wrapping_add(SHARED_UNIT)) {
                return Ok(1);
            }
        }
    }
}

// SAFETY: `is_held_exclusively` compares the owner with the calling thread,
// and only the thread that write locked stores its id in `owner`.
unsafe impl Synchronizer for ReadWrite {
    fn try_acquire(&self, core: &SyncCore, acquires: i32) -> Result<bool> {
        let state = core.state();
        if state != 0 {
            // Readers hold it, or another writer does.
            if exclusive_count(state) == 0 || !self.is_owner() {
                return Ok(false);
            }
            if exclusive_count(state) + exclusive_count(acquires) > MAX_COUNT {
                return Err(SyncError::Saturated("write lock"));
            }
            core.set_state(state + acquires);
            return Ok(true);
        }
        if self.writer_should_block(core) || !core.compare_and_set_state(0, acquires) {
            return Ok(false);
        }
        self.owner.store(park::current_id(), Relaxed);
        Ok(true)
    }

    fn try_release(&self, core: &SyncCore, releases: i32) -> Result<bool> {
        if !self.is_held_exclusively(core)? {
            return Err(SyncError::IllegalMonitorState);
        }
        let state = core.state() - releases;
        let free = exclusive_count(state) == 0;
        if free {
            self.owner.store(0, Relaxed);
        }
        core.set_state(state);
        Ok(free)
    }

    fn try_acquire_shared(&self, core: &SyncCore, _: i32) -> Result<i32> {
        self.acquire_read(core, true)
    }

    fn try_release_shared(&self, core: &SyncCore, _: i32) -> Result<bool> {
        loop {
            let state = core.state();
            if shared_count(state) == 0 {
                return Err(SyncError::IllegalMonitorState);
            }
            let next = state.wrapping_sub(SHARED_UNIT);
            if core.compare_and_set_state(state, next) {
                // Readers releasing don't matter to other readers, but may
                // let a writer in once all are gone.
                return Ok(next == 0);
            }
        }
    }

    fn is_held_exclusively(&self, core: &SyncCore) -> Result<bool> {
        Ok(exclusive_count(core.state()) != 0 && self.is_owner())
    }
}

/// A reader-writer lock.
///
/// Any number of readers, or a single writer, may hold it at a time. The
/// writer may lock it again for writing, and may also take read locks, which
/// lets it downgrade by read locking before write unlocking. Readers may not
/// upgrade.
///
/// Unless [`fair`], new readers queue behind a writer that is first in line,
/// which also means that recursive read locking may deadlock.
///
/// # Examples
///
/// ```
/// use queued_sync::locks::RawRwLock;
///
/// let lock = RawRwLock::new();
/// lock.read().unwrap();
/// lock.read().unwrap();
/// assert_eq!(lock.read_count(), 2);
/// assert!(!lock.try_write().unwrap());
/// lock.read_unlock().unwrap();
/// lock.read_unlock().unwrap();
/// assert!(lock.try_write().unwrap());
/// lock.write_unlock().unwrap();
/// ```
///
/// [`fair`]: RawRwLock::fair
#[derive(Debug)]
pub struct RawRwLock {
    sync: QueuedSynchronizer<ReadWrite>,
}

impl RawRwLock {
    /// Creates a new, unlocked and write-preferring lock (const).
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { sync: QueuedSynchronizer::new(ReadWrite::new(false)) }
    }

    /// Creates a new, unlocked lock that is granted in arrival order (const).
    #[cfg(not(all(loom, test)))]
    pub const fn fair() -> Self {
        Self { sync: QueuedSynchronizer::new(ReadWrite::new(true)) }
    }

    /// Creates a new, unlocked and write-preferring lock (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { sync: QueuedSynchronizer::new(ReadWrite::new(false)) }
    }

    /// Creates a new, unlocked lock that is granted in arrival order
    /// (non-const).
    #[cfg(all(loom, test))]
    pub fn fair() -> Self {
        Self { sync: QueuedSynchronizer::new(ReadWrite::new(true)) }
    }

    /// Acquires a read lock, blocking while a writer holds it or, unless
    /// fair, is first in line.
    pub fn read(&self) -> Result<()> {
        self.sync.acquire_shared(1)
    }

    /// Acquires a read lock, unless interrupted before or while waiting.
    pub fn read_interruptibly(&self) -> Result<()> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Attempts to acquire a read lock without blocking.
    ///
    /// Succeeds unless another thread holds the write lock, even if writers
    /// are queued or the lock is fair.
    pub fn try_read(&self) -> Result<bool> {
        Ok(self.sync.policy().acquire_read(self.sync.core(), false)? >= 0)
    }

    /// Attempts to acquire a read lock, waiting at most `timeout`.
    pub fn try_read_for(&self, timeout: Duration) -> Result<bool> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    /// Drops a read lock.
    pub fn read_unlock(&self) -> Result<()> {
        self.sync.release_shared(1).map(drop)
    }

    /// Acquires the write lock, or adds a hold if the calling thread already
    /// has it.
    pub fn write(&self) -> Result<()> {
        self.sync.acquire(1)
    }

    /// Acquires the write lock, unless interrupted before or while waiting.
    pub fn write_interruptibly(&self) -> Result<()> {
        self.sync.acquire_interruptibly(1)
    }

    /// Attempts to acquire the write lock without blocking.
    pub fn try_write(&self) -> Result<bool> {
        self.sync.policy().try_acquire(self.sync.core(), 1)
    }

    /// Attempts to acquire the write lock, waiting at most `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Result<bool> {
        self.sync.try_acquire_for(1, timeout)
    }

    /// Drops one hold of the write lock.
    pub fn write_unlock(&self) -> Result<()> {
        self.sync.release(1).map(drop)
    }

    /// Returns the number of read locks currently held, by all threads.
    pub fn read_count(&self) -> i32 {
        shared_count(self.sync.state())
    }

    /// Returns the number of write holds of the calling thread.
    pub fn write_hold_count(&self) -> i32 {
        if self.is_write_locked_by_current_thread() {
            exclusive_count(self.sync.state())
        } else {
            0
        }
    }

    /// Returns `true` if any thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        exclusive_count(self.sync.state()) != 0
    }

    /// Returns `true` if the calling thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        or_panic(self.sync.is_held_exclusively())
    }

    /// Returns `true` if this lock is granted in arrival order.
    pub fn is_fair(&self) -> bool {
        self.sync.policy().fair
    }

    /// Creates a new condition bound to the write lock.
    pub fn new_condition(&self) -> ConditionObject {
        self.sync.new_condition()
    }

    /// Returns the synchronizer, to use with conditions and queue queries.
    pub fn sync(&self) -> &QueuedSynchronizer<ReadWrite> {
        &self.sync
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl crate::test::Lock for RawRwLock {
    type Policy = ReadWrite;

    fn lock(&self) {
        or_panic(Self::write(self));
    }

    fn unlock(&self) {
        or_panic(Self::write_unlock(self));
    }

    fn sync(&self) -> &QueuedSynchronizer<ReadWrite> {
        Self::sync(self)
    }
}

#[cfg(all(feature = "lock_api", not(loom)))]
unsafe impl lock_api::RawRwLock for RawRwLock {
    type GuardMarker = lock_api::GuardNoSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    fn lock_shared(&self) {
        or_panic(self.read());
    }

    fn try_lock_shared(&self) -> bool {
        or_panic(self.try_read())
    }

    unsafe fn unlock_shared(&self) {
        or_panic(self.read_unlock());
    }

    fn lock_exclusive(&self) {
        or_panic(self.write());
    }

    fn try_lock_exclusive(&self) -> bool {
        or_panic(self.try_write())
    }

    unsafe fn unlock_exclusive(&self) {
        or_panic(self.write_unlock());
    }

    fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.is_write_locked()
    }
}

#[cfg(all(feature = "lock_api", not(loom)))]
unsafe impl lock_api::RawRwLockDowngrade for RawRwLock {
    unsafe fn downgrade(&self) {
        or_panic(self.read());
        or_panic(self.write_unlock());
    }
}

#[cfg(all(feature = "lock_api", not(loom)))]
unsafe impl lock_api::RawRwLockTimed for RawRwLock {
    type Duration = Duration;
    type Instant = std::time::Instant;

    fn try_lock_shared_for(&self, timeout: Duration) -> bool {
        super::mutex::timed(self.sync.try_acquire_shared_for(1, timeout))
    }

    fn try_lock_shared_until(&self, deadline: std::time::Instant) -> bool {
        super::mutex::timed(self.sync.try_acquire_shared_until(1, deadline))
    }

    fn try_lock_exclusive_for(&self, timeout: Duration) -> bool {
        super::mutex::timed(self.sync.try_acquire_for(1, timeout))
    }

    fn try_lock_exclusive_until(&self, deadline: std::time::Instant) -> bool {
        super::mutex::timed(self.sync.try_acquire_until(1, deadline))
    }
}

/// A reader-writer lock protecting shared data, backed by a [`RawRwLock`].
///
/// # Examples
///
/// ```
/// use queued_sync::locks::RwLock;
///
/// let lock = RwLock::new(5);
/// {
///     let r1 = lock.read();
///     let r2 = lock.read();
///     assert_eq!(*r1 + *r2, 10);
/// }
/// *lock.write() += 1;
/// assert_eq!(*lock.read(), 6);
/// ```
#[cfg(all(feature = "lock_api", not(loom)))]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;

/// An RAII guard of a read lock of a [`RwLock`].
#[cfg(all(feature = "lock_api", not(loom)))]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;

/// An RAII guard of the write lock of a [`RwLock`].
#[cfg(all(feature = "lock_api", not(loom)))]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{exclusive_count, shared_count, RawRwLock, MAX_COUNT, SHARED_SHIFT, SHARED_UNIT};
    use crate::error::SyncError;
    use crate::test::{tests, wait_for_queued};

    /// A state with every read hold taken.
    const ALL_READ: i32 = ((MAX_COUNT as u32) << SHARED_SHIFT) as i32;

    #[test]
    fn state_split() {
        let state = 3 * SHARED_UNIT + 2;
        assert_eq!(shared_count(state), 3);
        assert_eq!(exclusive_count(state), 2);
        assert_eq!(shared_count(ALL_READ), MAX_COUNT);
        assert_eq!(exclusive_count(ALL_READ), 0);
    }

    #[test]
    fn readers_then_writer() {
        let lock = Arc::new(RawRwLock::new());
        for _ in 0..3 {
            lock.read().unwrap();
        }
        assert_eq!(lock.read_count(), 3);

        let written = Arc::new(AtomicBool::new(false));
        let c_lock = Arc::clone(&lock);
        let c_written = Arc::clone(&written);
        let writer = thread::spawn(move || {
            c_lock.write().unwrap();
            c_written.store(true, Ordering::Relaxed);
            c_lock.write_unlock().unwrap();
        });
        wait_for_queued(lock.sync(), 1);

        for expected in [2, 1] {
            lock.read_unlock().unwrap();
            assert_eq!(lock.read_count(), expected);
            assert!(!written.load(Ordering::Relaxed));
        }
        lock.read_unlock().unwrap();
        writer.join().unwrap();
        assert!(written.load(Ordering::Relaxed));
        assert_eq!(lock.sync().state(), 0);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let lock = Arc::new(RawRwLock::new());
        lock.read().unwrap();
        let c_lock = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            c_lock.write().unwrap();
            c_lock.write_unlock().unwrap();
        });
        wait_for_queued(lock.sync(), 1);
        let c_lock = Arc::clone(&lock);
        let timed = move || c_lock.try_read_for(Duration::from_millis(20));
        assert_eq!(thread::spawn(timed).join().unwrap(), Ok(false));

        // Not blocking, so it does not wait for its turn either.
        let c_lock = Arc::clone(&lock);
        let barged = thread::spawn(move || {
            let barged = c_lock.try_read();
            c_lock.read_unlock().unwrap();
            barged
        });
        assert_eq!(barged.join().unwrap(), Ok(true));
        assert_eq!(lock.read_count(), 1);

        lock.read_unlock().unwrap();
        writer.join().unwrap();
        assert_eq!(lock.try_read(), Ok(true));
        lock.read_unlock().unwrap();
    }

    #[test]
    fn try_read_fails_against_a_writer() {
        let lock = Arc::new(RawRwLock::fair());
        lock.write().unwrap();
        let c_lock = Arc::clone(&lock);
        assert_eq!(thread::spawn(move || c_lock.try_read()).join().unwrap(), Ok(false));
        // The writer itself may read.
        assert_eq!(lock.try_read(), Ok(true));
        lock.read_unlock().unwrap();
        lock.write_unlock().unwrap();
    }

    #[test]
    fn shared_wakeups_propagate() {
        let lock = Arc::new(RawRwLock::new());
        lock.write().unwrap();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    lock.read().unwrap();
                    lock.read_unlock().unwrap();
                })
            })
            .collect();
        wait_for_queued(lock.sync(), 4);
        assert_eq!(lock.sync().shared_queued_threads().len(), 4);
        lock.write_unlock().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(lock.sync().state(), 0);
    }

    #[test]
    fn downgrade() {
        let lock = RawRwLock::new();
        lock.write().unwrap();
        lock.read().unwrap();
        lock.write_unlock().unwrap();
        assert!(!lock.is_write_locked());
        assert_eq!(lock.read_count(), 1);
        assert_eq!(lock.write_unlock(), Err(SyncError::IllegalMonitorState));
        lock.read_unlock().unwrap();
        assert_eq!(lock.read_unlock(), Err(SyncError::IllegalMonitorState));
    }

    #[test]
    fn write_holds_saturate() {
        let lock = RawRwLock::new();
        lock.sync().acquire(MAX_COUNT).unwrap();
        assert_eq!(lock.write_hold_count(), MAX_COUNT);
        assert_eq!(lock.write(), Err(SyncError::Saturated("write lock")));
        assert!(lock.sync().release(MAX_COUNT).unwrap());
    }

    #[test]
    fn read_holds_saturate() {
        let lock = RawRwLock::new();
        lock.sync().core().set_state(ALL_READ);
        assert_eq!(lock.read(), Err(SyncError::Saturated("read lock")));
        lock.sync().core().set_state(0);
    }

    #[test]
    fn mutual_exclusion() {
        tests::mutual_exclusion(RawRwLock::new);
        tests::mutual_exclusion(RawRwLock::fair);
    }

    #[test]
    fn fifo_under_fairness() {
        tests::fifo_under_fairness(RawRwLock::fair);
    }
}
