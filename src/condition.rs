//! Condition queues.
//!
//! A [`ConditionObject`] lets a thread that holds a synchronizer exclusively
//! give it up, wait until another holder signals, and get it back before
//! returning. Waiters sit on a private FIFO list while they wait. A signal
//! moves the first of them to the synchronizer's wait queue, where it
//! contends again like any other acquirer.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};
use crate::error::{Result, SyncError};
use crate::node::{Node, NodeRef, CONDITION};
use crate::park::{self, Parker};
use crate::relax::{Relax, Spin};
use crate::sync::{Outcome, QueuedSynchronizer, Synchronizer, Wait, SPIN_FOR_TIMEOUT_THRESHOLD};

/// What a condition waiter owes its caller once it got the synchronizer back.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// Interrupted before being signalled, report it as an error.
    Throw,
    /// Interrupted after being signalled, raise the flag again.
    Reassert,
}

/// A condition variable bound to one [`QueuedSynchronizer`].
///
/// Every operation takes the synchronizer it was created by, and fails with
/// [`SyncError::IllegalMonitorState`] if given another one or if the calling
/// thread does not hold it exclusively. Waiting operations fully release the
/// synchronizer, whatever its hold count, and restore it before returning.
///
/// Waiters are signalled in the order they started waiting.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// use queued_sync::locks::ReentrantLock;
///
/// # fn main() -> queued_sync::Result<()> {
/// let lock = Arc::new(ReentrantLock::new());
/// let ready = Arc::new(lock.new_condition());
///
/// // The signaller can only get the lock once we wait and release it.
/// lock.lock()?;
/// let c_lock = Arc::clone(&lock);
/// let c_ready = Arc::clone(&ready);
/// let handle = thread::spawn(move || {
///     c_lock.lock().unwrap();
///     c_ready.signal(c_lock.sync()).unwrap();
///     c_lock.unlock().unwrap();
/// });
///
/// let signalled = ready.wait_timeout(lock.sync(), Duration::from_secs(10))?;
/// assert!(signalled);
/// assert!(lock.is_held_by_current_thread());
/// lock.unlock()?;
/// handle.join().unwrap();
/// # Ok(())
/// # }
/// ```
pub struct ConditionObject {
    owner: usize,
    waiters: UnsafeCell<VecDeque<NodeRef>>,
}

// SAFETY: The waiter list is only accessed by the thread that holds the owner
// synchronizer exclusively, which is checked by every operation before
// touching it.
unsafe impl Sync for ConditionObject {}
// SAFETY: `NodeRef` is `Send`.
unsafe impl Send for ConditionObject {}

impl ConditionObject {
    /// Creates a condition owned by the synchronizer identified by `owner`.
    pub(crate) fn new(owner: usize) -> Self {
        Self { owner, waiters: UnsafeCell::new(VecDeque::new()) }
    }

    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    /// Waits until signalled or interrupted.
    ///
    /// If interrupted before being signalled, returns
    /// [`SyncError::Interrupted`] once the synchronizer is held again. If
    /// interrupted after, returns `Ok(())` with the interrupt flag raised.
    pub fn wait<S: Synchronizer>(&self, sync: &QueuedSynchronizer<S>) -> Result<()> {
        if park::interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_held(sync)?;
        let node = self.add_waiter();
        let saved = sync.fully_release(&node)?;
        let mut interrupt = None;
        while !sync.is_on_sync_queue(&node) {
            park::park(sync.token());
            interrupt = check_interrupt(sync, &node);
            if interrupt.is_some() {
                break;
            }
        }
        let moved_itself = interrupt == Some(Interrupt::Throw);
        self.reacquire(sync, &node, saved, moved_itself, interrupt)
    }

    /// Waits until signalled, ignoring interrupts.
    ///
    /// An interrupt received while waiting is raised again before returning.
    pub fn wait_uninterruptibly<S: Synchronizer>(
        &self,
        sync: &QueuedSynchronizer<S>,
    ) -> Result<()> {
        self.check_held(sync)?;
        let node = self.add_waiter();
        let saved = sync.fully_release(&node)?;
        let mut interrupted = false;
        while !sync.is_on_sync_queue(&node) {
            park::park(sync.token());
            if park::interrupted() {
                interrupted = true;
            }
        }
        let outcome = sync.acquire_queued(&node, saved, Wait::Uninterruptible)?;
        if interrupted || matches!(outcome, Outcome::Acquired { interrupted: true }) {
            park::reassert_interrupt();
        }
        Ok(())
    }

    /// Waits until signalled, interrupted, or `timeout` elapsed.
    ///
    /// Returns `Ok(false)` if the time ran out before a signal arrived. The
    /// synchronizer is held again in every case but a policy error.
    pub fn wait_timeout<S: Synchronizer>(
        &self,
        sync: &QueuedSynchronizer<S>,
        timeout: Duration,
    ) -> Result<bool> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(sync, deadline),
            None => self.wait(sync).map(|()| true),
        }
    }

    /// Waits until signalled, interrupted, or `deadline` passed.
    ///
    /// Returns `Ok(false)` if the deadline passed before a signal arrived.
    pub fn wait_until<S: Synchronizer>(
        &self,
        sync: &QueuedSynchronizer<S>,
        deadline: Instant,
    ) -> Result<bool> {
        if park::interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_held(sync)?;
        let node = self.add_waiter();
        let saved = sync.fully_release(&node)?;
        let mut timed_out = false;
        let mut interrupt = None;
        let mut spin = Spin::new();
        while !sync.is_on_sync_queue(&node) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = sync.transfer_after_cancelled_wait(&node);
                break;
            }
            if remaining > SPIN_FOR_TIMEOUT_THRESHOLD {
                park::park_timeout(sync.token(), remaining);
            } else {
                spin.relax();
            }
            interrupt = check_interrupt(sync, &node);
            if interrupt.is_some() {
                break;
            }
        }
        if timed_out {
            tracing::trace!(sync = sync.token(), "condition wait timed out");
        }
        let moved_itself = timed_out || interrupt == Some(Interrupt::Throw);
        self.reacquire(sync, &node, saved, moved_itself, interrupt).map(|()| !timed_out)
    }

    /// Moves the longest waiting thread, if any, to the synchronizer's wait
    /// queue. It returns from its wait once it acquires the synchronizer.
    pub fn signal<S: Synchronizer>(&self, sync: &QueuedSynchronizer<S>) -> Result<()> {
        self.check_held(sync)?;
        // SAFETY: Held exclusively, checked above.
        unsafe {
            self.waiters.with_mut_unchecked(|waiters| {
                // Skip waiters that cancelled in the meantime.
                while let Some(first) = waiters.pop_front() {
                    if sync.transfer_for_signal(&first) {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    /// Moves every waiting thread to the synchronizer's wait queue, in the
    /// order they started waiting.
    pub fn signal_all<S: Synchronizer>(&self, sync: &QueuedSynchronizer<S>) -> Result<()> {
        self.check_held(sync)?;
        // SAFETY: Held exclusively, checked above.
        unsafe {
            self.waiters.with_mut_unchecked(|waiters| {
                for node in waiters.drain(..) {
                    sync.transfer_for_signal(&node);
                }
            });
        }
        Ok(())
    }

    /// Returns `true` if any thread is waiting on this condition.
    pub fn has_waiters<S: Synchronizer>(&self, sync: &QueuedSynchronizer<S>) -> Result<bool> {
        self.check_held(sync)?;
        // SAFETY: Held exclusively, checked above.
        Ok(unsafe { self.waiters.with_unchecked(|waiters| waiters.iter().any(is_waiting)) })
    }

    /// Returns an estimate of the number of threads waiting on this
    /// condition.
    pub fn wait_queue_length<S: Synchronizer>(
        &self,
        sync: &QueuedSynchronizer<S>,
    ) -> Result<usize> {
        self.check_held(sync)?;
        let len = |waiters: &VecDeque<NodeRef>| {
            waiters.iter().filter(|node| is_waiting(node)).count()
        };
        // SAFETY: Held exclusively, checked above.
        Ok(unsafe { self.waiters.with_unchecked(len) })
    }

    /// Returns the threads that may be waiting on this condition, longest
    /// waiting first.
    pub fn waiting_threads<S: Synchronizer>(
        &self,
        sync: &QueuedSynchronizer<S>,
    ) -> Result<Vec<Parker>> {
        self.check_held(sync)?;
        let threads = |waiters: &VecDeque<NodeRef>| {
            let waiting = waiters.iter().filter(|node| is_waiting(node));
            waiting.filter_map(|node| node.waiter().cloned()).collect()
        };
        // SAFETY: Held exclusively, checked above.
        Ok(unsafe { self.waiters.with_unchecked(threads) })
    }

    /// Fails unless `sync` owns this condition and the calling thread holds
    /// it exclusively.
    fn check_held<S: Synchronizer>(&self, sync: &QueuedSynchronizer<S>) -> Result<()> {
        if sync.owns(self) && sync.is_held_exclusively()? {
            Ok(())
        } else {
            Err(SyncError::IllegalMonitorState)
        }
    }

    /// Appends a node for the calling thread, which holds the owner.
    fn add_waiter(&self) -> NodeRef {
        let node = Node::condition(park::current());
        // SAFETY: Only called after `check_held`.
        unsafe {
            self.waiters.with_mut_unchecked(|waiters| {
                if waiters.back().map_or(false, |last| !is_waiting(last)) {
                    unlink_cancelled_waiters(waiters);
                }
                waiters.push_back(node.clone());
            });
        }
        node
    }

    /// Gets the synchronizer back for a waiter that left the condition,
    /// then reports how the wait ended.
    fn reacquire<S: Synchronizer>(
        &self,
        sync: &QueuedSynchronizer<S>,
        node: &Node,
        saved: i32,
        moved_itself: bool,
        mut interrupt: Option<Interrupt>,
    ) -> Result<()> {
        let outcome = sync.acquire_queued(node, saved, Wait::Uninterruptible)?;
        let interrupted = matches!(outcome, Outcome::Acquired { interrupted: true });
        if interrupted && interrupt != Some(Interrupt::Throw) {
            interrupt = Some(Interrupt::Reassert);
        }
        // Signalled nodes were popped, but one that moved itself is still
        // on the list.
        if moved_itself {
            // SAFETY: The synchronizer was just reacquired exclusively.
            unsafe { self.waiters.with_mut_unchecked(unlink_cancelled_waiters) };
        }
        match interrupt {
            Some(Interrupt::Throw) => Err(SyncError::Interrupted),
            Some(Interrupt::Reassert) => {
                park::reassert_interrupt();
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ConditionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionObject").field("owner", &self.owner).finish_non_exhaustive()
    }
}

fn is_waiting(node: &NodeRef) -> bool {
    node.status() == CONDITION
}

/// Drops every node that is no longer waiting on the condition.
fn unlink_cancelled_waiters(waiters: &mut VecDeque<NodeRef>) {
    waiters.retain(is_waiting);
}

/// Checks for an interrupt while waiting on a condition. If one happened,
/// returns whether it must be reported as an error or reasserted.
fn check_interrupt<S>(sync: &QueuedSynchronizer<S>, node: &Node) -> Option<Interrupt>
where
    S: Synchronizer,
{
    park::interrupted().then(|| {
        if sync.transfer_after_cancelled_wait(node) {
            Interrupt::Throw
        } else {
            Interrupt::Reassert
        }
    })
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::error::SyncError;
    use crate::locks::ReentrantLock;
    use crate::park;
    use crate::test::{wait_for_condition_waiters, wait_for_queued};

    #[test]
    fn requires_holding() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        assert_eq!(cond.signal(lock.sync()), Err(SyncError::IllegalMonitorState));
        assert_eq!(cond.wait(lock.sync()), Err(SyncError::IllegalMonitorState));
        assert_eq!(cond.has_waiters(lock.sync()), Err(SyncError::IllegalMonitorState));
        assert_eq!(lock.sync().state(), 0);
    }

    #[test]
    fn requires_owner() {
        let one = ReentrantLock::new();
        let two = ReentrantLock::new();
        let cond = one.new_condition();
        two.lock().unwrap();
        assert_eq!(cond.signal_all(two.sync()), Err(SyncError::IllegalMonitorState));
        let result = cond.wait_timeout(two.sync(), Duration::ZERO);
        assert_eq!(result, Err(SyncError::IllegalMonitorState));
        assert_eq!(two.hold_count(), 1);
        two.unlock().unwrap();
    }

    #[test]
    fn usable_after_moving_the_lock() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        let lock = Arc::new(lock);
        lock.lock().unwrap();
        assert_eq!(cond.signal(lock.sync()), Ok(()));
        assert!(!cond.wait_timeout(lock.sync(), Duration::from_millis(1)).unwrap());
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
    }

    #[test]
    fn signal_without_waiters() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        lock.lock().unwrap();
        cond.signal(lock.sync()).unwrap();
        cond.signal_all(lock.sync()).unwrap();
        assert!(!cond.has_waiters(lock.sync()).unwrap());
        assert_eq!(cond.wait_queue_length(lock.sync()).unwrap(), 0);
        assert!(cond.waiting_threads(lock.sync()).unwrap().is_empty());
        lock.unlock().unwrap();
    }

    #[test]
    fn timeout_restores_hold_count() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        lock.lock().unwrap();
        lock.lock().unwrap();
        let start = Instant::now();
        assert!(!cond.wait_timeout(lock.sync(), Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(lock.hold_count(), 2);
        // The timed out node was removed from the condition.
        assert_eq!(cond.wait_queue_length(lock.sync()).unwrap(), 0);
        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn elapsed_deadline_still_releases() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        lock.lock().unwrap();
        assert!(!cond.wait_until(lock.sync(), Instant::now()).unwrap());
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
    }

    #[test]
    fn signal_wakes_one_in_order() {
        let lock = Arc::new(ReentrantLock::new());
        let cond = Arc::new(lock.new_condition());
        let woken = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (n, name) in ["x", "y", "z"].into_iter().enumerate() {
            let c_lock = Arc::clone(&lock);
            let c_cond = Arc::clone(&cond);
            let c_woken = Arc::clone(&woken);
            handles.push(thread::spawn(move || {
                c_lock.lock().unwrap();
                c_cond.wait_uninterruptibly(c_lock.sync()).unwrap();
                c_woken.lock().unwrap().push(name);
                c_lock.unlock().unwrap();
            }));
            wait_for_condition_waiters(&lock, &cond, n + 1);
        }

        lock.lock().unwrap();
        assert_eq!(cond.waiting_threads(lock.sync()).unwrap().len(), 3);
        cond.signal(lock.sync()).unwrap();
        assert_eq!(cond.wait_queue_length(lock.sync()).unwrap(), 2);
        // Moved to the lock's queue, not running yet.
        assert_eq!(lock.sync().queue_length(), 1);
        lock.unlock().unwrap();
        while woken.lock().unwrap().len() < 1 {
            thread::yield_now();
        }

        lock.lock().unwrap();
        cond.signal_all(lock.sync()).unwrap();
        assert!(!cond.has_waiters(lock.sync()).unwrap());
        assert_eq!(lock.sync().queue_length(), 2);
        lock.unlock().unwrap();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*woken.lock().unwrap(), ["x", "y", "z"]);
    }

    #[test]
    fn interrupted_before_signal() {
        let lock = Arc::new(ReentrantLock::new());
        let cond = Arc::new(lock.new_condition());
        let (tx, rx) = channel();
        let c_lock = Arc::clone(&lock);
        let c_cond = Arc::clone(&cond);
        let handle = thread::spawn(move || {
            c_lock.lock().unwrap();
            tx.send(park::current()).unwrap();
            let result = c_cond.wait(c_lock.sync());
            let held = c_lock.is_held_by_current_thread();
            c_lock.unlock().unwrap();
            (result, held)
        });
        let parker = rx.recv().unwrap();
        wait_for_condition_waiters(&lock, &cond, 1);
        parker.interrupt();
        let (result, held) = handle.join().unwrap();
        assert_eq!(result, Err(SyncError::Interrupted));
        assert!(held);
        lock.lock().unwrap();
        assert_eq!(cond.wait_queue_length(lock.sync()).unwrap(), 0);
        lock.unlock().unwrap();
    }

    #[test]
    fn interrupted_after_signal() {
        let lock = Arc::new(ReentrantLock::new());
        let cond = Arc::new(lock.new_condition());
        let (tx, rx) = channel();
        let c_lock = Arc::clone(&lock);
        let c_cond = Arc::clone(&cond);
        let handle = thread::spawn(move || {
            c_lock.lock().unwrap();
            tx.send(park::current()).unwrap();
            let result = c_cond.wait(c_lock.sync());
            c_lock.unlock().unwrap();
            (result, park::interrupted())
        });
        let parker = rx.recv().unwrap();
        wait_for_condition_waiters(&lock, &cond, 1);
        lock.lock().unwrap();
        cond.signal(lock.sync()).unwrap();
        // Signalled first, so the interrupt can only be reasserted.
        wait_for_queued(lock.sync(), 1);
        parker.interrupt();
        lock.unlock().unwrap();
        let (result, interrupted) = handle.join().unwrap();
        assert_eq!(result, Ok(()));
        assert!(interrupted);
    }
}
