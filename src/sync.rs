//! The synchronizer engine.
//!
//! A [`QueuedSynchronizer`] owns one atomic state word and one wait queue.
//! What the state means, and when it can be acquired or released, is decided
//! by a [`Synchronizer`] policy. The engine only takes care of queueing,
//! parking, waking and cancelling the threads the policy turned away.

use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, SeqCst};
use std::time::{Duration, Instant};

use crossbeam_epoch::{self as epoch, Guard};

use crate::cfg::atomic::{AtomicI32, AtomicUsize};
use crate::condition::ConditionObject;
use crate::error::{Mode, Result, SyncError};
use crate::node::{Node, NodeRef, CONDITION, NORMAL, PROPAGATE, SIGNAL};
use crate::park::{self, Parker};
use crate::queue::WaitQueue;
use crate::relax::{relax_until, Relax, Spin, Yield};

/// Remaining waiting time below which a timed acquire spins instead of doing
/// a timed park.
pub const SPIN_FOR_TIMEOUT_THRESHOLD: Duration = Duration::from_nanos(1000);

/// Source of synchronizer ids, zero means not assigned yet.
static NEXT_ID: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(1);

/// The policy side of a synchronizer: how its state is acquired and released.
///
/// Every hook receives the engine's [`SyncCore`], through which it reads and
/// updates the state word and queries the wait queue, and the argument that
/// was passed to the engine's operation. Hooks must be thread-safe,
/// non-blocking, and must not change the state when they fail. A hook that
/// returns an error from inside the engine's wait loop cancels the caller's
/// wait, the error is then propagated to the caller.
///
/// Only implement the hooks of the modes your synchronizer supports, the
/// default implementations report [`SyncError::Unsupported`].
///
/// # Safety
///
/// [`is_held_exclusively`] must only return `Ok(true)` if the calling thread
/// currently holds the synchronizer exclusively. Condition queues rely on
/// it to serialize access to their waiter list.
///
/// [`is_held_exclusively`]: Synchronizer::is_held_exclusively
pub unsafe trait Synchronizer {
    /// Attempts to acquire in exclusive mode.
    ///
    /// Returns `Ok(true)` on success. It is also called by the engine on
    /// behalf of a condition waiter that reacquires, with the state it held
    /// when it started waiting.
    fn try_acquire(&self, core: &SyncCore, arg: i32) -> Result<bool> {
        let _ = (core, arg);
        Err(SyncError::Unsupported(Mode::Exclusive))
    }

    /// Attempts to release in exclusive mode.
    ///
    /// Returns `Ok(true)` if the synchronizer is now fully released, so that
    /// waiting threads may attempt to acquire.
    fn try_release(&self, core: &SyncCore, arg: i32) -> Result<bool> {
        let _ = (core, arg);
        Err(SyncError::Unsupported(Mode::Exclusive))
    }

    /// Attempts to acquire in shared mode.
    ///
    /// A negative value means failure. Zero means success, but no other
    /// shared acquire may succeed right after. A positive value means
    /// success, and the next shared waiter should try as well.
    fn try_acquire_shared(&self, core: &SyncCore, arg: i32) -> Result<i32> {
        let _ = (core, arg);
        Err(SyncError::Unsupported(Mode::Shared))
    }

    /// Attempts to release in shared mode.
    ///
    /// Returns `Ok(true)` if this release may allow a waiting acquire, shared
    /// or exclusive, to succeed.
    fn try_release_shared(&self, core: &SyncCore, arg: i32) -> Result<bool> {
        let _ = (core, arg);
        Err(SyncError::Unsupported(Mode::Shared))
    }

    /// Returns `Ok(true)` if the calling thread holds the synchronizer
    /// exclusively. Only needed to support conditions.
    fn is_held_exclusively(&self, core: &SyncCore) -> Result<bool> {
        let _ = core;
        Err(SyncError::Unsupported(Mode::Exclusive))
    }
}

/// The state word and wait queue of a synchronizer, as seen by its policy.
pub struct SyncCore {
    state: AtomicI32,
    queue: WaitQueue,
    id: AtomicUsize,
}

impl SyncCore {
    /// Creates a new core based state with `state` (const).
    #[cfg(not(all(loom, test)))]
    const fn new(state: i32) -> Self {
        Self { state: AtomicI32::new(state), queue: WaitQueue::new(), id: AtomicUsize::new(0) }
    }

    /// Creates a new loom based state with `state` (non-const).
    #[cfg(all(loom, test))]
    fn new(state: i32) -> Self {
        Self { state: AtomicI32::new(state), queue: WaitQueue::new(), id: AtomicUsize::new(0) }
    }

    /// Returns the current value of the state word.
    pub fn state(&self) -> i32 {
        self.state.load(SeqCst)
    }

    /// Returns the id of this synchronizer, assigning one on first use.
    ///
    /// Unlike its address, the id stays the same when the synchronizer is
    /// moved.
    fn id(&self) -> usize {
        let id = self.id.load(Acquire);
        if id != 0 {
            return id;
        }
        let new = NEXT_ID.fetch_add(1, Relaxed);
        match self.id.compare_exchange(0, new, AcqRel, Acquire) {
            Ok(_) => new,
            Err(id) => id,
        }
    }

    /// Sets the state word, for policies that hold it exclusively.
    pub fn set_state(&self, state: i32) {
        self.state.store(state, SeqCst);
    }

    /// Sets the state word to `update` if it currently is `expect`.
    pub fn compare_and_set_state(&self, expect: i32, update: i32) -> bool {
        self.state.compare_exchange(expect, update, SeqCst, SeqCst).is_ok()
    }

    /// Returns `true` if some threads may be waiting to acquire.
    ///
    /// Waiters can cancel at any time, so a `true` return does not
    /// guarantee that any other thread will ever acquire.
    pub fn has_queued_threads(&self) -> bool {
        self.queue.has_queued_threads()
    }

    /// Returns `true` if any thread has ever blocked on this synchronizer.
    pub fn has_contended(&self) -> bool {
        self.queue.has_contended()
    }

    /// Returns the thread that has been waiting the longest, if any.
    pub fn first_queued_thread(&self) -> Option<Parker> {
        self.queue.first_queued_thread()
    }

    /// Returns `true` if `thread` is currently waiting to acquire.
    pub fn is_queued(&self, thread: &Parker) -> bool {
        self.queue.is_queued(thread)
    }

    /// Returns `true` if some thread has been waiting longer than the calling
    /// thread.
    ///
    /// This is what a fair policy checks before acquiring: if it returns
    /// `true`, and the caller is not reacquiring something it already holds,
    /// the acquire attempt should fail.
    pub fn has_queued_predecessors(&self) -> bool {
        self.queue.has_queued_predecessors()
    }

    /// Returns `true` if the apparent first waiter is waiting in exclusive
    /// mode. Used by read/write policies to keep writers from starving.
    pub fn apparently_first_queued_is_exclusive(&self) -> bool {
        self.queue.apparently_first_queued_is_exclusive()
    }

    /// Returns an estimate of the number of waiting threads.
    pub fn queue_length(&self) -> usize {
        self.queue.queue_length()
    }

    /// Returns the threads that may be waiting to acquire, in no particular
    /// order.
    pub fn queued_threads(&self) -> Vec<Parker> {
        self.queue.queued_threads(None)
    }

    /// Returns the threads that may be waiting in exclusive mode.
    pub fn exclusive_queued_threads(&self) -> Vec<Parker> {
        self.queue.queued_threads(Some(Mode::Exclusive))
    }

    /// Returns the threads that may be waiting in shared mode.
    pub fn shared_queued_threads(&self) -> Vec<Parker> {
        self.queue.queued_threads(Some(Mode::Shared))
    }
}

/// How a queued acquire reacts to interrupts and time.
#[derive(Clone, Copy)]
pub(crate) enum Wait {
    Uninterruptible,
    Interruptible,
    Until(Instant),
}

/// How a queued acquire ended, errors aside.
pub(crate) enum Outcome {
    Acquired { interrupted: bool },
    TimedOut,
}

/// Cancels a queued node unless disarmed, on any early return or unwind.
struct CancelOnDrop<'a> {
    queue: &'a WaitQueue,
    node: Option<&'a Node>,
}

impl CancelOnDrop<'_> {
    fn disarm(&mut self) {
        self.node = None;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node {
            let guard = epoch::pin();
            self.queue.cancel_acquire(node, &guard);
        }
    }
}

/// A blocking synchronizer built from a policy, a state word and a FIFO wait
/// queue.
///
/// The fast path of every acquire is a single call to the policy hook. Only
/// threads that fail it are queued, and they park until a release hands them
/// another chance. New threads may barge ahead of queued ones, a policy that
/// wants strict FIFO order checks [`SyncCore::has_queued_predecessors`].
///
/// # Examples
///
/// ```
/// use queued_sync::{QueuedSynchronizer, Result, SyncCore, Synchronizer};
///
/// struct Flag;
///
/// // SAFETY: `is_held_exclusively` is not implemented.
/// unsafe impl Synchronizer for Flag {
///     fn try_acquire_shared(&self, core: &SyncCore, _: i32) -> Result<i32> {
///         Ok(if core.state() != 0 { 1 } else { -1 })
///     }
///
///     fn try_release_shared(&self, core: &SyncCore, _: i32) -> Result<bool> {
///         core.set_state(1);
///         Ok(true)
///     }
/// }
///
/// let flag = QueuedSynchronizer::new(Flag);
/// std::thread::scope(|s| {
///     s.spawn(|| flag.acquire_shared(1).unwrap());
///     s.spawn(|| flag.acquire_shared(1).unwrap());
///     flag.release_shared(1).unwrap();
/// });
/// ```
pub struct QueuedSynchronizer<S> {
    core: SyncCore,
    policy: S,
}

impl<S> QueuedSynchronizer<S> {
    /// Creates a new synchronizer with an initial state of zero.
    #[cfg(not(all(loom, test)))]
    pub const fn new(policy: S) -> Self {
        Self::with_state(policy, 0)
    }

    /// Creates a new synchronizer with an initial state of `state`.
    #[cfg(not(all(loom, test)))]
    pub const fn with_state(policy: S, state: i32) -> Self {
        Self { core: SyncCore::new(state), policy }
    }

    /// Creates a new loom based synchronizer (non-const).
    #[cfg(all(loom, test))]
    pub fn new(policy: S) -> Self {
        Self::with_state(policy, 0)
    }

    /// Creates a new loom based synchronizer with `state` (non-const).
    #[cfg(all(loom, test))]
    pub fn with_state(policy: S, state: i32) -> Self {
        Self { core: SyncCore::new(state), policy }
    }

    /// Returns the policy of this synchronizer.
    pub fn policy(&self) -> &S {
        &self.policy
    }

    /// Returns the state word and queue queries of this synchronizer.
    pub fn core(&self) -> &SyncCore {
        &self.core
    }

    /// Returns the current value of the state word.
    pub fn state(&self) -> i32 {
        self.core.state()
    }

    /// See [`SyncCore::has_queued_threads`].
    pub fn has_queued_threads(&self) -> bool {
        self.core.has_queued_threads()
    }

    /// See [`SyncCore::has_contended`].
    pub fn has_contended(&self) -> bool {
        self.core.has_contended()
    }

    /// See [`SyncCore::first_queued_thread`].
    pub fn first_queued_thread(&self) -> Option<Parker> {
        self.core.first_queued_thread()
    }

    /// See [`SyncCore::is_queued`].
    pub fn is_queued(&self, thread: &Parker) -> bool {
        self.core.is_queued(thread)
    }

    /// See [`SyncCore::has_queued_predecessors`].
    pub fn has_queued_predecessors(&self) -> bool {
        self.core.has_queued_predecessors()
    }

    /// See [`SyncCore::queue_length`].
    pub fn queue_length(&self) -> usize {
        self.core.queue_length()
    }

    /// See [`SyncCore::queued_threads`].
    pub fn queued_threads(&self) -> Vec<Parker> {
        self.core.queued_threads()
    }

    /// See [`SyncCore::exclusive_queued_threads`].
    pub fn exclusive_queued_threads(&self) -> Vec<Parker> {
        self.core.exclusive_queued_threads()
    }

    /// See [`SyncCore::shared_queued_threads`].
    pub fn shared_queued_threads(&self) -> Vec<Parker> {
        self.core.shared_queued_threads()
    }

    /// Creates a new condition bound to this synchronizer.
    pub fn new_condition(&self) -> ConditionObject {
        ConditionObject::new(self.core.id())
    }

    /// Returns `true` if `condition` was created by this synchronizer.
    pub fn owns(&self, condition: &ConditionObject) -> bool {
        condition.owner() == self.core.id()
    }

    /// Identifies this synchronizer in traces and as the blocker recorded
    /// while parked. Only meaningful while it is not moved, which is the
    /// case for as long as any thread waits on it.
    pub(crate) fn token(&self) -> usize {
        self as *const Self as usize
    }
}

impl<S: Synchronizer> QueuedSynchronizer<S> {
    /// Acquires in exclusive mode, ignoring interrupts.
    ///
    /// An interrupt received while waiting is raised again before returning.
    /// Errors only come from the policy.
    pub fn acquire(&self, arg: i32) -> Result<()> {
        if !self.policy.try_acquire(&self.core, arg)? {
            let node = self.add_waiter(Mode::Exclusive);
            if let Outcome::Acquired { interrupted: true } =
                self.acquire_queued(&node, arg, Wait::Uninterruptible)?
            {
                park::reassert_interrupt();
            }
        }
        Ok(())
    }

    /// Acquires in exclusive mode, aborting with [`SyncError::Interrupted`]
    /// if the thread is interrupted before or while waiting.
    pub fn acquire_interruptibly(&self, arg: i32) -> Result<()> {
        if park::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !self.policy.try_acquire(&self.core, arg)? {
            let node = self.add_waiter(Mode::Exclusive);
            self.acquire_queued(&node, arg, Wait::Interruptible)?;
        }
        Ok(())
    }

    /// Attempts to acquire in exclusive mode, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` if the time ran out. Interrupts abort the wait
    /// with [`SyncError::Interrupted`].
    pub fn try_acquire_for(&self, arg: i32, timeout: Duration) -> Result<bool> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_until(arg, deadline),
            None => self.acquire_interruptibly(arg).map(|()| true),
        }
    }

    /// Attempts to acquire in exclusive mode, waiting until `deadline`.
    ///
    /// Returns `Ok(false)` if the deadline passed. Interrupts abort the wait
    /// with [`SyncError::Interrupted`].
    pub fn try_acquire_until(&self, arg: i32, deadline: Instant) -> Result<bool> {
        if park::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire(&self.core, arg)? {
            return Ok(true);
        }
        if deadline <= Instant::now() {
            return Ok(false);
        }
        let node = self.add_waiter(Mode::Exclusive);
        let outcome = self.acquire_queued(&node, arg, Wait::Until(deadline))?;
        Ok(matches!(outcome, Outcome::Acquired { .. }))
    }

    /// Releases in exclusive mode.
    ///
    /// Returns what the policy returned: `Ok(true)` if the synchronizer is
    /// now fully released, in which case the first waiter is woken.
    pub fn release(&self, arg: i32) -> Result<bool> {
        if !self.policy.try_release(&self.core, arg)? {
            return Ok(false);
        }
        let guard = &epoch::pin();
        if let Some(head) = self.core.queue.head(guard) {
            if head.status() != NORMAL {
                self.core.queue.unpark_successor(head, guard);
            }
        }
        Ok(true)
    }

    /// Acquires in shared mode, ignoring interrupts.
    ///
    /// An interrupt received while waiting is raised again before returning.
    pub fn acquire_shared(&self, arg: i32) -> Result<()> {
        if self.policy.try_acquire_shared(&self.core, arg)? < 0 {
            let node = self.add_waiter(Mode::Shared);
            if let Outcome::Acquired { interrupted: true } =
                self.acquire_queued(&node, arg, Wait::Uninterruptible)?
            {
                park::reassert_interrupt();
            }
        }
        Ok(())
    }

    /// Acquires in shared mode, aborting with [`SyncError::Interrupted`] if
    /// the thread is interrupted before or while waiting.
    pub fn acquire_shared_interruptibly(&self, arg: i32) -> Result<()> {
        if park::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_shared(&self.core, arg)? < 0 {
            let node = self.add_waiter(Mode::Shared);
            self.acquire_queued(&node, arg, Wait::Interruptible)?;
        }
        Ok(())
    }

    /// Attempts to acquire in shared mode, waiting at most `timeout`.
    pub fn try_acquire_shared_for(&self, arg: i32, timeout: Duration) -> Result<bool> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_shared_until(arg, deadline),
            None => self.acquire_shared_interruptibly(arg).map(|()| true),
        }
    }

    /// Attempts to acquire in shared mode, waiting until `deadline`.
    pub fn try_acquire_shared_until(&self, arg: i32, deadline: Instant) -> Result<bool> {
        if park::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_shared(&self.core, arg)? >= 0 {
            return Ok(true);
        }
        if deadline <= Instant::now() {
            return Ok(false);
        }
        let node = self.add_waiter(Mode::Shared);
        let outcome = self.acquire_queued(&node, arg, Wait::Until(deadline))?;
        Ok(matches!(outcome, Outcome::Acquired { .. }))
    }

    /// Releases in shared mode.
    ///
    /// Returns what the policy returned: `Ok(true)` if waiters may now
    /// acquire, in which case they are woken.
    pub fn release_shared(&self, arg: i32) -> Result<bool> {
        if !self.policy.try_release_shared(&self.core, arg)? {
            return Ok(false);
        }
        self.release_shared_waiters(&epoch::pin());
        Ok(true)
    }

    /// Returns `true` if the calling thread holds this synchronizer
    /// exclusively, as reported by the policy.
    pub fn is_held_exclusively(&self) -> Result<bool> {
        self.policy.is_held_exclusively(&self.core)
    }

    /// Creates a node for the calling thread and appends it to the queue.
    fn add_waiter(&self, mode: Mode) -> NodeRef {
        let node = Node::queued(park::current(), mode);
        let guard = &epoch::pin();
        self.core.queue.enqueue(&node, guard);
        tracing::trace!(sync = self.token(), %mode, "waiter enqueued");
        node
    }

    /// Waits on an already queued `node` until it acquires, gives up or the
    /// policy fails. The node is cancelled on every path but success.
    pub(crate) fn acquire_queued(&self, node: &Node, arg: i32, wait: Wait) -> Result<Outcome> {
        let queue = &self.core.queue;
        let mut cancel = CancelOnDrop { queue, node: Some(node) };
        let mut interrupted = false;
        let mut spin = Spin::new();
        loop {
            // Never stay pinned while parked.
            let (should_park, remaining) = {
                let guard = &epoch::pin();
                let pred = predecessor(node, guard);
                if queue.is_head(pred) && self.try_acquire_queued(node, arg, guard)? {
                    // Help the old head get reclaimed.
                    pred.next.clear(guard);
                    cancel.disarm();
                    return Ok(Outcome::Acquired { interrupted });
                }
                let remaining = match wait {
                    Wait::Until(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            tracing::trace!(sync = self.token(), "acquire timed out");
                            return Ok(Outcome::TimedOut);
                        }
                        Some(remaining)
                    }
                    _ => None,
                };
                (queue.should_park_after_failed_acquire(pred, node, guard), remaining)
            };
            match remaining {
                Some(remaining) if remaining <= SPIN_FOR_TIMEOUT_THRESHOLD => spin.relax(),
                _ if !should_park => {}
                timeout => self.park(timeout),
            }
            let check = matches!(wait, Wait::Until(_)) || should_park;
            if check && park::interrupted() {
                match wait {
                    Wait::Uninterruptible => interrupted = true,
                    _ => return Err(SyncError::Interrupted),
                }
            }
        }
    }

    /// Calls the policy for a queued `node` whose predecessor is head, making
    /// the node head on success.
    fn try_acquire_queued(&self, node: &Node, arg: i32, guard: &Guard) -> Result<bool> {
        match node.mode() {
            Mode::Exclusive => {
                let acquired = self.policy.try_acquire(&self.core, arg)?;
                if acquired {
                    self.core.queue.set_head(node, guard);
                }
                Ok(acquired)
            }
            Mode::Shared => {
                let propagate = self.policy.try_acquire_shared(&self.core, arg)?;
                if propagate >= 0 {
                    self.set_head_and_propagate(node, propagate, guard);
                }
                Ok(propagate >= 0)
            }
        }
    }

    /// Parks the calling thread, for at most `timeout` if any.
    fn park(&self, timeout: Option<Duration>) {
        tracing::trace!(sync = self.token(), ?timeout, "parking");
        match timeout {
            None => park::park(self.token()),
            Some(timeout) => park::park_timeout(self.token(), timeout),
        }
    }

    /// Makes `node` head and, if more shared acquires may succeed, wakes the
    /// next waiter.
    fn set_head_and_propagate(&self, node: &Node, propagate: i32, guard: &Guard) {
        let queue = &self.core.queue;
        let old = queue.head(guard);
        queue.set_head(node, guard);
        // Either the policy asked for it, or a release recorded that
        // propagation is owed on the old or the new head. Checking both may
        // cause an unnecessary wake-up, but never misses one.
        let owed = |head: Option<&Node>| head.map_or(true, |head| head.status() < 0);
        if propagate > 0 || owed(old) || owed(queue.head(guard)) {
            let next = node.next.load(Acquire, guard);
            if next.map_or(true, Node::is_shared) {
                self.release_shared_waiters(guard);
            }
        }
    }

    /// Wakes the successor of head, or marks head so that the release
    /// propagates to the next shared acquire.
    fn release_shared_waiters(&self, guard: &Guard) {
        let queue = &self.core.queue;
        loop {
            let head = queue.head(guard);
            if let (Some(head), Some(tail)) = (head, queue.tail(guard)) {
                if !core::ptr::eq(head, tail) {
                    let status = head.status();
                    if status == SIGNAL {
                        if !head.compare_and_set_status(SIGNAL, NORMAL) {
                            continue;
                        }
                        queue.unpark_successor(head, guard);
                    } else if status == NORMAL && !head.compare_and_set_status(NORMAL, PROPAGATE) {
                        continue;
                    }
                }
            }
            // Head changed meanwhile, the new one may need waking too.
            let same = match head {
                Some(head) => queue.is_head(head),
                None => queue.head(guard).is_none(),
            };
            if same {
                break;
            }
        }
    }

    /// Releases the whole state held by the calling thread, on behalf of a
    /// condition waiter owning `node`. Returns the state to reacquire with.
    pub(crate) fn fully_release(&self, node: &Node) -> Result<i32> {
        let saved = self.core.state();
        let released = self.release(saved).and_then(|released| {
            released.then_some(saved).ok_or(SyncError::IllegalMonitorState)
        });
        if released.is_err() {
            node.set_cancelled();
        }
        released
    }

    /// Moves a signalled condition `node` to the wait queue.
    ///
    /// Returns `false` if the node was cancelled before it was signalled.
    pub(crate) fn transfer_for_signal(&self, node: &Node) -> bool {
        if !node.compare_and_set_status(CONDITION, NORMAL) {
            return false;
        }
        let guard = &epoch::pin();
        let pred = self.core.queue.enqueue(node, guard);
        tracing::trace!(sync = self.token(), "condition waiter transferred");
        // If the predecessor can't be trusted to signal, wake the waiter so
        // it resyncs by itself.
        let status = pred.status();
        if status > 0 || !pred.compare_and_set_status(status, SIGNAL) {
            node.unpark();
        }
        true
    }

    /// Moves a condition `node` to the wait queue after its wait was
    /// interrupted or timed out.
    ///
    /// Returns `true` if the node got there before being signalled.
    pub(crate) fn transfer_after_cancelled_wait(&self, node: &Node) -> bool {
        if node.compare_and_set_status(CONDITION, NORMAL) {
            self.core.queue.enqueue(node, &epoch::pin());
            return true;
        }
        // Lost to a signal: wait until the signaller finished the transfer.
        // It's short and rare, so don't bother parking.
        relax_until::<Yield, _>(|| self.is_on_sync_queue(node));
        false
    }

    /// Returns `true` if the condition `node` was moved to the wait queue.
    pub(crate) fn is_on_sync_queue(&self, node: &Node) -> bool {
        self.core.queue.is_on_sync_queue(node, &epoch::pin())
    }
}

impl<S: Default> Default for QueuedSynchronizer<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> fmt::Debug for QueuedSynchronizer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = if self.core.has_queued_threads() { "non-empty" } else { "empty" };
        f.debug_struct("QueuedSynchronizer")
            .field("state", &self.core.state())
            .field("queue", &format_args!("{queue}"))
            .finish()
    }
}

/// Loads the predecessor of a node that is on the queue and not head.
fn predecessor<'g>(node: &Node, guard: &'g Guard) -> &'g Node {
    match node.prev.load(Acquire, guard) {
        Some(pred) => pred,
        None => unreachable!("queued node lost its predecessor"),
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crossbeam_epoch as epoch;

    use super::{Outcome, QueuedSynchronizer, SyncCore, Synchronizer, Wait};
    use crate::error::{Mode, Result, SyncError};
    use crate::node::PROPAGATE;
    use crate::park;
    use crate::test::{trace_init, wait_for_queued};

    /// A non-reentrant exclusive flag whose retry hook can be made to fail.
    #[derive(Default)]
    struct Flag {
        fail: AtomicBool,
        panic: AtomicBool,
        attempts: AtomicUsize,
    }

    // SAFETY: `is_held_exclusively` is not implemented.
    unsafe impl Synchronizer for Flag {
        fn try_acquire(&self, core: &SyncCore, arg: i32) -> Result<bool> {
            self.attempts.fetch_add(1, Relaxed);
            if self.panic.load(Relaxed) {
                panic!("policy panicked");
            }
            if self.fail.load(Relaxed) {
                return Err(SyncError::Saturated("test"));
            }
            Ok(core.compare_and_set_state(0, arg))
        }

        fn try_release(&self, core: &SyncCore, _: i32) -> Result<bool> {
            if core.state() == 0 {
                return Err(SyncError::IllegalMonitorState);
            }
            core.set_state(0);
            Ok(true)
        }
    }

    type Engine = QueuedSynchronizer<Flag>;

    /// Shared permits. A successful acquire never tells whether the next one
    /// would succeed too.
    struct Gate;

    // SAFETY: `is_held_exclusively` is not implemented.
    unsafe impl Synchronizer for Gate {
        fn try_acquire_shared(&self, core: &SyncCore, _: i32) -> Result<i32> {
            loop {
                let permits = core.state();
                if permits == 0 {
                    return Ok(-1);
                }
                if core.compare_and_set_state(permits, permits - 1) {
                    return Ok(0);
                }
            }
        }

        fn try_release_shared(&self, core: &SyncCore, _: i32) -> Result<bool> {
            loop {
                let permits = core.state();
                if core.compare_and_set_state(permits, permits + 1) {
                    return Ok(true);
                }
            }
        }
    }

    fn held() -> Arc<Engine> {
        let sync = Arc::new(Engine::default());
        sync.acquire(1).unwrap();
        sync
    }

    #[test]
    fn round_trip() {
        let sync = Engine::default();
        for _ in 0..100 {
            sync.acquire(1).unwrap();
            assert_eq!(sync.state(), 1);
            assert!(sync.release(1).unwrap());
        }
        assert_eq!(sync.state(), 0);
        assert!(!sync.has_contended());
    }

    #[test]
    fn release_without_holding() {
        let sync = Engine::default();
        assert_eq!(sync.release(1), Err(SyncError::IllegalMonitorState));
    }

    #[test]
    fn unsupported_mode() {
        let sync = Engine::default();
        assert_eq!(sync.acquire_shared(1), Err(SyncError::Unsupported(Mode::Shared)));
        assert_eq!(sync.release_shared(1), Err(SyncError::Unsupported(Mode::Shared)));
        assert_eq!(sync.is_held_exclusively(), Err(SyncError::Unsupported(Mode::Exclusive)));
    }

    #[test]
    fn contended_handoff() {
        let _trace = trace_init();
        let sync = held();
        let c_sync = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            c_sync.acquire(2).unwrap();
            c_sync.state()
        });
        wait_for_queued(&sync, 1);
        assert!(sync.has_queued_threads());
        assert!(sync.release(1).unwrap());
        assert_eq!(handle.join().unwrap(), 2);
        assert_eq!(sync.queue_length(), 0);
        assert!(sync.has_contended());
    }

    #[test]
    fn timed_acquire_expires() {
        let sync = held();
        let (tx, rx) = channel();
        let c_sync = Arc::clone(&sync);
        let first = thread::spawn(move || {
            tx.send(park::current()).unwrap();
            c_sync.acquire(1).unwrap();
            c_sync.release(1).unwrap();
        });
        let first_thread = rx.recv().unwrap();
        wait_for_queued(&sync, 1);

        let c_sync = Arc::clone(&sync);
        let timed = thread::spawn(move || {
            let start = Instant::now();
            let acquired = c_sync.try_acquire_for(1, Duration::from_millis(50)).unwrap();
            (acquired, start.elapsed())
        });
        let (acquired, elapsed) = timed.join().unwrap();
        assert!(!acquired);
        assert!(elapsed >= Duration::from_millis(50));
        // Only the expired waiter left, the first one is still parked.
        assert_eq!(sync.queue_length(), 1);
        assert!(sync.is_queued(&first_thread));

        sync.release(1).unwrap();
        first.join().unwrap();
        assert_eq!(sync.queue_length(), 0);
    }

    #[test]
    fn expiry_leaves_other_waiters_parked() {
        let sync = held();
        let (tx, rx) = channel();
        let c_sync = Arc::clone(&sync);
        let first = thread::spawn(move || {
            tx.send(park::current()).unwrap();
            c_sync.acquire(1).unwrap();
            c_sync.release(1).unwrap();
        });
        let first_thread = rx.recv().unwrap();
        // The engine parks its waiters with itself as the blocker.
        while first_thread.blocker() != Some(sync.token()) {
            thread::yield_now();
        }
        let attempts = sync.policy().attempts.load(Relaxed);

        let c_sync = Arc::clone(&sync);
        let timed = thread::spawn(move || c_sync.try_acquire_for(1, Duration::from_millis(30)));
        assert_eq!(timed.join().unwrap(), Ok(false));
        thread::sleep(Duration::from_millis(20));
        // Only the fast path of the expired waiter ran the policy, the first
        // waiter was not woken to retry.
        assert_eq!(sync.policy().attempts.load(Relaxed), attempts + 1);
        assert_eq!(first_thread.blocker(), Some(sync.token()));
        assert!(sync.is_queued(&first_thread));

        sync.release(1).unwrap();
        first.join().unwrap();
        assert_eq!(first_thread.blocker(), None);
    }

    #[test]
    fn propagation_owed_by_the_head() {
        let sync = Arc::new(QueuedSynchronizer::new(Gate));
        // Queued but never parked, so nobody arms the head.
        let node = sync.add_waiter(Mode::Shared);
        let c_sync = Arc::clone(&sync);
        let second = thread::spawn(move || c_sync.acquire_shared(1));
        wait_for_queued(&sync, 2);

        sync.release_shared(1).unwrap();
        sync.release_shared(1).unwrap();
        {
            let guard = &epoch::pin();
            let head = sync.core.queue.head(guard).unwrap();
            assert_eq!(head.status(), PROPAGATE);
        }
        // The policy reports nothing to propagate, the head's status does.
        let outcome = sync.acquire_queued(&node, 1, Wait::Uninterruptible).unwrap();
        assert!(matches!(outcome, Outcome::Acquired { interrupted: false }));
        assert_eq!(second.join().unwrap(), Ok(()));
        assert_eq!(sync.state(), 0);
        assert_eq!(sync.queue_length(), 0);
    }

    #[test]
    fn zero_timeout_does_not_queue() {
        let sync = held();
        assert!(!sync.try_acquire_for(1, Duration::ZERO).unwrap());
        assert!(!sync.has_contended());
    }

    #[test]
    fn interruptible_acquire_aborts() {
        let sync = held();
        let (tx, rx) = channel();
        let c_sync = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            tx.send(park::current()).unwrap();
            c_sync.acquire_interruptibly(1)
        });
        let parker = rx.recv().unwrap();
        wait_for_queued(&sync, 1);
        parker.interrupt();
        assert_eq!(handle.join().unwrap(), Err(SyncError::Interrupted));
        assert_eq!(sync.queue_length(), 0);
        assert!(!sync.has_queued_threads());
    }

    #[test]
    fn interrupted_before_acquire() {
        let sync = Engine::default();
        park::reassert_interrupt();
        assert_eq!(sync.acquire_interruptibly(1), Err(SyncError::Interrupted));
        assert!(!park::current().is_interrupted());
        assert_eq!(sync.state(), 0);
    }

    #[test]
    fn uninterruptible_acquire_reasserts() {
        let sync = held();
        let (tx, rx) = channel();
        let c_sync = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            tx.send(park::current()).unwrap();
            c_sync.acquire(1).unwrap();
            let interrupted = park::interrupted();
            c_sync.release(1).unwrap();
            interrupted
        });
        let parker = rx.recv().unwrap();
        wait_for_queued(&sync, 1);
        parker.interrupt();
        // Still waiting, interrupts don't abort it.
        thread::sleep(Duration::from_millis(10));
        assert_eq!(sync.queue_length(), 1);
        sync.release(1).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn failing_hook_cancels_node() {
        let sync = held();
        let c_sync = Arc::clone(&sync);
        let handle = thread::spawn(move || c_sync.acquire(1));
        wait_for_queued(&sync, 1);
        sync.policy().fail.store(true, Relaxed);
        sync.release(1).unwrap();
        assert_eq!(handle.join().unwrap(), Err(SyncError::Saturated("test")));
        assert_eq!(sync.queue_length(), 0);

        sync.policy().fail.store(false, Relaxed);
        sync.acquire(1).unwrap();
        sync.release(1).unwrap();
    }

    #[test]
    fn panicking_hook_cancels_node() {
        let sync = held();
        let c_sync = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| c_sync.acquire(1)));
            result.is_err()
        });
        wait_for_queued(&sync, 1);
        sync.policy().panic.store(true, Relaxed);
        sync.release(1).unwrap();
        assert!(handle.join().unwrap());
        assert_eq!(sync.queue_length(), 0);

        sync.policy().panic.store(false, Relaxed);
        sync.acquire(1).unwrap();
        assert_eq!(sync.state(), 1);
    }

    #[test]
    fn debug() {
        let sync = Engine::default();
        assert_eq!(format!("{sync:?}"), "QueuedSynchronizer { state: 0, queue: empty }");
        let sync = held();
        let c_sync = Arc::clone(&sync);
        let handle = thread::spawn(move || c_sync.acquire(1).unwrap());
        wait_for_queued(&sync, 1);
        assert_eq!(format!("{sync:?}"), "QueuedSynchronizer { state: 1, queue: non-empty }");
        sync.release(1).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn conditions_are_bound() {
        let one = Engine::default();
        let two = Engine::default();
        let condition = one.new_condition();
        assert!(one.owns(&condition));
        assert!(!two.owns(&condition));
        assert!(two.owns(&two.new_condition()));
    }

    #[test]
    fn conditions_follow_a_moved_synchronizer() {
        let sync = Engine::default();
        let condition = sync.new_condition();
        let boxed = Box::new(sync);
        assert!(boxed.owns(&condition));
        let sync = Arc::new(*boxed);
        assert!(sync.owns(&condition));
        assert!(!Engine::default().owns(&condition));
    }
}
