//! Wait queue nodes and their reclamation.
//!
//! A node is heap allocated and reference counted. Every [`Link`] that points
//! at a node owns one count, and so does every [`NodeRef`] handle. Dropping a
//! count is never done in place: the decrement is deferred through the epoch
//! collector, so a thread that loaded a link while pinned may keep using the
//! loaded reference until it unpins, even if the link is overwritten in the
//! meantime. Once the last count is gone the node is freed, and the counts
//! held by its own links are given back the same way.
//!
//! The rules every user of this module follows:
//!
//! - references returned by [`Link::load`] are only used while the guard that
//!   loaded them is alive;
//! - a thread never stays pinned while parked;
//! - a node that must outlive a pin (the caller's own node) is held through a
//!   [`NodeRef`].

use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{self, AcqRel, Acquire, Relaxed, Release, SeqCst};

use crossbeam_epoch::{self as epoch, Guard};

use crate::cfg::atomic::{fence, AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};
use crate::error::Mode;
use crate::park::Parker;

/// The node was cancelled due to timeout, interrupt or a failing hook.
pub(crate) const CANCELLED: i32 = 1;
/// The initial status of a node on the wait queue.
pub(crate) const NORMAL: i32 = 0;
/// The successor of this node is, or will soon be, parked. The node must
/// unpark it when it releases or cancels.
pub(crate) const SIGNAL: i32 = -1;
/// The node is on a condition queue.
pub(crate) const CONDITION: i32 = -2;
/// A shared release happened while no waiter had armed a signal, the next
/// shared acquire must keep propagating.
pub(crate) const PROPAGATE: i32 = -3;

/// One blocked acquire attempt, or the queue's dummy head.
pub(crate) struct Node {
    refs: AtomicUsize,
    status: AtomicI32,
    /// Authoritative link towards the head.
    pub(crate) prev: Link,
    /// Best-effort link towards the tail, may be stale or missing.
    pub(crate) next: Link,
    waiter: Option<Parker>,
    waiting: AtomicBool,
    mode: Mode,
}

impl Node {
    /// Creates the dummy node installed as head on first contention.
    pub(crate) fn sentinel() -> NodeRef {
        NodeRef::new(Self::with(None, Mode::Exclusive, NORMAL))
    }

    /// Creates a node for the calling thread to wait on the main queue.
    pub(crate) fn queued(waiter: Parker, mode: Mode) -> NodeRef {
        NodeRef::new(Self::with(Some(waiter), mode, NORMAL))
    }

    /// Creates a node for the calling thread to wait on a condition queue.
    pub(crate) fn condition(waiter: Parker) -> NodeRef {
        NodeRef::new(Self::with(Some(waiter), Mode::Exclusive, CONDITION))
    }

    fn with(waiter: Option<Parker>, mode: Mode, status: i32) -> Self {
        Self {
            refs: AtomicUsize::new(1),
            status: AtomicI32::new(status),
            prev: Link::null(),
            next: Link::null(),
            waiting: AtomicBool::new(waiter.is_some()),
            waiter,
            mode,
        }
    }

    /// Returns a raw mutable pointer of this node.
    pub(crate) fn as_ptr(&self) -> *mut Self {
        (self as *const Self).cast_mut()
    }

    pub(crate) fn status(&self) -> i32 {
        self.status.load(SeqCst)
    }

    pub(crate) fn compare_and_set_status(&self, current: i32, new: i32) -> bool {
        self.status.compare_exchange(current, new, SeqCst, SeqCst).is_ok()
    }

    /// Marks this node as cancelled.
    ///
    /// Only the owning thread writes `CANCELLED`, and once written it never
    /// changes, so a plain store is enough.
    pub(crate) fn set_cancelled(&self) {
        self.status.store(CANCELLED, Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.status() > 0
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.mode == Mode::Shared
    }

    /// Returns the waiting thread, unless it was cleared.
    pub(crate) fn waiter(&self) -> Option<&Parker> {
        if self.waiting.load(Acquire) {
            self.waiter.as_ref()
        } else {
            None
        }
    }

    /// Returns `true` if the waiting thread is the one identified by `id`.
    pub(crate) fn is_waiter(&self, id: usize) -> bool {
        self.waiter().map_or(false, |waiter| waiter.id() == id)
    }

    /// Forgets the waiting thread, once it became head or gave up.
    pub(crate) fn clear_waiter(&self) {
        self.waiting.store(false, Release);
    }

    /// Wakes the waiting thread, if there still is one.
    pub(crate) fn unpark(&self) {
        if let Some(waiter) = self.waiter() {
            tracing::trace!(waiter = waiter.id(), "unpark");
            waiter.unpark();
        }
    }

    /// Adds one count for a new link or handle.
    fn retain(&self) {
        self.refs.fetch_add(1, Relaxed);
    }

    /// Drops one count, freeing the node if it was the last one.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live node and the caller must own the count that
    /// is being dropped. Every thread that may still use a reference to the
    /// node without owning a count must have unpinned since that reference
    /// was loaded.
    unsafe fn release(ptr: *mut Node) {
        // SAFETY: Caller owns a count, so the node is alive.
        if unsafe { &*ptr }.refs.fetch_sub(1, Release) != 1 {
            return;
        }
        fence(Acquire);
        // SAFETY: That was the last count, nobody else can reach this node.
        let node = unsafe { Box::from_raw(ptr) };
        let guard = epoch::pin();
        node.prev.clear(&guard);
        node.next.clear(&guard);
    }
}

/// An owning handle to a node, keeps it alive across pins and parks.
pub(crate) struct NodeRef {
    ptr: NonNull<Node>,
}

// SAFETY: A node is only made of atomics and a thread handle, all of which can
// be shared and sent between threads. The count itself is atomic.
unsafe impl Send for NodeRef {}
// SAFETY: Same as above.
unsafe impl Sync for NodeRef {}

impl NodeRef {
    fn new(node: Node) -> Self {
        let ptr = Box::into_raw(Box::new(node));
        // SAFETY: `Box::into_raw` never returns a null pointer.
        Self { ptr: unsafe { NonNull::new_unchecked(ptr) } }
    }

    /// Takes a new count on a node loaded from a link.
    pub(crate) fn from_shared(node: &Node) -> Self {
        node.retain();
        Self { ptr: NonNull::from(node) }
    }

    /// Returns `true` if both handles point to the same node.
    pub(crate) fn ptr_eq(&self, other: &Node) -> bool {
        ptr::eq(self.ptr.as_ptr(), other)
    }
}

impl Deref for NodeRef {
    type Target = Node;

    fn deref(&self) -> &Node {
        // SAFETY: The handle owns a count, so the node is alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        Self::from_shared(self)
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        let guard = epoch::pin();
        // SAFETY: This handle owns the count being dropped.
        unsafe { defer_release(self.ptr.as_ptr(), &guard) }
    }
}

/// Returns the pointer stored in a cancelled node's `next` link, standing for
/// a link to the node itself.
///
/// It owns no count, so a cancelled node never keeps itself alive.
fn tombstone() -> *mut Node {
    NonNull::dangling().as_ptr()
}

/// Drops one count once every thread pinned right now has unpinned.
///
/// # Safety
///
/// `ptr` must be null, the tombstone, or a node the caller owns a count of.
unsafe fn defer_release(ptr: *mut Node, guard: &Guard) {
    if ptr.is_null() || ptr == tombstone() {
        return;
    }
    // SAFETY: Caller gives up its count, the decrement runs after every
    // currently pinned thread unpinned.
    unsafe { guard.defer_unchecked(move || Node::release(ptr)) }
}

/// Takes a count on behalf of a link about to point at `node`.
fn retain(node: Option<&Node>) -> *mut Node {
    node.map_or(ptr::null_mut(), |node| {
        node.retain();
        node.as_ptr()
    })
}

/// Gives back a count taken by [`retain`] that was never published.
fn unretain(ptr: *mut Node) {
    if !ptr.is_null() {
        // SAFETY: The count was taken by the caller and is still owned by it,
        // the node is also reachable through whatever reference it was taken
        // from, so this is never the last count.
        unsafe { &*ptr }.refs.fetch_sub(1, Relaxed);
    }
}

/// The failure ordering paired with a compare-and-swap success ordering.
fn failure(order: Ordering) -> Ordering {
    match order {
        SeqCst => SeqCst,
        AcqRel | Acquire => Acquire,
        _ => Relaxed,
    }
}

/// A counted, atomically updated pointer to a node.
pub(crate) struct Link {
    ptr: AtomicPtr<Node>,
}

impl Link {
    /// Creates a new, null and core based link (const).
    #[cfg(not(all(loom, test)))]
    pub(crate) const fn null() -> Self {
        Self { ptr: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Creates a new, null and loom based link (non-const).
    #[cfg(all(loom, test))]
    pub(crate) fn null() -> Self {
        Self { ptr: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Loads the node this link points to.
    ///
    /// Returns `None` for both null and tombstone links. The reference is
    /// valid for as long as `guard` is.
    pub(crate) fn load<'g>(&self, order: Ordering, _guard: &'g Guard) -> Option<&'g Node> {
        let ptr = self.ptr.load(order);
        if ptr.is_null() || ptr == tombstone() {
            return None;
        }
        // SAFETY: The link owned a count when we loaded it, and dropping that
        // count is deferred until after `guard` is released.
        Some(unsafe { &*ptr })
    }

    /// Returns the raw pointer this link holds, for identity comparisons.
    pub(crate) fn as_ptr(&self, order: Ordering) -> *mut Node {
        self.ptr.load(order)
    }

    /// Returns `true` if this link points nowhere, not even a tombstone.
    pub(crate) fn is_null(&self, order: Ordering) -> bool {
        self.ptr.load(order).is_null()
    }

    /// Returns `true` if this link points to `node`.
    pub(crate) fn is(&self, node: &Node, order: Ordering) -> bool {
        ptr::eq(self.ptr.load(order), node)
    }

    /// Points this link at `new`.
    pub(crate) fn store(&self, new: Option<&Node>, order: Ordering, guard: &Guard) {
        let new = retain(new);
        let old = self.ptr.swap(new, order);
        // SAFETY: The count of `old` was owned by this link.
        unsafe { defer_release(old, guard) }
    }

    /// Points this link at `new` if it currently points at `current`.
    ///
    /// `current` is compared by address. Callers load it under the same
    /// `guard`, so it can't have been freed and reused in the meantime.
    pub(crate) fn compare_exchange(
        &self,
        current: *const Node,
        new: Option<&Node>,
        order: Ordering,
        guard: &Guard,
    ) -> bool {
        let new = retain(new);
        let current = current.cast_mut();
        match self.ptr.compare_exchange(current, new, order, failure(order)) {
            Ok(old) => {
                // SAFETY: The count of `old` was owned by this link.
                unsafe { defer_release(old, guard) };
                true
            }
            Err(_) => {
                unretain(new);
                false
            }
        }
    }

    /// Replaces this link with a tombstone, a link to its own node.
    pub(crate) fn tombstone(&self, order: Ordering, guard: &Guard) {
        let old = self.ptr.swap(tombstone(), order);
        // SAFETY: The count of `old` was owned by this link.
        unsafe { defer_release(old, guard) }
    }

    /// Nulls this link, giving back its count.
    pub(crate) fn clear(&self, guard: &Guard) {
        self.store(None, Release, guard);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::{Acquire, Relaxed, SeqCst};

    use crossbeam_epoch as epoch;

    use super::{Link, Node, CANCELLED, CONDITION, NORMAL, SIGNAL};
    use crate::error::Mode;
    use crate::park;

    #[test]
    fn fresh_nodes() {
        let sentinel = Node::sentinel();
        assert_eq!(sentinel.status(), NORMAL);
        assert!(sentinel.waiter().is_none());

        let queued = Node::queued(park::current(), Mode::Shared);
        assert!(queued.is_shared());
        assert!(queued.is_waiter(park::current().id()));

        let condition = Node::condition(park::current());
        assert_eq!(condition.status(), CONDITION);
        assert_eq!(condition.mode(), Mode::Exclusive);
    }

    #[test]
    fn status_transitions() {
        let node = Node::queued(park::current(), Mode::Exclusive);
        assert!(node.compare_and_set_status(NORMAL, SIGNAL));
        assert!(!node.compare_and_set_status(NORMAL, SIGNAL));
        node.set_cancelled();
        assert_eq!(node.status(), CANCELLED);
        assert!(node.is_cancelled());
    }

    #[test]
    fn cleared_waiter_is_gone() {
        let node = Node::queued(park::current(), Mode::Exclusive);
        node.clear_waiter();
        assert!(node.waiter().is_none());
        assert!(!node.is_waiter(park::current().id()));
    }

    #[test]
    fn links_count_references() {
        let a = Node::sentinel();
        let b = Node::sentinel();
        let link = Link::null();
        let guard = epoch::pin();
        assert!(link.load(Acquire, &guard).is_none());

        link.store(Some(&a), SeqCst, &guard);
        assert_eq!(a.refs.load(Relaxed), 2);
        assert!(link.is(&a, Acquire));

        assert!(!link.compare_exchange(b.as_ptr(), None, SeqCst, &guard));
        assert_eq!(b.refs.load(Relaxed), 1);
        assert!(link.compare_exchange(a.as_ptr(), Some(&b), SeqCst, &guard));
        assert_eq!(b.refs.load(Relaxed), 2);
        assert!(a.refs.load(Relaxed) >= 1);

        link.tombstone(SeqCst, &guard);
        assert!(link.load(Acquire, &guard).is_none());
        assert!(!link.is_null(Acquire));
        link.clear(&guard);
        assert!(link.is_null(Acquire));
    }
}
