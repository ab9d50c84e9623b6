//! The main wait queue.
//!
//! A CLH variant: each waiter spins (well, parks) on a status stored in its
//! predecessor's node. The `prev` chain from `tail` is authoritative, `next`
//! is only a shortcut and every traversal that needs an exact answer walks
//! backwards from `tail`.

use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Release, SeqCst};

use crossbeam_epoch::{self as epoch, Guard};

use crate::error::Mode;
use crate::node::{Link, Node, CONDITION, NORMAL, SIGNAL};
use crate::park::{self, Parker};

/// A lazily initialized, lock-free FIFO of waiting threads.
pub(crate) struct WaitQueue {
    head: Link,
    tail: Link,
}

impl WaitQueue {
    /// Creates a new, empty and core based queue (const).
    #[cfg(not(all(loom, test)))]
    pub(crate) const fn new() -> Self {
        Self { head: Link::null(), tail: Link::null() }
    }

    /// Creates a new, empty and loom based queue (non-const).
    #[cfg(all(loom, test))]
    pub(crate) fn new() -> Self {
        Self { head: Link::null(), tail: Link::null() }
    }

    /// Returns the current head, if the queue was ever initialized.
    pub(crate) fn head<'g>(&self, guard: &'g Guard) -> Option<&'g Node> {
        self.head.load(SeqCst, guard)
    }

    /// Returns the current tail, if the queue was ever initialized.
    pub(crate) fn tail<'g>(&self, guard: &'g Guard) -> Option<&'g Node> {
        self.tail.load(SeqCst, guard)
    }

    /// Returns `true` if `node` is the current head.
    pub(crate) fn is_head(&self, node: &Node) -> bool {
        self.head.is(node, SeqCst)
    }

    /// Appends `node`, installing a sentinel head first if the queue was never
    /// used. Returns the node's predecessor.
    pub(crate) fn enqueue<'g>(&self, node: &Node, guard: &'g Guard) -> &'g Node {
        loop {
            let Some(tail) = self.tail.load(SeqCst, guard) else {
                let sentinel = Node::sentinel();
                if self.head.compare_exchange(ptr::null(), Some(&sentinel), SeqCst, guard) {
                    tracing::trace!("wait queue initialized");
                    self.tail.store(Some(&sentinel), SeqCst, guard);
                }
                continue;
            };
            node.prev.store(Some(tail), Release, guard);
            if self.tail.compare_exchange(tail, Some(node), SeqCst, guard) {
                tail.next.store(Some(node), Release, guard);
                return tail;
            }
        }
    }

    /// Makes `node` the new head, forgetting its thread and predecessor.
    ///
    /// Only the thread that just acquired through `node` calls this, so a
    /// plain store is enough.
    pub(crate) fn set_head(&self, node: &Node, guard: &Guard) {
        self.head.store(Some(node), SeqCst, guard);
        node.clear_waiter();
        node.prev.clear(guard);
    }

    /// Wakes the first live successor of `node`, if any.
    pub(crate) fn unpark_successor(&self, node: &Node, guard: &Guard) {
        let status = node.status();
        if status < 0 {
            // A failure here only means the waiter already changed it.
            node.compare_and_set_status(status, NORMAL);
        }
        let mut successor = node.next.load(Acquire, guard);
        if successor.map_or(true, Node::is_cancelled) {
            successor = None;
            let mut cursor = self.tail.load(SeqCst, guard);
            while let Some(current) = cursor {
                if ptr::eq(current, node) {
                    break;
                }
                if current.status() <= 0 {
                    successor = Some(current);
                }
                cursor = current.prev.load(Acquire, guard);
            }
        }
        if let Some(successor) = successor {
            successor.unpark();
        }
    }

    /// Checks and updates the predecessor's status after a failed acquire.
    ///
    /// Returns `true` if the caller may now park: `pred` promised to signal
    /// it. Otherwise the caller must retry its acquire first.
    pub(crate) fn should_park_after_failed_acquire(
        &self,
        pred: &Node,
        node: &Node,
        guard: &Guard,
    ) -> bool {
        let status = pred.status();
        if status == SIGNAL {
            return true;
        }
        if status > 0 {
            // Skip over cancelled predecessors, the head is never cancelled.
            let mut pred = pred;
            while pred.is_cancelled() {
                let Some(prev) = pred.prev.load(Acquire, guard) else { return false };
                node.prev.store(Some(prev), Release, guard);
                pred = prev;
            }
            pred.next.store(Some(node), Release, guard);
        } else {
            // NORMAL or PROPAGATE: arm the signal, but retry before parking.
            pred.compare_and_set_status(status, SIGNAL);
        }
        false
    }

    /// Gives up an acquire attempt, unlinking `node` as far as possible.
    pub(crate) fn cancel_acquire(&self, node: &Node, guard: &Guard) {
        node.clear_waiter();
        let Some(mut pred) = node.prev.load(Acquire, guard) else { return };
        while pred.is_cancelled() {
            let Some(prev) = pred.prev.load(Acquire, guard) else { break };
            node.prev.store(Some(prev), Release, guard);
            pred = prev;
        }
        // Used as the expected value of the unlinking CAS below, it fails if
        // anyone else relinked `pred` meanwhile.
        let pred_next = pred.next.as_ptr(Acquire);

        // From here on other nodes may skip past us.
        node.set_cancelled();
        tracing::trace!(mode = %node.mode(), "acquire cancelled");

        let is_tail = self.tail.is(node, SeqCst);
        if is_tail && self.tail.compare_exchange(node, Some(pred), SeqCst, guard) {
            pred.next.compare_exchange(pred_next, None, Release, guard);
            return;
        }
        let armed = |pred: &Node| {
            let status = pred.status();
            status == SIGNAL || (status <= 0 && pred.compare_and_set_status(status, SIGNAL))
        };
        if !self.is_head(pred) && armed(pred) && pred.waiter().is_some() {
            if let Some(next) = node.next.load(Acquire, guard) {
                if next.status() <= 0 {
                    pred.next.compare_exchange(pred_next, Some(next), Release, guard);
                }
            }
        } else {
            self.unpark_successor(node, guard);
        }
        node.next.tombstone(Release, guard);
    }

    /// Returns `true` if `node`, once on a condition queue, is now waiting on
    /// this queue.
    pub(crate) fn is_on_sync_queue(&self, node: &Node, guard: &Guard) -> bool {
        if node.status() == CONDITION || node.prev.is_null(Acquire) {
            return false;
        }
        // A successor, or a tombstone, is only ever set by this queue.
        if !node.next.is_null(Acquire) {
            return true;
        }
        // `prev` may be set while the CAS on `tail` that publishes the node
        // still fails, so confirm by scanning.
        self.find_node_from_tail(node, guard)
    }

    /// Returns `true` if `node` is reachable from `tail` through `prev`.
    pub(crate) fn find_node_from_tail(&self, node: &Node, guard: &Guard) -> bool {
        self.iter(guard).any(|current| ptr::eq(current, node))
    }

    /// Iterates from `tail` to `head`, head included.
    fn iter<'g>(&self, guard: &'g Guard) -> impl Iterator<Item = &'g Node> {
        let mut cursor = self.tail.load(SeqCst, guard);
        core::iter::from_fn(move || {
            let current = cursor?;
            cursor = current.prev.load(Acquire, guard);
            Some(current)
        })
    }

    /// Queries whether any thread is waiting, racy by nature.
    pub(crate) fn has_queued_threads(&self) -> bool {
        self.head.as_ptr(SeqCst) != self.tail.as_ptr(SeqCst)
    }

    /// Queries whether any thread has ever contended.
    pub(crate) fn has_contended(&self) -> bool {
        !self.head.is_null(SeqCst)
    }

    /// Returns the longest waiting thread, if any.
    pub(crate) fn first_queued_thread(&self) -> Option<Parker> {
        if !self.has_queued_threads() {
            return None;
        }
        let guard = &epoch::pin();
        // The successor of head is usually the answer, but it may be in the
        // middle of a concurrent `set_head`, so try twice before scanning.
        for _ in 0..2 {
            let first = self.head(guard).and_then(|head| {
                let next = head.next.load(Acquire, guard)?;
                next.prev.is(head, Acquire).then(|| next.waiter().cloned()).flatten()
            });
            if first.is_some() {
                return first;
            }
        }
        let head = self.head(guard)?;
        self.iter(guard)
            .take_while(|&node| !ptr::eq(node, head))
            .filter_map(|node| node.waiter().cloned())
            .last()
    }

    /// Returns `true` if `thread` is currently waiting on this queue.
    pub(crate) fn is_queued(&self, thread: &Parker) -> bool {
        let guard = &epoch::pin();
        let queued = self.iter(guard).any(|node| node.is_waiter(thread.id()));
        queued
    }

    /// Returns `true` if some thread other than the caller has been waiting
    /// longer than the caller.
    pub(crate) fn has_queued_predecessors(&self) -> bool {
        let guard = &epoch::pin();
        let (Some(head), Some(tail)) = (self.head(guard), self.tail(guard)) else {
            return false;
        };
        if ptr::eq(head, tail) {
            return false;
        }
        match head.next.load(Acquire, guard) {
            None => true,
            Some(first) => !first.is_waiter(park::current_id()),
        }
    }

    /// Returns `true` if the apparent first waiter wants exclusive mode.
    pub(crate) fn apparently_first_queued_is_exclusive(&self) -> bool {
        let guard = &epoch::pin();
        self.head(guard)
            .and_then(|head| head.next.load(Acquire, guard))
            .map_or(false, |first| !first.is_shared() && first.waiter().is_some())
    }

    /// Estimates the number of waiting threads.
    pub(crate) fn queue_length(&self) -> usize {
        let guard = &epoch::pin();
        self.iter(guard).filter(|node| node.waiter().is_some()).count()
    }

    /// Collects the waiting threads, optionally only those of `mode`, from
    /// the most recent to the longest waiting one.
    pub(crate) fn queued_threads(&self, mode: Option<Mode>) -> Vec<Parker> {
        let guard = &epoch::pin();
        self.iter(guard)
            .filter(|node| mode.map_or(true, |mode| node.mode() == mode))
            .filter_map(|node| node.waiter().cloned())
            .collect()
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        let guard = &epoch::pin();
        // Cut every link still reachable from either end, so that leftover
        // cancelled nodes don't keep each other alive.
        let mut cursor = self.head.load(Acquire, guard);
        while let Some(node) = cursor {
            cursor = node.next.load(Acquire, guard);
            node.next.clear(guard);
        }
        let mut cursor = self.tail.load(Acquire, guard);
        while let Some(node) = cursor {
            cursor = node.prev.load(Acquire, guard);
            node.prev.clear(guard);
        }
        self.head.clear(guard);
        self.tail.clear(guard);
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Acquire;

    use crossbeam_epoch as epoch;

    use super::WaitQueue;
    use crate::error::Mode;
    use crate::node::{Node, CANCELLED, CONDITION, NORMAL, SIGNAL};
    use crate::park;

    #[test]
    fn lazy_initialization() {
        let queue = WaitQueue::new();
        assert!(!queue.has_contended());
        assert!(!queue.has_queued_threads());
        let guard = &epoch::pin();
        let node = Node::queued(park::current(), Mode::Exclusive);
        let pred = queue.enqueue(&node, guard);
        assert!(queue.is_head(pred));
        assert!(pred.waiter().is_none());
        assert!(queue.has_contended());
        assert!(queue.has_queued_threads());
        assert_eq!(queue.queue_length(), 1);
    }

    #[test]
    fn fifo_links() {
        let queue = WaitQueue::new();
        let guard = &epoch::pin();
        let first = Node::queued(park::current(), Mode::Exclusive);
        let second = Node::queued(park::current(), Mode::Shared);
        queue.enqueue(&first, guard);
        let pred = queue.enqueue(&second, guard);
        assert!(first.ptr_eq(pred));
        assert!(first.next.is(&second, Acquire));
        assert!(second.prev.is(&first, Acquire));
        assert_eq!(queue.queued_threads(Some(Mode::Shared)).len(), 1);
        assert_eq!(queue.queued_threads(Some(Mode::Exclusive)).len(), 1);
        assert_eq!(queue.queued_threads(None).len(), 2);
        assert!(queue.apparently_first_queued_is_exclusive());
    }

    #[test]
    fn set_head_forgets_thread() {
        let queue = WaitQueue::new();
        let guard = &epoch::pin();
        let node = Node::queued(park::current(), Mode::Exclusive);
        queue.enqueue(&node, guard);
        queue.set_head(&node, guard);
        assert!(queue.is_head(&node));
        assert!(node.waiter().is_none());
        assert!(node.prev.is_null(Acquire));
        assert!(!queue.has_queued_threads());
        assert_eq!(queue.queue_length(), 0);
    }

    #[test]
    fn arm_then_park() {
        let queue = WaitQueue::new();
        let guard = &epoch::pin();
        let node = Node::queued(park::current(), Mode::Exclusive);
        let pred = queue.enqueue(&node, guard);
        assert_eq!(pred.status(), NORMAL);
        assert!(!queue.should_park_after_failed_acquire(pred, &node, guard));
        assert_eq!(pred.status(), SIGNAL);
        assert!(queue.should_park_after_failed_acquire(pred, &node, guard));
    }

    #[test]
    fn cancel_tail_restores_predecessor() {
        let queue = WaitQueue::new();
        let guard = &epoch::pin();
        let first = Node::queued(park::current(), Mode::Exclusive);
        let second = Node::queued(park::current(), Mode::Exclusive);
        queue.enqueue(&first, guard);
        queue.enqueue(&second, guard);
        assert_eq!(queue.queue_length(), 2);

        queue.cancel_acquire(&second, guard);
        assert_eq!(second.status(), CANCELLED);
        assert!(queue.tail(guard).map_or(false, |tail| first.ptr_eq(tail)));
        assert!(first.next.is_null(Acquire));
        assert_eq!(queue.queue_length(), 1);
    }

    #[test]
    fn cancel_middle_is_skipped() {
        let queue = WaitQueue::new();
        let guard = &epoch::pin();
        let new = |_| Node::queued(park::current(), Mode::Exclusive);
        let nodes: Vec<_> = (0..3).map(new).collect();
        for node in &nodes {
            queue.enqueue(node, guard);
        }
        queue.cancel_acquire(&nodes[1], guard);
        assert!(nodes[1].is_cancelled());
        assert_eq!(queue.queue_length(), 2);
        // The cancelled node is gone from `next`, and `prev` skips it on the
        // next failed acquire of its successor.
        assert!(nodes[0].next.is(&nodes[2], Acquire));
        let pred = nodes[2].prev.load(Acquire, guard).unwrap();
        assert!(!queue.should_park_after_failed_acquire(pred, &nodes[2], guard));
        assert!(nodes[2].prev.is(&nodes[0], Acquire));
    }

    #[test]
    fn condition_nodes_are_not_on_sync_queue() {
        let queue = WaitQueue::new();
        let guard = &epoch::pin();
        let node = Node::condition(park::current());
        assert_eq!(node.status(), CONDITION);
        assert!(!queue.is_on_sync_queue(&node, guard));
        assert!(node.compare_and_set_status(CONDITION, NORMAL));
        queue.enqueue(&node, guard);
        assert!(queue.is_on_sync_queue(&node, guard));
        assert!(queue.find_node_from_tail(&node, guard));
        assert!(queue.is_queued(&park::current()));
    }

    #[test]
    fn first_queued_thread_is_longest_waiting() {
        let queue = WaitQueue::new();
        assert!(queue.first_queued_thread().is_none());
        let guard = &epoch::pin();
        let here = Node::queued(park::current(), Mode::Exclusive);
        queue.enqueue(&here, guard);
        let first = queue.first_queued_thread().unwrap();
        assert!(first.ptr_eq(&park::current()));
        // The caller itself is first, so it has no predecessors.
        assert!(!queue.has_queued_predecessors());
        assert!(queue.apparently_first_queued_is_exclusive());
    }
}
