//! Thread parking with cooperative interruption.
//!
//! This is the blocking facility the engine is built on. A parked thread
//! sleeps until a matching [`Parker::unpark`] call, until it is interrupted,
//! until a deadline passes or, occasionally, for no reason at all. Unpark
//! calls coalesce into a single pending permit per thread, exactly like
//! [`std::thread::park`], which this module wraps.
//!
//! Rust threads have no built-in notion of interruption, so each thread also
//! carries a flag that other threads can raise through [`Parker::interrupt`].
//! Interruptible operations of this crate observe and clear that flag and
//! report [`SyncError::Interrupted`]; uninterruptible ones swallow it while
//! waiting and raise it again before returning.
//!
//! [`SyncError::Interrupted`]: crate::SyncError::Interrupted

use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::time::Duration;

use crate::cfg::atomic::{AtomicBool, AtomicUsize};
use crate::cfg::sync::Arc;
use crate::cfg::thread::{self, Thread};

/// Source of process-unique thread ids, zero is never handed out.
static NEXT_ID: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(1);

thread::thread_local! {
    static CURRENT: Parker = Parker::new(thread::current());
}

/// A handle to a thread that can be unparked and interrupted.
///
/// Cloning a `Parker` is cheap, every clone refers to the same thread.
///
/// # Examples
///
/// ```
/// use std::thread;
///
/// use queued_sync::park;
///
/// let (tx, rx) = std::sync::mpsc::channel();
/// let handle = thread::spawn(move || {
///     tx.send(park::current()).unwrap();
///     while !park::interrupted() {
///         park::park(0);
///     }
/// });
///
/// let parker = rx.recv().unwrap();
/// parker.interrupt();
/// handle.join().unwrap();
/// ```
#[derive(Clone)]
pub struct Parker {
    inner: Arc<Inner>,
}

struct Inner {
    id: usize,
    thread: Thread,
    interrupted: AtomicBool,
    blocker: AtomicUsize,
}

impl Parker {
    fn new(thread: Thread) -> Self {
        let id = NEXT_ID.fetch_add(1, Relaxed);
        let interrupted = AtomicBool::new(false);
        let blocker = AtomicUsize::new(0);
        Self { inner: Arc::new(Inner { id, thread, interrupted, blocker }) }
    }

    /// Returns the underlying thread handle.
    pub fn thread(&self) -> &Thread {
        &self.inner.thread
    }

    /// Returns a process-unique, non-zero identifier for this thread.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Makes the thread's permit available if it is not already.
    pub fn unpark(&self) {
        self.inner.thread.unpark();
    }

    /// Raises the thread's interrupt flag and wakes it up if it is parked.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Release);
        self.inner.thread.unpark();
    }

    /// Returns `true` if the thread's interrupt flag is raised.
    ///
    /// Unlike [`interrupted`], this does not clear the flag.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Acquire)
    }

    /// Returns the diagnostic token of the synchronizer this thread is
    /// currently parked on, if any.
    pub fn blocker(&self) -> Option<usize> {
        match self.inner.blocker.load(Relaxed) {
            0 => None,
            token => Some(token),
        }
    }

    /// Returns `true` if both handles refer to the same thread.
    pub fn ptr_eq(&self, other: &Parker) -> bool {
        self.inner.id == other.inner.id
    }
}

impl fmt::Debug for Parker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parker")
            .field("id", &self.inner.id)
            .field("thread", &self.inner.thread.id())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Returns the [`Parker`] of the calling thread.
pub fn current() -> Parker {
    CURRENT.with(Parker::clone)
}

/// Returns the [`Parker::id`] of the calling thread.
pub(crate) fn current_id() -> usize {
    CURRENT.with(Parker::id)
}

/// Blocks the current thread until its permit is made available.
///
/// Returns immediately if the thread is interrupted, without clearing the
/// flag. May also return spuriously, so callers must re-check their wait
/// condition in a loop. `blocker` is recorded for diagnostics while parked,
/// zero means none.
pub fn park(blocker: usize) {
    park_with(blocker, None);
}

/// Blocks the current thread for at most `timeout`.
///
/// Same wake-up rules as [`park`], plus the deadline.
pub fn park_timeout(blocker: usize, timeout: Duration) {
    park_with(blocker, Some(timeout));
}

/// Returns whether the current thread was interrupted, clearing the flag.
pub fn interrupted() -> bool {
    CURRENT.with(|parker| parker.inner.interrupted.swap(false, AcqRel))
}

/// Raises the current thread's interrupt flag without waking anyone.
///
/// Used to hand an interrupt that was swallowed while waiting back to the
/// caller.
pub fn reassert_interrupt() {
    CURRENT.with(|parker| parker.inner.interrupted.store(true, Release));
}

fn park_with(blocker: usize, timeout: Option<Duration>) {
    CURRENT.with(|parker| {
        parker.inner.blocker.store(blocker, Relaxed);
        if !parker.is_interrupted() {
            match timeout {
                None => thread::park(),
                Some(timeout) => thread::park_timeout(timeout),
            }
        }
        parker.inner.blocker.store(0, Relaxed);
    });
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{current, interrupted, park, park_timeout, reassert_interrupt};

    #[test]
    fn ids_are_unique_per_thread() {
        let here = current();
        assert_eq!(here.id(), current().id());
        assert!(here.ptr_eq(&current()));
        let there = thread::spawn(current).join().unwrap();
        assert_ne!(here.id(), there.id());
        assert_ne!(0, there.id());
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        current().unpark();
        // Consumes the pending permit instead of blocking forever.
        park(0);
    }

    #[test]
    fn park_timeout_expires() {
        // Nobody unparks us, the deadline does.
        let start = Instant::now();
        park_timeout(0, Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!current().is_interrupted());
    }

    #[test]
    fn interrupt_wakes_parked_thread() {
        let (tx, rx) = channel();
        let handle = thread::spawn(move || {
            tx.send(current()).unwrap();
            while !current().is_interrupted() {
                park(42);
            }
            interrupted()
        });
        let parker = rx.recv().unwrap();
        parker.interrupt();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn interrupted_clears_flag() {
        reassert_interrupt();
        assert!(current().is_interrupted());
        // An interrupted thread does not block.
        park(0);
        assert!(interrupted());
        assert!(!interrupted());
        assert!(!current().is_interrupted());
    }

    #[test]
    fn blocker_is_visible_while_parked() {
        let (tx, rx) = channel();
        let handle = thread::spawn(move || {
            tx.send(current()).unwrap();
            while !current().is_interrupted() {
                park(7);
            }
            interrupted();
        });
        let parker = rx.recv().unwrap();
        while parker.blocker() != Some(7) {
            thread::yield_now();
        }
        parker.interrupt();
        handle.join().unwrap();
        assert_eq!(parker.blocker(), None);
    }
}
