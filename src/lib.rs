//! A queued synchronizer framework for building blocking locks and related
//! synchronizers on top of a single atomic state word and a FIFO wait queue.
//!
//! The core type is [`QueuedSynchronizer`]. It owns an `i32` state and a
//! lock-free, doubly linked queue of waiting threads (a variant of the CLH
//! queue). A [`Synchronizer`] policy decides what the state means and when an
//! acquire or release succeeds; the engine takes care of queueing, parking,
//! wakeups, timeouts, interrupts and cancellation.
//!
//! Synchronizers are acquired in one of two modes:
//!
//! - exclusive, where at most one thread succeeds at a time, such as a mutex;
//! - shared, where several threads may succeed together and a successful
//!   acquire propagates wakeups to the following shared waiters, such as a
//!   latch, a semaphore or the read side of a read/write lock.
//!
//! A synchronizer whose policy reports exclusive ownership can also create
//! [`ConditionObject`]s: per-condition wait queues whose waiters fully
//! release the synchronizer, and reacquire it with the same state once
//! signalled.
//!
//! ## Interrupts
//!
//! Blocking operations may be interrupted through [`Parker::interrupt`].
//! Interruptible variants fail with [`SyncError::Interrupted`], the others
//! keep waiting and leave the interrupt pending for the caller.
//!
//! ## Locks
//!
//! The [`locks`] module holds ready made synchronizers: a mutex, a reentrant
//! lock, a read/write lock, a semaphore and a countdown latch. They double as
//! examples of [`Synchronizer`] implementations.
//!
//! ## Features
//!
//! ### lock_api
//!
//! Enabled by default. Implements the [lock_api] raw traits for the mutex and
//! read/write lock of the [`locks`] module, and exports the matching `Mutex`
//! and `RwLock` aliases.
//!
//! [lock_api]: https://docs.rs/lock_api/latest/lock_api

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod condition;
pub mod error;
pub mod locks;
pub mod park;
pub mod sync;

pub use condition::ConditionObject;
pub use error::{Mode, Result, SyncError};
pub use park::Parker;
pub use sync::{QueuedSynchronizer, SyncCore, Synchronizer, SPIN_FOR_TIMEOUT_THRESHOLD};

pub(crate) mod cfg;
pub(crate) mod node;
pub(crate) mod queue;
pub(crate) mod relax;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
pub(crate) mod loom;
