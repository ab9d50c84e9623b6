//! Ready to use synchronizers built on the engine.
//!
//! Each type here is a thin policy over a [`QueuedSynchronizer`], and doubles
//! as an example of how to write one:
//!
//! - [`RawMutex`]: a non-reentrant mutual exclusion lock.
//! - [`ReentrantLock`]: a mutual exclusion lock its holder may lock again.
//! - [`RawRwLock`]: a write-preferring read/write lock.
//! - [`Semaphore`]: a counting semaphore.
//! - [`CountDownLatch`]: a one-shot gate that opens once counted down to zero.
//!
//! The mutex and read/write lock types support conditions, and implement the
//! [lock_api] raw traits when the `lock_api` feature is enabled, which is the
//! default. In that case this module also exports [`Mutex`] and [`RwLock`]
//! aliases holding data.
//!
//! [`QueuedSynchronizer`]: crate::QueuedSynchronizer
//! [lock_api]: https://crates.io/crates/lock_api

mod latch;
mod mutex;
mod reentrant;
mod rwlock;
mod semaphore;

pub use latch::CountDownLatch;
pub use mutex::{Exclusive, RawMutex};
pub use reentrant::{Reentrant, ReentrantLock};
pub use rwlock::{RawRwLock, ReadWrite};
pub use semaphore::{Permits, Semaphore};

#[cfg(all(feature = "lock_api", not(loom)))]
pub use mutex::{Mutex, MutexGuard};

#[cfg(all(feature = "lock_api", not(loom)))]
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;

/// Unwraps the result of an operation that can't fail for a given policy,
/// or whose trait signature has no room for an error.
#[cfg_attr(all(loom, test), allow(dead_code))]
fn or_panic<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("{err}"),
    }
}
