use std::time::Duration;

use crate::error::Result;
use crate::sync::{QueuedSynchronizer, SyncCore, Synchronizer};

use super::or_panic;

/// The policy of [`CountDownLatch`]: the state is the remaining count.
#[derive(Debug, Default)]
struct Countdown;

// SAFETY: `is_held_exclusively` is not implemented.
unsafe impl Synchronizer for Countdown {
    fn try_acquire_shared(&self, core: &SyncCore, _: i32) -> Result<i32> {
        Ok(if core.state() == 0 { 1 } else { -1 })
    }

    fn try_release_shared(&self, core: &SyncCore, _: i32) -> Result<bool> {
        loop {
            let count = core.state();
            if count == 0 {
                return Ok(false);
            }
            if core.compare_and_set_state(count, count - 1) {
                return Ok(count == 1);
            }
        }
    }
}

/// A gate that opens once counted down to zero, and then stays open.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use queued_sync::locks::CountDownLatch;
///
/// let done = Arc::new(CountDownLatch::new(3));
/// for _ in 0..3 {
///     let done = Arc::clone(&done);
///     thread::spawn(move || done.count_down());
/// }
/// done.wait().unwrap();
/// assert_eq!(done.count(), 0);
/// ```
#[derive(Debug)]
pub struct CountDownLatch {
    sync: QueuedSynchronizer<Countdown>,
}

impl CountDownLatch {
    /// Creates a latch that opens after `count` calls to
    /// [`count_down`](Self::count_down). Negative counts are taken as zero.
    pub fn new(count: i32) -> Self {
        Self { sync: QueuedSynchronizer::with_state(Countdown, count.max(0)) }
    }

    /// Blocks until the count reaches zero, unless interrupted before or
    /// while waiting.
    pub fn wait(&self) -> Result<()> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Blocks until the count reaches zero or `timeout` elapsed.
    ///
    /// Returns `Ok(true)` if the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    /// Decrements the count, releasing every waiting thread when it reaches
    /// zero. Does nothing once open.
    pub fn count_down(&self) {
        or_panic(self.sync.release_shared(1));
    }

    /// Returns the current count.
    pub fn count(&self) -> i32 {
        self.sync.state()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::CountDownLatch;
    use crate::test::wait_for_queued;

    #[test]
    fn open_latch_does_not_block() {
        let latch = CountDownLatch::new(0);
        latch.wait().unwrap();
        assert_eq!(latch.wait_timeout(Duration::ZERO), Ok(true));
        latch.count_down();
        assert_eq!(latch.count(), 0);
        assert!(!latch.sync.has_contended());
    }

    #[test]
    fn releases_every_waiter() {
        const WAITERS: usize = 5;
        let latch = Arc::new(CountDownLatch::new(2));
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait().unwrap())
            })
            .collect();
        wait_for_queued(&latch.sync, WAITERS);
        latch.count_down();
        assert_eq!(latch.count(), 1);
        assert_eq!(latch.sync.queue_length(), WAITERS);
        latch.count_down();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(latch.sync.queue_length(), 0);
    }

    #[test]
    fn wait_timeout_expires() {
        let latch = CountDownLatch::new(1);
        assert_eq!(latch.wait_timeout(Duration::from_millis(10)), Ok(false));
        assert_eq!(latch.count(), 1);
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn latch_release() {
        models::latch_release();
    }
}
