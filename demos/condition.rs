use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use queued_sync::locks::ReentrantLock;
use queued_sync::ConditionObject;

/// A bounded queue guarded by a reentrant lock, with one condition per
/// direction.
struct Bounded {
    lock: ReentrantLock,
    not_full: ConditionObject,
    not_empty: ConditionObject,
    items: std::cell::UnsafeCell<VecDeque<u32>>,
}

// SAFETY: `items` is only accessed while `lock` is held.
unsafe impl Sync for Bounded {}

impl Bounded {
    const CAPACITY: usize = 4;

    fn new() -> Self {
        let lock = ReentrantLock::new();
        let not_full = lock.new_condition();
        let not_empty = lock.new_condition();
        let items = std::cell::UnsafeCell::new(VecDeque::new());
        Self { lock, not_full, not_empty, items }
    }

    fn put(&self, item: u32) -> queued_sync::Result<()> {
        self.lock.lock()?;
        // SAFETY: The lock is held.
        while unsafe { &*self.items.get() }.len() == Self::CAPACITY {
            self.not_full.wait(self.lock.sync())?;
        }
        // SAFETY: The lock is held.
        unsafe { &mut *self.items.get() }.push_back(item);
        self.not_empty.signal(self.lock.sync())?;
        self.lock.unlock()
    }

    fn take(&self) -> queued_sync::Result<u32> {
        self.lock.lock()?;
        // SAFETY: The lock is held.
        let item = loop {
            if let Some(item) = unsafe { &mut *self.items.get() }.pop_front() {
                break item;
            }
            self.not_empty.wait(self.lock.sync())?;
        };
        self.not_full.signal(self.lock.sync())?;
        self.lock.unlock()?;
        Ok(item)
    }
}

fn main() {
    const ITEMS: u32 = 100;

    let queue = Arc::new(Bounded::new());
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for item in 0..ITEMS {
                queue.put(item).unwrap();
            }
        })
    };

    // Items come out in the order they went in.
    for expected in 0..ITEMS {
        assert_eq!(queue.take().unwrap(), expected);
    }
    producer.join().unwrap();
}
