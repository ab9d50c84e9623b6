use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use queued_sync::locks::{CountDownLatch, Semaphore};

fn main() {
    const WORKERS: usize = 8;
    const SLOTS: i32 = 3;

    // Workers wait for the start signal, then do their work at most `SLOTS`
    // at a time. The main thread waits for all of them to be done.
    let start = Arc::new(CountDownLatch::new(1));
    let done = Arc::new(CountDownLatch::new(WORKERS as i32));
    let slots = Arc::new(Semaphore::new(SLOTS));
    let busy = Arc::new(AtomicUsize::new(0));

    for _ in 0..WORKERS {
        let (start, done) = (Arc::clone(&start), Arc::clone(&done));
        let (slots, busy) = (Arc::clone(&slots), Arc::clone(&busy));
        thread::spawn(move || {
            start.wait().unwrap();
            slots.acquire().unwrap();
            let now = busy.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(now <= SLOTS as usize);
            busy.fetch_sub(1, Ordering::SeqCst);
            slots.release().unwrap();
            done.count_down();
        });
    }

    start.count_down();
    done.wait().unwrap();
    assert_eq!(slots.available_permits(), SLOTS);
}
