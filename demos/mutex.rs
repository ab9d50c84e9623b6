use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

// Requires the `lock_api` feature.
//
// You may export this types to your callers, change the inner mutex type
// (as long as it implements the same raw mutex interfaces), without breaking
// their code.
pub type Mutex<T> = queued_sync::locks::Mutex<T>;
pub type MutexGuard<'a, T> = queued_sync::locks::MutexGuard<'a, T>;

fn main() {
    const N: usize = 10;

    // Spawn a few threads to increment a shared variable (non-atomically), and
    // let the main thread know once all increments are done.
    //
    // Threads that find the mutex locked are queued and parked, rather than
    // spinning, until the holder releases it.
    let data = Arc::new(Mutex::new(0));

    let (tx, rx) = channel();
    for _ in 0..N {
        let (data, tx) = (data.clone(), tx.clone());
        thread::spawn(move || {
            let mut data: MutexGuard<'_, usize> = data.lock();
            *data += 1;
            if *data == N {
                tx.send(()).unwrap();
            }
            // the lock is unlocked here when `data` goes out of scope.
        });
    }
    let _message = rx.recv();

    // Would return `None` if lock was already held.
    let count = data.try_lock().unwrap();
    assert_eq!(*count, N);
}
