// Test suite from the Rust's Mutex and RwLock implementations with minor
// modifications since the API is not compatible with this crate
// implementation and some new tests as well.
//
// Copyright 2014 The Rust Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![cfg(feature = "lock_api")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use queued_sync::locks::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

#[derive(Eq, PartialEq, Debug)]
struct NonCopy(i32);

#[test]
fn smoke() {
    let m = Mutex::new(());
    drop(m.lock());
    drop(m.lock());
}

#[test]
fn lots_and_lots() {
    static LOCK: Mutex<u32> = Mutex::new(0);

    const ITERS: u32 = 1000;
    const CONCURRENCY: u32 = 3;

    fn inc() {
        for _ in 0..ITERS {
            let mut g = LOCK.lock();
            *g += 1;
        }
    }

    let (tx, rx) = channel();
    for _ in 0..CONCURRENCY {
        let tx2 = tx.clone();
        thread::spawn(move || {
            inc();
            tx2.send(()).unwrap();
        });
        let tx2 = tx.clone();
        thread::spawn(move || {
            inc();
            tx2.send(()).unwrap();
        });
    }

    drop(tx);
    for _ in 0..2 * CONCURRENCY {
        rx.recv().unwrap();
    }
    assert_eq!(*LOCK.lock(), ITERS * CONCURRENCY * 2);
}

#[test]
fn try_lock() {
    let m = Mutex::new(());
    *m.try_lock().unwrap() = ();
}

#[test]
fn test_into_inner() {
    let m = Mutex::new(NonCopy(10));
    assert_eq!(m.into_inner(), NonCopy(10));
}

#[test]
fn test_into_inner_drop() {
    struct Foo(Arc<AtomicUsize>);
    impl Drop for Foo {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    let num_drops = Arc::new(AtomicUsize::new(0));
    let m = Mutex::new(Foo(num_drops.clone()));
    assert_eq!(num_drops.load(Ordering::SeqCst), 0);
    {
        let _inner = m.into_inner();
        assert_eq!(num_drops.load(Ordering::SeqCst), 0);
    }
    assert_eq!(num_drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_get_mut() {
    let mut m = Mutex::new(NonCopy(10));
    *m.get_mut() = NonCopy(20);
    assert_eq!(m.into_inner(), NonCopy(20));
}

#[test]
fn test_lock_arc_nested() {
    // Tests nested locks and access
    // to underlying data.
    let arc = Arc::new(Mutex::new(1));
    let arc2 = Arc::new(Mutex::new(arc));
    let (tx, rx) = channel();
    let _t = thread::spawn(move || {
        let lock = arc2.lock();
        let lock2 = lock.lock();
        assert_eq!(*lock2, 1);
        tx.send(()).unwrap();
    });
    rx.recv().unwrap();
}

#[test]
fn test_recursive_lock() {
    let arc = Arc::new(Mutex::new(1));
    let (tx, rx) = channel();
    for _ in 0..4 {
        let tx2 = tx.clone();
        let c_arc = Arc::clone(&arc);
        let _t = thread::spawn(move || {
            let mutex = Mutex::new(1);
            let _lock = c_arc.lock();
            let lock2 = mutex.lock();
            assert_eq!(*lock2, 1);
            tx2.send(()).unwrap();
        });
    }
    drop(tx);
    rx.recv().unwrap();
}

#[test]
fn test_lock_arc_access_in_unwind() {
    let arc = Arc::new(Mutex::new(1));
    let arc2 = arc.clone();
    let _ = thread::spawn(move || -> () {
        struct Unwinder {
            i: Arc<Mutex<i32>>,
        }
        impl Drop for Unwinder {
            fn drop(&mut self) {
                *self.i.lock() += 1;
            }
        }
        let _u = Unwinder { i: arc2 };
        panic!();
    })
    .join();
    let lock = arc.lock();
    assert_eq!(*lock, 2);
}

#[test]
fn test_lock_unsized() {
    let lock: &Mutex<[i32]> = &Mutex::new([1, 2, 3]);
    {
        let b = &mut *lock.lock();
        b[0] = 4;
        b[2] = 5;
    }
    let comp: &[i32] = &[4, 2, 5];
    assert_eq!(&*lock.lock(), comp);
}

#[test]
fn try_lock_for_contended() {
    let m = Arc::new(Mutex::new(0));
    let guard = m.lock();
    let c_m = Arc::clone(&m);
    let acquired = thread::spawn(move || c_m.try_lock_for(Duration::from_millis(10)).is_some());
    assert!(!acquired.join().unwrap());
    drop(guard);
    assert!(m.try_lock_for(Duration::from_millis(10)).is_some());
}

#[test]
fn rwlock_smoke() {
    let l = RwLock::new(());
    drop(l.read());
    drop(l.write());
    drop((l.read(), l.read()));
    drop(l.write());
}

#[test]
fn rwlock_frob() {
    const N: u32 = 10;
    const M: u32 = 1000;

    let r = Arc::new(RwLock::new(()));

    let (tx, rx) = channel::<()>();
    for i in 0..N {
        let tx = tx.clone();
        let r = r.clone();
        thread::spawn(move || {
            for j in 0..M {
                if (i + j) % 5 == 0 {
                    drop(r.write());
                } else {
                    drop(r.read());
                }
            }
            drop(tx);
        });
    }
    drop(tx);
    let _ = rx.recv();
}

#[test]
fn test_rw_arc() {
    let arc = Arc::new(RwLock::new(0));
    let arc2 = arc.clone();
    let (tx, rx) = channel();

    thread::spawn(move || {
        let mut lock = arc2.write();
        for _ in 0..10 {
            let tmp = *lock;
            *lock = -1;
            thread::yield_now();
            *lock = tmp + 1;
        }
        tx.send(()).unwrap();
    });

    // Readers try to catch the writer in the act
    let mut children = Vec::new();
    for _ in 0..5 {
        let arc3 = arc.clone();
        children.push(thread::spawn(move || {
            let lock = arc3.read();
            assert!(*lock >= 0);
        }));
    }

    // Wait for children to pass their asserts
    for r in children {
        assert!(r.join().is_ok());
    }

    // Wait for writer to finish
    rx.recv().unwrap();
    let lock = arc.read();
    assert_eq!(*lock, 10);
}

#[test]
fn test_rwlock_try_write() {
    let lock = RwLock::new(0isize);
    let read_guard = lock.read();
    assert!(lock.try_write().is_none());
    drop(read_guard);
    assert!(lock.try_write().is_some());
}

#[test]
fn test_rwlock_downgrade() {
    let lock = Arc::new(RwLock::new(0));
    let mut write = lock.write();
    *write = 1;
    let read = RwLockWriteGuard::downgrade(write);
    let c_lock = Arc::clone(&lock);
    let other = thread::spawn(move || *c_lock.read()).join().unwrap();
    assert_eq!(other, 1);
    assert!(lock.try_write().is_none());
    drop(read);
    assert!(lock.try_write().is_some());
}

#[test]
fn test_rwlock_timed() {
    let lock = Arc::new(RwLock::new(()));
    let write = lock.write();
    let c_lock = Arc::clone(&lock);
    let read = thread::spawn(move || c_lock.try_read_for(Duration::from_millis(10)).is_some());
    assert!(!read.join().unwrap());
    drop(write);
    assert!(lock.try_read_for(Duration::from_millis(10)).is_some());
}

#[test]
fn unlock_fair_and_bump() {
    let mutex = Arc::new(Mutex::new(0));
    let mut guard = mutex.lock();
    let c_mutex = Arc::clone(&mutex);
    let handle = thread::spawn(move || *c_mutex.lock() += 1);
    // Hands the lock to the other thread if it queued already.
    MutexGuard::bump(&mut guard);
    *guard += 10;
    MutexGuard::unlock_fair(guard);
    handle.join().unwrap();
    assert_eq!(*mutex.lock(), 11);
}
