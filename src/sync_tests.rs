//! Synchronization primitive tests

use std::sync::Arc;
use std::thread;

use crate::sync::{Sleeplock, Spinlock, WaitChannel};

#[test]
fn sleeplock_mutual_exclusion() {
    let lock = Arc::new(Sleeplock::new(0u64));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let lock = lock.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                let mut guard = lock.lock();
                *guard += 1;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*lock.lock(), 4000);
}

#[test]
fn sleeplock_try_lock() {
    let lock = Sleeplock::new(());
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());
    assert!(lock.is_held());
    drop(guard);
    assert!(lock.try_lock().is_some());
}

#[test]
fn waitchannel_wakes_sleeper() {
    let lock = Arc::new(Spinlock::new(false));
    let chan = Arc::new(WaitChannel::new());

    let waiter = {
        let lock = lock.clone();
        let chan = chan.clone();
        thread::spawn(move || {
            let mut guard = lock.lock();
            while !*guard {
                guard = chan.sleep(&lock, guard);
            }
        })
    };

    thread::sleep(std::time::Duration::from_millis(10));
    {
        let mut guard = lock.lock();
        *guard = true;
    }
    chan.wake_all();
    waiter.join().unwrap();
}

#[test]
fn waitchannel_no_missed_wakeup() {
    let chan = Arc::new(WaitChannel::new());
    // A wakeup after the snapshot is observed even if it lands before
    // the wait begins.
    let seen = chan.generation();
    chan.wake_all();
    chan.wait_from(seen);
}
