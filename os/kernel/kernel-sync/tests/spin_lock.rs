use kernel_sync::{IrqGuard, SpinLock, SyncOnceCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let held = l.try_lock().expect("uncontended try_lock");
    assert_eq!(*held, 1);
    assert!(l.try_lock().is_none());

    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn irq_guard_holds_the_lock_and_releases_it() {
    let l = SpinLock::new(vec![1, 2]);
    {
        let mut g = l.lock_irq();
        g.push(3);
        assert!(l.try_lock().is_none(), "lock_irq must hold the lock");
    }
    assert_eq!(l.with_lock_irq(|v| v.len()), 3);
    assert!(!l.is_locked());
}

#[test]
fn irq_guard_on_host_never_reenables() {
    // Hosted builds report interrupts as masked; the guard must not try to
    // restore a state it never changed.
    let g = IrqGuard::new();
    assert!(!g.were_enabled());
}

#[test]
fn get_mut_and_into_inner() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock_irq(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn once_cell_initializes_exactly_once() {
    static CELL: SyncOnceCell<SpinLock<u32>> = SyncOnceCell::new();
    assert!(CELL.get().is_none());

    let calls = AtomicUsize::new(0);
    let a = CELL.get_or_init(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        SpinLock::new(7)
    });
    let b = CELL.get_or_init(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        SpinLock::new(9)
    });

    assert!(std::ptr::eq(a, b));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*CELL.get().unwrap().lock(), 7);
}

#[test]
fn once_cell_set_rejects_second_value() {
    let cell = SyncOnceCell::new();
    assert_eq!(cell.set(1u8).copied(), Ok(1));
    assert_eq!(cell.set(2u8).map(|v| *v), Err(2));
    assert_eq!(cell.get(), Some(&1));
}
