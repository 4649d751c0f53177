use netsentry_core::{Error, LockFlags, ThreadContext, UpgradeableRwLock, Wait};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};

const NONE: LockFlags = LockFlags::NONE;

#[test]
fn basic_lock_unlock() {
    let lock = UpgradeableRwLock::default();
    let t = ThreadContext::new();
    {
        let _read_guard = lock.read(Some(&t), Wait::Forever).expect("read failed");
        assert_eq!(lock.have_shared(Some(&t)), Ok(()));
    }
    {
        let _write_guard = lock.write(Some(&t), Wait::Forever).expect("write failed");
        assert_eq!(lock.have_mutex(Some(&t)), Ok(()));
    }
    assert_eq!(lock.have_either(Some(&t)), Err(Error::LackingMutex));
    assert_eq!(t.held_locks(), 0);
}

#[test]
fn concurrent_readers() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    let mut handles = Vec::new();

    for _ in 0..10 {
        let r = Arc::clone(&lock);
        handles.push(thread::spawn(move || {
            let t = ThreadContext::new();
            for _ in 0..100 {
                let _read_guard = r.read(Some(&t), Wait::Forever).expect("read failed");
            }
        }));
    }

    for h in handles {
        h.join().expect("reader thread panicked");
    }
}

#[test]
fn queued_writer_goes_before_later_readers() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    let first = ThreadContext::new();
    lock.lock_shared(Some(&first), NONE).unwrap();

    let (tx, rx) = mpsc::channel();

    let w_lock = Arc::clone(&lock);
    let w_tx = tx.clone();
    let writer = thread::spawn(move || {
        let t = ThreadContext::new();
        w_lock.lock_mutex(Some(&t), NONE).unwrap();
        w_tx.send("writer").unwrap();
        thread::sleep(Duration::from_millis(20));
        w_lock.unlock(Some(&t)).unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    let r_lock = Arc::clone(&lock);
    let reader = thread::spawn(move || {
        let t = ThreadContext::new();
        r_lock.lock_shared(Some(&t), NONE).unwrap();
        tx.send("reader").unwrap();
        r_lock.unlock(Some(&t)).unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    // A queued writer shuts the door on new readers.
    let late = ThreadContext::new();
    assert_eq!(lock.lock_shared_timed(Some(&late), Duration::ZERO, NONE), Err(Error::Busy));
    assert!(rx.try_recv().is_err());

    lock.unlock(Some(&first)).unwrap();
    assert_eq!(rx.recv().unwrap(), "writer");
    assert_eq!(rx.recv().unwrap(), "reader");
    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn single_reservation_slot() {
    let lock = UpgradeableRwLock::default();
    let (t1, t2) = (ThreadContext::new(), ThreadContext::new());
    lock.lock_shared(Some(&t1), NONE).unwrap();
    lock.lock_shared(Some(&t2), NONE).unwrap();

    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t1), NONE), Ok(()));
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t2), NONE), Err(Error::Busy));
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t1), NONE), Err(Error::Already));
    assert_eq!(lock.lock_shared2mutex(Some(&t2), NONE), Err(Error::Busy));
    assert_eq!(lock.lock_shared2mutex(Some(&t1), NONE), Err(Error::Already));

    // A timed-out redeem keeps the reservation.
    assert_eq!(
        lock.lock_shared2mutex_redeem_timed(Some(&t1), Duration::from_millis(20), NONE),
        Err(Error::TimedOut)
    );
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t1)), Ok(()));

    lock.unlock(Some(&t2)).unwrap();
    assert_eq!(lock.lock_shared2mutex_redeem(Some(&t1), NONE), Ok(()));
    assert_eq!(lock.have_mutex(Some(&t1)), Ok(()));
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t1)), Err(Error::IncompatibleState));

    assert_eq!(lock.lock_shared2mutex_redeem(Some(&t1), NONE), Err(Error::Already));
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t1), NONE), Err(Error::Already));
    assert_eq!(lock.lock_shared2mutex_abandon(Some(&t1), NONE), Err(Error::IncompatibleState));
    lock.unlock(Some(&t1)).unwrap();
    assert_eq!(lock.unlock(Some(&t1)), Err(Error::IncompatibleState));
}

#[test]
fn timed_out_upgrade_returns_its_reservation() {
    let lock = UpgradeableRwLock::default();
    let (t1, t2) = (ThreadContext::new(), ThreadContext::new());
    lock.lock_shared(Some(&t1), NONE).unwrap();
    lock.lock_shared(Some(&t2), NONE).unwrap();

    assert_eq!(
        lock.lock_shared2mutex_timed(Some(&t1), Duration::from_millis(20), NONE),
        Err(Error::TimedOut)
    );
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t1)), Err(Error::IncompatibleState));
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t2), NONE), Ok(()));
    assert_eq!(lock.lock_shared2mutex_abandon(Some(&t2), NONE), Ok(()));
    assert_eq!(lock.lock_shared2mutex_abandon(Some(&t2), NONE), Err(Error::IncompatibleState));

    lock.unlock(Some(&t1)).unwrap();
    lock.unlock(Some(&t2)).unwrap();
    lock.destroy().unwrap();
}

#[test]
fn upgrade_requires_a_single_shared_hold() {
    let lock = UpgradeableRwLock::default();
    let t = ThreadContext::new();
    assert_eq!(lock.lock_shared2mutex(Some(&t), NONE), Err(Error::LackingReadLock));
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t), NONE), Err(Error::LackingReadLock));

    lock.lock_shared(Some(&t), NONE).unwrap();
    lock.lock_shared(Some(&t), NONE).unwrap();
    assert_eq!(t.held_locks(), 1);
    assert_eq!(lock.lock_shared2mutex(Some(&t), NONE), Err(Error::IncompatibleState));
    lock.unlock(Some(&t)).unwrap();

    assert_eq!(lock.lock_shared2mutex(Some(&t), NONE), Ok(()));
    // Already exclusive: no-op.
    assert_eq!(lock.lock_shared2mutex(Some(&t), NONE), Ok(()));
    lock.unlock(Some(&t)).unwrap();
    assert_eq!(t.held_locks(), 0);
}

#[test]
fn recursion_rules() {
    let lock = UpgradeableRwLock::new(LockFlags::NONRECURSIVE_SHARED);
    let t = ThreadContext::new();
    lock.lock_shared(Some(&t), NONE).unwrap();
    assert_eq!(lock.lock_shared(Some(&t), NONE), Err(Error::Already));
    lock.unlock(Some(&t)).unwrap();

    let lock = UpgradeableRwLock::new(LockFlags::NONRECURSIVE_MUTEX);
    lock.lock_mutex(Some(&t), NONE).unwrap();
    assert_eq!(lock.lock_mutex(Some(&t), NONE), Err(Error::Already));
    assert_eq!(lock.lock_shared(Some(&t), NONE), Err(Error::Already));
    lock.unlock(Some(&t)).unwrap();

    // Plain lock: shared by the mutex holder nests as exclusive.
    let lock = UpgradeableRwLock::default();
    lock.lock_mutex(Some(&t), NONE).unwrap();
    lock.lock_shared(Some(&t), NONE).unwrap();
    lock.unlock(Some(&t)).unwrap();
    assert_eq!(lock.have_mutex(Some(&t)), Ok(()));
    lock.unlock(Some(&t)).unwrap();
    assert_eq!(lock.have_mutex(Some(&t)), Err(Error::LackingMutex));
}

#[test]
fn anonymous_callers_nest_only_with_retain() {
    let lock = UpgradeableRwLock::default();
    assert_eq!(lock.lock_shared(None, NONE), Err(Error::InvalidArg));
    assert_eq!(lock.have_shared(None), Err(Error::InvalidArg));

    lock.lock_mutex(None, NONE).unwrap();
    assert_eq!(lock.lock_mutex_timed(None, Duration::ZERO, NONE), Err(Error::Busy));
    lock.lock_mutex(None, LockFlags::RETAIN_SEMAPHORE).unwrap();
    assert_eq!(lock.have_mutex(None), Ok(()));
    lock.unlock(None).unwrap();
    lock.unlock(None).unwrap();
    assert_eq!(lock.unlock(None), Err(Error::IncompatibleState));
    lock.destroy().unwrap();
}

#[test]
fn queries_report_what_is_missing() {
    let lock = UpgradeableRwLock::default();
    let t = ThreadContext::new();
    assert_eq!(lock.have_shared(Some(&t)), Err(Error::LackingReadLock));
    assert_eq!(lock.have_mutex(Some(&t)), Err(Error::LackingMutex));
    assert_eq!(lock.have_either(Some(&t)), Err(Error::LackingMutex));
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t)), Err(Error::IncompatibleState));
    assert_eq!(lock.lock_mutex2shared(Some(&t), NONE), Err(Error::LackingMutex));
}

#[test]
fn downgrade_can_keep_the_upgrade_slot() {
    let lock = UpgradeableRwLock::default();
    let (t1, t2) = (ThreadContext::new(), ThreadContext::new());

    lock.lock_mutex(Some(&t1), NONE).unwrap();
    lock.lock_mutex(Some(&t1), NONE).unwrap();
    assert_eq!(lock.lock_mutex2shared(Some(&t1), NONE), Err(Error::IncompatibleState));
    lock.unlock(Some(&t1)).unwrap();

    lock.lock_mutex2shared(Some(&t1), LockFlags::GET_RESERVATION_TOO).unwrap();
    assert_eq!(lock.have_shared(Some(&t1)), Ok(()));
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t1)), Ok(()));

    // The reservation does not keep other readers out.
    lock.lock_shared_timed(Some(&t2), Duration::ZERO, NONE).unwrap();
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t2), NONE), Err(Error::Busy));
    lock.unlock(Some(&t2)).unwrap();

    lock.lock_shared2mutex_redeem(Some(&t1), NONE).unwrap();
    lock.unlock(Some(&t1)).unwrap();
}

#[test]
fn shared_acquisition_with_reservation() {
    let lock = UpgradeableRwLock::default();
    let (t1, t2) = (ThreadContext::new(), ThreadContext::new());

    lock.lock_shared(Some(&t1), LockFlags::GET_RESERVATION_TOO).unwrap();
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t1)), Ok(()));
    assert_eq!(
        lock.lock_shared_timed(Some(&t2), Duration::ZERO, LockFlags::GET_RESERVATION_TOO),
        Err(Error::Busy)
    );
    lock.lock_shared(Some(&t2), LockFlags::TRY_RESERVATION_TOO).unwrap();
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t2)), Err(Error::IncompatibleState));

    // Releasing the last shared hold also drops the reservation.
    lock.unlock(Some(&t1)).unwrap();
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t2), NONE), Ok(()));
    lock.unlock(Some(&t2)).unwrap();
    lock.destroy().unwrap();
}

#[test]
fn read_only_threads_cannot_write() {
    let lock = UpgradeableRwLock::default();
    let t = ThreadContext::new();
    t.set_readonly();
    assert_eq!(lock.lock_mutex(Some(&t), NONE), Err(Error::NotPermitted));
    lock.lock_shared(Some(&t), NONE).unwrap();
    assert_eq!(lock.lock_shared2mutex_reserve(Some(&t), NONE), Err(Error::NotPermitted));
    assert_eq!(lock.lock_shared2mutex(Some(&t), NONE), Err(Error::NotPermitted));
    t.set_readwrite();
    assert_eq!(lock.lock_shared2mutex(Some(&t), NONE), Ok(()));
    lock.unlock(Some(&t)).unwrap();
}

#[test]
fn destroy_and_reinit() {
    let lock = UpgradeableRwLock::default();
    let t = ThreadContext::new();

    lock.lock_shared(Some(&t), NONE).unwrap();
    assert_eq!(lock.destroy(), Err(Error::InvalidArg));
    lock.unlock(Some(&t)).unwrap();

    assert_eq!(lock.init(NONE), Err(Error::Already));
    lock.destroy().unwrap();
    assert_eq!(lock.destroy(), Err(Error::InvalidArg));
    assert_eq!(lock.lock_shared(Some(&t), NONE), Err(Error::InvalidArg));
    assert_eq!(lock.lock_mutex(None, NONE), Err(Error::InvalidArg));

    lock.init(LockFlags::NONRECURSIVE_SHARED).unwrap();
    assert_eq!(lock.get_flags(), LockFlags::NONRECURSIVE_SHARED);
    lock.lock_shared(Some(&t), NONE).unwrap();
    lock.unlock(Some(&t)).unwrap();
}

#[test]
fn destroy_under_hold_turns_waiters_away() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    let owner = ThreadContext::new();
    let mut guard = lock.write(Some(&owner), Wait::Forever).unwrap();

    let (tx, rx) = mpsc::channel();
    let mut waiters = Vec::new();
    for exclusive in [true, false] {
        let l = Arc::clone(&lock);
        let tx = tx.clone();
        waiters.push(thread::spawn(move || {
            let t = ThreadContext::new();
            let res = if exclusive {
                l.lock_mutex(Some(&t), NONE)
            } else {
                l.lock_shared(Some(&t), NONE)
            };
            tx.send(res).unwrap();
        }));
    }
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());

    guard.unlock_and_destroy().unwrap();
    assert_eq!(owner.held_locks(), 0);
    for _ in 0..2 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Err(Error::InvalidArg));
    }
    for w in waiters {
        w.join().unwrap();
    }
    drop(guard);

    // The lock is fully retired and re-arms cleanly.
    assert_eq!(lock.destroy(), Err(Error::InvalidArg));
    lock.init(NONE).unwrap();
    let t = ThreadContext::new();
    lock.lock_mutex(Some(&t), NONE).unwrap();
    lock.unlock(Some(&t)).unwrap();
    lock.lock_shared(Some(&t), NONE).unwrap();
    lock.unlock(Some(&t)).unwrap();
}

#[test]
fn destroy_under_hold_needs_a_single_exclusive_hold() {
    let lock = UpgradeableRwLock::default();
    let t = ThreadContext::new();

    let mut shared = lock.read(Some(&t), Wait::Forever).unwrap();
    assert_eq!(shared.unlock_and_destroy(), Err(Error::LackingMutex));
    shared.release().unwrap();

    assert_eq!(lock.unlock_and_destroy(Some(&t)), Err(Error::LackingMutex));
    lock.lock_mutex(Some(&t), NONE).unwrap();
    lock.lock_mutex(Some(&t), NONE).unwrap();
    assert_eq!(lock.unlock_and_destroy(Some(&t)), Err(Error::Busy));
    assert_eq!(lock.have_mutex(Some(&t)), Ok(()));
    lock.unlock(Some(&t)).unwrap();
    lock.unlock_and_destroy(Some(&t)).unwrap();
    assert_eq!(lock.lock_mutex(Some(&t), NONE), Err(Error::InvalidArg));
}

#[test]
fn queued_writers_are_granted_in_arrival_order() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    let reader = ThreadContext::new();
    lock.lock_shared(Some(&reader), NONE).unwrap();

    let (tx, rx) = mpsc::channel();
    let mut writers = Vec::new();
    for name in ["w1", "w2", "w3"] {
        let l = Arc::clone(&lock);
        let tx = tx.clone();
        writers.push(thread::spawn(move || {
            let t = ThreadContext::new();
            l.lock_mutex(Some(&t), NONE).unwrap();
            tx.send(name).unwrap();
            thread::sleep(Duration::from_millis(5));
            l.unlock(Some(&t)).unwrap();
        }));
        // Let each writer join the queue before the next one arrives.
        thread::sleep(Duration::from_millis(50));
    }
    drop(tx);
    assert!(rx.try_recv().is_err());

    lock.unlock(Some(&reader)).unwrap();
    let order: Vec<&str> = rx.iter().collect();
    assert_eq!(order, ["w1", "w2", "w3"]);
    for w in writers {
        w.join().unwrap();
    }
}

#[test]
fn holds_are_checked_against_their_owner() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    let owner = ThreadContext::new();
    lock.lock_mutex(Some(&owner), NONE).unwrap();

    let l = Arc::clone(&lock);
    thread::spawn(move || {
        let other = ThreadContext::new();
        assert_eq!(l.unlock(Some(&other)), Err(Error::IncompatibleState));
        assert_eq!(l.have_mutex(Some(&other)), Err(Error::LackingMutex));
        assert_eq!(l.lock_mutex2shared(Some(&other), NONE), Err(Error::LackingMutex));
        // Anonymous callers cannot release a thread's hold either.
        assert_eq!(l.unlock(None), Err(Error::IncompatibleState));
    })
    .join()
    .unwrap();

    assert_eq!(lock.have_mutex(Some(&owner)), Ok(()));
    lock.unlock(Some(&owner)).unwrap();
}

#[test]
fn anonymous_writers_wait_out_each_other() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    lock.lock_mutex(None, NONE).unwrap();

    // A second anonymous request is not a re-entry: a bounded wait expires.
    let start = Instant::now();
    assert_eq!(
        lock.lock_mutex_timed(None, Duration::from_millis(30), NONE),
        Err(Error::TimedOut)
    );
    assert!(start.elapsed() >= Duration::from_millis(25));

    let l = Arc::clone(&lock);
    let waiter = thread::spawn(move || {
        l.lock_mutex(None, NONE).unwrap();
        l.unlock(None).unwrap();
    });
    thread::sleep(Duration::from_millis(30));
    lock.unlock(None).unwrap();
    waiter.join().unwrap();
    lock.destroy().unwrap();
}

#[test]
fn timed_waits_honour_deadlines() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel::<()>();

    let holder = {
        let lock = Arc::clone(&lock);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let t = ThreadContext::new();
            let _g = lock.write(Some(&t), Wait::Forever).unwrap();
            barrier.wait();
            rx.recv().unwrap();
        })
    };
    barrier.wait();

    let t = ThreadContext::new();
    let start = Instant::now();
    assert_eq!(
        lock.lock_shared_timed(Some(&t), Duration::from_millis(50), NONE),
        Err(Error::TimedOut)
    );
    assert!(start.elapsed() >= Duration::from_millis(40));

    let start = Instant::now();
    assert_eq!(
        lock.lock_mutex_abstimed(Some(&t), Instant::now() + Duration::from_millis(30), NONE),
        Err(Error::TimedOut)
    );
    assert!(start.elapsed() >= Duration::from_millis(20));

    // A standing deadline caps an otherwise unbounded wait.
    t.set_deadline_rel(Duration::from_millis(30));
    assert_eq!(lock.lock_mutex(Some(&t), NONE), Err(Error::TimedOut));
    t.clear_deadline();

    tx.send(()).unwrap();
    holder.join().unwrap();
    lock.lock_mutex(Some(&t), NONE).unwrap();
    lock.unlock(Some(&t)).unwrap();
}

#[test]
fn guard_promotion_and_release() {
    let lock = UpgradeableRwLock::default();
    let t = ThreadContext::new();

    let mut g = lock.read(Some(&t), Wait::Forever).unwrap();
    g.reserve().unwrap();
    g.redeem(Wait::Poll).unwrap();
    assert!(g.is_exclusive());
    assert_eq!(g.reserve(), Err(Error::IncompatibleState));
    g.downgrade(NONE).unwrap();
    g.reserve().unwrap();
    g.abandon().unwrap();
    assert_eq!(lock.have_shared2mutex_reservation(Some(&t)), Err(Error::IncompatibleState));
    g.promote(Wait::Poll).unwrap();
    g.release().unwrap();
    g.release().unwrap();
    assert_eq!(lock.have_either(Some(&t)), Err(Error::LackingMutex));
    drop(g);
    assert_eq!(t.held_locks(), 0);
}

#[test]
fn mutual_exclusion_under_contention() {
    let lock = UpgradeableRwLock::new_arc(NONE);
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));
    let promoted = Arc::new(AtomicUsize::new(0));
    let threads = num_cpus::get().clamp(2, 8);
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let (lock, readers, writers, promoted, barrier) = (
                Arc::clone(&lock),
                Arc::clone(&readers),
                Arc::clone(&writers),
                Arc::clone(&promoted),
                Arc::clone(&barrier),
            );
            thread::spawn(move || {
                let t = ThreadContext::new();
                barrier.wait();
                for round in 0..200 {
                    if (i + round) % 3 == 0 {
                        let _g = lock.write(Some(&t), Wait::Forever).unwrap();
                        assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        writers.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    let mut g = lock.read(Some(&t), Wait::Forever).unwrap();
                    readers.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(writers.load(Ordering::SeqCst), 0);
                    if round % 5 == 0 && g.reserve().is_ok() {
                        readers.fetch_sub(1, Ordering::SeqCst);
                        g.redeem(Wait::Forever).unwrap();
                        assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        promoted.fetch_add(1, Ordering::SeqCst);
                        writers.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("worker panicked");
    }
    assert!(promoted.load(Ordering::SeqCst) > 0);
    assert_eq!(readers.load(Ordering::SeqCst), 0);
}
