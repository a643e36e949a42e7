//! End-to-end scenarios exercising the scheduler, synchronization
//! primitives, interruption, and join/panic propagation together, the way a
//! user of the crate actually would -- as opposed to the unit tests
//! alongside each module, which exercise one piece in isolation.

use std::sync::{Arc, Mutex as StdMutex};

use fiber::sync::{Condvar, Mutex};

/// Lets `RUST_LOG=debug cargo test -- --nocapture` show this crate's own
/// `log::debug!`/`warn!`/`error!` output (interruption delivery, cross-thread
/// wakes, panic capture) while running these scenarios. Safe to call more
/// than once across the test binary's threads.
fn init() {
    let _ = env_logger::try_init();
}

#[test]
fn sequencing_is_fifo_within_equal_priority() {
    init();
    let log = Arc::new(StdMutex::new(Vec::new()));
    let mut handles = Vec::new();
    for id in ['A', 'B', 'C'] {
        let log = Arc::clone(&log);
        handles.push(
            fiber::Builder::new()
                .priority(1)
                .spawn(move || {
                    log.lock().unwrap().push(id);
                    fiber::this_fiber::yield_now().unwrap();
                    log.lock().unwrap().push(id);
                })
                .unwrap(),
        );
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec!['A', 'B', 'C', 'A', 'B', 'C']);
}

#[test]
fn sequencing_drains_higher_priority_first() {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (id, priority) in [('A', 3), ('B', 2), ('C', 1)] {
        let log = Arc::clone(&log);
        handles.push(
            fiber::Builder::new()
                .priority(priority)
                .spawn(move || {
                    log.lock().unwrap().push(id);
                    fiber::this_fiber::yield_now().unwrap();
                    log.lock().unwrap().push(id);
                })
                .unwrap(),
        );
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec!['A', 'A', 'B', 'B', 'C', 'C']);
}

#[test]
fn mutex_handoff_is_fifo_by_arrival_order() {
    let m = Arc::new(Mutex::new(()));
    let log = Arc::new(StdMutex::new(Vec::new()));

    let guard = m.lock().unwrap();

    let (m1, log1) = (Arc::clone(&m), Arc::clone(&log));
    let f1 = fiber::spawn(move || {
        let _g = m1.lock().unwrap();
        log1.lock().unwrap().push("F1");
    })
    .unwrap();
    fiber::scheduler::run(); // drives F1 up to the point it parks on `m`

    let (m2, log2) = (Arc::clone(&m), Arc::clone(&log));
    let f2 = fiber::spawn(move || {
        let _g = m2.lock().unwrap();
        log2.lock().unwrap().push("F2");
    })
    .unwrap();
    fiber::scheduler::run(); // and F2 too, while `m` is still held by main

    drop(guard); // hands off to F1 directly, per the fairness guarantee

    f1.join().unwrap();
    f2.join().unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["F1", "F2"]);
}

#[test]
fn condvar_wait_while_returns_once_predicate_holds() {
    let m = Arc::new(Mutex::new(0));
    let cond = Arc::new(Condvar::new());

    let (m_w, cond_w) = (Arc::clone(&m), Arc::clone(&cond));
    let w = fiber::spawn(move || {
        let guard = m_w.lock().unwrap();
        let guard = cond_w.wait_while(guard, |data| *data != 42).unwrap();
        *guard
    })
    .unwrap();

    fiber::scheduler::run(); // park W on the condvar

    {
        let mut guard = m.lock().unwrap();
        *guard = 42;
    }
    cond.notify_one();

    assert_eq!(w.join().unwrap(), 42);
}

#[test]
fn interruption_during_condvar_wait_releases_the_lock_and_leaves_no_ghost() {
    let m = Arc::new(Mutex::new(0));
    let cond = Arc::new(Condvar::new());

    let (m_w, cond_w) = (Arc::clone(&m), Arc::clone(&cond));
    let w = fiber::spawn(move || {
        let guard = m_w.lock().unwrap();
        cond_w.wait(guard).is_err()
    })
    .unwrap();

    fiber::scheduler::run(); // park W on the condvar, releasing `m`

    w.interrupt();
    assert!(w.join().unwrap(), "W should have observed Interrupted from cond.wait");

    // `m` was released internally by the interrupted wait, not leaked.
    assert!(m.try_lock().unwrap().is_some());

    // A waiter queued after the interrupted one must be the only one a
    // subsequent notify wakes -- nothing "ghost" left behind in the queue.
    let (m2, cond2) = (Arc::clone(&m), Arc::clone(&cond));
    let w2 = fiber::spawn(move || {
        let guard = m2.lock().unwrap();
        let guard = cond2.wait_while(guard, |d| *d != 7).unwrap();
        *guard
    })
    .unwrap();
    fiber::scheduler::run();
    {
        let mut guard = m.lock().unwrap();
        *guard = 7;
    }
    cond.notify_one();
    assert_eq!(w2.join().unwrap(), 7);
}

#[test]
fn cross_thread_wake_via_condvar() {
    init();
    let m = Arc::new(Mutex::new(0));
    let cond = Arc::new(Condvar::new());

    let (m_p, cond_p) = (Arc::clone(&m), Arc::clone(&cond));
    let p = fiber::spawn(move || {
        let guard = m_p.lock().unwrap();
        let guard = cond_p.wait_while(guard, |data| *data != 42).unwrap();
        *guard
    })
    .unwrap();

    fiber::scheduler::run(); // park P on this thread's condvar wait queue

    let (m_t2, cond_t2) = (Arc::clone(&m), Arc::clone(&cond));
    let t2 = std::thread::spawn(move || {
        let mut guard = m_t2.lock().unwrap();
        *guard = 42;
        drop(guard);
        cond_t2.notify_one();
    });
    t2.join().unwrap();

    // The notify landed in this thread's cross-thread inbox; `join` pumps
    // the scheduler, which drains it before picking the next ready fiber.
    assert_eq!(p.join().unwrap(), 42);
}

#[derive(Debug)]
struct DomainError {
    code: i32,
}

#[test]
fn join_rethrows_the_target_fibers_panic_payload() {
    init();
    let f = fiber::spawn(|| {
        std::panic::panic_any(DomainError { code: 7 });
    })
    .unwrap();

    match f.join() {
        Err(fiber::Error::FiberPanic(payload)) => {
            let err = payload
                .downcast::<DomainError>()
                .expect("payload should be the original DomainError, not wrapped");
            assert_eq!(err.code, 7);
        }
        other => panic!("expected Err(FiberPanic(..)), got {other:?}"),
    }
}

#[test]
fn local_state_survives_being_suspended_and_resumed_repeatedly() {
    let f = fiber::spawn(|| {
        let mut counter = 0;
        for _ in 0..50 {
            counter += 1;
            fiber::this_fiber::yield_now().unwrap();
        }
        counter
    })
    .unwrap();

    // Pump the scheduler directly so this genuinely exercises 50 separate
    // suspend/resume round trips on the same stack before letting it finish.
    for _ in 0..50 {
        fiber::scheduler::run();
    }
    assert_eq!(f.join().unwrap(), 50);
}

#[cfg(unix)]
#[test]
fn dropping_a_joinable_handle_aborts_the_process() {
    use std::os::unix::process::ExitStatusExt;

    if std::env::var_os("FIBER_TEST_ABORT_CHILD").is_some() {
        init();
        let h = fiber::spawn(|| {}).unwrap();
        fiber::scheduler::run();
        drop(h); // still joinable: must abort before reaching the next line
        unreachable!("dropping a joinable handle must abort the process");
    }

    let exe = std::env::current_exe().expect("test binary path");
    let output = std::process::Command::new(exe)
        .args(["--exact", "dropping_a_joinable_handle_aborts_the_process"])
        .env("FIBER_TEST_ABORT_CHILD", "1")
        .output()
        .expect("failed to relaunch test binary as a child process");

    assert_eq!(
        output.status.signal(),
        Some(6), // SIGABRT
        "child exited with {:?} instead of aborting; stderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr),
    );
}
