#![cfg(unix)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc, Mutex, TryLockError,
    },
    thread,
    time::{Duration, Instant},
};

use threadstop::{force, spawn, JoinHandle, ThreadState};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn drops_within_timeout<T: Send + 'static>(handle: JoinHandle<T>) -> bool {
    let (done, finished) = mpsc::channel();
    thread::spawn(move || {
        drop(handle);
        let _ = done.send(());
    });
    finished.recv_timeout(TIMEOUT).is_ok()
}

#[test]
fn stops_counter_loop() {
    let counter = Arc::new(AtomicU64::new(0));
    let handle = {
        let counter = Arc::clone(&counter);
        spawn(move |_stop_token| loop {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };
    let thread = handle.thread().clone();
    assert!(wait_until(|| counter.load(Ordering::Relaxed) > 0));

    unsafe { force::stop(&thread).unwrap() };
    assert!(wait_until(|| !thread.is_alive()));
    assert_eq!(thread.state(), ThreadState::Stopped);

    let seen = counter.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::Relaxed), seen);

    assert!(handle.join().unwrap_err().is_stopped());
}

#[test]
fn stopping_finished_thread_is_noop() {
    let handle = spawn(|_stop_token| 1 + 1);
    let thread = handle.thread().clone();
    assert!(wait_until(|| !thread.is_alive()));

    unsafe { force::stop(&thread).unwrap() };
    assert_eq!(thread.state(), ThreadState::Finished);
    assert_eq!(handle.join().unwrap(), 2);

    // The OS thread is gone by now.
    unsafe { force::stop(&thread).unwrap() };
    assert_eq!(thread.state(), ThreadState::Finished);
}

#[test]
fn stopping_twice_is_noop() {
    let handle = spawn(|_stop_token| loop {
        std::hint::spin_loop();
    });
    let thread = handle.thread().clone();
    unsafe { force::stop(&thread).unwrap() };
    assert!(wait_until(|| !thread.is_alive()));
    unsafe { force::stop(&thread).unwrap() };
    assert_eq!(thread.state(), ThreadState::Stopped);
    // Dropping the handle of a stopped thread must not hang.
    drop(handle);
}

#[test]
fn held_lock_is_abandoned() {
    let lock = Arc::new(Mutex::new(0u32));
    let locked = Arc::new(AtomicBool::new(false));
    let handle = {
        let lock = Arc::clone(&lock);
        let locked = Arc::clone(&locked);
        spawn(move |_stop_token| {
            let mut guard = lock.lock().unwrap();
            *guard += 1;
            locked.store(true, Ordering::SeqCst);
            loop {
                std::hint::spin_loop();
            }
        })
    };
    assert!(wait_until(|| locked.load(Ordering::SeqCst)));

    unsafe { force::stop(handle.thread()).unwrap() };
    assert!(wait_until(|| handle.is_finished()));

    // No unwinding happened: the lock is neither released nor poisoned.
    assert!(matches!(lock.try_lock(), Err(TryLockError::WouldBlock)));
    assert!(!lock.is_poisoned());
    assert!(handle.join().unwrap_err().is_stopped());
}

#[test]
fn cooperative_and_forced_threads_side_by_side() {
    let polite = spawn(|stop_token| {
        stop_token.wait();
        "done"
    });
    let rude = spawn(|_stop_token| loop {
        std::hint::spin_loop();
    });

    unsafe { force::stop(rude.thread()).unwrap() };
    assert!(polite.request_stop());
    assert_eq!(polite.join().unwrap(), "done");
    assert!(rude.join().unwrap_err().is_stopped());
}

#[test]
fn stopped_token_poller_can_be_dropped() {
    let polls = Arc::new(AtomicU64::new(0));
    let handle = {
        let polls = Arc::clone(&polls);
        spawn(move |stop_token| loop {
            if stop_token.check().is_ok() {
                polls.fetch_add(1, Ordering::Relaxed);
            }
        })
    };
    let thread = handle.thread().clone();
    let token = handle.stop_token();
    assert!(wait_until(|| polls.load(Ordering::Relaxed) > 1000));

    unsafe { force::stop(&thread).unwrap() };
    assert!(wait_until(|| !thread.is_alive()));

    assert!(!thread.request_stop());
    assert!(token.check().is_ok());
    assert!(drops_within_timeout(handle));
}

#[test]
fn stopped_sleeper_can_be_dropped() {
    let ticks = Arc::new(AtomicU64::new(0));
    let handle = {
        let ticks = Arc::clone(&ticks);
        spawn(move |stop_token| {
            while stop_token.sleep(Duration::from_micros(50)).is_ok() {
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        })
    };
    let thread = handle.thread().clone();
    assert!(wait_until(|| ticks.load(Ordering::Relaxed) > 10));

    unsafe { force::stop(&thread).unwrap() };
    assert!(wait_until(|| !thread.is_alive()));
    assert_eq!(thread.state(), ThreadState::Stopped);

    assert!(!thread.request_stop());
    assert!(drops_within_timeout(handle));
}
