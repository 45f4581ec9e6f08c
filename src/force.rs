//! Forced termination of threads spawned by this crate.
//!
//! Prefer [`StopToken`](crate::StopToken): a thread that checks its token
//! gets to release what it holds. [`stop`] is for threads that never check,
//! like a runaway loop in user code, and it pays for that with everything
//! listed under its safety section.
//!
//! The mechanism is a dedicated signal (`SIGRTMIN` on Linux, `SIGUSR2`
//! elsewhere) delivered to the target with `pthread_kill`. The handler runs
//! on the target, marks it stopped and ends the OS thread without
//! unwinding. On Linux that is the raw `exit` syscall, which ends only the
//! calling thread; other platforms park the thread in `pause` for good.

use std::{cell::Cell, io, mem, ptr, sync::OnceLock};

use libc::c_int;

use crate::{
    jthread::{Inner, ThreadState},
    StopError, Thread,
};

pub(crate) struct Pthread(pub(crate) libc::pthread_t);

// SAFETY: a pthread_t is an id, usable from any thread.
unsafe impl Send for Pthread {}

thread_local! {
    static CURRENT: Cell<*const Inner> = const { Cell::new(ptr::null()) };
}

/// Forcibly terminates `thread`.
///
/// Returns once the request is delivered; the thread dies asynchronously.
/// Watch [`Thread::is_alive`] or join the thread to see it gone. Stopping
/// a thread that already finished or was already stopped does nothing.
///
/// # Safety
///
/// The target is halted wherever it happens to be. No destructors run, its
/// stack and thread locals are leaked, and every lock it holds stays locked
/// forever. That includes locks the caller cannot see, such as the
/// allocator's or stdout's. The caller must make sure nothing will ever
/// wait on state the target may have been holding.
pub unsafe fn stop(thread: &Thread) -> Result<(), StopError> {
    let inner = &thread.inner;
    if inner.transition(ThreadState::Starting, ThreadState::Stopped) {
        return Ok(());
    }

    // Held while signalling so the joiner cannot reclaim the OS thread
    // under us.
    let native = inner.lock_native();
    if inner.state() != ThreadState::Running {
        return Ok(());
    }
    let Some(pthread) = native.as_ref() else {
        return Ok(());
    };
    install_handler().map_err(StopError::Install)?;
    match unsafe { libc::pthread_kill(pthread.0, stop_signal()) } {
        0 | libc::ESRCH => Ok(()),
        code => Err(StopError::Signal {
            thread: thread.describe(),
            source: io::Error::from_raw_os_error(code),
        }),
    }
}

pub(crate) fn enter(inner: &Inner) {
    CURRENT.with(|current| current.set(inner));
}

pub(crate) fn leave() {
    CURRENT.with(|current| current.set(ptr::null()));
}

pub(crate) fn exit_current_thread() -> ! {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_exit, 0);
    }
    loop {
        unsafe {
            libc::pause();
        }
    }
}

fn stop_signal() -> c_int {
    #[cfg(target_os = "linux")]
    {
        libc::SIGRTMIN()
    }
    #[cfg(not(target_os = "linux"))]
    {
        libc::SIGUSR2
    }
}

fn install_handler() -> io::Result<()> {
    static INSTALLED: OnceLock<Result<(), i32>> = OnceLock::new();
    let res = *INSTALLED.get_or_init(|| unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handle_stop_signal as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(stop_signal(), &action, ptr::null_mut()) == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
        }
    });
    res.map_err(io::Error::from_raw_os_error)
}

// Async-signal context: only the const thread local, one atomic and the
// exit path are touched here.
extern "C" fn handle_stop_signal(_signal: c_int) {
    let inner = CURRENT.try_with(Cell::get).unwrap_or(ptr::null());
    if inner.is_null() {
        return;
    }
    // SAFETY: `leave` clears the pointer before the thread drops its `Arc`.
    let inner = unsafe { &*inner };
    if inner.transition(ThreadState::Running, ThreadState::Stopped) {
        exit_current_thread()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{jthread::Builder, spawn, JoinError};

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn stop_before_start_skips_closure() {
        let ran = Arc::new(AtomicBool::new(false));
        let (release, gate) = mpsc::channel();
        let handle = {
            let ran = Arc::clone(&ran);
            Builder::new()
                .start_gate(gate)
                .spawn(move |_stop_token| ran.store(true, Ordering::SeqCst))
                .unwrap()
        };
        let thread = handle.thread().clone();
        assert_eq!(thread.state(), ThreadState::Starting);

        unsafe { stop(&thread).unwrap() };
        assert_eq!(thread.state(), ThreadState::Stopped);
        release.send(()).unwrap();

        assert!(matches!(handle.join(), Err(JoinError::Stopped)));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!thread.is_alive());
    }

    #[test]
    fn handler_ignores_foreign_threads() {
        install_handler().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let native = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                7
            })
        };
        {
            use std::os::unix::thread::JoinHandleExt;
            let rc = unsafe { libc::pthread_kill(native.as_pthread_t(), stop_signal()) };
            assert_eq!(rc, 0);
        }
        flag.store(true, Ordering::SeqCst);
        assert_eq!(native.join().unwrap(), 7);
    }

    #[test]
    fn stopped_running_thread_reports_stopped() {
        let handle = spawn(|_stop_token| loop {
            std::hint::spin_loop();
        });
        let thread = handle.thread().clone();
        assert!(wait_until(Duration::from_secs(10), || {
            thread.state() == ThreadState::Running
        }));
        unsafe { stop(&thread).unwrap() };
        assert!(wait_until(Duration::from_secs(10), || !thread.is_alive()));
        assert_eq!(thread.state(), ThreadState::Stopped);
        assert!(handle.join().unwrap_err().is_stopped());
    }
}
