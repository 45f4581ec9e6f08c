use std::{
    fmt, io, mem, panic,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{JoinError, StopSource, StopToken};

// A forcibly stopped thread cannot notify its joiner.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Spawned, the closure has not started yet.
    Starting,
    Running,
    /// The closure returned or panicked.
    Finished,
    /// Forcibly terminated.
    Stopped,
}

impl ThreadState {
    fn from_u8(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Starting,
            1 => ThreadState::Running,
            2 => ThreadState::Finished,
            _ => ThreadState::Stopped,
        }
    }

    pub fn is_alive(self) -> bool {
        matches!(self, ThreadState::Starting | ThreadState::Running)
    }
}

pub(crate) struct Inner {
    state: AtomicU8,
    stop_source: StopSource,
    exit_lock: Mutex<()>,
    exited: Condvar,
    #[cfg(unix)]
    native: Mutex<Option<crate::force::Pthread>>,
}

impl Inner {
    fn new() -> Inner {
        Inner {
            state: AtomicU8::new(ThreadState::Starting as u8),
            stop_source: StopSource::new(),
            exit_lock: Mutex::new(()),
            exited: Condvar::new(),
            #[cfg(unix)]
            native: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(unix)]
    pub(crate) fn lock_native(&self) -> MutexGuard<'_, Option<crate::force::Pthread>> {
        self.native.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_exit(&self) -> MutexGuard<'_, ()> {
        self.exit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self) {
        self.transition(ThreadState::Running, ThreadState::Finished);
        let _guard = self.lock_exit();
        self.exited.notify_all();
    }
}

/// A handle to a thread spawned by this crate.
///
/// Cloning is cheap, and a `Thread` does not keep the thread alive.
#[derive(Clone)]
pub struct Thread {
    native: thread::Thread,
    pub(crate) inner: Arc<Inner>,
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.native.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.native.name()
    }

    pub fn state(&self) -> ThreadState {
        self.inner.state()
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    pub fn stop_token(&self) -> StopToken {
        self.inner.stop_source.new_token()
    }

    /// Asks the thread to stop via its [`StopToken`].
    ///
    /// Does nothing for a forcibly stopped thread.
    pub fn request_stop(&self) -> bool {
        if self.state() == ThreadState::Stopped {
            return false;
        }
        let requested = self
            .inner
            .stop_source
            .request_stop_unless(|| self.state() == ThreadState::Stopped);
        if requested {
            debug!(thread = %self.describe(), "stop requested");
        }
        requested
    }

    pub(crate) fn describe(&self) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", self.id()),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Owns a spawned thread. Dropping it requests stop and joins.
pub struct JoinHandle<T> {
    thread: Thread,
    native: Option<thread::JoinHandle<T>>,
}

pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce(StopToken) -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn thread")
}

#[derive(Debug)]
pub struct Builder {
    inner: thread::Builder,
    // Holds the new thread in `Starting` until a message (or hangup) arrives.
    #[cfg(test)]
    start_gate: Option<std::sync::mpsc::Receiver<()>>,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            inner: thread::Builder::new(),
            #[cfg(test)]
            start_gate: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.inner = self.inner.name(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Builder {
        self.inner = self.inner.stack_size(size);
        self
    }

    #[cfg(test)]
    pub(crate) fn start_gate(mut self, gate: std::sync::mpsc::Receiver<()>) -> Builder {
        self.start_gate = Some(gate);
        self
    }

    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce(StopToken) -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::new(Inner::new());
        let stop_token = inner.stop_source.new_token();
        let thread_inner = Arc::clone(&inner);
        #[cfg(test)]
        let start_gate = self.start_gate;
        let native = self.inner.spawn(move || {
            #[cfg(test)]
            if let Some(gate) = start_gate {
                let _ = gate.recv();
            }
            run(&thread_inner, f, stop_token)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::thread::JoinHandleExt;
            *inner.lock_native() = Some(crate::force::Pthread(native.as_pthread_t()));
        }

        let thread = Thread {
            native: native.thread().clone(),
            inner,
        };
        debug!(thread = %thread.describe(), "spawned");
        Ok(JoinHandle {
            thread,
            native: Some(native),
        })
    }
}

fn run<F, T>(inner: &Arc<Inner>, f: F, stop_token: StopToken) -> T
where
    F: FnOnce(StopToken) -> T,
{
    #[cfg(unix)]
    crate::force::enter(inner);
    // Only a forced stop moves a thread out of `Starting`.
    if !inner.transition(ThreadState::Starting, ThreadState::Running) {
        #[cfg(unix)]
        crate::force::exit_current_thread();
    }

    struct ExitGuard<'a>(&'a Inner);

    impl Drop for ExitGuard<'_> {
        fn drop(&mut self) {
            self.0.finish();
            #[cfg(unix)]
            crate::force::leave();
        }
    }

    let _guard = ExitGuard(inner);
    f(stop_token)
}

impl<T> JoinHandle<T> {
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn stop_token(&self) -> StopToken {
        self.thread.stop_token()
    }

    pub fn request_stop(&self) -> bool {
        self.thread.request_stop()
    }

    pub fn is_finished(&self) -> bool {
        !self.thread.is_alive()
    }

    /// Waits for the thread to exit. Does not request stop.
    pub fn join(mut self) -> Result<T, JoinError> {
        let native = self.take_native();
        self.wait_for_exit(None);
        self.reap(native)
    }

    /// Like [`JoinHandle::join`], but hands the handle back if the thread
    /// is still alive after `timeout`.
    pub fn join_timeout(mut self, timeout: Duration) -> Result<Result<T, JoinError>, Self> {
        if !self.wait_for_exit(Some(Instant::now() + timeout)) {
            return Err(self);
        }
        let native = self.take_native();
        Ok(self.reap(native))
    }

    // Only `join`, `join_timeout` and `drop` take it, each consuming the
    // handle.
    fn take_native(&mut self) -> thread::JoinHandle<T> {
        match self.native.take() {
            Some(native) => native,
            None => unreachable!("join handle already consumed"),
        }
    }

    fn wait_for_exit(&self, deadline: Option<Instant>) -> bool {
        let inner = &self.thread.inner;
        let mut guard = inner.lock_exit();
        loop {
            if !inner.state().is_alive() {
                return true;
            }
            let mut timeout = POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                timeout = timeout.min(deadline - now);
            }
            guard = inner
                .exited
                .wait_timeout(guard, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn reap(&self, native: thread::JoinHandle<T>) -> Result<T, JoinError> {
        trace!(thread = %self.thread.describe(), state = ?self.thread.state(), "joining");
        match self.thread.state() {
            ThreadState::Stopped => {
                // The OS thread died without unwinding; std's join would
                // wait for a result that is never written.
                mem::forget(native);
                Err(JoinError::Stopped)
            }
            _ => {
                #[cfg(unix)]
                self.thread.inner.lock_native().take();
                native.join().map_err(JoinError::Panicked)
            }
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("thread", &self.thread)
            .finish()
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            // `request_stop` skips a forcibly stopped thread, whose
            // stop state may be locked forever.
            self.thread.request_stop();
            self.wait_for_exit(None);
            trace!(thread = %self.thread.describe(), "dropped");
            if let Err(JoinError::Panicked(payload)) = self.reap(native) {
                if !thread::panicking() {
                    panic::resume_unwind(payload)
                }
            }
        }
    }
}
