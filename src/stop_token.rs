use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    task::{Context, Poll, Waker},
    thread,
    time::{Duration, Instant},
};

use crate::StoppedError;

/// The requesting side of a one-shot stop signal.
///
/// Dropping the source requests stop, so a thread handed a token never
/// outlives the interest of whoever owns the source.
#[derive(Default)]
pub struct StopSource {
    shared: Arc<Shared>,
}

/// The observing side, handed to the stoppable code.
#[derive(Clone)]
pub struct StopToken {
    shared: Arc<Shared>,
}

// `stop_requested` is read without the lock, so a forcibly stopped thread
// that was only polling its token never leaves `wakers` locked.
#[derive(Default)]
struct Shared {
    stop_requested: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<Waker>> {
        self.wakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn notify(&self, mut guard: MutexGuard<'_, Vec<Waker>>) {
        let wakers = std::mem::take(&mut *guard);
        drop(guard);
        self.cond.notify_all();
        for waker in wakers {
            waker.wake()
        }
    }
}

impl StopSource {
    pub fn new() -> StopSource {
        StopSource::default()
    }

    pub fn new_token(&self) -> StopToken {
        StopToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns `true` if this call is the one that requested the stop.
    pub fn request_stop(&self) -> bool {
        if self.shared.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.notify(self.shared.lock());
        true
    }

    /// Like [`StopSource::request_stop`], but gives up notifying waiters
    /// once `abandoned` says the lock holder is gone for good.
    pub(crate) fn request_stop_unless(&self, abandoned: impl Fn() -> bool) -> bool {
        if self.shared.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        loop {
            match self.shared.wakers.try_lock() {
                Ok(wakers) => break self.shared.notify(wakers),
                Err(TryLockError::Poisoned(err)) => break self.shared.notify(err.into_inner()),
                Err(TryLockError::WouldBlock) if abandoned() => break,
                Err(TryLockError::WouldBlock) => thread::yield_now(),
            }
        }
        true
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }
}

impl Drop for StopSource {
    fn drop(&mut self) {
        self.request_stop();
    }
}

impl StopToken {
    pub fn check(&self) -> Result<(), StoppedError> {
        if self.shared.stop_requested() {
            Err(StoppedError)
        } else {
            Ok(())
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Sleeps for `dur`, waking up early if stop is requested.
    pub fn sleep(&self, dur: Duration) -> Result<(), StoppedError> {
        let deadline = Instant::now() + dur;
        let mut wakers = self.shared.lock();
        loop {
            if self.shared.stop_requested() {
                return Err(StoppedError);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            wakers = self
                .shared
                .cond
                .wait_timeout(wakers, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Blocks until stop is requested.
    pub fn wait(&self) {
        let wakers = self.shared.lock();
        let _wakers = self
            .shared
            .cond
            .wait_while(wakers, |_| !self.shared.stop_requested())
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl Future for &'_ StopToken {
    type Output = StoppedError;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StoppedError> {
        let mut wakers = self.shared.lock();
        if self.shared.stop_requested() {
            return Poll::Ready(StoppedError);
        }
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
