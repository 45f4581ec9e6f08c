use std::{any::Any, io};

use thiserror::Error;

/// Returned by cooperative checks once stop has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stop requested")]
pub struct StoppedError;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("thread panicked")]
    Panicked(Box<dyn Any + Send + 'static>),
    #[error("thread was forcibly stopped")]
    Stopped,
}

impl JoinError {
    pub fn is_stopped(&self) -> bool {
        matches!(self, JoinError::Stopped)
    }

    /// Panic payload, suitable for `std::panic::resume_unwind`.
    pub fn into_panic(self) -> Option<Box<dyn Any + Send + 'static>> {
        match self {
            JoinError::Panicked(payload) => Some(payload),
            JoinError::Stopped => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("failed to install the stop signal handler")]
    Install(#[source] io::Error),
    #[error("failed to signal thread {thread}")]
    Signal {
        thread: String,
        #[source]
        source: io::Error,
    },
}
