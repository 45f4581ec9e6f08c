//! Threads that can be asked to stop, and, as a last resort, made to.
//!
//! Every thread spawned here gets a [`StopToken`]. Dropping its
//! [`JoinHandle`] requests stop and joins, so well-behaved code never needs
//! anything else. For code that never looks at its token there is
//! [`force::stop`], which is `unsafe` for good reason.

mod error;
mod jthread;
mod stop_token;
#[cfg(unix)]
pub mod force;

pub use crate::{
    error::{JoinError, StopError, StoppedError},
    jthread::{spawn, Builder, JoinHandle, Thread, ThreadState},
    stop_token::{StopSource, StopToken},
};
