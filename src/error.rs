// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Crate-wide error type.
//!
//! Errors fall into the three categories the runtime actually produces:
//! misuse of the scheduler API, I/O failures surfaced from the kernel, and
//! panics unwound out of a fiber body. The fourth category from the original
//! design — allocation/system errors from the stack pool — piggybacks on
//! [`Error::Io`], since `mmap`/`mprotect` failures are reported as
//! [`std::io::Error`] already.

use std::any::Any;

/// Everything that can go wrong while driving a [`crate::scheduler::Scheduler`]
/// or [`crate::io::IoScheduler`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An ambient call (`schedule`, `yield_now`, `Async::*`) was made with no
    /// scheduler bound on this thread.
    #[error("no scheduler is bound on this thread; call inside scheduler_run")]
    NoSchedulerBound,

    /// [`crate::runtime::scheduler_run`] was called while a scheduler was
    /// already bound on this thread.
    #[error("a scheduler is already bound on this thread")]
    SchedulerAlreadyBound,

    /// The wait table already has a parked context for this fd/direction
    /// pair; a given direction may only ever have one waiter.
    #[error("fd {fd} is already awaited for {direction:?}")]
    DirectionInUse {
        /// The offending file descriptor.
        fd: std::os::unix::io::RawFd,
        /// Which direction was already occupied.
        direction: crate::io::Direction,
    },

    /// A syscall failed in a way that is not would-block.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Constructing the readiness notifier (`mio::Poll`) failed.
    #[error("failed to create I/O poller: {0}")]
    PollerCreation(#[source] std::io::Error),

    /// A fiber body panicked; the payload is the value passed to
    /// `std::panic::panic_any`, captured by the trampoline and re-raised on
    /// the scheduler's own stack.
    #[error("a fiber panicked")]
    Fiber(Box<dyn Any + Send>),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
