// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Binds one [`IoScheduler`] to the calling thread for the duration of
//! [`scheduler_run`], and exposes the ambient `schedule`/`yield_now`
//! free functions that read it back.
//!
//! The runtime is single-threaded by construction (spec: no OS threads are
//! ever spawned), so a `thread_local` is the direct safe-Rust reading of
//! "one globally-reachable current scheduler" — no unsafe global `static
//! mut` pointer is needed the way an ambient binding would be implemented in
//! a language without thread-locals.

use std::cell::Cell;

use crate::context::{self, arch, Action, Payload};
use crate::error::{Error, Result};
use crate::io::IoScheduler;

thread_local! {
    static CURRENT: Cell<*mut IoScheduler> = const { Cell::new(std::ptr::null_mut()) };
}

/// Binds `scheduler` as the current thread's scheduler, runs it to
/// completion via [`IoScheduler::run`], then unbinds it — including when
/// `run` returns an error or a fiber's captured panic propagates out.
///
/// # Errors
///
/// Returns [`Error::SchedulerAlreadyBound`] if a scheduler is already bound
/// on this thread (nested `scheduler_run` calls are not supported).
pub fn scheduler_run(mut scheduler: IoScheduler) -> Result<()> {
    CURRENT.with(|cell| -> Result<()> {
        if !cell.get().is_null() {
            return Err(Error::SchedulerAlreadyBound);
        }
        cell.set(&mut scheduler);
        Ok(())
    })?;

    // Run behind `catch_unwind` so the binding is always cleared, even if
    // `Error::Fiber` is turned into a real unwind by the caller afterwards
    // or `run` itself panics for some other reason.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| scheduler.run()));

    CURRENT.with(|cell| cell.set(std::ptr::null_mut()));

    match result {
        Ok(run_result) => run_result,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

/// Runs `f` with a mutable reference to the currently bound scheduler.
///
/// # Panics
///
/// Panics if no scheduler is bound on this thread; ambient calls
/// (`schedule`, `yield_now`, `Async::*`) are only valid from inside a fiber
/// running under [`scheduler_run`].
pub(crate) fn with_current<R>(f: impl FnOnce(&mut IoScheduler) -> R) -> Result<R> {
    CURRENT.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return Err(Error::NoSchedulerBound);
        }
        // Safety: `ptr` was set by `scheduler_run` to a `&mut IoScheduler`
        // that outlives every call made during its own dynamic extent, and
        // is cleared before `scheduler_run` returns.
        let scheduler = unsafe { &mut *ptr };
        Ok(f(scheduler))
    })
}

pub(crate) fn with_sched_regs<R>(f: impl FnOnce(&mut arch::Registers) -> R) -> R {
    with_current(|scheduler| f(scheduler.core_mut().sched_regs_mut()))
        .expect("with_sched_regs called with no scheduler bound")
}

/// Queues a new fiber on the currently bound scheduler.
///
/// Equivalent to the original design's free `schedule` function: callable
/// both before the scheduler starts running (to seed the initial set of
/// fibers) and from inside a running fiber (to spawn more).
pub fn schedule(body: impl FnOnce() + 'static) -> Result<()> {
    with_current(|scheduler| scheduler.spawn(body))?
}

/// Suspends the calling fiber and puts it back at the end of the ready
/// queue, resuming once every other currently-ready fiber has had a turn.
///
/// # Panics
///
/// Panics if called outside of a running fiber.
pub fn yield_now() -> Result<()> {
    match context::switch_out(Action::Sched) {
        Action::Start(_) => Ok(()),
        Action::Throw(err) => Err(err.into()),
        other => unreachable!("scheduler resumed a yielded fiber with {other:?}"),
    }
}

pub(crate) fn park_and_wait(fd: std::os::unix::io::RawFd, dir: crate::io::Direction) -> Result<()> {
    context::install_watcher(Box::new(crate::io::IoWatcher { fd, dir }));
    match context::switch_out(Action::Stop(Payload::None)) {
        Action::Start(_) => Ok(()),
        Action::Throw(err) => Err(err.into()),
        other => unreachable!("scheduler resumed a parked fiber with {other:?}"),
    }
}
