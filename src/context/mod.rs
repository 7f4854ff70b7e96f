// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single fiber's saved state, and the action protocol exchanged with it
//! on every switch.

pub mod arch;

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::stack::Stack;

/// The pointer-sized payload `Action::Start`/`Action::Stop` may carry.
///
/// Mirrors the `YieldData` union from which this design is derived: every
/// variant fits in a machine word, so no heap indirection is needed to cross
/// a context switch.
#[derive(Debug, Clone, Copy)]
pub enum Payload {
    /// No payload.
    None,
    /// An opaque pointer, typically into data owned by the caller.
    Ptr(*mut ()),
    I32(i32),
    U32(u32),
    USize(usize),
    ISize(isize),
}

/// One step of the switch protocol between a scheduler and a fiber.
///
/// `Start`/`Throw` only ever travel scheduler-to-fiber; `Stop`/`Sched` only
/// ever travel fiber-to-scheduler.
#[derive(Debug)]
pub enum Action {
    /// Resume (or begin) the fiber normally, delivering `Payload`.
    Start(Payload),
    /// Resume the fiber by raising this I/O error at its current await point.
    Throw(std::io::Error),
    /// The fiber voluntarily suspended via `yield_now`. Carries no payload:
    /// `yield_now` is a bare `yield()` per spec §6, not the `yield(payload)
    /// -> payload` round-trip of spec §3/§4.3.
    Sched,
    /// The fiber either finished running or is parking itself pending I/O;
    /// which one is recorded on the `Context` itself (`finished`/`watcher`).
    Stop(Payload),
}

/// Installed on the running fiber by `yield_now`/`Async::*` just before
/// switching back to the scheduler, to tell the scheduler what to do with
/// the now-suspended context: park it in the I/O wait table, or just drop it
/// back on the ready queue.
pub trait Watcher {
    /// Called by the scheduler immediately after the fiber switches out.
    /// Implementations register the context wherever it needs to wait.
    fn install(
        self: Box<Self>,
        ctx: Box<Context>,
        scheduler: &mut crate::io::IoScheduler,
    ) -> crate::error::Result<()>;
}

/// One fiber: its stack, saved registers, body, and switch-time exchange
/// slot.
pub struct Context {
    regs: arch::Registers,
    stack: Stack,
    entry: Option<Box<dyn FnOnce() + 'static>>,
    finished: bool,
    panicked: Option<Box<dyn Any + Send>>,
    watcher: Option<Box<dyn Watcher>>,
    exchange: Cell<Option<Action>>,
}

thread_local! {
    static CURRENT: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
}

impl Context {
    /// Builds a not-yet-started fiber running `body` on `stack`.
    pub fn new(stack: Stack, body: impl FnOnce() + 'static) -> Box<Self> {
        let mut ctx = Box::new(Self {
            regs: arch::Registers::default(),
            stack,
            entry: Some(Box::new(body)),
            finished: false,
            panicked: None,
            watcher: None,
            exchange: Cell::new(None),
        });
        let ctx_ptr: *mut Context = &mut *ctx;
        ctx.regs = arch::Registers::new_for_fiber(ctx.stack.top(), ctx_ptr);
        ctx
    }

    /// Whether the fiber body has returned (or panicked) to completion.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Takes the watcher installed by the fiber during its last suspension,
    /// if any.
    pub fn take_watcher(&mut self) -> Option<Box<dyn Watcher>> {
        self.watcher.take()
    }

    /// Takes the captured panic payload, if the fiber finished by panicking.
    pub fn take_panic(&mut self) -> Option<Box<dyn Any + Send>> {
        self.panicked.take()
    }

    /// Returns the stack to its pool, consuming the (finished) context.
    pub fn into_stack(self) -> Stack {
        self.stack
    }

    /// Scheduler side: resumes this context with `action`, blocking (from
    /// the scheduler's point of view, a plain function call) until the
    /// fiber switches back out, and returns whatever action it left with.
    ///
    /// `sched_regs` is the scheduler's own saved register set, used as the
    /// switch-back target.
    pub fn resume(&mut self, action: Action, sched_regs: &mut arch::Registers) -> Action {
        self.exchange.set(Some(action));
        let ctx_ptr: *mut Context = self;
        CURRENT.with(|c| c.set(ctx_ptr));
        // Safety: `self.regs` was produced either by `Registers::new_for_fiber`
        // (first resume) or by a previous `switch_context` call that parked
        // this same still-valid stack (subsequent resumes).
        unsafe {
            arch::switch_context(sched_regs, &self.regs);
        }
        CURRENT.with(|c| c.set(std::ptr::null_mut()));
        self.exchange
            .take()
            .expect("fiber switched back without leaving an action")
    }
}

/// Fiber side: installs `watcher` on the currently running fiber. The
/// scheduler consults it the next time this fiber switches out with
/// `Action::Stop`, instead of treating the fiber as finished.
///
/// # Panics
///
/// Panics if called outside of a running fiber.
pub(crate) fn install_watcher(watcher: Box<dyn Watcher>) {
    let ctx_ptr = CURRENT.with(|c| c.get());
    assert!(
        !ctx_ptr.is_null(),
        "install_watcher called with no fiber currently running"
    );
    // Safety: see `switch_out`.
    let ctx = unsafe { &mut *ctx_ptr };
    ctx.watcher = Some(watcher);
}

/// Fiber side: suspends the currently running fiber, handing `action` to the
/// scheduler, and returns whatever action it resumes us with.
///
/// # Panics
///
/// Panics if called outside of a running fiber (i.e. not on a stack reached
/// through [`Context::resume`]).
pub(crate) fn switch_out(action: Action) -> Action {
    let ctx_ptr = CURRENT.with(|c| c.get());
    assert!(
        !ctx_ptr.is_null(),
        "switch_out called with no fiber currently running"
    );
    // Safety: `ctx_ptr` was set by `resume` for the duration of this fiber's
    // execution and is non-null by the assertion above.
    let ctx = unsafe { &mut *ctx_ptr };
    ctx.exchange.set(Some(action));
    crate::runtime::with_sched_regs(|sched_regs| {
        // Safety: `sched_regs` is the scheduler's live register slot for the
        // thread currently driving this fiber.
        unsafe {
            arch::switch_context(&mut ctx.regs, sched_regs);
        }
    });
    ctx.exchange
        .take()
        .expect("scheduler resumed fiber without leaving an action")
}

/// The trampoline every fresh fiber's stack is rigged to land on. Runs the
/// fiber body to completion, capturing panics, then hands control back to
/// the scheduler for good.
pub(crate) extern "C" fn trampoline_entry(ctx_ptr: *mut Context) -> ! {
    // Safety: `ctx_ptr` was written into `rdi`/`x0` by `Registers::new_for_fiber`
    // and is valid for as long as this fiber runs.
    let ctx = unsafe { &mut *ctx_ptr };
    let entry = ctx.entry.take().expect("fiber trampoline entered twice");

    log::trace!("fiber {:p} starting", ctx_ptr);
    match catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => {
            log::trace!("fiber {:p} finished", ctx_ptr);
        }
        Err(payload) => {
            log::warn!("fiber {:p} panicked", ctx_ptr);
            ctx.panicked = Some(payload);
        }
    }
    ctx.finished = true;
    switch_out(Action::Stop(Payload::None));
    unreachable!("a finished fiber must never be resumed");
}
