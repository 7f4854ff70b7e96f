// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The core fiber scheduler: a FIFO ready-queue of fibers, run one at a time
//! on the calling OS thread.
//!
//! This module knows nothing about I/O readiness; [`crate::io::IoScheduler`]
//! builds on top of it to add that.

use std::collections::VecDeque;

use crate::context::{arch, Action, Context, Payload};
use crate::error::Result;
use crate::stack::{Stack, StackPool};

/// A FIFO scheduler for cooperatively-scheduled fibers.
pub struct Scheduler {
    ready: VecDeque<Box<Context>>,
    pool: StackPool,
    sched_regs: arch::Registers,
}

impl Scheduler {
    /// Creates an empty scheduler. No stacks are mapped until the first
    /// fiber is spawned.
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            pool: StackPool::new(),
            sched_regs: arch::Registers::default(),
        }
    }

    /// Queues a new fiber to run `body` to completion. The fiber does not
    /// start running until the scheduler gets to it.
    pub fn spawn(&mut self, body: impl FnOnce() + 'static) -> Result<()> {
        let stack = self.pool.acquire()?;
        self.ready.push_back(Context::new(stack, body));
        log::debug!("spawned fiber, {} now ready", self.ready.len());
        Ok(())
    }

    /// True if there is nothing left to run.
    pub fn empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Number of fibers currently in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn pop_ready(&mut self) -> Option<Box<Context>> {
        self.ready.pop_front()
    }

    pub(crate) fn push_ready(&mut self, ctx: Box<Context>) {
        self.ready.push_back(ctx);
    }

    pub(crate) fn release_stack(&mut self, stack: Stack) {
        self.pool.release(stack);
    }

    pub(crate) fn sched_regs_mut(&mut self) -> &mut arch::Registers {
        &mut self.sched_regs
    }

    /// Resumes `ctx` with `action`, returning whatever action it switches
    /// back with.
    pub(crate) fn resume_ctx(&mut self, ctx: &mut Context, action: Action) -> Action {
        ctx.resume(action, &mut self.sched_regs)
    }

    /// Runs exactly one fiber from the ready queue to its next suspension
    /// point. Returns `false` if the ready queue was empty.
    ///
    /// A bare `Scheduler` has no I/O wait table, so a fiber that parks
    /// itself (switches out with a watcher installed, rather than finishing)
    /// is a usage error here; use [`crate::io::IoScheduler`] for anything
    /// that calls into [`crate::async_io`].
    pub fn run_one(&mut self) -> Result<bool> {
        let Some(mut ctx) = self.pop_ready() else {
            return Ok(false);
        };
        let action = self.resume_ctx(&mut ctx, Action::Start(Payload::None));
        match action {
            Action::Sched => self.push_ready(ctx),
            Action::Stop(_) => {
                assert!(
                    ctx.take_watcher().is_none(),
                    "fiber parked on I/O but no IoScheduler is driving it"
                );
                if let Some(panic) = ctx.take_panic() {
                    self.release_stack(ctx.into_stack());
                    return Err(crate::error::Error::Fiber(panic));
                }
                self.release_stack(ctx.into_stack());
            }
            Action::Start(_) | Action::Throw(_) => {
                unreachable!("a fiber may only switch out with Sched or Stop")
            }
        }
        Ok(true)
    }

    /// Runs fibers until the ready queue is empty.
    pub fn run(&mut self) -> Result<()> {
        while !self.empty() {
            self.run_one()?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.ready.is_empty() {
            log::warn!(
                "scheduler dropped with {} fiber(s) still queued",
                self.ready.len()
            );
        }
    }
}
