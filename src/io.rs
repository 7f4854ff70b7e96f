// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness-based I/O multiplexing layered on top of the fiber scheduler
//! core.
//!
//! [`IoScheduler`] adds a wait table (fd + direction -> parked fiber) and a
//! `mio`-backed readiness notifier to [`crate::scheduler::Scheduler`]'s plain
//! ready-queue loop: whenever the ready queue runs dry but fibers are parked
//! on I/O, `run_one` blocks in `mio::Poll::poll` instead of returning, and
//! wakes exactly the fibers whose fd became ready.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::context::{Action, Context, Payload, Watcher};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

/// Which half of a full-duplex fd a fiber is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Waiting for the fd to become readable (or for a listening socket, for
    /// a connection to accept).
    Read,
    /// Waiting for the fd to become writable.
    Write,
}

/// The scheduler actually driven by [`crate::runtime::scheduler_run`].
///
/// Combines the plain ready-queue scheduler with a `mio::Poll` instance and
/// the wait table the `Async` façade parks fibers in.
pub struct IoScheduler {
    core: Scheduler,
    poll: Poll,
    events: Events,
    wait: HashMap<(RawFd, Direction), Box<Context>>,
    /// Fds currently known to the readiness notifier, independent of which
    /// directions are parked on them right now. Needed because a woken
    /// fiber can re-park on the very same fd before `reregister_or_deregister`
    /// gets a chance to run for that wakeup (see `poll_once`); without this,
    /// `register_wait` would think the fd is unregistered and call
    /// `register` on an fd mio already has, which fails with `EEXIST`.
    registered: HashSet<RawFd>,
}

impl IoScheduler {
    /// Creates a scheduler with a fresh `mio::Poll` instance.
    pub fn new() -> Result<Self> {
        Ok(Self {
            core: Scheduler::new(),
            poll: Poll::new().map_err(Error::PollerCreation)?,
            events: Events::with_capacity(128),
            wait: HashMap::new(),
            registered: HashSet::new(),
        })
    }

    /// Queues a new fiber.
    pub fn spawn(&mut self, body: impl FnOnce() + 'static) -> Result<()> {
        self.core.spawn(body)
    }

    /// True when there is nothing ready to run and nothing parked on I/O.
    pub fn empty(&self) -> bool {
        self.core.empty() && self.wait.is_empty()
    }

    pub(crate) fn core_mut(&mut self) -> &mut Scheduler {
        &mut self.core
    }

    /// Registers `ctx` as waiting on `fd` for `dir`, (re)registering the fd
    /// with the readiness notifier as needed.
    ///
    /// Only one fiber may wait on a given (fd, direction) pair at a time.
    pub(crate) fn register_wait(
        &mut self,
        ctx: Box<Context>,
        fd: RawFd,
        dir: Direction,
    ) -> Result<()> {
        if self.wait.contains_key(&(fd, dir)) {
            return Err(Error::DirectionInUse { fd, direction: dir });
        }
        let other = other_direction(dir);
        let already_other = self.wait.contains_key(&(fd, other));
        let interest = combined_interest(dir, already_other);

        // Whether `fd` is new to mio, not whether the *other* direction is
        // parked: a fiber can re-park on the same (fd, dir) it just woke up
        // on, synchronously, before `poll_once` gets around to reconciling
        // the registration for the event that woke it.
        let mut source = SourceFd(&fd);
        if self.registered.contains(&fd) {
            self.poll
                .registry()
                .reregister(&mut source, Token(fd as usize), interest)?;
        } else {
            self.poll
                .registry()
                .register(&mut source, Token(fd as usize), interest)?;
            self.registered.insert(fd);
        }
        log::trace!("parked fd {fd} for {dir:?}");
        self.wait.insert((fd, dir), ctx);
        Ok(())
    }

    /// Runs exactly one step: either a ready fiber to its next suspension,
    /// or (if the ready queue is empty but fibers are parked) blocks on
    /// `mio::Poll::poll` until at least one becomes ready and resumes it.
    ///
    /// Returns `false` only when the whole scheduler is empty.
    pub fn run_one(&mut self) -> Result<bool> {
        if let Some(mut ctx) = self.core.pop_ready() {
            let action = self.core.resume_ctx(&mut ctx, Action::Start(Payload::None));
            self.dispatch(ctx, action)?;
            return Ok(true);
        }
        if self.wait.is_empty() {
            return Ok(false);
        }
        self.poll_once()?;
        Ok(true)
    }

    /// Runs fibers and services I/O until both the ready queue and the wait
    /// table are empty.
    pub fn run(&mut self) -> Result<()> {
        while !self.empty() {
            self.run_one()?;
        }
        Ok(())
    }

    fn dispatch(&mut self, mut ctx: Box<Context>, action: Action) -> Result<()> {
        match action {
            Action::Sched => self.core.push_ready(ctx),
            Action::Stop(_) => {
                if let Some(watcher) = ctx.take_watcher() {
                    watcher.install(ctx, self)?;
                } else if let Some(panic) = ctx.take_panic() {
                    self.core.release_stack(ctx.into_stack());
                    return Err(Error::Fiber(panic));
                } else {
                    self.core.release_stack(ctx.into_stack());
                }
            }
            Action::Start(_) | Action::Throw(_) => {
                unreachable!("a fiber may only switch out with Sched or Stop")
            }
        }
        Ok(())
    }

    fn poll_once(&mut self) -> Result<()> {
        self.poll.poll(&mut self.events, None)?;
        // `is_read_closed()`/`is_write_closed()` report an orderly half-close
        // (EPOLLRDHUP), not an error: a parked reader must wake up and retry
        // its syscall so it observes EOF as a `0`-byte read, per spec §8/§4.5.
        // Only `is_error()` is a genuine error/hangup that should raise inside
        // the fiber; the one exception is a writer parked on a fd whose peer
        // closed its read side, where the retried write itself would fail.
        let woken: Vec<(RawFd, bool, bool, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token().0 as RawFd,
                    e.is_readable() || e.is_read_closed(),
                    e.is_writable() || e.is_write_closed(),
                    e.is_error(),
                    e.is_write_closed(),
                )
            })
            .collect();

        for (fd, readable, writable, is_error, write_closed) in woken {
            if readable {
                if let Some(ctx) = self.wait.remove(&(fd, Direction::Read)) {
                    self.resume_parked(ctx, fd, is_error)?;
                }
            }
            if writable {
                if let Some(ctx) = self.wait.remove(&(fd, Direction::Write)) {
                    self.resume_parked(ctx, fd, is_error || write_closed)?;
                }
            }
            self.reregister_or_deregister(fd)?;
        }
        Ok(())
    }

    fn resume_parked(&mut self, mut ctx: Box<Context>, fd: RawFd, raise: bool) -> Result<()> {
        let action = if raise {
            let err = std::io::Error::new(std::io::ErrorKind::Other, "fd reported an error event");
            self.core.resume_ctx(&mut ctx, Action::Throw(err))
        } else {
            self.core.resume_ctx(&mut ctx, Action::Start(Payload::None))
        };
        log::trace!("woke fiber parked on fd {fd}");
        self.dispatch(ctx, action)
    }

    fn reregister_or_deregister(&mut self, fd: RawFd) -> Result<()> {
        let has_read = self.wait.contains_key(&(fd, Direction::Read));
        let has_write = self.wait.contains_key(&(fd, Direction::Write));
        let mut source = SourceFd(&fd);
        match (has_read, has_write) {
            (false, false) => {
                // Best-effort: the peer may have already closed the fd.
                let _ = self.poll.registry().deregister(&mut source);
                self.registered.remove(&fd);
            }
            (true, false) => {
                self.poll
                    .registry()
                    .reregister(&mut source, Token(fd as usize), Interest::READABLE)?;
            }
            (false, true) => {
                self.poll
                    .registry()
                    .reregister(&mut source, Token(fd as usize), Interest::WRITABLE)?;
            }
            (true, true) => {
                self.poll.registry().reregister(
                    &mut source,
                    Token(fd as usize),
                    Interest::READABLE | Interest::WRITABLE,
                )?;
            }
        }
        Ok(())
    }
}

fn other_direction(dir: Direction) -> Direction {
    match dir {
        Direction::Read => Direction::Write,
        Direction::Write => Direction::Read,
    }
}

fn combined_interest(dir: Direction, other_already_parked: bool) -> Interest {
    match (dir, other_already_parked) {
        (_, true) => Interest::READABLE | Interest::WRITABLE,
        (Direction::Read, false) => Interest::READABLE,
        (Direction::Write, false) => Interest::WRITABLE,
    }
}

/// Watcher installed by [`crate::async_io`] on a fiber that needs to wait for
/// an fd to become ready.
pub(crate) struct IoWatcher {
    pub fd: RawFd,
    pub dir: Direction,
}

impl Watcher for IoWatcher {
    fn install(self: Box<Self>, ctx: Box<Context>, scheduler: &mut IoScheduler) -> Result<()> {
        scheduler.register_wait(ctx, self.fd, self.dir)
    }
}
