// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded cooperative fiber runtime with readiness-based I/O
//! multiplexing.
//!
//! `fiberio` runs many sequential tasks ("fibers") on one OS thread by
//! hand-switching a real machine stack per fiber, and schedules them around
//! blocking I/O the way an event loop does: a fiber that would block on a
//! read, write, or accept is parked until the kernel reports the fd ready,
//! while every other runnable fiber keeps making progress.
//!
//! ```no_run
//! let mut scheduler = fiberio::io::IoScheduler::new()?;
//! scheduler.spawn(|| {
//!     // spawning again from inside a running fiber uses the ambient
//!     // free function instead, since it has no `&mut IoScheduler` at hand.
//!     fiberio::runtime::schedule(|| println!("hello from a nested fiber")).unwrap();
//!     println!("hello from a fiber");
//! })?;
//! fiberio::runtime::scheduler_run(scheduler)?;
//! # Ok::<(), fiberio::Error>(())
//! ```
//!
//! See `README.md` for the shape of the three interlocking pieces (stack
//! pool, context switch, readiness-driven scheduler) and `DESIGN.md` for
//! where each one is grounded.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![feature(naked_functions)]
#![warn(missing_docs)]

pub mod async_io;
pub mod context;
pub mod error;
pub mod io;
pub mod runtime;
pub mod scheduler;
pub mod stack;

pub use error::{Error, Result};
pub use scheduler::Scheduler;
