// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86_64 System V context switch.
//!
//! `switch_context` only ever needs to preserve the callee-saved registers
//! (`rbx`, `rbp`, `r12`-`r15`) plus `rsp` itself across a swap; `rdi`/`rsi`
//! are saved and restored too purely so the very first switch into a fresh
//! fiber can hand it a `*mut Context` in `rdi`, matching the System V
//! argument-passing convention the fiber's trampoline expects.

use core::arch::naked_asm;
use std::num::NonZeroUsize;

use crate::context::Context;

/// Saved machine state for one suspended execution.
///
/// Field order is load-bearing: `switch_context`'s hand-written offsets
/// assume exactly this layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
}

impl Registers {
    /// Builds the register set for a fiber that has never been resumed.
    ///
    /// The fresh stack is laid out with a single synthetic return address —
    /// the trampoline's entry point — sixteen bytes below the top, so that
    /// after `switch_context`'s closing `ret` pops it, `rsp` satisfies the
    /// same alignment a real `call` would have produced.
    pub fn new_for_fiber(top: NonZeroUsize, ctx_ptr: *mut Context) -> Self {
        let top = top.get() as u64;
        let init_rsp = top - 16;

        // Safety: `top` is the highest address of a stack region this
        // context owns exclusively and which is at least 16 bytes long.
        unsafe {
            (init_rsp as *mut u64).write(crate::context::trampoline_entry as usize as u64);
        }

        Self {
            rsp: init_rsp,
            rdi: ctx_ptr as u64,
            ..Default::default()
        }
    }
}

/// Saves the currently running context into `out` and resumes `into`.
///
/// # Safety
///
/// `into` must describe a register set previously produced by
/// [`Registers::new_for_fiber`] or previously saved by a prior call to this
/// function with a still-valid stack backing it.
#[naked]
pub unsafe extern "C" fn switch_context(out: *mut Registers, into: *const Registers) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], r15",
        "mov [rdi + 0x10], r14",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], rbx",
        "mov [rdi + 0x30], rbp",
        "mov [rdi + 0x38], rdi",
        "mov [rdi + 0x40], rsi",
        "mov rsp, [rsi + 0x00]",
        "mov r15, [rsi + 0x08]",
        "mov r14, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov rbx, [rsi + 0x28]",
        "mov rbp, [rsi + 0x30]",
        "mov rdi, [rsi + 0x38]",
        "mov rsi, [rsi + 0x40]",
        "ret",
    )
}
