// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-architecture register save/restore.
//!
//! Every backend exposes the same two items: a `Registers` struct holding
//! exactly the state a context switch must preserve, and a `switch_context`
//! function that saves the running context's registers into one `Registers`
//! and loads another's, transferring control with no further Rust code
//! executed in between.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("fiberio only supports x86_64 and aarch64 targets");
    }
}
