// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-size execution stacks, pooled for reuse.
//!
//! Every fiber needs a region of memory to use as its machine stack. Mapping
//! and unmapping that memory on every fiber spawn is wasteful when fibers are
//! created and destroyed continuously (the common case for a connection
//! handler), so [`StackPool`] caches freed stacks in a LIFO free list and only
//! falls back to `mmap` when the pool is empty.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Size of the usable portion of every stack this crate hands out.
pub const STACK_SIZE: usize = 4 * 1024 * 1024;

fn page_size() -> usize {
    // Safety: sysconf with _SC_PAGESIZE never fails and takes no invalid args.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A single stack region, owning its `mmap` allocation.
///
/// The region is laid out as one inaccessible guard page followed by
/// `STACK_SIZE` (rounded up to a page boundary) of read/write memory. The
/// guard page turns a stack overflow into a segfault at the boundary instead
/// of silent corruption of whatever happens to be mapped below it.
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    mmap_len: usize,
    top: NonZeroUsize,
}

// Safety: a `Stack` owns its mapping exclusively and is only ever handed to
// the one thread driving the scheduler that allocated it.
unsafe impl Send for Stack {}

impl Stack {
    /// Maps a fresh guard-paged stack region.
    pub fn new() -> io::Result<Self> {
        let page = page_size();
        let usable = STACK_SIZE.div_ceil(page) * page;
        let mmap_len = usable + page;

        // Safety: fixed-size anonymous mapping, no file descriptor involved.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Safety: `base` was just mapped with `mmap_len` bytes; the guard
        // page is the first `page` bytes and stays PROT_NONE.
        let rc = unsafe {
            libc::mprotect(
                base.wrapping_add(page).cast(),
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Safety: undo the mapping we just made.
            unsafe {
                libc::munmap(base, mmap_len);
            }
            return Err(err);
        }

        let top_addr = base as usize + mmap_len;
        log::trace!("mapped stack at {:#x}..{:#x}", base as usize, top_addr);

        Ok(Self {
            // Safety: mmap returned a non-null pointer (checked above).
            base: unsafe { NonNull::new_unchecked(base.cast()) },
            mmap_len,
            top: NonZeroUsize::new(top_addr).expect("mmap never returns an address near 0"),
        })
    }

    /// The stack pointer a fresh switch should start from: the highest
    /// address of the usable region (stacks grow down on every architecture
    /// this crate supports).
    pub fn top(&self) -> NonZeroUsize {
        self.top
    }

    /// The lowest usable address, i.e. one past the guard page.
    pub fn bottom(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.top.get() - (self.mmap_len - page_size()))
            .expect("stack region is always above address 0")
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `base`/`mmap_len` describe exactly the region `mmap` gave us.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.mmap_len);
        }
    }
}

/// A LIFO cache of [`Stack`] regions.
///
/// Acquiring pops the most recently released stack (favoring the still-warm
/// page cache over an older one), falling back to a fresh `mmap` when the
/// pool is drained. Releasing pushes the stack back without unmapping it.
/// Dropping the pool drops every cached `Stack`, which unmaps them.
#[derive(Debug, Default)]
pub struct StackPool {
    free: Vec<Stack>,
}

impl StackPool {
    /// Creates an empty pool. No memory is mapped until the first `acquire`.
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// Takes a stack from the free list, or maps a new one.
    pub fn acquire(&mut self) -> io::Result<Stack> {
        match self.free.pop() {
            Some(stack) => {
                log::trace!("reusing pooled stack ({} cached)", self.free.len());
                Ok(stack)
            }
            None => Stack::new(),
        }
    }

    /// Returns a stack to the free list for later reuse.
    pub fn release(&mut self, stack: Stack) {
        self.free.push(stack);
    }

    /// Number of stacks currently cached.
    pub fn cached(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_region() {
        let mut pool = StackPool::new();
        let a = pool.acquire().unwrap();
        let a_top = a.top();
        pool.release(a);
        assert_eq!(pool.cached(), 1);

        let b = pool.acquire().unwrap();
        assert_eq!(b.top(), a_top, "released stack should be reused verbatim");
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn fresh_stack_is_page_aligned_and_sized() {
        let stack = Stack::new().unwrap();
        let page = page_size();
        assert_eq!(stack.top().get() % page, 0);
        assert!(stack.top().get() - stack.bottom().get() >= STACK_SIZE);
    }
}
