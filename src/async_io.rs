// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The synchronous-looking async I/O façade: `accept`/`read`/`write` that
//! look like ordinary blocking calls to the fiber calling them, but park the
//! fiber and let the scheduler run something else whenever the underlying
//! fd would actually block.
//!
//! Every function here sets `O_NONBLOCK` on the fd before using it,
//! unconditionally (see `DESIGN.md`'s notes on this simplification), then
//! loops: attempt the syscall, return on success, park-and-yield on
//! `WouldBlock`, and propagate any other error synchronously to the caller.

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::io::Direction;
use crate::runtime::park_and_wait;

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: `fd` is a valid, open file descriptor for the duration of this
    // call, as required by every caller in this module.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
    )
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            debug_assert!(len as usize >= std::mem::size_of::<libc::sockaddr_in>());
            // Safety: the OS filled in at least `sizeof(sockaddr_in)` bytes
            // and told us the family is AF_INET.
            let addr: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            debug_assert!(len as usize >= std::mem::size_of::<libc::sockaddr_in6>());
            // Safety: as above, for AF_INET6.
            let addr: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::from((ip, port)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported socket address family {family}"),
        )),
    }
}

/// Accepts one connection from a non-blocking listening socket, parking the
/// calling fiber until one is available.
pub fn accept(listener_fd: RawFd) -> Result<(RawFd, SocketAddr)> {
    set_nonblocking(listener_fd)?;
    loop {
        let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // Safety: `storage`/`len` describe a valid, appropriately-sized
        // output buffer for `accept`.
        let fd = unsafe {
            libc::accept(
                listener_fd,
                storage.as_mut_ptr().cast(),
                &mut len as *mut _,
            )
        };
        if fd >= 0 {
            // Safety: a non-negative return means the kernel filled `storage`.
            let storage = unsafe { storage.assume_init() };
            let addr = sockaddr_to_std(&storage, len)?;
            log::trace!("accepted fd {fd} from {addr}");
            return Ok((fd, addr));
        }
        let err = io::Error::last_os_error();
        if would_block(&err) {
            park_and_wait(listener_fd, Direction::Read)?;
            continue;
        }
        return Err(err.into());
    }
}

/// Reads into `buf` from a non-blocking fd, parking the calling fiber until
/// data (or EOF) is available. Returns `0` on EOF, same as `Read::read`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    set_nonblocking(fd)?;
    loop {
        // Safety: `buf` is a valid, initialized, appropriately-sized buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if would_block(&err) {
            park_and_wait(fd, Direction::Read)?;
            continue;
        }
        return Err(err.into());
    }
}

/// Writes `buf` to a non-blocking fd, parking the calling fiber until the fd
/// accepts at least one byte. A single call may perform a short write; loop
/// on the caller's side to write a buffer in full.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    set_nonblocking(fd)?;
    loop {
        // Safety: `buf` is a valid, initialized, appropriately-sized buffer.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if would_block(&err) {
            park_and_wait(fd, Direction::Write)?;
            continue;
        }
        return Err(err.into());
    }
}
