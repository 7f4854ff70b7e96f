// Copyright 2025 fiberio contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A line-oriented `GET key` / `PUT key val` / `STOP` key-value server, the
//! same protocol the reference implementation's end-to-end "supertest"
//! drives through a proxy. Half-close propagation through a proxy is
//! already covered by `echo_server`'s `shutdown(Write)`-then-read-to-EOF
//! clients; this test focuses on the line-buffering and command-dispatch
//! logic a naive byte-at-a-time reader gets wrong.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;
use std::thread;

use fiberio::io::IoScheduler;
use fiberio::runtime;

/// Buffers partial reads off a non-blocking fd and yields complete lines.
struct LineReader {
    fd: RawFd,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buf: Vec::new(),
        }
    }

    fn next_line(&mut self) -> fiberio::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let rest = self.buf.split_off(pos + 1);
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.pop(); // drop the '\n'
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            let mut chunk = [0u8; 256];
            let n = fiberio::async_io::read(self.fd, &mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn write_all(fd: RawFd, data: &[u8]) -> fiberio::Result<()> {
    let mut off = 0;
    while off < data.len() {
        off += fiberio::async_io::write(fd, &data[off..])?;
    }
    Ok(())
}

type Store = Rc<RefCell<HashMap<String, String>>>;

fn handle_kv_client(fd: RawFd, store: Store) {
    let mut reader = LineReader::new(fd);
    loop {
        let line = match reader.next_line().unwrap() {
            Some(line) => line,
            None => break,
        };
        let mut parts = line.split_whitespace();
        let reply = match parts.next() {
            Some("GET") => {
                let key = parts.next().unwrap_or_default();
                match store.borrow().get(key) {
                    Some(value) => format!("{value}\n"),
                    None => "None\n".to_string(),
                }
            }
            Some("PUT") => {
                let key = parts.next().unwrap_or_default().to_string();
                let value = parts.next().unwrap_or_default().to_string();
                store.borrow_mut().insert(key, value);
                "Ok\n".to_string()
            }
            Some("STOP") => break,
            _ => "Err\n".to_string(),
        };
        write_all(fd, reply.as_bytes()).unwrap();
    }
    // Safety: this fiber is the sole owner of `fd` from here on.
    unsafe {
        libc::close(fd);
    }
}

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn deterministic_client_transcript() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_fd = listener.into_raw_fd();

    let client = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut stream = stream;

        let transcript: &[(&str, &str)] = &[
            ("GET A", "None"),
            ("GET B", "None"),
            ("PUT A 10", "Ok"),
            ("GET A", "10"),
            ("GET B", "None"),
            ("PUT A 20", "Ok"),
            ("GET A", "20"),
        ];

        for (command, expected) in transcript {
            writeln!(stream, "{command}").unwrap();
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim_end(), *expected, "reply to {command:?}");
        }
        writeln!(stream, "STOP").unwrap();
    });

    let mut scheduler = IoScheduler::new().unwrap();
    let store: Store = Rc::new(RefCell::new(HashMap::new()));
    scheduler
        .spawn(move || {
            let (client_fd, _addr) = fiberio::async_io::accept(listener_fd).unwrap();
            handle_kv_client(client_fd, store);
            unsafe {
                libc::close(listener_fd);
            }
        })
        .unwrap();
    runtime::scheduler_run(scheduler).unwrap();

    client.join().unwrap();
}

#[test]
fn many_clients_with_randomized_commands_do_not_corrupt_the_store() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_fd = listener.into_raw_fd();

    const CLIENTS: usize = 4;
    let client_threads: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || {
                let stream = TcpStream::connect(addr).unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut stream = stream;
                let key = format!("key{i}");
                writeln!(stream, "PUT {key} {i}").unwrap();
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                assert_eq!(line.trim_end(), "Ok");

                line.clear();
                writeln!(stream, "GET {key}").unwrap();
                reader.read_line(&mut line).unwrap();
                assert_eq!(line.trim_end(), i.to_string());

                writeln!(stream, "STOP").unwrap();
            })
        })
        .collect();

    let mut scheduler = IoScheduler::new().unwrap();
    let store: Store = Rc::new(RefCell::new(HashMap::new()));
    scheduler
        .spawn(move || {
            for _ in 0..CLIENTS {
                let (client_fd, _addr) = fiberio::async_io::accept(listener_fd).unwrap();
                let store = store.clone();
                runtime::schedule(move || handle_kv_client(client_fd, store)).unwrap();
            }
            unsafe {
                libc::close(listener_fd);
            }
        })
        .unwrap();
    runtime::scheduler_run(scheduler).unwrap();

    for h in client_threads {
        h.join().unwrap();
    }
}
