//! epoll receiver engine.
//!
//! Readiness-driven counterpart to the io_uring engine: a mio `Poll` with
//! edge-triggered connections, a single shared receive buffer, and a
//! per-connection unsent-reply counter. Write interest is registered only
//! while replies are outstanding; with `batch_send`, sends are deferred to
//! a queue serviced after the read pass of each wakeup.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::config::EpollRxConfig;
use crate::error::{fatal, Error};
use crate::protocol::ProtocolParser;
use crate::runner::{run_workload, Runner, RxCounters};
use crate::signal;
use crate::stats::RxStats;

/// Token offset for listeners to avoid collision with connections.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

struct EpollListener {
    listener: TcpListener,
}

struct EpollConn {
    stream: TcpStream,
    parser: ProtocolParser,
    /// Reply bytes owed but not yet written.
    to_write: u64,
    /// Whether the poll registration currently includes write interest.
    write_interest: bool,
}

pub struct EpollRunner {
    name: String,
    cfg: EpollRxConfig,
    print_rx_stats: bool,
    print_read_stats: bool,
    poll: Poll,
    events: Events,
    listeners: Slab<EpollListener>,
    conns: Slab<EpollConn>,
    /// Shared receive scratch; also the source of reply bytes, whose content
    /// is irrelevant.
    rcvbuff: Vec<u8>,
    event_scratch: Vec<(usize, bool, bool)>,
    write_queue: Vec<usize>,
    counters: RxCounters,
}

impl EpollRunner {
    pub fn new(
        name: String,
        cfg: EpollRxConfig,
        print_rx_stats: bool,
        print_read_stats: bool,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let events = Events::with_capacity(cfg.base.max_events.max(1));
        let rcvbuff = vec![0u8; cfg.base.recv_size];
        Ok(Self {
            name,
            cfg,
            print_rx_stats,
            print_read_stats,
            poll,
            events,
            listeners: Slab::new(),
            conns: Slab::new(),
            rcvbuff,
            event_scratch: Vec::with_capacity(64),
            write_queue: Vec::with_capacity(1024),
            counters: RxCounters::default(),
        })
    }

    fn accept_pending(&mut self, key: usize) {
        loop {
            match self.listeners[key].listener.accept() {
                Ok((mut stream, _addr)) => {
                    let entry = self.conns.vacant_entry();
                    let token = Token(entry.key());
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        fatal(format!("{}: register accepted sock: {e}", self.name));
                    }
                    entry.insert(EpollConn {
                        stream,
                        parser: ProtocolParser::new(),
                        to_write: 0,
                        write_interest: false,
                    });
                    self.counters.new_sock();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => fatal(format!("{}: accept: {e}", self.name)),
            }
        }
    }

    fn drive_socket(&mut self, key: usize, readable: bool, writable: bool, reads: &mut u32) {
        if readable {
            *reads += 1;
            if !self.do_read(key) {
                return;
            }
        }
        let to_write = self.conns.get(key).map(|c| c.to_write).unwrap_or(0);
        if writable || (to_write > 0 && !self.cfg.batch_send) {
            self.do_write(key);
        } else if to_write > 0 {
            self.write_queue.push(key);
        }
    }

    /// Drain the socket until EAGAIN or a short read. Returns false if the
    /// connection was torn down.
    fn do_read(&mut self, key: usize) -> bool {
        let fd = self.conns[key].stream.as_raw_fd();
        loop {
            let res = if self.cfg.base.recvmsg {
                let mut iov = libc::iovec {
                    iov_base: self.rcvbuff.as_mut_ptr() as *mut libc::c_void,
                    iov_len: self.rcvbuff.len(),
                };
                let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
                hdr.msg_iov = &mut iov;
                hdr.msg_iovlen = 1;
                unsafe { libc::recvmsg(fd, &mut hdr, libc::MSG_NOSIGNAL) }
            } else {
                unsafe {
                    libc::recv(
                        fd,
                        self.rcvbuff.as_mut_ptr() as *mut libc::c_void,
                        self.rcvbuff.len(),
                        libc::MSG_NOSIGNAL,
                    )
                }
            };

            if res <= 0 {
                let err = io::Error::last_os_error();
                if res < 0 && err.raw_os_error() == Some(libc::EAGAIN) {
                    return true;
                }
                if res < 0 && err.raw_os_error() != Some(libc::ECONNRESET) {
                    tracing::debug!("{}: read error fd={fd}: {err}", self.name);
                }
                let mut conn = self.conns.remove(key);
                let _ = self.poll.registry().deregister(&mut conn.stream);
                drop(conn);
                self.counters.del_sock();
                return false;
            }

            let n = res as usize;
            self.counters.bytes += n as u64;
            let consumed = self.conns[key].parser.consume(&self.rcvbuff[..n]);
            run_workload(consumed.count, self.cfg.base.workload);
            self.counters.requests += consumed.count as u64;
            self.conns[key].to_write += consumed.to_write;

            if n < self.rcvbuff.len() {
                return true;
            }
        }
    }

    /// Drain the unsent-reply counter, then fix up write interest.
    fn do_write(&mut self, key: usize) {
        let fd = self.conns[key].stream.as_raw_fd();
        loop {
            let to_write = self.conns[key].to_write;
            if to_write == 0 {
                break;
            }
            let n = (to_write as usize).min(self.rcvbuff.len());
            let res = unsafe {
                libc::send(
                    fd,
                    self.rcvbuff.as_ptr() as *const libc::c_void,
                    n,
                    libc::MSG_NOSIGNAL,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    break;
                }
                // Socket is probably dead; the read path will reap it.
                self.conns[key].to_write = 0;
            } else {
                self.conns[key].to_write -= (res as u64).min(to_write);
            }
        }

        let conn = &mut self.conns[key];
        if conn.write_interest && conn.to_write == 0 {
            if let Err(e) = self.poll.registry().reregister(
                &mut conn.stream,
                Token(key),
                Interest::READABLE,
            ) {
                fatal(format!("{}: drop write interest: {e}", self.name));
            }
            conn.write_interest = false;
        } else if !conn.write_interest && conn.to_write > 0 {
            if let Err(e) = self.poll.registry().reregister(
                &mut conn.stream,
                Token(key),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                fatal(format!("{}: add write interest: {e}", self.name));
            }
            conn.write_interest = true;
        }
    }
}

impl Runner for EpollRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, shutdown: &AtomicBool) {
        let mut stats = RxStats::new(&self.name, self.print_read_stats);
        while !shutdown.load(Ordering::Relaxed) && !signal::should_shutdown() {
            stats.start_wait();
            if let Err(e) = self
                .poll
                .poll(&mut self.events, Some(Duration::from_secs(1)))
            {
                if e.kind() == io::ErrorKind::Interrupted {
                    stats.done_wait();
                    continue;
                }
                fatal(format!("{}: poll: {e}", self.name));
            }
            stats.done_wait();

            if self.events.is_empty() {
                tracing::trace!("{}: no events, socks={}", self.name, self.counters.socks());
            }

            let mut reads = 0u32;
            self.event_scratch.clear();
            for event in self.events.iter() {
                self.event_scratch
                    .push((event.token().0, event.is_readable(), event.is_writable()));
            }
            for i in 0..self.event_scratch.len() {
                let (token, readable, writable) = self.event_scratch[i];
                if token >= LISTENER_TOKEN_OFFSET {
                    self.accept_pending(token - LISTENER_TOKEN_OFFSET);
                } else if self.conns.contains(token) {
                    self.drive_socket(token, readable, writable, &mut reads);
                }
            }

            for i in 0..self.write_queue.len() {
                let key = self.write_queue[i];
                if self.conns.contains(key) && self.conns[key].to_write > 0 {
                    self.do_write(key);
                }
            }
            self.write_queue.clear();

            if self.print_rx_stats {
                stats.done_loop(self.counters.bytes, self.counters.requests, reads, false);
            }
        }
        tracing::debug!("{}: done socks={}", self.name, self.counters.socks());
    }

    fn stop(&mut self) {}

    fn add_listen_sock(&mut self, fd: RawFd, _v6: bool) {
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        let mut listener = TcpListener::from_std(std_listener);
        let entry = self.listeners.vacant_entry();
        let token = Token(entry.key() + LISTENER_TOKEN_OFFSET);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
        {
            fatal(format!("{}: register listener: {e}", self.name));
        }
        entry.insert(EpollListener { listener });
        tracing::debug!("{}: listening on fd {fd}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_rx, RxSpec};

    #[test]
    fn construct_with_defaults() {
        let RxSpec::Epoll(cfg) = parse_rx("epoll").unwrap() else {
            panic!("wrong engine");
        };
        let runner = EpollRunner::new("epoll test".into(), cfg, true, true).unwrap();
        assert_eq!(runner.rcvbuff.len(), 4096);
        assert_eq!(runner.counters.socks(), 0);
    }
}
