//! io_uring receiver engine.
//!
//! Single-threaded completion loop: accepts, reads, sends, and closes all
//! flow through one ring, with completions routed by the tag in the low
//! nibble of user_data. Buffers come from the configured provider; with
//! fixed files, accepted sockets live in the registered file table and are
//! addressed by slot index.

mod buf_ring;
mod completion;
mod conn;
mod fd_slots;
mod provider;

pub use provider::BGID;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use io_uring::types::{DestinationSlot, Fd, SubmitArgs, Timespec};
use io_uring::{cqueue, opcode, IoUring};
use slab::Slab;

use crate::config::UringRxConfig;
use crate::error::{fatal, Error};
use crate::runner::{Runner, RxCounters};
use crate::signal;
use crate::stats::RxStats;
use completion::{OpTag, UserData, PROVIDE_INDEX};
use conn::{SockFd, SockState};
use fd_slots::FixedSlotPool;
use provider::Provider;

/// How long the post-stop drain may run before the engine gives up.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

struct ListenSock {
    fd: RawFd,
    /// Accept sockaddr scratch; one accept is in flight per listener, so a
    /// single stable slot suffices.
    addr: libc::sockaddr_storage,
    addr_len: libc::socklen_t,
    /// Fixed-file slot reserved for the in-flight direct accept.
    next_accept_slot: Option<u32>,
    closed: bool,
}

pub struct UringRunner {
    name: String,
    cfg: UringRxConfig,
    print_rx_stats: bool,
    print_read_stats: bool,
    ring: IoUring,
    /// Ring was built R_DISABLED and must be enabled on the loop thread.
    created_disabled: bool,
    /// Kernel advertises FEAT_CQE_SKIP.
    cqe_skip: bool,
    provider: Provider,
    conns: Slab<Box<SockState>>,
    listeners: Slab<Box<ListenSock>>,
    slot_pool: Option<FixedSlotPool>,
    /// Response bytes come from here; content is irrelevant. Grows to the
    /// largest response seen.
    send_buff: Vec<u8>,
    cqe_batch: Vec<(u64, i32, u32)>,
    counters: RxCounters,
    stopping: bool,
}

// Kernel-facing pointers (msghdr, sockaddr scratch, arenas) all live in
// boxed state owned by this struct; the runner moves to its loop thread
// before any SQE is submitted.
unsafe impl Send for UringRunner {}

fn setup_ring(cfg: &UringRxConfig) -> Result<IoUring, Error> {
    // Several SQEs (send, read) commonly fan out of one CQE, so size the CQ
    // generously unless told otherwise.
    let cq_entries = if cfg.cqe_count > 0 {
        cfg.cqe_count
    } else {
        128 * cfg.sqe_count
    };

    let build = |newer_flags: bool| {
        let mut builder = IoUring::builder();
        if newer_flags {
            builder.setup_submit_all();
            builder.setup_coop_taskrun();
        }
        builder.setup_cqsize(cq_entries);
        if cfg.defer_taskrun {
            builder.setup_defer_taskrun();
            builder.setup_single_issuer();
            builder.setup_r_disabled();
        }
        builder.build(cfg.sqe_count)
    };

    match build(true) {
        Ok(ring) => Ok(ring),
        Err(e) => {
            tracing::warn!("ring init failed ({e}), retrying without SUBMIT_ALL | COOP_TASKRUN");
            build(false).map_err(|e| Error::RingSetup(format!("io_uring init: {e}")))
        }
    }
}

impl UringRunner {
    pub fn new(
        name: String,
        cfg: UringRxConfig,
        print_rx_stats: bool,
        print_read_stats: bool,
    ) -> Result<Self, Error> {
        let ring = setup_ring(&cfg)?;
        let cqe_skip = ring.params().is_feature_skip_cqe_on_success();

        let provider = Provider::from_config(&cfg)?;
        provider.register(&ring)?;

        let slot_pool = if cfg.fixed_files {
            ring.submitter()
                .register_files_sparse(cfg.fixed_file_count)
                .map_err(|e| Error::RingSetup(format!("register file table: {e}")))?;
            Some(FixedSlotPool::new(cfg.fixed_file_count))
        } else {
            None
        };

        Ok(Self {
            name,
            created_disabled: cfg.defer_taskrun,
            cfg,
            print_rx_stats,
            print_read_stats,
            ring,
            cqe_skip,
            provider,
            conns: Slab::new(),
            listeners: Slab::new(),
            slot_pool,
            send_buff: vec![0u8; 2048],
            cqe_batch: Vec::with_capacity(1024),
            counters: RxCounters::default(),
            stopping: false,
        })
    }

    /// Push one SQE, making room with a submit if the queue is full.
    fn push_sqe(&mut self, entry: io_uring::squeue::Entry) {
        unsafe {
            if self.ring.submission().push(&entry).is_ok() {
                return;
            }
        }
        self.submit();
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                fatal(format!("{}: submission queue full after submit", self.name));
            }
        }
    }

    fn submit(&mut self) {
        match self.ring.submit() {
            Ok(_) => {}
            Err(e) if self.stopping => {
                tracing::debug!("{}: submit while stopping: {e}", self.name);
            }
            Err(e) => fatal(format!("{}: submit: {e}", self.name)),
        }
    }

    /// Re-lend free buffers to the kernel (V1 only). `force` ignores the
    /// low-watermark gate.
    fn provide_buffers(&mut self, force: bool) {
        if !matches!(self.provider, Provider::V1(_)) {
            return;
        }
        if !(force || self.provider.needs_to_provide()) {
            return;
        }
        if self.cfg.provided_buffer_compact {
            self.provider.compact();
        }
        while let Some(entry) = self.provider.provide_entry() {
            let entry = entry.user_data(UserData::encode(OpTag::Other, PROVIDE_INDEX).raw());
            self.push_sqe(entry);
        }
    }

    fn add_accept(&mut self, key: usize) {
        let entry = {
            let ls = &mut self.listeners[key];
            ls.addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let addr_ptr = &mut ls.addr as *mut libc::sockaddr_storage as *mut libc::sockaddr;
            if let Some(pool) = &mut self.slot_pool {
                if ls.next_accept_slot.is_some() {
                    fatal("only one accept may be in flight per listener");
                }
                let Some(slot) = pool.alloc() else {
                    fatal("no free fixed-file slot for accept");
                };
                ls.next_accept_slot = Some(slot);
                let dest = DestinationSlot::try_from_slot_target(slot)
                    .unwrap_or_else(|_| fatal(format!("bad fixed-file slot {slot}")));
                opcode::Accept::new(Fd(ls.fd), addr_ptr, &mut ls.addr_len)
                    .file_index(Some(dest))
                    .flags(libc::SOCK_NONBLOCK)
                    .build()
            } else {
                opcode::Accept::new(Fd(ls.fd), addr_ptr, &mut ls.addr_len)
                    .flags(libc::SOCK_NONBLOCK)
                    .build()
            }
        };
        let entry = entry.user_data(UserData::encode(OpTag::Accept, key).raw());
        self.push_sqe(entry);
    }

    fn add_read(&mut self, key: usize) {
        let entry = {
            let sock = &mut self.conns[key];
            sock.prepare_read(&self.provider)
        };
        let entry = entry.user_data(UserData::encode(OpTag::Read, key).raw());
        self.push_sqe(entry);
    }

    fn add_send(&mut self, key: usize, len: u64) {
        let len = len.min(u32::MAX as u64) as u32;
        if self.send_buff.len() < len as usize {
            self.send_buff.resize(len as usize, 0);
        }
        let entry = self.conns[key]
            .prepare_send(self.send_buff.as_ptr(), len)
            .user_data(UserData::encode(OpTag::Write, key).raw());
        self.push_sqe(entry);
    }

    fn new_conn(&mut self, fd: SockFd) {
        let sock = Box::new(SockState::new(
            &self.cfg,
            fd,
            self.provider.in_use(),
            self.cqe_skip,
        ));
        let key = self.conns.insert(sock);
        self.add_read(key);
        self.counters.new_sock();
    }

    /// Pick up connections that raced ahead of the completed accept.
    fn drain_accept4(&mut self, key: usize) {
        let fd = self.listeners[key].fd;
        loop {
            let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let sock_fd = unsafe {
                libc::accept4(
                    fd,
                    &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_NONBLOCK,
                )
            };
            if sock_fd < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    break;
                }
                fatal(format!("{}: accept4: {err}", self.name));
            }
            self.new_conn(SockFd::Raw(sock_fd));
        }
    }

    fn on_accept(&mut self, key: usize, res: i32) {
        if !self.listeners.contains(key) {
            return;
        }

        if res < 0 {
            // The reserved slot must go back even on failure, or it leaks
            // across the drain.
            if let Some(slot) = self.listeners[key].next_accept_slot.take() {
                if let Some(pool) = &mut self.slot_pool {
                    pool.free(slot);
                }
            }
            if !self.stopping {
                fatal(format!(
                    "{}: accept failed: {}",
                    self.name,
                    io::Error::from_raw_os_error(-res)
                ));
            }
            return;
        }

        let fd = if self.slot_pool.is_some() {
            if res > 0 {
                fatal(
                    "direct accept returned a plain fd; \
                     this kernel does not support accept into the file table",
                );
            }
            let Some(slot) = self.listeners[key].next_accept_slot.take() else {
                fatal("accept completion without a reserved slot");
            };
            SockFd::Fixed(slot)
        } else {
            SockFd::Raw(res)
        };
        self.new_conn(fd);

        if self.stopping {
            return;
        }
        if self.cfg.supports_nonblock_accept && self.slot_pool.is_none() {
            self.drain_accept4(key);
        }
        self.add_accept(key);
    }

    fn on_read(&mut self, key: usize, res: i32, flags: u32) {
        let Some(sock) = self.conns.get_mut(key) else {
            fatal(format!("read completion for unknown connection {key}"));
        };
        let multishot = sock.is_multishot();
        let out = sock.did_read(&self.provider, res, flags);

        if let Some(bid) = out.recycle {
            self.provider.return_index(bid);
            self.provide_buffers(false);
        }

        if out.amount > 0 {
            let pending = self.conns[key].take_send();
            if pending.to_write > 0 {
                self.counters.requests += pending.count as u64;
                self.add_send(key, pending.to_write);
            }
            self.counters.bytes += out.amount as u64;
            if !(multishot && cqueue::more(flags)) {
                self.add_read(key);
            }
            return;
        }

        if res == -libc::ENOBUFS {
            // The watermark plus compaction must keep the kernel stocked;
            // running dry is an accounting bug, not backpressure.
            fatal(format!(
                "{}: out of provided buffers (userspace holds {})",
                self.name,
                self.provider.to_provide_count()
            ));
        }
        if res < 0 && res != -libc::ECONNRESET && !self.stopping {
            tracing::warn!(
                "{}: unexpected read result {res} ({}), closing",
                self.name,
                io::Error::from_raw_os_error(-res)
            );
        }

        if self.slot_pool.is_some() {
            let entry = self.conns[key]
                .prepare_close()
                .user_data(UserData::encode(OpTag::Other, key).raw());
            self.push_sqe(entry);
        } else {
            self.conns[key].do_close();
            self.conns.remove(key);
            self.counters.del_sock();
        }
    }

    fn on_write(&mut self, key: usize, res: i32) {
        // Successful sends are usually skipped via CQE_SKIP_SUCCESS.
        if res < 0 {
            if let Some(sock) = self.conns.get(key) {
                if !sock.closing() {
                    tracing::warn!(
                        "{}: send failed on live socket: {}",
                        self.name,
                        io::Error::from_raw_os_error(-res)
                    );
                }
            }
        }
    }

    fn on_other(&mut self, key: usize, res: i32) {
        if key == PROVIDE_INDEX {
            // Successful provide_buffers are skipped; anything here failed.
            if res < 0 {
                fatal(format!(
                    "{}: provide_buffers failed: {}",
                    self.name,
                    io::Error::from_raw_os_error(-res)
                ));
            }
            return;
        }

        let Some(sock) = self.conns.get(key) else {
            return;
        };
        if !sock.closing() {
            return;
        }
        if res == 0 || res == -libc::EBADF {
            if let SockFd::Fixed(slot) = sock.fd() {
                if let Some(pool) = &mut self.slot_pool {
                    pool.free(slot);
                }
            }
        } else {
            tracing::warn!("{}: unable to close socket, ret={res}", self.name);
        }
        self.conns.remove(key);
        self.counters.del_sock();
    }

    fn dispatch(&mut self, user_data: u64, res: i32, flags: u32, reads: &mut u32) {
        let ud = UserData(user_data);
        match ud.tag() {
            Some(OpTag::Accept) => self.on_accept(ud.index(), res),
            Some(OpTag::Read) => {
                *reads += 1;
                self.on_read(ud.index(), res, flags);
            }
            Some(OpTag::Write) => self.on_write(ud.index(), res),
            Some(OpTag::Other) => self.on_other(ud.index(), res),
            None => fatal(format!("unexpected completion user_data {user_data:#x}")),
        }
    }

    fn is_overflow(&mut self) -> bool {
        self.ring.submission().cq_overflow()
    }
}

impl Runner for UringRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), Error> {
        if self.created_disabled {
            // R_DISABLED rings are enabled on the loop thread, which then
            // becomes the single issuer.
            self.ring
                .submitter()
                .register_enable_rings()
                .map_err(|e| Error::RingSetup(format!("enable rings: {e}")))?;
        }
        if matches!(self.provider, Provider::V1(_)) {
            self.provide_buffers(true);
            self.submit();
        }
        Ok(())
    }

    fn run(&mut self, shutdown: &AtomicBool) {
        let mut stats = RxStats::new(&self.name, self.print_read_stats);
        let mut timeout = Timespec::new().sec(1);
        let mut drain_started: Option<Instant> = None;

        while self.counters.socks() > 0 || !self.stopping {
            let was_overflow = self.is_overflow();
            let mut reads = 0u32;
            self.provide_buffers(false);

            stats.start_wait();
            if was_overflow {
                // Flush kernel-side overflow into the CQ before processing.
                if let Err(e) = self.ring.submitter().submit() {
                    if !self.stopping {
                        fatal(format!("{}: overflow flush: {e}", self.name));
                    }
                }
            } else {
                let args = SubmitArgs::new().timespec(&timeout);
                match self.ring.submitter().submit_with_args(1, &args) {
                    Ok(_) => {}
                    Err(e)
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                        ) => {}
                    Err(e) => fatal(format!("{}: submit_and_wait: {e}", self.name)),
                }
            }
            stats.done_wait();

            if shutdown.load(Ordering::Relaxed) || signal::should_shutdown() {
                if self.stopping {
                    if drain_started.is_some_and(|t| t.elapsed() > DRAIN_DEADLINE) {
                        tracing::warn!(
                            "{}: giving up drain with {} sockets live",
                            self.name,
                            self.counters.socks()
                        );
                        break;
                    }
                } else {
                    tracing::debug!("{}: stopping", self.name);
                    self.stop();
                    timeout = Timespec::new().nsec(100_000_000);
                    drain_started = Some(Instant::now());
                }
            }

            self.cqe_batch.clear();
            {
                let cq = self.ring.completion();
                for cqe in cq {
                    self.cqe_batch
                        .push((cqe.user_data(), cqe.result(), cqe.flags()));
                }
            }
            for i in 0..self.cqe_batch.len() {
                let (user_data, res, flags) = self.cqe_batch[i];
                self.dispatch(user_data, res, flags, &mut reads);
            }

            if self.print_rx_stats {
                stats.done_loop(self.counters.bytes, self.counters.requests, reads, was_overflow);
            }
        }

        if let Some(pool) = &self.slot_pool {
            if self.counters.socks() == 0 {
                // Every connection slot must have come home through a close
                // completion; only in-flight accept reservations may be out.
                let reserved = self
                    .listeners
                    .iter()
                    .filter(|(_, ls)| ls.next_accept_slot.is_some())
                    .count();
                debug_assert_eq!(pool.available() + reserved, pool.capacity() as usize);
            }
        }
        tracing::debug!("{}: done socks={}", self.name, self.counters.socks());
    }

    fn stop(&mut self) {
        self.stopping = true;
        for (_, ls) in self.listeners.iter_mut() {
            if !ls.closed {
                unsafe { libc::close(ls.fd) };
                ls.closed = true;
            }
        }
    }

    fn add_listen_sock(&mut self, fd: RawFd, v6: bool) {
        let ls = Box::new(ListenSock {
            fd,
            addr: unsafe { std::mem::zeroed() },
            addr_len: 0,
            next_accept_slot: None,
            closed: false,
        });
        let key = self.listeners.insert(ls);
        tracing::debug!("{}: listening on fd {fd} v6={v6}", self.name);
        self.add_accept(key);
    }
}

impl Drop for UringRunner {
    fn drop(&mut self) {
        if self.counters.socks() > 0 {
            tracing::debug!(
                "{}: dropping with {} sockets live, stopping={}",
                self.name,
                self.counters.socks(),
                self.stopping
            );
        }
        for (_, ls) in self.listeners.iter_mut() {
            if !ls.closed {
                unsafe { libc::close(ls.fd) };
                ls.closed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_rx, RxSpec};

    fn uring_cfg(spec: &str) -> UringRxConfig {
        match parse_rx(spec).unwrap() {
            RxSpec::Uring(cfg) => cfg,
            _ => panic!("wrong engine"),
        }
    }

    /// io_uring may be unavailable (old kernel, seccomp); these tests skip
    /// rather than fail in that case.
    fn try_runner(spec: &str) -> Option<UringRunner> {
        match UringRunner::new("io_uring test".into(), uring_cfg(spec), false, false) {
            Ok(r) => Some(r),
            Err(e) => {
                eprintln!("skipping io_uring test: {e}");
                None
            }
        }
    }

    #[test]
    fn construct_default_engine() {
        let Some(runner) = try_runner(
            "io_uring provided_buffer_count=64 fixed_file_count=64 sqe_count=16 cqe_count=64",
        ) else {
            return;
        };
        assert!(runner.slot_pool.is_some());
        assert!(runner.provider.in_use());
    }

    #[test]
    fn construct_v1_engine() {
        let Some(runner) = try_runner(
            "io_uring provide_buffers=1 provided_buffer_count=64 fixed_files=0 sqe_count=16",
        ) else {
            return;
        };
        assert!(runner.slot_pool.is_none());
        assert_eq!(runner.provider.to_provide_count(), 64);
    }

    #[test]
    fn construct_inline_engine() {
        let Some(runner) = try_runner("io_uring provide_buffers=0 fixed_files=0 sqe_count=16")
        else {
            return;
        };
        assert!(!runner.provider.in_use());
    }
}
