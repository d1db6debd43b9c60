//! Per-connection socket state for the io_uring engine.
//!
//! A socket never performs I/O directly: its methods prepare SQEs for the
//! runner to push, and `did_read` interprets read completions. State lives
//! in a `Box` so the recvmsg header and inline buffer keep stable addresses
//! while the kernel holds pointers to them.

use io_uring::cqueue;
use io_uring::opcode;
use io_uring::squeue::{self, Entry};
use io_uring::types::{Fd, Fixed, RecvMsgOut};

use crate::config::UringRxConfig;
use crate::error::fatal;
use crate::protocol::{ConsumeResult, ProtocolParser};
use crate::runner::run_workload;
use crate::uring::provider::{Provider, BGID};

/// Connection identity: a kernel fd, or a slot in the registered file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockFd {
    Raw(i32),
    Fixed(u32),
}

/// Outcome of one read completion.
pub struct DidRead {
    /// Payload bytes consumed, or the non-positive completion result.
    pub amount: i32,
    /// Provided-buffer id to recycle, when one was selected.
    pub recycle: Option<u16>,
}

pub struct SockState {
    fd: SockFd,
    parser: ProtocolParser,
    /// Requests completed but not yet answered.
    pending: ConsumeResult,
    closing: bool,
    recvmsg: bool,
    multishot: bool,
    workload: usize,
    cqe_skip: bool,
    recv_hdr: libc::msghdr,
    recv_iov: libc::iovec,
    /// Inline receive buffer; empty when a provider owns the buffers.
    buf: Box<[u8]>,
}

impl SockState {
    pub fn new(cfg: &UringRxConfig, fd: SockFd, provider_in_use: bool, cqe_skip: bool) -> Self {
        let buf = if provider_in_use {
            Box::default()
        } else {
            vec![0u8; cfg.base.recv_size].into_boxed_slice()
        };
        Self {
            fd,
            parser: ProtocolParser::new(),
            pending: ConsumeResult::default(),
            closing: false,
            recvmsg: cfg.base.recvmsg,
            // Multishot needs kernel-selected buffers.
            multishot: cfg.multishot_recv && provider_in_use,
            workload: cfg.base.workload,
            cqe_skip,
            recv_hdr: unsafe { std::mem::zeroed() },
            recv_iov: unsafe { std::mem::zeroed() },
            buf,
        }
    }

    pub fn fd(&self) -> SockFd {
        self.fd
    }

    pub fn closing(&self) -> bool {
        self.closing
    }

    pub fn is_multishot(&self) -> bool {
        self.multishot
    }

    /// Drain the accumulated unsent responses.
    pub fn take_send(&mut self) -> ConsumeResult {
        std::mem::take(&mut self.pending)
    }

    /// The header must be refreshed each submission: `self` may have moved
    /// between preparations, and the iovec pointer lives inside it.
    fn arm_msghdr(&mut self, provider_in_use: bool) {
        self.recv_hdr = unsafe { std::mem::zeroed() };
        self.recv_iov = libc::iovec {
            iov_base: self.buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: self.buf.len(),
        };
        self.recv_hdr.msg_iov = &mut self.recv_iov;
        self.recv_hdr.msg_iovlen = if provider_in_use { 0 } else { 1 };
    }

    /// Prepare one receive SQE. With multishot this is armed once and
    /// yields completions until the kernel clears `CQE_F_MORE`.
    pub fn prepare_read(&mut self, provider: &Provider) -> Entry {
        if provider.in_use() {
            let len = if self.multishot {
                0
            } else {
                provider.size_per_buffer() as u32
            };
            if self.recvmsg {
                self.arm_msghdr(true);
                if self.multishot {
                    match self.fd {
                        SockFd::Raw(fd) => {
                            opcode::RecvMsgMulti::new(Fd(fd), &self.recv_hdr, BGID).build()
                        }
                        SockFd::Fixed(slot) => {
                            opcode::RecvMsgMulti::new(Fixed(slot), &self.recv_hdr, BGID).build()
                        }
                    }
                } else {
                    match self.fd {
                        SockFd::Raw(fd) => opcode::RecvMsg::new(Fd(fd), &mut self.recv_hdr)
                            .buf_group(BGID)
                            .build()
                            .flags(squeue::Flags::BUFFER_SELECT),
                        SockFd::Fixed(slot) => {
                            opcode::RecvMsg::new(Fixed(slot), &mut self.recv_hdr)
                                .buf_group(BGID)
                                .build()
                                .flags(squeue::Flags::BUFFER_SELECT)
                        }
                    }
                }
            } else if self.multishot {
                match self.fd {
                    SockFd::Raw(fd) => opcode::RecvMulti::new(Fd(fd), BGID).build(),
                    SockFd::Fixed(slot) => opcode::RecvMulti::new(Fixed(slot), BGID).build(),
                }
            } else {
                match self.fd {
                    SockFd::Raw(fd) => opcode::Recv::new(Fd(fd), std::ptr::null_mut(), len)
                        .buf_group(BGID)
                        .build()
                        .flags(squeue::Flags::BUFFER_SELECT),
                    SockFd::Fixed(slot) => opcode::Recv::new(Fixed(slot), std::ptr::null_mut(), len)
                        .buf_group(BGID)
                        .build()
                        .flags(squeue::Flags::BUFFER_SELECT),
                }
            }
        } else if self.recvmsg {
            self.arm_msghdr(false);
            match self.fd {
                SockFd::Raw(fd) => opcode::RecvMsg::new(Fd(fd), &mut self.recv_hdr).build(),
                SockFd::Fixed(slot) => opcode::RecvMsg::new(Fixed(slot), &mut self.recv_hdr).build(),
            }
        } else {
            let (ptr, len) = (self.buf.as_mut_ptr(), self.buf.len() as u32);
            match self.fd {
                SockFd::Raw(fd) => opcode::Recv::new(Fd(fd), ptr, len).build(),
                SockFd::Fixed(slot) => opcode::Recv::new(Fixed(slot), ptr, len).build(),
            }
        }
    }

    /// Prepare a send of `len` bytes from `buf`.
    pub fn prepare_send(&self, buf: *const u8, len: u32) -> Entry {
        let entry = match self.fd {
            SockFd::Raw(fd) => opcode::Send::new(Fd(fd), buf, len)
                .flags(libc::MSG_WAITALL)
                .build(),
            SockFd::Fixed(slot) => opcode::Send::new(Fixed(slot), buf, len)
                .flags(libc::MSG_WAITALL)
                .build(),
        };
        if self.cqe_skip {
            entry.flags(squeue::Flags::SKIP_SUCCESS)
        } else {
            entry
        }
    }

    /// Prepare a close SQE (direct close for fixed files).
    pub fn prepare_close(&mut self) -> Entry {
        self.closing = true;
        match self.fd {
            SockFd::Raw(fd) => opcode::Close::new(Fd(fd)).build(),
            SockFd::Fixed(slot) => opcode::Close::new(Fixed(slot)).build(),
        }
    }

    /// Synchronous close for the non-fixed-files path.
    pub fn do_close(&mut self) {
        self.closing = true;
        if let SockFd::Raw(fd) = self.fd {
            unsafe { libc::close(fd) };
        }
    }

    /// Interpret a read completion: locate the payload, run the parser, and
    /// accumulate owed response bytes.
    pub fn did_read(&mut self, provider: &Provider, res: i32, flags: u32) -> DidRead {
        if res <= 0 {
            return DidRead {
                amount: res,
                recycle: None,
            };
        }

        if provider.in_use() {
            let Some(bid) = cqueue::buffer_select(flags) else {
                fatal(format!(
                    "read completion without a buffer id (res={res} flags={flags:#x})"
                ));
            };
            let data = provider.data(bid);
            let mut payload = unsafe { std::slice::from_raw_parts(data, res as usize) };

            // Keeps the parsed recvmsg view alive while payload borrows it.
            let msg_out;
            if self.multishot && self.recvmsg {
                // The buffer starts with a kernel-produced header describing
                // name/control/payload lengths.
                match RecvMsgOut::parse(payload, &self.recv_hdr) {
                    Ok(out) => {
                        msg_out = out;
                        payload = msg_out.payload_data();
                    }
                    Err(_) => {
                        return DidRead {
                            amount: 0,
                            recycle: Some(bid),
                        }
                    }
                }
            }

            let amount = payload.len() as i32;
            self.consume(payload);
            DidRead {
                amount,
                recycle: Some(bid),
            }
        } else {
            let n = (res as usize).min(self.buf.len());
            let chunk = &self.buf[..n];
            // Split borrow: the parser does not touch buf.
            let consumed = self.parser.consume(chunk);
            run_workload(consumed.count, self.workload);
            self.pending += consumed;
            DidRead {
                amount: res,
                recycle: None,
            }
        }
    }

    fn consume(&mut self, data: &[u8]) {
        let consumed = self.parser.consume(data);
        run_workload(consumed.count, self.workload);
        self.pending += consumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_rx, RxSpec, UringRxConfig};

    fn cfg(spec: &str) -> UringRxConfig {
        match parse_rx(spec).unwrap() {
            RxSpec::Uring(c) => c,
            _ => panic!("wrong engine"),
        }
    }

    #[test]
    fn inline_socket_owns_a_buffer() {
        let sock = SockState::new(
            &cfg("io_uring provide_buffers=0 recv_size=512"),
            SockFd::Raw(7),
            false,
            false,
        );
        assert_eq!(sock.buf.len(), 512);
        assert!(!sock.is_multishot());
    }

    #[test]
    fn provider_socket_has_no_inline_buffer() {
        let sock = SockState::new(&cfg("io_uring"), SockFd::Fixed(3), true, true);
        assert!(sock.buf.is_empty());
        assert!(sock.is_multishot());
    }

    #[test]
    fn multishot_requires_provider() {
        let sock = SockState::new(
            &cfg("io_uring provide_buffers=0 multishot_recv=1"),
            SockFd::Raw(7),
            false,
            false,
        );
        assert!(!sock.is_multishot());
    }

    #[test]
    fn inline_read_parses_and_accumulates() {
        let mut sock = SockState::new(
            &cfg("io_uring provide_buffers=0 recv_size=512"),
            SockFd::Raw(7),
            false,
            false,
        );
        let provider = Provider::Inline;

        // Two frames: (len=1, resp=2) and (len=1, resp=3).
        let mut wire = Vec::new();
        for (payload, resp) in [(b"A", 2u32), (b"B", 3u32)] {
            wire.extend_from_slice(&1u32.to_le_bytes());
            wire.extend_from_slice(&resp.to_le_bytes());
            wire.extend_from_slice(payload.as_slice());
        }
        sock.buf[..wire.len()].copy_from_slice(&wire);

        let out = sock.did_read(&provider, wire.len() as i32, 0);
        assert_eq!(out.amount, wire.len() as i32);
        assert!(out.recycle.is_none());
        let pending = sock.take_send();
        assert_eq!(pending.count, 2);
        assert_eq!(pending.to_write, 5);
        // Drained.
        assert_eq!(sock.take_send().count, 0);
    }

    #[test]
    fn eof_and_errors_pass_through() {
        let mut sock = SockState::new(
            &cfg("io_uring provide_buffers=0"),
            SockFd::Raw(7),
            false,
            false,
        );
        let provider = Provider::Inline;
        let out = sock.did_read(&provider, 0, 0);
        assert_eq!(out.amount, 0);
        let out = sock.did_read(&provider, -libc::ECONNRESET, 0);
        assert_eq!(out.amount, -libc::ECONNRESET);
    }
}
