//! Receiver engine boundary.
//!
//! A receiver owns its listening sockets, accepted connections, and buffer
//! arena. The driver thread constructs one, hands it listening sockets,
//! then runs it on a dedicated thread until the shutdown flag flips and the
//! drain completes.

use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use crate::error::{fatal, Error};

pub trait Runner: Send {
    fn name(&self) -> &str;

    /// One-time initialisation on the engine thread.
    fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Run until `shutdown` is observed true and in-flight work drains.
    fn run(&mut self, shutdown: &AtomicBool);

    /// Enter the stopping phase: close listen sockets. Engine thread only.
    fn stop(&mut self);

    /// Transfer ownership of a listening socket to the engine.
    fn add_listen_sock(&mut self, fd: RawFd, v6: bool);
}

/// Shared per-engine counters fed to the stats reporter.
#[derive(Default)]
pub struct RxCounters {
    pub bytes: u64,
    pub requests: u64,
    socks: usize,
}

impl RxCounters {
    pub fn new_sock(&mut self) {
        self.socks += 1;
        if self.socks % 100 == 0 {
            tracing::debug!("add sock: now {}", self.socks);
        }
    }

    pub fn del_sock(&mut self) {
        self.socks -= 1;
        if self.socks % 100 == 0 {
            tracing::debug!("del sock: now {}", self.socks);
        }
    }

    pub fn socks(&self) -> usize {
        self.socks
    }
}

/// Synthetic per-request CPU cost.
pub fn run_workload(completed: u32, workload: usize) {
    if workload == 0 || completed == 0 {
        return;
    }
    let mut acc: u64 = completed as u64;
    for _ in 0..completed as usize * workload {
        acc = acc
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
    }
    std::hint::black_box(acc);
}

/// Receiver stub for client-only mode: discards the listen socket and
/// returns immediately.
pub struct NullRunner {
    name: String,
}

impl NullRunner {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

impl Runner for NullRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, _shutdown: &AtomicBool) {}

    fn stop(&mut self) {}

    fn add_listen_sock(&mut self, fd: RawFd, _v6: bool) {
        unsafe { libc::close(fd) };
    }
}

/// Run a receiver on its own named thread.
pub fn spawn(mut runner: Box<dyn Runner>, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    let thread_name = format!("rcv-{}", runner.name());
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            if let Err(e) = runner.start() {
                fatal(format!("{}: start failed: {e}", runner.name()));
            }
            runner.run(&shutdown);
            tracing::debug!("{}: receiver done", runner.name());
        })
        .expect("spawn receiver thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_socks() {
        let mut c = RxCounters::default();
        c.new_sock();
        c.new_sock();
        assert_eq!(c.socks(), 2);
        c.del_sock();
        assert_eq!(c.socks(), 1);
    }

    #[test]
    fn workload_zero_is_free() {
        run_workload(0, 1000);
        run_workload(1000, 0);
    }
}
