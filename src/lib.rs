//! ringbench - epoll vs io_uring TCP receiver micro-benchmark.
//!
//! Two independently implemented single-threaded receiver engines serve the
//! same length-delimited request/response workload: a readiness loop built
//! on epoll and a completion loop built on io_uring. The io_uring engine
//! exposes the tuning surface under test (provided buffers, buffer rings,
//! multishot receive, fixed files, deferred task running); both report
//! steady-state throughput with CPU, idle, and read-batch statistics.

pub mod config;
pub mod epoll;
pub mod error;
pub mod listener;
pub mod logging;
pub mod protocol;
pub mod runner;
pub mod sender;
pub mod signal;
pub mod stats;
pub mod uring;

pub use config::{parse_rx, parse_tx, EpollRxConfig, RxSpec, TxSpec, UringRxConfig};
pub use epoll::EpollRunner;
pub use error::Error;
pub use runner::{NullRunner, Runner};
pub use sender::{run_sender, Aggregate, SendResults};
pub use uring::UringRunner;
