//! Engine and scenario configuration.
//!
//! Receivers and senders are described by spec strings such as
//! `"io_uring provide_buffers=1 fixed_files=0"` or `"small size=4096"`.
//! The first token selects the engine or scenario; the rest are `key=value`
//! options fed back through clap, so `--help`-style validation and defaults
//! come for free.

use clap::{ArgAction, Parser};

use crate::error::Error;

fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(format!("expected 0/1, got '{s}'")),
    }
}

/// Options common to both receiver engines.
#[derive(clap::Args, Debug, Clone)]
#[command(rename_all = "snake_case")]
pub struct RxConfig {
    /// Listen backlog.
    #[arg(long, default_value_t = 100_000)]
    pub backlog: i32,

    /// Maximum events per poll wakeup (epoll engine).
    #[arg(long, default_value_t = 32)]
    pub max_events: usize,

    /// Receive buffer size in bytes.
    #[arg(long, default_value_t = 4096)]
    pub recv_size: usize,

    /// Read with recvmsg instead of recv.
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "0")]
    pub recvmsg: bool,

    /// Synthetic per-request CPU cost (spin iterations).
    #[arg(long, default_value_t = 0)]
    pub workload: usize,

    /// Override the description used in logs and results.
    #[arg(long)]
    pub description: Option<String>,
}

/// io_uring receiver options.
#[derive(Parser, Debug, Clone)]
#[command(name = "io_uring", rename_all = "snake_case")]
pub struct UringRxConfig {
    #[command(flatten)]
    pub base: RxConfig,

    /// Kernel supports io_uring accept on a nonblocking listener; completions
    /// are then followed by an accept4 drain.
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "0")]
    pub supports_nonblock_accept: bool,

    /// Receive buffer strategy: 0 = inline per-socket buffers,
    /// 1 = provide_buffers SQEs, 2 = kernel-mapped buffer ring.
    #[arg(long, default_value_t = 2)]
    pub provide_buffers: u8,

    /// Use a registered file table with direct descriptors.
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "1")]
    pub fixed_files: bool,

    /// Submission queue size.
    #[arg(long, default_value_t = 64)]
    pub sqe_count: u32,

    /// Completion queue size; 0 derives 128x sqe_count.
    #[arg(long, default_value_t = 0)]
    pub cqe_count: u32,

    /// Total buffers in the provided-buffer arena.
    #[arg(long, default_value_t = 8000)]
    pub provided_buffer_count: u16,

    /// Size of the registered file table.
    #[arg(long, default_value_t = 16000)]
    pub fixed_file_count: u32,

    /// Reprovision threshold for provide_buffers=1; -1 derives a quarter of
    /// the arena.
    #[arg(long, default_value_t = -1)]
    pub provided_buffer_low_watermark: i64,

    /// Coalesce the free list before providing.
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "1")]
    pub provided_buffer_compact: bool,

    /// Back the buffer-ring arena with 2MB huge pages (provide_buffers=2).
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "0")]
    pub huge_pages: bool,

    /// Use multishot receive.
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "1")]
    pub multishot_recv: bool,

    /// IORING_SETUP_DEFER_TASKRUN + SINGLE_ISSUER.
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "0")]
    pub defer_taskrun: bool,
}

impl UringRxConfig {
    /// Effective low watermark: a quarter of the arena unless given.
    pub fn low_watermark(&self) -> usize {
        if self.provided_buffer_low_watermark < 0 {
            self.provided_buffer_count as usize / 4
        } else {
            self.provided_buffer_low_watermark as usize
        }
    }
}

/// epoll receiver options.
#[derive(Parser, Debug, Clone)]
#[command(name = "epoll", rename_all = "snake_case")]
pub struct EpollRxConfig {
    #[command(flatten)]
    pub base: RxConfig,

    /// Defer sends into a queue serviced after the read pass.
    #[arg(long, value_parser = parse_bool, action = ArgAction::Set, default_value = "0")]
    pub batch_send: bool,
}

/// One parsed `--rx` specification.
#[derive(Debug, Clone)]
pub enum RxSpec {
    Uring(UringRxConfig),
    Epoll(EpollRxConfig),
}

impl RxSpec {
    pub fn engine_name(&self) -> &'static str {
        match self {
            RxSpec::Uring(_) => "io_uring",
            RxSpec::Epoll(_) => "epoll",
        }
    }

    pub fn base(&self) -> &RxConfig {
        match self {
            RxSpec::Uring(cfg) => &cfg.base,
            RxSpec::Epoll(cfg) => &cfg.base,
        }
    }

    /// Short description: the override, or the non-default options.
    pub fn describe(&self) -> String {
        if let Some(d) = &self.base().description {
            return d.clone();
        }
        let mut out = self.engine_name().to_string();
        let base = self.base();
        if base.recvmsg {
            out.push_str(" recvmsg=1");
        }
        if base.workload != 0 {
            out.push_str(&format!(" workload={}", base.workload));
        }
        match self {
            RxSpec::Epoll(cfg) => {
                if cfg.batch_send {
                    out.push_str(" batch_send=1");
                }
            }
            RxSpec::Uring(cfg) => {
                let defaults = default_uring();
                if cfg.fixed_files != defaults.fixed_files
                    || cfg.fixed_file_count != defaults.fixed_file_count
                {
                    if cfg.fixed_files {
                        out.push_str(&format!(" fixed_files=1 (count={})", cfg.fixed_file_count));
                    } else {
                        out.push_str(" fixed_files=0");
                    }
                }
                if cfg.provide_buffers != defaults.provide_buffers {
                    out.push_str(&format!(" provide_buffers={}", cfg.provide_buffers));
                }
                if cfg.provided_buffer_count != defaults.provided_buffer_count {
                    out.push_str(&format!(
                        " provided_buffer_count={}",
                        cfg.provided_buffer_count
                    ));
                }
                if cfg.sqe_count != defaults.sqe_count {
                    out.push_str(&format!(" sqe_count={}", cfg.sqe_count));
                }
                if cfg.cqe_count != defaults.cqe_count {
                    out.push_str(&format!(" cqe_count={}", cfg.cqe_count));
                }
                if cfg.huge_pages {
                    out.push_str(" huge_pages=1");
                }
                if cfg.defer_taskrun {
                    out.push_str(" defer_taskrun=1");
                }
                if cfg.multishot_recv != defaults.multishot_recv {
                    out.push_str(&format!(" multishot_recv={}", cfg.multishot_recv as u8));
                }
            }
        }
        out
    }
}

fn default_uring() -> UringRxConfig {
    UringRxConfig::try_parse_from(["io_uring"]).expect("defaults parse")
}

fn spec_args<'a>(
    engine: &'a str,
    tokens: impl Iterator<Item = &'a str> + 'a,
) -> impl Iterator<Item = String> + 'a {
    std::iter::once(engine.to_string()).chain(tokens.map(|t| format!("--{t}")))
}

/// Parse one `--rx` spec string.
pub fn parse_rx(spec: &str) -> Result<RxSpec, Error> {
    let mut tokens = spec.split_whitespace();
    let engine = tokens
        .next()
        .ok_or_else(|| Error::Config(format!("empty rx spec '{spec}'")))?;
    match engine {
        "io_uring" => UringRxConfig::try_parse_from(spec_args(engine, tokens))
            .map(RxSpec::Uring)
            .map_err(|e| Error::Config(format!("rx spec '{spec}': {e}"))),
        "epoll" => EpollRxConfig::try_parse_from(spec_args(engine, tokens))
            .map(RxSpec::Epoll)
            .map_err(|e| Error::Config(format!("rx spec '{spec}': {e}"))),
        other => Err(Error::Config(format!(
            "unknown rx engine '{other}' (expected io_uring or epoll)"
        ))),
    }
}

#[derive(Parser, Debug, Clone, Default)]
#[command(rename_all = "snake_case")]
struct TxOverrides {
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long)]
    conns: Option<usize>,
    #[arg(long)]
    size: Option<u32>,
    #[arg(long)]
    resp: Option<u32>,
}

/// One parsed `--tx` scenario.
#[derive(Debug, Clone)]
pub struct TxSpec {
    pub name: String,
    /// Sender threads.
    pub threads: usize,
    /// Connections per thread.
    pub conns: usize,
    /// Request payload bytes.
    pub size: u32,
    /// Reply bytes requested per frame.
    pub resp: u32,
}

pub const TX_SCENARIOS: &[&str] = &["small", "medium", "large", "custom"];

/// Parse one `--tx` scenario string: a preset name plus overrides.
pub fn parse_tx(spec: &str) -> Result<TxSpec, Error> {
    let mut tokens = spec.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| Error::Config(format!("empty tx spec '{spec}'")))?;
    let (threads, conns, size, resp) = match name {
        "small" | "custom" => (2, 8, 64, 1),
        "medium" => (2, 8, 4096, 1),
        "large" => (2, 4, 65_536, 4),
        other => {
            return Err(Error::Config(format!(
                "unknown tx scenario '{other}' (expected one of {TX_SCENARIOS:?})"
            )))
        }
    };
    let over = TxOverrides::try_parse_from(spec_args(name, tokens))
        .map_err(|e| Error::Config(format!("tx spec '{spec}': {e}")))?;
    Ok(TxSpec {
        name: name.to_string(),
        threads: over.threads.unwrap_or(threads),
        conns: over.conns.unwrap_or(conns),
        size: over.size.unwrap_or(size),
        resp: over.resp.unwrap_or(resp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_defaults() {
        let spec = parse_rx("io_uring").unwrap();
        let RxSpec::Uring(cfg) = spec else {
            panic!("wrong engine")
        };
        assert_eq!(cfg.provide_buffers, 2);
        assert!(cfg.fixed_files);
        assert!(cfg.multishot_recv);
        assert_eq!(cfg.sqe_count, 64);
        assert_eq!(cfg.base.recv_size, 4096);
        // Quarter of the arena unless told otherwise.
        assert_eq!(cfg.low_watermark(), 2000);
    }

    #[test]
    fn rx_overrides() {
        let spec =
            parse_rx("io_uring provide_buffers=1 fixed_files=0 recvmsg=1 sqe_count=128").unwrap();
        let RxSpec::Uring(cfg) = spec else {
            panic!("wrong engine")
        };
        assert_eq!(cfg.provide_buffers, 1);
        assert!(!cfg.fixed_files);
        assert!(cfg.base.recvmsg);
        assert_eq!(cfg.sqe_count, 128);
    }

    #[test]
    fn rx_explicit_watermark() {
        let spec = parse_rx("io_uring provided_buffer_low_watermark=10").unwrap();
        let RxSpec::Uring(cfg) = spec else {
            panic!("wrong engine")
        };
        assert_eq!(cfg.low_watermark(), 10);
    }

    #[test]
    fn rx_epoll_batch_send() {
        let spec = parse_rx("epoll batch_send=1 recv_size=8192").unwrap();
        let RxSpec::Epoll(cfg) = spec else {
            panic!("wrong engine")
        };
        assert!(cfg.batch_send);
        assert_eq!(cfg.base.recv_size, 8192);
    }

    #[test]
    fn rx_unknown_engine() {
        assert!(parse_rx("kqueue").is_err());
        assert!(parse_rx("").is_err());
    }

    #[test]
    fn rx_unknown_option() {
        assert!(parse_rx("io_uring frobnicate=1").is_err());
    }

    #[test]
    fn tx_presets_and_overrides() {
        let tx = parse_tx("small").unwrap();
        assert_eq!((tx.threads, tx.conns, tx.size, tx.resp), (2, 8, 64, 1));
        let tx = parse_tx("large threads=4 resp=16").unwrap();
        assert_eq!((tx.threads, tx.conns, tx.size, tx.resp), (4, 4, 65_536, 16));
        assert!(parse_tx("bogus").is_err());
    }

    #[test]
    fn describe_mentions_non_defaults() {
        let spec = parse_rx("io_uring provide_buffers=1 huge_pages=1").unwrap();
        let d = spec.describe();
        assert!(d.contains("provide_buffers=1"));
        assert!(d.contains("huge_pages=1"));
        assert!(!d.contains("sqe_count"));
    }
}
