//! Benchmark driver.
//!
//! For every `--tx` scenario x `--rx` engine pairing: build a fresh
//! receiver, run it on its own thread, drive the sender against it, then
//! flip the shutdown flag and join. With `--server_only` the receivers run
//! until interrupted; with `--client_only` only senders run, against the
//! given ports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use ringbench::config::{self, RxSpec, TxSpec};
use ringbench::error::fatal;
use ringbench::sender::{run_sender, Aggregate, SendResults};
use ringbench::{listener, logging, runner, signal};
use ringbench::{EpollRunner, NullRunner, Runner, UringRunner};

#[derive(Parser, Debug)]
#[command(
    name = "ringbench",
    about = "Benchmark epoll and io_uring TCP receiver engines under identical workloads",
    rename_all = "snake_case"
)]
struct Cli {
    /// Receiver engine specs, e.g. "io_uring provide_buffers=1 fixed_files=0"
    /// or "epoll batch_send=1". Defaults to io_uring and epoll.
    #[arg(long = "rx")]
    rx: Vec<String>,

    /// Sender scenario specs, e.g. "small" or "large threads=4".
    #[arg(long = "tx")]
    tx: Vec<String>,

    /// Seconds each scenario runs.
    #[arg(long, default_value_t = 10)]
    time: u64,

    /// Target host (client-only mode).
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Use IPv6.
    #[arg(long)]
    v6: bool,

    /// Explicit receiver ports; assigned to receivers in order. Required for
    /// client-only mode. Without this, ephemeral ports are used.
    #[arg(long = "port")]
    ports: Vec<u16>,

    /// Repeat every tx/rx pairing this many times and aggregate.
    #[arg(long, default_value_t = 1)]
    runs: usize,

    /// Only run receivers; an external sender drives them.
    #[arg(long)]
    server_only: bool,

    /// Only run senders, against the given ports.
    #[arg(long)]
    client_only: bool,

    /// Log periodic receiver statistics.
    #[arg(long, value_parser = BoolishValueParser::new(), action = ArgAction::Set,
          default_value = "true")]
    print_rx_stats: bool,

    /// Include read-batch quantiles in the statistics.
    #[arg(long, value_parser = BoolishValueParser::new(), action = ArgAction::Set,
          default_value = "true")]
    print_read_stats: bool,

    /// Log level (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct Receiver {
    runner: Box<dyn Runner>,
    port: u16,
    label: String,
}

/// Hands out explicit ports in order, then falls back to ephemeral.
struct PortPicker {
    ports: Vec<u16>,
    next: usize,
}

impl PortPicker {
    fn new(ports: &[u16]) -> Self {
        Self {
            ports: ports.to_vec(),
            next: 0,
        }
    }

    fn pick(&mut self) -> u16 {
        let port = self.ports.get(self.next).copied().unwrap_or(0);
        self.next += 1;
        port
    }
}

fn build_receiver(cli: &Cli, spec: &RxSpec, port: u16) -> Receiver {
    match spec {
        RxSpec::Epoll(cfg) => {
            let (fd, port) = listener::mk_listen_sock(port, cli.v6, cfg.base.backlog, true)
                .unwrap_or_else(|e| fatal(format!("listen socket: {e}")));
            let mut engine = EpollRunner::new(
                format!("epoll port={port}"),
                cfg.clone(),
                cli.print_rx_stats,
                cli.print_read_stats,
            )
            .unwrap_or_else(|e| fatal(format!("epoll engine: {e}")));
            engine.add_listen_sock(fd, cli.v6);
            Receiver {
                runner: Box::new(engine),
                port,
                label: spec.describe(),
            }
        }
        RxSpec::Uring(cfg) => {
            // The ring rejects accepts on nonblocking listeners unless the
            // kernel is known to support them.
            let nonblocking = cfg.supports_nonblock_accept;
            let (fd, port) = listener::mk_listen_sock(port, cli.v6, cfg.base.backlog, nonblocking)
                .unwrap_or_else(|e| fatal(format!("listen socket: {e}")));
            let mut engine = UringRunner::new(
                format!("io_uring port={port}"),
                cfg.clone(),
                cli.print_rx_stats,
                cli.print_read_stats,
            )
            .unwrap_or_else(|e| fatal(format!("io_uring engine: {e}")));
            engine.add_listen_sock(fd, cli.v6);
            Receiver {
                runner: Box::new(engine),
                port,
                label: spec.describe(),
            }
        }
    }
}

/// One benchmark pairing: receiver thread up, sender run, drain, join.
fn run_pairing(cli: &Cli, tx: &TxSpec, receiver: Receiver) -> (String, SendResults) {
    let label = format!("tx:{} rx:{}", tx.name, receiver.label);
    tracing::info!("running {} port={}", label, receiver.port);

    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = runner::spawn(receiver.runner, shutdown.clone());

    let result = run_sender(tx, &cli.host, receiver.port, Duration::from_secs(cli.time))
        .unwrap_or_else(|e| fatal(format!("{label}: sender: {e}")));
    tracing::info!("...done sender");

    shutdown.store(true, Ordering::Release);
    if handle.join().is_err() {
        fatal(format!("{label}: receiver thread panicked"));
    }
    tracing::info!("...done receiver");

    (label, result)
}

fn report(results: Vec<(String, SendResults)>) {
    for (label, result) in &results {
        tracing::info!("{label}");
        tracing::info!("{:30}{result}", "");
    }

    // Aggregate repeats, preserving first-appearance order.
    let mut grouped: Vec<(String, Vec<SendResults>)> = Vec::new();
    for (label, result) in results {
        match grouped.iter_mut().find(|(l, _)| *l == label) {
            Some((_, list)) => list.push(result),
            None => grouped.push((label, vec![result])),
        }
    }
    for (label, list) in grouped {
        if list.len() <= 1 {
            continue;
        }
        let pps = Aggregate::new(list.iter().map(|r| r.packets_per_second).collect());
        let bps = Aggregate::new(list.iter().map(|r| r.bytes_per_second).collect());
        tracing::info!("aggregated:  {label}");
        tracing::info!(
            "{:30}packetsPerSecond={{{pps}}} bytesPerSecond={{{bps}}}",
            ""
        );
    }
}

fn serve_until_interrupted(cli: &Cli, rx_specs: &[RxSpec]) {
    let mut ports = PortPicker::new(&cli.ports);
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    tracing::info!("using receivers:");
    for spec in rx_specs {
        let receiver = build_receiver(cli, spec, ports.pick());
        tracing::info!("{} port={}", receiver.label, receiver.port);
        handles.push(runner::spawn(receiver.runner, shutdown.clone()));
    }

    while !signal::should_shutdown() {
        std::thread::sleep(Duration::from_millis(100));
    }
    shutdown.store(true, Ordering::Release);
    for handle in handles {
        let _ = handle.join();
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    signal::install();

    if cli.server_only && cli.client_only {
        fatal("only one of server_only/client_only please");
    }

    let tx_specs: Vec<TxSpec> = if cli.server_only {
        Vec::new()
    } else {
        let specs = if cli.tx.is_empty() {
            vec!["small".to_string()]
        } else {
            cli.tx.clone()
        };
        specs
            .iter()
            .map(|s| config::parse_tx(s))
            .collect::<Result<_, _>>()
            .unwrap_or_else(|e| fatal(e))
    };

    let rx_specs: Vec<RxSpec> = if cli.client_only {
        Vec::new()
    } else {
        let specs = if cli.rx.is_empty() {
            vec!["io_uring".to_string(), "epoll".to_string()]
        } else {
            cli.rx.clone()
        };
        specs
            .iter()
            .map(|s| config::parse_rx(s))
            .collect::<Result<_, _>>()
            .unwrap_or_else(|e| fatal(e))
    };

    if tx_specs.is_empty() {
        serve_until_interrupted(&cli, &rx_specs);
        tracing::debug!("all done");
        return;
    }

    let mut results = Vec::new();
    for _ in 0..cli.runs.max(1) {
        for tx in &tx_specs {
            if cli.client_only {
                if cli.ports.is_empty() {
                    fatal("please specify --port for client_only");
                }
                for &port in &cli.ports {
                    let receiver = Receiver {
                        runner: Box::new(NullRunner::new(format!("null port={port}"))),
                        port,
                        label: format!("given_port port={port}"),
                    };
                    results.push(run_pairing(&cli, tx, receiver));
                }
            } else {
                let mut ports = PortPicker::new(&cli.ports);
                for spec in &rx_specs {
                    let receiver = build_receiver(&cli, spec, ports.pick());
                    results.push(run_pairing(&cli, tx, receiver));
                }
            }
        }
    }
    report(results);
    tracing::debug!("all done");
}
