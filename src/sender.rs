//! Load generator.
//!
//! N threads each own M blocking connections. A thread writes one framed
//! request on every connection, then collects every reply, so up to M
//! requests are in flight per thread. Each completed reply counts as one
//! transaction.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::TxSpec;
use crate::error::Error;
use crate::signal;

#[derive(Debug, Clone, Copy)]
pub struct SendResults {
    pub packets_per_second: f64,
    pub bytes_per_second: f64,
}

impl std::fmt::Display for SendResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "packetsPerSecond={:.2}k bytesPerSecond={:.2}M",
            self.packets_per_second / 1000.0,
            self.bytes_per_second / 1_000_000.0
        )
    }
}

/// Run one scenario against `host:port` and gather the totals.
pub fn run_sender(
    tx: &TxSpec,
    host: &str,
    port: u16,
    run_time: Duration,
) -> Result<SendResults, Error> {
    let deadline = Instant::now() + run_time;
    let started = Instant::now();

    let mut handles = Vec::with_capacity(tx.threads);
    for t in 0..tx.threads {
        let tx = tx.clone();
        let host = host.to_string();
        let handle = thread::Builder::new()
            .name(format!("snd-{t}"))
            .spawn(move || sender_thread(&tx, &host, port, deadline))
            .map_err(Error::Io)?;
        handles.push(handle);
    }

    let mut packets = 0u64;
    let mut bytes = 0u64;
    for handle in handles {
        let (p, b) = handle
            .join()
            .map_err(|_| Error::Config("sender thread panicked".into()))??;
        packets += p;
        bytes += b;
    }

    let elapsed = started.elapsed().as_secs_f64();
    Ok(SendResults {
        packets_per_second: packets as f64 / elapsed,
        bytes_per_second: bytes as f64 / elapsed,
    })
}

fn sender_thread(
    tx: &TxSpec,
    host: &str,
    port: u16,
    deadline: Instant,
) -> Result<(u64, u64), Error> {
    let mut conns = Vec::with_capacity(tx.conns);
    for _ in 0..tx.conns {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        conns.push(stream);
    }

    let mut request = Vec::with_capacity(8 + tx.size as usize);
    request.extend_from_slice(&tx.size.to_le_bytes());
    request.extend_from_slice(&tx.resp.to_le_bytes());
    request.resize(8 + tx.size as usize, 0);

    let mut reply = vec![0u8; tx.resp as usize];
    let mut packets = 0u64;
    let mut bytes = 0u64;

    while Instant::now() < deadline && !signal::should_shutdown() {
        for conn in &mut conns {
            conn.write_all(&request)?;
        }
        for conn in &mut conns {
            if !reply.is_empty() {
                conn.read_exact(&mut reply)?;
            }
            packets += 1;
            bytes += request.len() as u64;
        }
    }
    Ok((packets, bytes))
}

/// p50/avg/p100 across repeated runs of the same pairing.
#[derive(Debug, Clone, Copy)]
pub struct Aggregate {
    pub p50: f64,
    pub avg: f64,
    pub p100: f64,
}

impl Aggregate {
    pub fn new(mut vals: Vec<f64>) -> Self {
        assert!(!vals.is_empty());
        vals.sort_by(|a, b| a.total_cmp(b));
        let avg = vals.iter().sum::<f64>() / vals.len() as f64;
        Self {
            p50: vals[vals.len() / 2],
            avg,
            p100: *vals.last().unwrap(),
        }
    }
}

impl std::fmt::Display for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "p50={:.2} avg={:.2} p100={:.2}",
            self.p50, self.avg, self.p100
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_orders_values() {
        let agg = Aggregate::new(vec![3.0, 1.0, 2.0]);
        assert_eq!(agg.p50, 2.0);
        assert_eq!(agg.p100, 3.0);
        assert!((agg.avg - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregate_single_value() {
        let agg = Aggregate::new(vec![5.0]);
        assert_eq!(agg.p50, 5.0);
        assert_eq!(agg.avg, 5.0);
        assert_eq!(agg.p100, 5.0);
    }
}
