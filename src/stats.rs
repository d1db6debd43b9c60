//! Receiver-side statistics.
//!
//! Each engine owns one `RxStats`. The loop brackets its blocking wait with
//! `start_wait`/`done_wait`, then calls `done_loop` once per iteration; a
//! report line is emitted when at least one second has passed since the
//! previous one. CPU time comes from `times(2)`, converted with
//! `sysconf(_SC_CLK_TCK)`.

use std::time::{Duration, Instant};

/// Wait intervals under this are noise and are not counted as idle.
const IDLE_EPSILON: Duration = Duration::from_micros(100);

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub struct RxStats {
    name: String,
    count_reads: bool,
    reads: Vec<u32>,

    last_stats: Instant,
    wait_started: Instant,
    idle: Duration,

    ticks_per_second: u64,
    last_times: libc::tms,
    last_clock: libc::clock_t,

    loops: u64,
    overflows: u64,
    last_bytes: u64,
    last_requests: u64,
    last_rps: f64,
}

impl RxStats {
    pub fn new(name: &str, count_reads: bool) -> Self {
        let mut times: libc::tms = unsafe { std::mem::zeroed() };
        let clock = unsafe { libc::times(&mut times) };
        let now = Instant::now();
        Self {
            name: name.to_string(),
            count_reads,
            reads: if count_reads {
                Vec::with_capacity(32_000)
            } else {
                Vec::new()
            },
            last_stats: now,
            wait_started: now,
            idle: Duration::ZERO,
            ticks_per_second: unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as u64,
            last_times: times,
            last_clock: clock,
            loops: 0,
            overflows: 0,
            last_bytes: 0,
            last_requests: 0,
            last_rps: 0.0,
        }
    }

    pub fn start_wait(&mut self) {
        self.wait_started = Instant::now();
    }

    pub fn done_wait(&mut self) {
        let waited = self.wait_started.elapsed();
        if waited > IDLE_EPSILON {
            self.idle += waited;
        }
    }

    pub fn done_loop(&mut self, bytes: u64, requests: u64, reads: u32, is_overflow: bool) {
        self.loops += 1;
        if is_overflow {
            self.overflows += 1;
        }
        if self.count_reads {
            self.reads.push(reads);
        }
        if self.last_stats.elapsed() >= REPORT_INTERVAL {
            self.report(bytes, requests);
        }
    }

    fn report(&mut self, bytes: u64, requests: u64) {
        let now = Instant::now();
        let millis = now.duration_since(self.last_stats).as_millis() as u64;
        let bps = (bytes - self.last_bytes) as f64 * 1000.0 / millis as f64;
        let rps = (requests - self.last_requests) as f64 * 1000.0 / millis as f64;

        let mut times_now: libc::tms = unsafe { std::mem::zeroed() };
        let clock_now = unsafe { libc::times(&mut times_now) };

        // Skip the first window and windows with no traffic.
        if requests > self.last_requests && self.last_rps > 0.0 {
            let read_stats = if self.count_reads {
                read_stats_line(&mut self.reads)
            } else {
                String::new()
            };
            tracing::info!(
                "{}: rps:{:6.2}k Bps:{:6.2}M idle={}ms user={}ms system={}ms wall={}ms \
                 loops={} overflows={}{}",
                self.name,
                rps / 1000.0,
                bps / 1_000_000.0,
                self.idle.as_millis(),
                self.tick_ms(self.last_times.tms_utime, times_now.tms_utime),
                self.tick_ms(self.last_times.tms_stime, times_now.tms_stime),
                self.tick_ms(self.last_clock, clock_now),
                self.loops,
                self.overflows,
                read_stats,
            );
        }
        self.reads.clear();
        self.loops = 0;
        self.overflows = 0;
        self.idle = Duration::ZERO;
        self.last_clock = clock_now;
        self.last_times = times_now;
        self.last_bytes = bytes;
        self.last_requests = requests;
        self.last_stats = now;
        self.last_rps = rps;
    }

    fn tick_ms(&self, from: libc::clock_t, to: libc::clock_t) -> u64 {
        if to <= from {
            0
        } else {
            (to - from) as u64 * 1000 / self.ticks_per_second
        }
    }
}

/// Nearest-rank read-batch quantiles for one report window.
fn read_quantiles(reads: &mut [u32]) -> (u32, u32, u32, f64) {
    reads.sort_unstable();
    let total: u64 = reads.iter().map(|&r| r as u64).sum();
    let avg = total as f64 / reads.len() as f64;
    let p10 = reads[reads.len() / 10];
    let p50 = reads[reads.len() / 2];
    let p90 = reads[(reads.len() as f64 * 0.9) as usize];
    (p10, p50, p90, avg)
}

fn read_stats_line(reads: &mut Vec<u32>) -> String {
    if reads.is_empty() {
        return String::new();
    }
    let (p10, p50, p90, avg) = read_quantiles(reads);
    format!(" read_per_loop: p10={p10} p50={p50} p90={p90} avg={avg:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_nearest_rank() {
        let mut reads: Vec<u32> = (1..=10).collect();
        let (p10, p50, p90, avg) = read_quantiles(&mut reads);
        assert_eq!(p10, 2);
        assert_eq!(p50, 6);
        assert_eq!(p90, 10);
        assert!((avg - 5.5).abs() < f64::EPSILON);
    }

    #[test]
    fn quantiles_single_sample() {
        let mut reads = vec![3];
        let (p10, p50, p90, avg) = read_quantiles(&mut reads);
        assert_eq!((p10, p50, p90), (3, 3, 3));
        assert!((avg - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_window_has_no_line() {
        let mut reads = Vec::new();
        assert_eq!(read_stats_line(&mut reads), "");
    }

    #[test]
    fn done_wait_ignores_short_intervals() {
        let mut stats = RxStats::new("test", false);
        stats.start_wait();
        stats.done_wait();
        assert_eq!(stats.idle, Duration::ZERO);
    }
}
