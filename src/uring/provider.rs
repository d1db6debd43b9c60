//! Receive-buffer provisioning.
//!
//! Three strategies, chosen at construction:
//!
//! - `Inline`: every socket owns a plain receive buffer; nothing is lent to
//!   the kernel.
//! - `V1`: a contiguous arena whose free buffers are re-lent with
//!   `provide_buffers` SQEs. The free list is kept as index ranges so one
//!   SQE can hand back a whole run.
//! - `V2`: a kernel-mapped buffer ring; returns go straight into the shared
//!   ring and no SQEs are needed.

use std::alloc::Layout;

use io_uring::{opcode, squeue, IoUring};

use crate::config::UringRxConfig;
use crate::error::Error;
use crate::uring::buf_ring::BufRing;

/// Buffer group id shared by all provisioning strategies.
pub const BGID: u16 = 1;

const BUFFER_ALIGN: usize = 32;

/// Buffer sizes are rounded up to a 32-byte multiple.
pub fn align_buffer_size(n: usize) -> usize {
    BUFFER_ALIGN * ((n + BUFFER_ALIGN - 1) / BUFFER_ALIGN)
}

/// A run of free buffer indices: `start, start+1, .., start+count-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    start: u16,
    count: u16,
}

impl Range {
    fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Sort key ordering by (start, count).
    fn key(self) -> u32 {
        (self.start as u32) << 16 | self.count as u32
    }

    fn end(self) -> u32 {
        self.start as u32 + self.count as u32
    }

    /// Absorb a single index adjacent to either edge.
    fn merge_index(&mut self, idx: u16) -> bool {
        if self.start > 0 && idx == self.start - 1 {
            self.start = idx;
            self.count += 1;
            true
        } else if idx as u32 == self.end() {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Absorb an adjacent range.
    fn merge_range(&mut self, r: Range) -> bool {
        if self.end() == r.start as u32 {
            self.count += r.count;
            true
        } else if r.end() == self.start as u32 {
            self.start = r.start;
            self.count += r.count;
            true
        } else {
            false
        }
    }
}

/// 32-byte-aligned heap allocation for the V1 arena.
struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for Arena {}

impl Arena {
    fn alloc(size: usize) -> Result<Self, Error> {
        let layout = Layout::from_size_align(size, BUFFER_ALIGN)
            .map_err(|_| Error::BufferSetup(format!("bad arena layout, size {size}")))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::BufferSetup(format!(
                "arena allocation of {size} bytes failed"
            )));
        }
        Ok(Self { ptr, layout })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

/// `provide_buffers`-based arena with a range-coalescing free list.
pub struct RangePool {
    arena: Arena,
    size_per_buffer: usize,
    low_watermark: usize,
    to_provide: Vec<Range>,
    scratch: Vec<Range>,
    /// Buffers currently owned by userspace; always equals the sum of
    /// `to_provide` range counts.
    to_provide_count: usize,
}

impl RangePool {
    pub fn new(cfg: &UringRxConfig) -> Result<Self, Error> {
        let size_per_buffer = align_buffer_size(cfg.base.recv_size);
        let count = cfg.provided_buffer_count;
        if count == 0 {
            return Err(Error::BufferSetup("provided_buffer_count is zero".into()));
        }
        let arena = Arena::alloc(count as usize * size_per_buffer)?;
        let mut to_provide = Vec::with_capacity(128);
        to_provide.push(Range::new(0, count));
        Ok(Self {
            arena,
            size_per_buffer,
            low_watermark: cfg.low_watermark(),
            to_provide,
            scratch: Vec::with_capacity(128),
            to_provide_count: count as usize,
        })
    }

    pub fn size_per_buffer(&self) -> usize {
        self.size_per_buffer
    }

    pub fn to_provide_count(&self) -> usize {
        self.to_provide_count
    }

    pub fn data(&self, idx: u16) -> *mut u8 {
        unsafe { self.arena.ptr.add(idx as usize * self.size_per_buffer) }
    }

    pub fn can_provide(&self) -> bool {
        !self.to_provide.is_empty()
    }

    pub fn needs_to_provide(&self) -> bool {
        self.to_provide_count > self.low_watermark
    }

    /// Take a completed buffer back from the kernel.
    ///
    /// Completions commonly land out of order by one (1,3,2): the 2 bridges
    /// the two newest ranges, which then collapse into one.
    pub fn return_index(&mut self, idx: u16) {
        let len = self.to_provide.len();
        if len == 0 {
            self.to_provide.push(Range::new(idx, 1));
        } else if self.to_provide[len - 1].merge_index(idx)
            || (len >= 2 && self.to_provide[len - 2].merge_index(idx))
        {
            if len >= 2 {
                let tail = self.to_provide[len - 1];
                if self.to_provide[len - 2].merge_range(tail) {
                    self.to_provide.pop();
                }
            }
        } else {
            self.to_provide.push(Range::new(idx, 1));
        }
        self.to_provide_count += 1;
    }

    /// Sort and merge the free list into its minimal range decomposition.
    pub fn compact(&mut self) {
        if self.to_provide.len() <= 1 {
            return;
        }
        if self.to_provide.len() == 2 {
            let tail = self.to_provide[1];
            if self.to_provide[0].merge_range(tail) {
                self.to_provide.pop();
            }
            return;
        }
        let was = self.to_provide.len();
        self.to_provide.sort_unstable_by_key(|r| r.key());
        self.scratch.clear();
        self.scratch.push(self.to_provide[0]);
        for i in 1..self.to_provide.len() {
            let r = self.to_provide[i];
            let last = self.scratch.last_mut().unwrap();
            if !last.merge_range(r) {
                self.scratch.push(r);
            }
        }
        std::mem::swap(&mut self.to_provide, &mut self.scratch);
        tracing::trace!("compact() was {} now {}", was, self.to_provide.len());
    }

    /// Pop one free range into a provide-buffers SQE.
    pub fn provide_entry(&mut self) -> Option<squeue::Entry> {
        let r = self.to_provide.pop()?;
        self.to_provide_count -= r.count as usize;
        let entry = opcode::ProvideBuffers::new(
            self.data(r.start),
            self.size_per_buffer as i32,
            r.count,
            BGID,
            r.start,
        )
        .build()
        .flags(squeue::Flags::SKIP_SUCCESS);
        Some(entry)
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<(u16, u16)> {
        self.to_provide.iter().map(|r| (r.start, r.count)).collect()
    }
}

/// Buffer provisioning strategy, fixed at engine construction.
pub enum Provider {
    Inline,
    V1(RangePool),
    V2(BufRing),
}

impl Provider {
    pub fn from_config(cfg: &UringRxConfig) -> Result<Self, Error> {
        match cfg.provide_buffers {
            0 => Ok(Provider::Inline),
            1 => Ok(Provider::V1(RangePool::new(cfg)?)),
            2 => Ok(Provider::V2(BufRing::new(cfg)?)),
            other => Err(Error::Config(format!(
                "provide_buffers={other} (expected 0, 1 or 2)"
            ))),
        }
    }

    /// Whether reads use kernel-selected buffers.
    pub fn in_use(&self) -> bool {
        !matches!(self, Provider::Inline)
    }

    pub fn size_per_buffer(&self) -> usize {
        match self {
            Provider::Inline => 0,
            Provider::V1(p) => p.size_per_buffer(),
            Provider::V2(p) => p.size_per_buffer(),
        }
    }

    pub fn data(&self, idx: u16) -> *const u8 {
        match self {
            Provider::Inline => std::ptr::null(),
            Provider::V1(p) => p.data(idx),
            Provider::V2(p) => p.data(idx),
        }
    }

    pub fn return_index(&mut self, idx: u16) {
        match self {
            Provider::Inline => {}
            Provider::V1(p) => p.return_index(idx),
            Provider::V2(p) => p.return_index(idx),
        }
    }

    pub fn needs_to_provide(&self) -> bool {
        match self {
            Provider::V1(p) => p.needs_to_provide(),
            _ => false,
        }
    }

    pub fn can_provide(&self) -> bool {
        match self {
            Provider::V1(p) => p.can_provide(),
            _ => false,
        }
    }

    pub fn compact(&mut self) {
        if let Provider::V1(p) = self {
            p.compact();
        }
    }

    pub fn provide_entry(&mut self) -> Option<squeue::Entry> {
        match self {
            Provider::V1(p) => p.provide_entry(),
            _ => None,
        }
    }

    pub fn to_provide_count(&self) -> usize {
        match self {
            Provider::V1(p) => p.to_provide_count(),
            _ => 0,
        }
    }

    /// One-time kernel registration (V2 ring only).
    pub fn register(&self, ring: &IoUring) -> Result<(), Error> {
        if let Provider::V2(p) = self {
            unsafe {
                ring.submitter()
                    .register_buf_ring(p.ring_addr(), p.ring_entries(), BGID)
                    .map_err(|e| Error::BufferSetup(format!("register buffer ring: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_rx, RxSpec, UringRxConfig};

    fn cfg(spec: &str) -> UringRxConfig {
        match parse_rx(spec).unwrap() {
            RxSpec::Uring(cfg) => cfg,
            _ => panic!("wrong engine"),
        }
    }

    fn empty_pool(count: u16) -> RangePool {
        let mut pool = RangePool::new(&cfg(&format!(
            "io_uring provide_buffers=1 provided_buffer_count={count} recv_size=64"
        )))
        .unwrap();
        // Lend the whole arena out.
        while pool.provide_entry().is_some() {}
        assert_eq!(pool.to_provide_count(), 0);
        pool
    }

    #[test]
    fn starts_with_one_full_range() {
        let pool = RangePool::new(&cfg(
            "io_uring provide_buffers=1 provided_buffer_count=16 recv_size=100",
        ))
        .unwrap();
        assert_eq!(pool.ranges(), vec![(0, 16)]);
        assert_eq!(pool.to_provide_count(), 16);
        assert_eq!(pool.size_per_buffer(), 128);
    }

    #[test]
    fn coalesces_after_compact() {
        let mut pool = empty_pool(16);
        for idx in [0u16, 1, 3, 2, 4] {
            pool.return_index(idx);
        }
        pool.compact();
        assert_eq!(pool.ranges(), vec![(0, 5)]);
        assert_eq!(pool.to_provide_count(), 5);
    }

    #[test]
    fn out_of_order_by_one_merges_without_compact() {
        let mut pool = empty_pool(16);
        for idx in [1u16, 3, 2] {
            pool.return_index(idx);
        }
        assert_eq!(pool.ranges(), vec![(1, 3)]);
        assert_eq!(pool.to_provide_count(), 3);
    }

    #[test]
    fn disjoint_returns_stay_disjoint() {
        let mut pool = empty_pool(16);
        for idx in [0u16, 5, 10] {
            pool.return_index(idx);
        }
        pool.compact();
        assert_eq!(pool.ranges(), vec![(0, 1), (5, 1), (10, 1)]);
    }

    #[test]
    fn compact_is_minimal() {
        let mut pool = empty_pool(16);
        // Reverse order defeats the tail merge entirely.
        for idx in (0u16..8).rev() {
            pool.return_index(idx);
        }
        pool.compact();
        assert_eq!(pool.ranges(), vec![(0, 8)]);
    }

    #[test]
    fn count_tracks_returns_and_provides() {
        let mut pool = empty_pool(16);
        for idx in 0u16..8 {
            pool.return_index(idx);
        }
        assert_eq!(pool.to_provide_count(), 8);
        assert!(pool.provide_entry().is_some());
        assert_eq!(pool.to_provide_count(), 0);
        assert!(pool.provide_entry().is_none());
    }

    #[test]
    fn watermark_default_is_quarter_and_full_arena_wants_provisioning() {
        let pool = RangePool::new(&cfg(
            "io_uring provide_buffers=1 provided_buffer_count=100 recv_size=64",
        ))
        .unwrap();
        // 100 owned > 25 watermark: a full arena is always eligible.
        assert!(pool.needs_to_provide());
    }

    #[test]
    fn watermark_boundary() {
        let mut pool = empty_pool(100);
        for idx in 0u16..25 {
            pool.return_index(idx);
        }
        assert!(!pool.needs_to_provide());
        pool.return_index(25);
        assert!(pool.needs_to_provide());
    }

    #[test]
    fn inline_provider_is_vacuous() {
        let mut p = Provider::Inline;
        assert!(!p.in_use());
        assert!(!p.needs_to_provide());
        assert!(!p.can_provide());
        assert!(p.provide_entry().is_none());
        p.return_index(3);
        p.compact();
    }
}
