//! Kernel-mapped provided-buffer ring.
//!
//! One anonymous private mapping holds the shared descriptor ring followed
//! by the buffer arena, so a buffer id addresses both the ring entry and
//! its bytes. The kernel consumes descriptors directly; userspace returns
//! buffers by stamping ring entries and publishing the producer tail with a
//! release-ordered store. Returns are staged in batches of 32 to amortise
//! the ordered publication.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

use arrayvec::ArrayVec;
use io_uring::types::BufRingEntry;

use crate::config::UringRxConfig;
use crate::error::Error;
use crate::uring::provider::align_buffer_size;

const STAGE_BATCH: usize = 32;
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

pub struct BufRing {
    mmap_ptr: *mut u8,
    mmap_size: usize,
    buffer_base: *mut u8,
    size_per_buffer: usize,
    ring_entries: u16,
    ring_mask: u16,
    tail_cached: u16,
    staged: ArrayVec<u16, STAGE_BATCH>,
}

// The mapping is owned by this struct and only the tail store is shared
// with the kernel.
unsafe impl Send for BufRing {}

impl BufRing {
    pub fn new(cfg: &UringRxConfig) -> Result<Self, Error> {
        let count = cfg.provided_buffer_count;
        if count == 0 {
            return Err(Error::BufferSetup("provided_buffer_count is zero".into()));
        }
        if count > 1 << 15 {
            return Err(Error::BufferSetup(format!(
                "buffer count too large: {count}"
            )));
        }
        let size_per_buffer = align_buffer_size(cfg.base.recv_size);
        let ring_entries = count.next_power_of_two();
        let ring_mask = ring_entries - 1;

        let ring_mem = align_buffer_size(ring_entries as usize * std::mem::size_of::<BufRingEntry>());
        let mut mmap_size = ring_mem + count as usize * size_per_buffer;
        let mut mmap_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        if cfg.huge_pages {
            mmap_size = (mmap_size + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);
            mmap_flags |= libc::MAP_HUGETLB;
        }

        let mmap_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                mmap_flags,
                -1,
                0,
            )
        };
        if mmap_ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(Error::BufferSetup(format!(
                "mmap of {mmap_size} bytes (huge_pages={}) failed: {err}",
                cfg.huge_pages
            )));
        }
        let mmap_ptr = mmap_ptr as *mut u8;
        tracing::debug!(
            "buffer ring mmap size={mmap_size} ring_mem={ring_mem} entries={ring_entries} \
             count={count}"
        );

        let mut ring = Self {
            mmap_ptr,
            mmap_size,
            buffer_base: unsafe { mmap_ptr.add(ring_mem) },
            size_per_buffer,
            ring_entries,
            ring_mask,
            tail_cached: 0,
            staged: ArrayVec::new(),
        };

        for i in 0..count {
            ring.stamp(i, i);
        }
        ring.tail_cached = count;
        ring.publish_tail();
        Ok(ring)
    }

    /// Ring base address for kernel registration.
    pub fn ring_addr(&self) -> u64 {
        self.mmap_ptr as u64
    }

    pub fn ring_entries(&self) -> u16 {
        self.ring_entries
    }

    pub fn size_per_buffer(&self) -> usize {
        self.size_per_buffer
    }

    pub fn data(&self, idx: u16) -> *const u8 {
        unsafe { self.buffer_base.add(idx as usize * self.size_per_buffer) }
    }

    /// Write the descriptor for `bid` into ring slot `slot`.
    fn stamp(&mut self, slot: u16, bid: u16) {
        let entry = unsafe {
            &mut *(self.mmap_ptr as *mut BufRingEntry).add((slot & self.ring_mask) as usize)
        };
        entry.set_addr(self.data(bid) as u64);
        entry.set_len(self.size_per_buffer as u32);
        entry.set_bid(bid);
    }

    fn publish_tail(&self) {
        let tail = unsafe { BufRingEntry::tail(self.mmap_ptr as *const BufRingEntry) };
        unsafe { (*(tail as *const AtomicU16)).store(self.tail_cached, Ordering::Release) };
    }

    /// Hand a buffer back. Staged until a batch fills, then published with
    /// one ordered tail store.
    pub fn return_index(&mut self, idx: u16) {
        self.staged.push(idx);
        if self.staged.is_full() {
            self.flush();
        }
    }

    fn flush(&mut self) {
        for i in 0..self.staged.len() {
            let bid = self.staged[i];
            self.stamp(self.tail_cached, bid);
            self.tail_cached = self.tail_cached.wrapping_add(1);
        }
        self.staged.clear();
        self.publish_tail();
    }

    #[cfg(test)]
    fn published_tail(&self) -> u16 {
        let tail = unsafe { BufRingEntry::tail(self.mmap_ptr as *const BufRingEntry) };
        unsafe { (*(tail as *const AtomicU16)).load(Ordering::Acquire) }
    }

    #[cfg(test)]
    fn bid_at(&self, slot: u16) -> u16 {
        // Ring entry wire layout.
        #[repr(C)]
        struct RawEntry {
            addr: u64,
            len: u32,
            bid: u16,
            resv: u16,
        }
        let entry = unsafe {
            &*(self.mmap_ptr as *const RawEntry).add((slot & self.ring_mask) as usize)
        };
        entry.bid
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_ptr as *mut libc::c_void, self.mmap_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_rx, RxSpec, UringRxConfig};

    fn cfg(count: u16) -> UringRxConfig {
        let spec = format!("io_uring provided_buffer_count={count} recv_size=64");
        match parse_rx(&spec).unwrap() {
            RxSpec::Uring(cfg) => cfg,
            _ => panic!("wrong engine"),
        }
    }

    #[test]
    fn initialised_full() {
        let ring = BufRing::new(&cfg(48)).unwrap();
        assert_eq!(ring.ring_entries(), 64);
        assert_eq!(ring.published_tail(), 48);
        for i in 0..48u16 {
            assert_eq!(ring.bid_at(i), i);
        }
    }

    #[test]
    fn returns_stage_until_batch_fills() {
        let mut ring = BufRing::new(&cfg(64)).unwrap();
        for i in 0..(STAGE_BATCH as u16 - 1) {
            ring.return_index(i);
        }
        // Nothing published yet.
        assert_eq!(ring.published_tail(), 64);
        ring.return_index(STAGE_BATCH as u16 - 1);
        assert_eq!(ring.published_tail(), 64 + STAGE_BATCH as u16);
    }

    #[test]
    fn no_duplicate_bids_in_window() {
        let mut ring = BufRing::new(&cfg(32)).unwrap();
        // Return every buffer once; the window between consumer position and
        // the new tail must contain each bid exactly once.
        for i in 0..32u16 {
            ring.return_index(i);
        }
        assert_eq!(ring.published_tail(), 64);
        let mut seen = std::collections::HashSet::new();
        for slot in 32..64u16 {
            assert!(seen.insert(ring.bid_at(slot)));
        }
        assert_eq!(seen.len(), 32);
    }

    #[test]
    fn tail_is_monotonic() {
        let mut ring = BufRing::new(&cfg(64)).unwrap();
        let mut last = ring.published_tail();
        for round in 0..4 {
            for i in 0..STAGE_BATCH as u16 {
                ring.return_index((round * 7 + i) % 64);
            }
            let now = ring.published_tail();
            assert!(now.wrapping_sub(last) as usize == STAGE_BATCH);
            last = now;
        }
    }

    #[test]
    fn rejects_oversized_arena() {
        assert!(BufRing::new(&cfg(33_000)).is_err());
    }

    #[test]
    fn buffer_addresses_are_disjoint() {
        let ring = BufRing::new(&cfg(8)).unwrap();
        for i in 0..7u16 {
            let gap = ring.data(i + 1) as usize - ring.data(i) as usize;
            assert_eq!(gap, ring.size_per_buffer());
        }
    }
}
