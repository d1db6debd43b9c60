//! Benchmark wire protocol.
//!
//! A request is a little-endian header `(u32 length, u32 response_bytes)`
//! followed by `length` payload bytes. Each completed request earns a reply
//! of `response_bytes` bytes whose content is irrelevant.

use std::ops::AddAssign;

/// What one `consume` call produced: completed requests and the reply bytes
/// they are owed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeResult {
    pub count: u32,
    pub to_write: u64,
}

impl AddAssign for ConsumeResult {
    fn add_assign(&mut self, rhs: Self) {
        self.count += rhs.count;
        self.to_write += rhs.to_write;
    }
}

/// Resumable frame parser.
///
/// Input may be split at any byte boundary; state carries across calls.
#[derive(Debug, Default)]
pub struct ProtocolParser {
    header: [u8; 8],
    header_have: usize,
    frame_len: u32,
    response_bytes: u32,
    /// Bytes consumed for the current frame, header included.
    so_far: u64,
}

impl ProtocolParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of stream bytes, returning completed requests.
    pub fn consume(&mut self, mut data: &[u8]) -> ConsumeResult {
        let mut ret = ConsumeResult::default();
        while !data.is_empty() {
            if self.header_have < 8 {
                if self.header_have == 0 && data.len() >= 8 {
                    // Fast path: whole header inside this chunk, decode in place.
                    self.frame_len = u32::from_le_bytes(data[0..4].try_into().unwrap());
                    self.response_bytes = u32::from_le_bytes(data[4..8].try_into().unwrap());
                    self.header_have = 8;
                    self.so_far = 8;
                    data = &data[8..];
                } else {
                    let add = (8 - self.header_have).min(data.len());
                    self.header[self.header_have..self.header_have + add]
                        .copy_from_slice(&data[..add]);
                    self.header_have += add;
                    self.so_far += add as u64;
                    data = &data[add..];
                    if self.header_have < 8 {
                        break;
                    }
                    self.frame_len = u32::from_le_bytes(self.header[0..4].try_into().unwrap());
                    self.response_bytes = u32::from_le_bytes(self.header[4..8].try_into().unwrap());
                }
            }

            let total = self.frame_len as u64 + 8;
            let take = (total - self.so_far).min(data.len() as u64) as usize;
            self.so_far += take as u64;
            data = &data[take..];

            if self.so_far >= total {
                ret.count += 1;
                ret.to_write += self.response_bytes as u64;
                self.header_have = 0;
                self.so_far = 0;
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8], response_bytes: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&response_bytes.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_frame_exact_boundary() {
        let mut p = ProtocolParser::new();
        let buf = frame(&[0xAA, 0xBB, 0xCC, 0xDD], 1);
        let r = p.consume(&buf);
        assert_eq!(r, ConsumeResult { count: 1, to_write: 1 });
    }

    #[test]
    fn frame_split_across_two_reads() {
        let mut p = ProtocolParser::new();
        let buf = frame(&[1, 2, 3, 4], 7);
        let r1 = p.consume(&buf[..4]);
        assert_eq!(r1, ConsumeResult { count: 0, to_write: 0 });
        let r2 = p.consume(&buf[4..]);
        assert_eq!(r2, ConsumeResult { count: 1, to_write: 7 });
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut p = ProtocolParser::new();
        let mut buf = frame(b"A", 2);
        buf.extend_from_slice(&frame(b"B", 3));
        let r = p.consume(&buf);
        assert_eq!(r, ConsumeResult { count: 2, to_write: 5 });
    }

    #[test]
    fn zero_length_payload() {
        let mut p = ProtocolParser::new();
        let r = p.consume(&frame(&[], 9));
        assert_eq!(r, ConsumeResult { count: 1, to_write: 9 });
    }

    #[test]
    fn resumable_across_any_split() {
        // Three frames, split at every possible boundary, must agree with the
        // single-chunk result.
        let mut buf = frame(&[0u8; 5], 1);
        buf.extend_from_slice(&frame(&[0u8; 13], 200));
        buf.extend_from_slice(&frame(b"xyz", 40));

        let mut whole = ProtocolParser::new();
        let expect = whole.consume(&buf);
        assert_eq!(expect, ConsumeResult { count: 3, to_write: 241 });

        for split in 0..=buf.len() {
            let mut p = ProtocolParser::new();
            let mut got = p.consume(&buf[..split]);
            got += p.consume(&buf[split..]);
            assert_eq!(got, expect, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time() {
        let buf = frame(&[7u8; 32], 11);
        let mut p = ProtocolParser::new();
        let mut got = ConsumeResult::default();
        for b in &buf {
            got += p.consume(std::slice::from_ref(b));
        }
        assert_eq!(got, ConsumeResult { count: 1, to_write: 11 });
    }
}
