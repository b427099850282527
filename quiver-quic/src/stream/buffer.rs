//! Gap-aware receive reassembly buffer.
//!
//! Stores out-of-order chunks keyed by stream offset, merging overlaps on
//! insert so the map always holds disjoint ranges. Shared by stream receive
//! state and the crypto streams.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::{Buf, Bytes};

/// Offset-keyed reassembly buffer with overlap elimination.
#[derive(Debug, Clone, Default)]
pub struct ReceiveBuffer {
    chunks: BTreeMap<u64, Bytes>,
    buffered_len: u64,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total bytes currently buffered.
    pub fn buffered_len(&self) -> u64 {
        self.buffered_len
    }

    /// Offset of the earliest buffered chunk.
    pub fn front_offset(&self) -> Option<u64> {
        self.chunks.keys().next().copied()
    }

    /// Insert a chunk, discarding any bytes already present.
    pub fn insert(&mut self, mut offset: u64, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        // Trim the prefix already covered by an earlier chunk.
        if let Some((&prev_off, prev)) = self.chunks.range(..=offset).next_back() {
            let prev_end = prev_off + prev.len() as u64;
            if prev_end >= offset + data.len() as u64 {
                return;
            }
            if prev_end > offset {
                data.advance((prev_end - offset) as usize);
                offset = prev_end;
            }
        }
        // Absorb or truncate against later chunks.
        loop {
            let end = offset + data.len() as u64;
            let Some((&next_off, next)) = self.chunks.range(offset..).next() else {
                break;
            };
            if next_off >= end {
                break;
            }
            let next_end = next_off + next.len() as u64;
            if next_end <= end {
                let removed = self.chunks.remove(&next_off).unwrap();
                self.buffered_len -= removed.len() as u64;
                continue;
            }
            data.truncate((next_off - offset) as usize);
            break;
        }
        if !data.is_empty() {
            self.buffered_len += data.len() as u64;
            self.chunks.insert(offset, data);
        }
    }

    /// Remove and return data contiguous with `read_offset`. Chunks entirely
    /// below the read offset (stale retransmissions) are discarded.
    pub fn pop_contiguous(&mut self, read_offset: u64) -> Option<Bytes> {
        loop {
            let (&off, chunk) = self.chunks.iter().next()?;
            let end = off + chunk.len() as u64;
            if end <= read_offset {
                let removed = self.chunks.remove(&off).unwrap();
                self.buffered_len -= removed.len() as u64;
                continue;
            }
            if off > read_offset {
                return None;
            }
            let mut removed = self.chunks.remove(&off).unwrap();
            self.buffered_len -= removed.len() as u64;
            if off < read_offset {
                removed.advance((read_offset - off) as usize);
            }
            return Some(removed);
        }
    }

    /// Data is available at exactly `read_offset`.
    pub fn has_data_at(&self, read_offset: u64) -> bool {
        self.chunks
            .range(..=read_offset)
            .next_back()
            .is_some_and(|(&off, chunk)| off + chunk.len() as u64 > read_offset)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.buffered_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_in_order_read() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"hello"));
        assert_eq!(buf.pop_contiguous(0).unwrap(), bytes(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_gap_blocks_read() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(5, bytes(b"world"));
        assert!(buf.pop_contiguous(0).is_none());
        assert_eq!(buf.front_offset(), Some(5));
        buf.insert(0, bytes(b"hello"));
        assert_eq!(buf.pop_contiguous(0).unwrap(), bytes(b"hello"));
        assert_eq!(buf.pop_contiguous(5).unwrap(), bytes(b"world"));
    }

    #[test]
    fn test_overlap_is_deduplicated() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"abcd"));
        buf.insert(2, bytes(b"cdef"));
        assert_eq!(buf.buffered_len(), 6);
        assert_eq!(buf.pop_contiguous(0).unwrap(), bytes(b"abcd"));
        assert_eq!(buf.pop_contiguous(4).unwrap(), bytes(b"ef"));
    }

    #[test]
    fn test_fully_covered_insert_dropped() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"abcdef"));
        buf.insert(1, bytes(b"bcd"));
        assert_eq!(buf.buffered_len(), 6);
    }

    #[test]
    fn test_insert_spanning_later_chunk() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(4, bytes(b"ef"));
        buf.insert(0, bytes(b"abcdefgh"));
        // Covered middle stays single-copy; trailing part of the long insert
        // past the existing chunk is dropped, not spliced.
        assert_eq!(buf.pop_contiguous(0).unwrap(), bytes(b"abcd"));
        assert_eq!(buf.pop_contiguous(4).unwrap(), bytes(b"ef"));
    }

    #[test]
    fn test_stale_retransmission_discarded() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"abcd"));
        assert_eq!(buf.pop_contiguous(0).unwrap(), bytes(b"abcd"));
        buf.insert(0, bytes(b"abcd"));
        assert!(buf.pop_contiguous(4).is_none());
        buf.insert(2, bytes(b"cdEF"));
        assert_eq!(buf.pop_contiguous(4).unwrap(), bytes(b"EF"));
    }

    #[test]
    fn test_has_data_at() {
        let mut buf = ReceiveBuffer::new();
        buf.insert(0, bytes(b"abc"));
        assert!(buf.has_data_at(0));
        assert!(buf.has_data_at(2));
        assert!(!buf.has_data_at(3));
    }
}
