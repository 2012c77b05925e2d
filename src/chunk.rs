// PCIe Accelerator DMA Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Transfer chunking.
//!
//! A transfer of arbitrary length is split into ordered chunks of at most
//! [`CHUNK_SIZE`](crate::CHUNK_SIZE) bytes. The split itself is lazy and
//! carries no sequence numbers: sequence numbers are taken atomically from
//! the direction's `requested` counter when a chunk is admitted to the
//! pipeline, so chunks of concurrent transfers in the same direction
//! interleave fairly while each transfer's own chunks stay in order.

use crate::CHUNK_SIZE;

/// Transfer direction relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host memory to device memory (write path).
    ToDev,
    /// Device memory to host memory (read path).
    FromDev,
}

impl Direction {
    /// Short name used in log messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ToDev => "write",
            Self::FromDev => "read",
        }
    }
}

/// A device-side address.
///
/// Plain wrapper over the device's byte address space; alignment is a
/// property of the selected backend and is checked at transfer admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    /// Whether this address is a multiple of `alignment`.
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 % alignment == 0
    }

    /// Address advanced by `bytes`.
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl From<u64> for DeviceAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

/// One chunk of a transfer: a contiguous byte range at identical offsets
/// into the host span and the device range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExtent {
    /// Byte offset into the caller's host span.
    pub host_offset: usize,
    /// Byte offset from the transfer's device base address.
    pub dev_offset: u64,
    /// Chunk length, at most [`CHUNK_SIZE`](crate::CHUNK_SIZE).
    pub len: usize,
}

/// Lazy splitter producing the chunks of one transfer in ascending order.
///
/// For every length `L >= 0` the produced chunks are contiguous,
/// non-overlapping and cover `[0, L)` exactly; the last chunk is truncated
/// to the remainder. The iterator is `Clone`, so a split can be restarted
/// from any point.
#[derive(Debug, Clone)]
pub struct ChunkSplit {
    offset: usize,
    remaining: usize,
}

impl ChunkSplit {
    /// Split `len` bytes into chunks of at most `CHUNK_SIZE`.
    pub const fn new(len: usize) -> Self {
        Self {
            offset: 0,
            remaining: len,
        }
    }

    /// Number of chunks this split will produce.
    pub const fn chunk_count(len: usize) -> usize {
        len.div_ceil(CHUNK_SIZE)
    }
}

impl Iterator for ChunkSplit {
    type Item = ChunkExtent;

    fn next(&mut self) -> Option<ChunkExtent> {
        if self.remaining == 0 {
            return None;
        }
        let len = self.remaining.min(CHUNK_SIZE);
        let extent = ChunkExtent {
            host_offset: self.offset,
            dev_offset: self.offset as u64,
            len,
        };
        self.offset += len;
        self.remaining -= len;
        Some(extent)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = Self::chunk_count(self.remaining);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkSplit {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transfer_has_no_chunks() {
        assert_eq!(ChunkSplit::new(0).count(), 0);
        assert_eq!(ChunkSplit::chunk_count(0), 0);
    }

    #[test]
    fn split_is_exhaustive_and_contiguous() {
        for len in [
            1,
            CHUNK_SIZE - 1,
            CHUNK_SIZE,
            CHUNK_SIZE + 1,
            3 * CHUNK_SIZE + 17,
            10 * CHUNK_SIZE,
        ] {
            let chunks: Vec<_> = ChunkSplit::new(len).collect();
            let mut expected_offset = 0usize;
            for c in &chunks {
                assert_eq!(c.host_offset, expected_offset);
                assert_eq!(c.dev_offset, expected_offset as u64);
                assert!(c.len > 0 && c.len <= CHUNK_SIZE);
                expected_offset += c.len;
            }
            assert_eq!(expected_offset, len, "chunks must cover {len} bytes");
            assert_eq!(chunks.len(), ChunkSplit::chunk_count(len));
        }
    }

    #[test]
    fn scenario_600_kib() {
        // 600 KiB at 256 KiB capacity: 256 KiB, 256 KiB, 88 KiB.
        let chunks: Vec<_> = ChunkSplit::new(600 * 1024).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len, 256 * 1024);
        assert_eq!(chunks[1].len, 256 * 1024);
        assert_eq!(chunks[2].len, 88 * 1024);
        assert_eq!(chunks[2].host_offset, 512 * 1024);
    }

    #[test]
    fn split_is_restartable() {
        let mut split = ChunkSplit::new(2 * CHUNK_SIZE + 5);
        let first = split.next().unwrap();
        let rest: Vec<_> = split.clone().collect();
        let rest_again: Vec<_> = split.collect();
        assert_eq!(first.host_offset, 0);
        assert_eq!(rest, rest_again);
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn device_address_alignment() {
        assert!(DeviceAddress(0x1000).is_aligned(64));
        assert!(!DeviceAddress(0x1001).is_aligned(64));
        assert_eq!(DeviceAddress(0x1000).offset(0x40), DeviceAddress(0x1040));
    }
}
