// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-sender jitter buffer for decoded PCM.
//!
//! Writers enqueue byte chunks as they arrive from the voice client; the mix
//! tick drains exactly one frame per tick, zero-padding when a sender is
//! short. The last-write stamp is atomic so the tick's staleness check never
//! has to touch the queue itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// FIFO of decoded PCM chunks for one sender.
pub struct PcmBuffer {
    chunks: VecDeque<Bytes>,
    /// Bytes of the front chunk already consumed by partial frame reads.
    front_consumed: usize,
    last_write_ms: AtomicU64,
}

impl PcmBuffer {
    pub fn new(now_ms: u64) -> Self {
        Self {
            chunks: VecDeque::new(),
            front_consumed: 0,
            last_write_ms: AtomicU64::new(now_ms),
        }
    }

    /// Enqueues a copy of `data` and stamps the write time.
    pub fn write(&mut self, data: &[u8], now_ms: u64) {
        if data.is_empty() {
            return;
        }
        self.chunks.push_back(Bytes::copy_from_slice(data));
        self.last_write_ms.store(now_ms, Ordering::Release);
    }

    /// Dequeues up to `dst.len()` bytes, concatenating across chunks and
    /// zero-padding the remainder. Returns whether any bytes were copied.
    pub fn read_frame(&mut self, dst: &mut [u8]) -> bool {
        let mut copied = 0usize;
        while copied < dst.len() {
            let Some(front) = self.chunks.front() else { break };
            let available = &front[self.front_consumed..];
            let take = available.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&available[..take]);
            copied += take;
            if take == available.len() {
                self.chunks.pop_front();
                self.front_consumed = 0;
            } else {
                self.front_consumed += take;
            }
        }
        dst[copied..].fill(0);
        copied > 0
    }

    /// Wait-free read of the last write stamp.
    pub fn last_write_ms(&self) -> u64 {
        self.last_write_ms.load(Ordering::Acquire)
    }

    pub fn buffered_bytes(&self) -> usize {
        let queued: usize = self.chunks.iter().map(Bytes::len).sum();
        queued - self.front_consumed
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.front_consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_read_frame_concatenates_chunks() {
        let mut buf = PcmBuffer::new(0);
        buf.write(&[1, 2, 3], 1);
        buf.write(&[4, 5, 6, 7], 2);

        let mut frame = [0u8; 5];
        assert!(buf.read_frame(&mut frame));
        assert_eq!(frame, [1, 2, 3, 4, 5]);
        assert_eq!(buf.buffered_bytes(), 2);

        let mut rest = [0xFFu8; 4];
        assert!(buf.read_frame(&mut rest));
        assert_eq!(rest, [6, 7, 0, 0]);
    }

    #[test]
    fn test_read_frame_zero_pads_when_empty() {
        let mut buf = PcmBuffer::new(0);
        let mut frame = [0xAAu8; 4];
        assert!(!buf.read_frame(&mut frame));
        assert_eq!(frame, [0, 0, 0, 0]);
    }

    #[test]
    fn test_last_write_stamp_updates() {
        let mut buf = PcmBuffer::new(10);
        assert_eq!(buf.last_write_ms(), 10);
        buf.write(&[0, 0], 42);
        assert_eq!(buf.last_write_ms(), 42);
    }
}
