//! Bounded buffer of recent terminal output.
//!
//! When enabled, late joiners receive the tail of the output produced
//! before they attached. Disabled (capacity 0) by default: a joiner then
//! sees only output produced after it joined.

use std::collections::VecDeque;

use bytes::Bytes;

/// Ring of the most recent `capacity` output bytes.
#[derive(Debug)]
pub struct ReplayBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    total_written: u64,
}

impl ReplayBuffer {
    /// Creates a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
        }
    }

    /// Appends a chunk, evicting the oldest bytes when full.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_written += chunk.len() as u64;
        if self.capacity == 0 {
            return;
        }

        // Only the tail can survive.
        let chunk = if chunk.len() > self.capacity {
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(chunk);
    }

    /// Returns the buffered bytes, oldest first.
    pub fn snapshot(&self) -> Bytes {
        let (front, back) = self.data.as_slices();
        let mut out = Vec::with_capacity(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        Bytes::from(out)
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total bytes ever pushed, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}
