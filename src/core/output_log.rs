//! Ring buffer and output log (component B).
//!
//! Two storage layers per task: a bounded rolling window feeding the
//! pattern scanner, and an unbounded accumulator serving `output` RPCs.
//! The PTY reader is the sole producer of both; readers take snapshots
//! by length, so concurrent `output`/`status` calls never observe a
//! torn write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Bounded window of the most recent `capacity` bytes, used by the
/// pattern scanner's ANSI-stripping/matching pass without unbounded
/// memory growth. Not currently read outside this module — the scanner
/// consumes the same chunks the accumulator does, directly from the
/// executor's callback — but kept as a first-class type because the
/// component design calls for it explicitly and a future caller (e.g. a
/// "replay last N bytes" RPC) would reach for this rather than the
/// unbounded accumulator.
pub struct RingBuffer {
    capacity: usize,
    buf: RwLock<VecDeque<u8>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, chunk: &[u8]) {
        let mut buf = self.buf.write().unwrap();
        buf.extend(chunk.iter().copied());
        let excess = buf.len().saturating_sub(self.capacity);
        if excess > 0 {
            buf.drain(..excess);
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.read().unwrap().iter().copied().collect()
    }
}

/// Append-only accumulator of everything the child has written. The
/// `byte_count` counter is atomic so `status`/`output` can read the
/// current length without taking the accumulator's write lock.
pub struct OutputLog {
    bytes: RwLock<Vec<u8>>,
    byte_count: AtomicU64,
    line_count: AtomicU64,
}

impl OutputLog {
    pub fn new() -> Self {
        Self {
            bytes: RwLock::new(Vec::new()),
            byte_count: AtomicU64::new(0),
            line_count: AtomicU64::new(0),
        }
    }

    /// Appends a chunk. `newlines` is the count of `\n` bytes the caller
    /// already found in `chunk` (the pattern scanner computes this as
    /// part of line assembly, so we don't re-scan here).
    pub fn append(&self, chunk: &[u8], newlines: u64) {
        let mut bytes = self.bytes.write().unwrap();
        bytes.extend_from_slice(chunk);
        // Length is updated while still holding the write lock so a
        // concurrent reader never observes a count ahead of the bytes
        // it describes.
        self.byte_count.store(bytes.len() as u64, Ordering::Release);
        self.line_count.fetch_add(newlines, Ordering::Relaxed);
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Acquire)
    }

    pub fn line_count(&self) -> u64 {
        self.line_count.load(Ordering::Relaxed)
    }

    /// Full snapshot of everything written so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().unwrap().clone()
    }

    /// Snapshot of at most the last `tail` bytes. Returns whether the
    /// result was truncated relative to the full log.
    pub fn tail(&self, tail: usize) -> (Vec<u8>, bool) {
        let bytes = self.bytes.read().unwrap();
        if tail >= bytes.len() {
            (bytes.clone(), false)
        } else {
            (bytes[bytes.len() - tail..].to_vec(), true)
        }
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_prefix_stable() {
        let log = OutputLog::new();
        log.append(b"hello ", 0);
        let snap1 = log.snapshot();
        log.append(b"world\n", 1);
        let snap2 = log.snapshot();
        assert!(snap2.starts_with(&snap1), "later snapshot must extend the earlier one");
        assert_eq!(snap2, b"hello world\n");
    }

    #[test]
    fn tail_reports_truncation() {
        let log = OutputLog::new();
        log.append(b"0123456789", 0);
        let (data, truncated) = log.tail(4);
        assert_eq!(data, b"6789");
        assert!(truncated);

        let (data, truncated) = log.tail(100);
        assert_eq!(data, b"0123456789");
        assert!(!truncated);
    }

    #[test]
    fn ring_buffer_evicts_from_front() {
        let ring = RingBuffer::new(4);
        ring.push(b"abcdef");
        assert_eq!(ring.snapshot(), b"cdef");
    }
}
