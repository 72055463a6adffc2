//! Bounded byte ring buffer between the event pump and readers
//!
//! The event pump appends interrupt payloads as transfers complete, and
//! application threads drain them at their own pace. The buffer absorbs
//! bursts between the two.
//!
//! # Overflow policy
//!
//! Drop-tail: when a batch does not fit, only its leading bytes that fit are
//! stored and the rest of the batch is discarded. Bytes already buffered are
//! never evicted, so a lagging reader loses the newest data, not the oldest.
//!
//! ```text
//! capacity 8, append [1..=6], append [7, 8, 9, 10]
//!
//!   [1 2 3 4 5 6 7 8]   9, 10 dropped
//!    ^ head      ^ tail
//! ```

use parking_lot::Mutex;
use tracing::{trace, warn};

/// Default ring capacity (matches the 4 KiB deployment tier)
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// Result of a single append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Bytes stored in the buffer
    pub accepted: usize,
    /// Bytes discarded because the buffer was full
    pub dropped: usize,
}

/// Snapshot of ring buffer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub capacity: usize,
    /// Bytes currently buffered
    pub buffered: usize,
    /// Total bytes ever accepted by append
    pub appended: u64,
    /// Total bytes ever discarded by the overflow policy
    pub dropped: u64,
    /// Total bytes ever removed by drain
    pub drained: u64,
}

struct RingInner {
    storage: Box<[u8]>,
    /// Index of the oldest buffered byte
    head: usize,
    /// Number of buffered bytes
    len: usize,
    appended: u64,
    dropped: u64,
    drained: u64,
}

impl RingInner {
    fn copy_out(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }

        let capacity = self.storage.len();
        let first = n.min(capacity - self.head);
        out[..first].copy_from_slice(&self.storage[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.storage[..n - first]);

        self.head = (self.head + n) % capacity;
        self.len -= n;
        self.drained += n as u64;
        if self.len == 0 {
            self.head = 0;
        }
        n
    }
}

/// Fixed-capacity FIFO byte queue with drop-tail overflow
///
/// Append and drain both take the same mutex; neither performs I/O while
/// holding it.
pub struct RingBuffer {
    inner: Mutex<RingInner>,
}

impl RingBuffer {
    /// Create a ring buffer holding at most `capacity` bytes
    ///
    /// A zero capacity is allowed; such a buffer drops everything.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                storage: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
                appended: 0,
                dropped: 0,
                drained: 0,
            }),
        }
    }

    /// Append a batch, keeping only the prefix that fits
    pub fn append(&self, data: &[u8]) -> AppendOutcome {
        let mut inner = self.inner.lock();
        let capacity = inner.storage.len();
        let accepted = data.len().min(capacity - inner.len);
        let dropped = data.len() - accepted;

        if accepted > 0 {
            let tail = (inner.head + inner.len) % capacity;
            let first = accepted.min(capacity - tail);
            inner.storage[tail..tail + first].copy_from_slice(&data[..first]);
            inner.storage[..accepted - first].copy_from_slice(&data[first..accepted]);
            inner.len += accepted;
            inner.appended += accepted as u64;
        }

        if dropped > 0 {
            inner.dropped += dropped as u64;
            warn!(
                "Ring buffer full ({} bytes), dropped {} of {} incoming bytes (total dropped: {})",
                capacity,
                dropped,
                data.len(),
                inner.dropped
            );
        } else {
            trace!("Buffered {} bytes, {} of {} used", accepted, inner.len, capacity);
        }

        AppendOutcome { accepted, dropped }
    }

    /// Remove and return up to `max_len` bytes in FIFO order
    ///
    /// Returns an empty vector when nothing is buffered.
    pub fn drain(&self, max_len: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let mut out = vec![0u8; max_len.min(inner.len)];
        inner.copy_out(&mut out);
        out
    }

    /// Drain into a caller-provided buffer, returning the number of bytes copied
    pub fn drain_into(&self, out: &mut [u8]) -> usize {
        self.inner.lock().copy_out(out)
    }

    /// Discard everything currently buffered, returning the byte count
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let discarded = inner.len;
        inner.head = 0;
        inner.len = 0;
        inner.drained += discarded as u64;
        discarded
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().storage.len()
    }

    /// Free space in bytes
    pub fn free(&self) -> usize {
        let inner = self.inner.lock();
        inner.storage.len() - inner.len
    }

    pub fn stats(&self) -> RingStats {
        let inner = self.inner.lock();
        RingStats {
            capacity: inner.storage.len(),
            buffered: inner.len,
            appended: inner.appended,
            dropped: inner.dropped,
            drained: inner.drained,
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    enum Op {
        Append(Vec<u8>),
        Drain(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..=48).prop_map(Op::Append),
            (0usize..64).prop_map(Op::Drain),
        ]
    }

    proptest! {
        /// Property: size stays within bounds and drained bytes follow the
        /// drop-tail model exactly
        #[test]
        fn prop_matches_drop_tail_model(
            capacity in 0usize..96,
            ops in proptest::collection::vec(op_strategy(), 1..64),
        ) {
            let ring = RingBuffer::new(capacity);
            let mut model: VecDeque<u8> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Append(data) => {
                        let fit = data.len().min(capacity - model.len());
                        model.extend(&data[..fit]);
                        let outcome = ring.append(&data);
                        prop_assert_eq!(outcome.accepted, fit);
                        prop_assert_eq!(outcome.dropped, data.len() - fit);
                    }
                    Op::Drain(max_len) => {
                        let n = max_len.min(model.len());
                        let expected: Vec<u8> = model.drain(..n).collect();
                        prop_assert_eq!(ring.drain(max_len), expected);
                    }
                }

                let stats = ring.stats();
                prop_assert!(stats.buffered <= capacity);
                prop_assert_eq!(stats.buffered, model.len());
                prop_assert_eq!(
                    stats.appended - stats.drained,
                    stats.buffered as u64
                );
            }
        }
    }
}
