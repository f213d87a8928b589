//! Thread-safe monotonic counters.
//!
//! The presenter tags every accepted connection with a number from a
//! [`SequenceCounter`] so that a connection task can tell whether the
//! registry entry for its identity still belongs to it, or has since been
//! replaced by a newer connection from the same machine.  The fan-out sender
//! uses a second counter for datagram sequence numbers.
//!
//! # Thread safety
//!
//! The counter is a single `AtomicU64`.  `fetch_add` reads, increments and
//! writes as one indivisible step, so concurrent callers never observe the
//! same value.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free, monotonically increasing counter.
///
/// Starts at 0 and wraps to 0 after `u64::MAX` without panicking.
///
/// # Examples
///
/// ```rust
/// use classlink_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next value and advances the counter.
    ///
    /// `Relaxed` ordering is enough: the values are identifiers, not a
    /// synchronisation mechanism.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the next value truncated to 32 bits, for wire fields that
    /// carry a `u32` sequence number.
    pub fn next_u32(&self) -> u32 {
        self.next() as u32
    }

    /// Returns the value the next call to [`next`](Self::next) will produce.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
