//! Timestamp search over a circular buffer
//!
//! Two interchangeable strategies answer the same lower-bound query:
//!
//! - `BinarySearch` tolerates irregular spacing, dropped records and error frames
//! - `FixedRate` computes the position in constant time, assuming uniform spacing
//!
//! Pick a strategy at compile time with the unit structs, or at run time with
//! `SearchStrategy`, which is resolved once per call through a single match
//! rather than dynamic dispatch.

pub mod binary;
pub mod fixed_rate;

pub use binary::BinarySearch;
pub use fixed_rate::FixedRate;

use crate::memory::circular::{CircularBuffer, Cursor};
use crate::memory::record::Readout;
use crate::memory::{RecordSink, RecordSource};
use crate::BufferConfig;
use serde::Deserialize;
use std::ops::Deref;
use std::time::Duration;

/// A strategy for locating a record by timestamp
pub trait LowerBound<T: Readout> {
    /// Cursor at the first record whose span contains or follows `timestamp`,
    /// or `end()` if the timestamp is not currently buffered
    fn lower_bound<'a>(
        &self,
        buffer: &'a CircularBuffer<T>,
        timestamp: u64,
        include_error_records: bool,
    ) -> Cursor<'a, T>;
}

/// Run-time choice of search strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Binary search, safe for any spacing
    #[default]
    Binary,
    /// Arithmetic lookup for uniformly spaced streams
    FixedRate,
}

impl<T: Readout> LowerBound<T> for SearchStrategy {
    #[inline]
    fn lower_bound<'a>(
        &self,
        buffer: &'a CircularBuffer<T>,
        timestamp: u64,
        include_error_records: bool,
    ) -> Cursor<'a, T> {
        match self {
            SearchStrategy::Binary => binary::lower_bound(buffer, timestamp, include_error_records),
            SearchStrategy::FixedRate => fixed_rate::lower_bound(buffer, timestamp, include_error_records),
        }
    }
}

/// A circular buffer bundled with the strategy used to search it
///
/// Dereferences to the underlying `CircularBuffer`, so push, pop and iteration are
/// available directly.
pub struct SearchableBuffer<T, S = SearchStrategy> {
    buffer: CircularBuffer<T>,
    strategy: S,
}

impl<T: Readout, S: LowerBound<T>> SearchableBuffer<T, S> {
    /// Wrap an existing buffer
    pub fn new(buffer: CircularBuffer<T>, strategy: S) -> Self {
        Self { buffer, strategy }
    }

    /// Locate `timestamp` with this buffer's strategy
    pub fn lower_bound(&self, timestamp: u64, include_error_records: bool) -> Cursor<'_, T> {
        self.strategy.lower_bound(&self.buffer, timestamp, include_error_records)
    }

    /// The strategy in use
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Unwrap into the plain buffer
    pub fn into_inner(self) -> CircularBuffer<T> {
        self.buffer
    }
}

impl<T: Readout> SearchableBuffer<T, SearchStrategy> {
    /// Build a buffer from configuration
    ///
    /// # Panics
    ///
    /// Panics if the configured capacity is zero.
    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(
            CircularBuffer::with_policy(config.capacity, config.overflow_policy),
            config.search,
        )
    }
}

impl<T, S> Deref for SearchableBuffer<T, S> {
    type Target = CircularBuffer<T>;

    fn deref(&self) -> &CircularBuffer<T> {
        &self.buffer
    }
}

impl<T: Readout, S: Send + Sync> RecordSink<T> for SearchableBuffer<T, S> {
    fn push(&self, record: T) -> bool {
        self.buffer.push(record)
    }
}

impl<T: Readout, S: Send + Sync> RecordSource<T> for SearchableBuffer<T, S> {
    fn pop(&self, timeout: Duration) -> Option<T> {
        self.buffer.pop(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::circular::OverflowPolicy;
    use crate::memory::record::Superchunk;

    #[test]
    fn test_strategies_agree_on_uniform_stream() {
        let binary = SearchableBuffer::new(CircularBuffer::new(16), BinarySearch);
        let fixed = SearchableBuffer::new(CircularBuffer::new(16), FixedRate);

        for i in 0..40u64 {
            binary.push(Superchunk::new(i * 300));
            fixed.push(Superchunk::new(i * 300));
        }

        for ts in (24 * 300..40 * 300).step_by(37) {
            assert_eq!(
                binary.lower_bound(ts, false).index(),
                fixed.lower_bound(ts, false).index(),
                "strategies disagree at {ts}"
            );
        }
    }

    #[test]
    fn test_from_config() {
        let config = BufferConfig {
            capacity: 3,
            overflow_policy: OverflowPolicy::Reject,
            search: SearchStrategy::FixedRate,
        };
        let buffer = SearchableBuffer::<Superchunk>::from_config(&config);

        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.overflow_policy(), OverflowPolicy::Reject);
        assert_eq!(*buffer.strategy(), SearchStrategy::FixedRate);

        for i in 0..4 {
            buffer.push(Superchunk::new(i * 300));
        }
        assert_eq!(buffer.lower_bound(450, false).get().map(|c| c.first_timestamp), Some(300));
    }
}
