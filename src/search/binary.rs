//! Timestamp lookup by binary search over the occupied window
//!
//! Works for any spacing between records as long as the producer pushed them in
//! non-decreasing timestamp order. The search runs on a window snapshot taken at
//! entry; records pushed or evicted while it runs may or may not be observed.

use crate::memory::circular::{CircularBuffer, Cursor};
use crate::memory::record::Readout;
use crate::search::LowerBound;

/// Binary-search lookup, valid for irregular record spacing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinarySearch;

impl<T: Readout> LowerBound<T> for BinarySearch {
    fn lower_bound<'a>(
        &self,
        buffer: &'a CircularBuffer<T>,
        timestamp: u64,
        include_error_records: bool,
    ) -> Cursor<'a, T> {
        lower_bound(buffer, timestamp, include_error_records)
    }
}

/// Find the first buffered record whose span contains or follows `timestamp`
///
/// Returns `end()` when the buffer is empty, when `timestamp` is older than the
/// oldest record, or when it lies at or past the end of the newest record's span.
/// Unless `include_error_records` is set, records flagged with errors are skipped
/// and the next clean record is returned instead.
pub fn lower_bound<T: Readout>(
    buffer: &CircularBuffer<T>,
    timestamp: u64,
    include_error_records: bool,
) -> Cursor<'_, T> {
    let window = buffer.window();
    if window.is_empty() {
        return buffer.end();
    }

    let oldest = buffer.read_slot(window.index(0));
    let newest = buffer.read_slot(window.index(window.len - 1));
    if timestamp < oldest.first_timestamp() || timestamp >= newest.end_timestamp() {
        return buffer.end();
    }

    // First offset whose span ends after the target
    let (mut low, mut high) = (0, window.len);
    while low < high {
        let mid = low + (high - low) / 2;
        if buffer.read_slot(window.index(mid)).end_timestamp() <= timestamp {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    if !include_error_records {
        while low < window.len && buffer.read_slot(window.index(low)).has_errors() {
            low += 1;
        }
    }

    if low == window.len {
        return buffer.end();
    }
    buffer.at_position(window.position(low))
}
