//! Constant-time timestamp lookup for uniformly spaced streams
//!
//! When every record in the window covers exactly `frame_count *
//! EXPECTED_TICK_DIFFERENCE` ticks with no gaps, the slot of a timestamp is an
//! offset computed from the oldest record alone. The uniform-spacing precondition
//! is not checked: on a window with dropped or irregular records the returned
//! position is simply wrong.

use crate::memory::circular::{CircularBuffer, Cursor};
use crate::memory::record::Readout;
use crate::search::{binary, LowerBound};

/// Arithmetic lookup, valid only for uniform record spacing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedRate;

impl<T: Readout> LowerBound<T> for FixedRate {
    fn lower_bound<'a>(
        &self,
        buffer: &'a CircularBuffer<T>,
        timestamp: u64,
        include_error_records: bool,
    ) -> Cursor<'a, T> {
        lower_bound(buffer, timestamp, include_error_records)
    }
}

/// Compute the slot whose nominal span contains `timestamp`
///
/// Asking for error records falls back to the binary search, since error frames
/// break the uniform-spacing assumption.
pub fn lower_bound<T: Readout>(
    buffer: &CircularBuffer<T>,
    timestamp: u64,
    include_error_records: bool,
) -> Cursor<'_, T> {
    if include_error_records {
        return binary::lower_bound(buffer, timestamp, true);
    }

    let window = buffer.window();
    if window.is_empty() {
        return buffer.end();
    }

    let oldest = buffer.read_slot(window.index(0));
    let frames = u64::from(oldest.frame_count());
    let tick = T::EXPECTED_TICK_DIFFERENCE;
    if frames == 0 || tick == 0 {
        return binary::lower_bound(buffer, timestamp, false);
    }

    let last_ts = oldest.first_timestamp();
    let newest_ts = last_ts.saturating_add((window.len as u64).saturating_mul(tick.saturating_mul(frames)));
    if timestamp < last_ts || timestamp > newest_ts {
        return buffer.end();
    }

    let tick_diff = (timestamp - last_ts) / tick;
    let element_offset = (tick_diff / frames) as usize;

    // An offset equal to the window length lands on the write position: end()
    buffer.at_position(window.position(element_offset))
}
