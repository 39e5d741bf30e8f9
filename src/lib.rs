//! Readout Buffer - timestamp-indexed circular buffers for real-time
//! data-acquisition readout.
//!
//! # Overview
//!
//! A readout link produces a continuous stream of fixed-size records, each
//! stamped with the timestamp of its first frame. This crate buffers that
//! stream in memory and lets consumers find records by timestamp without
//! slowing the producer down:
//!
//! 1. `CircularBuffer` - bounded, lock-free single-producer buffer with
//!    drop-oldest overflow, timed pop and restartable cursors
//! 2. `BinarySearch` - lower-bound lookup by timestamp for any record spacing
//! 3. `FixedRate` - constant-time lookup for uniformly spaced streams
//!
//! Around the buffer sit two collaborators that exercise it end to end:
//!
//! - `SourceEmulator` produces synthetic records with dropouts and frame errors
//! - `Recorder` drains the buffer into a checksummed memory-mapped recording
//!
//! # Usage
//!
//! The crate is typically used by:
//! 1. Building a `SearchableBuffer` from a `BufferConfig`
//! 2. Pushing records from the readout thread
//! 3. Draining with `pop` or looking up with `lower_bound` from other threads
//! 4. Ending worker loops through a shared `RunToken`
//!
//! See `demos/basic_usage.rs` for a complete run.

#![deny(missing_docs)]

mod disk;
mod emulator;
mod memory;
mod recorder;
mod run;
mod search;

pub use disk::cursor::{Position, RecordingCursor};
pub use disk::recording::RecordingFile;
pub use disk::{RecordLayout, RecordingError};
pub use emulator::{
    Emulated, EmulatorConfig, EmulatorError, EmulatorInfo, ErrorBitGenerator, RateLimiter, SourceEmulator,
};
pub use memory::circular::{BufferStats, CircularBuffer, Cursor, OverflowPolicy, Window};
pub use memory::record::{Readout, Superchunk};
pub use memory::{RecordSink, RecordSource};
pub use recorder::{Recorder, RecorderConfig, RecorderInfo};
pub use run::RunToken;
pub use search::{BinarySearch, FixedRate, LowerBound, SearchStrategy, SearchableBuffer};

use serde::Deserialize;

/// Configuration for one buffered readout stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of records the buffer holds
    pub capacity: usize,
    /// What to do when a push finds the buffer full
    pub overflow_policy: OverflowPolicy,
    /// How `lower_bound` locates records
    pub search: SearchStrategy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            overflow_policy: OverflowPolicy::DropOldest,
            search: SearchStrategy::Binary,
        }
    }
}

/// Re-exported data types used in the API
pub mod types {
    pub use crate::disk::{ControlBlock, EntryHeader};
    pub use crate::memory::record::Superchunk;
}
