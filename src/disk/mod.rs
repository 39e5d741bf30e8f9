//! On-disk recording format for readout records
//!
//! A recording is a memory-mapped file made of a fixed control block followed by
//! a fixed number of equally sized entries:
//!
//! ```text
//! +----------------------+---------------------------+---------------------------+---
//! | ControlBlock (48 B)  | EntryHeader (8 B) | record | EntryHeader (8 B) | record | ...
//! +----------------------+---------------------------+---------------------------+---
//! ```
//!
//! All integers are little-endian and written field by field, so the layout does
//! not depend on the in-memory representation of any Rust type. Control block:
//!
//! | offset | field           | type |
//! |--------|-----------------|------|
//! | 0      | magic `"RDRC"`  | u32  |
//! | 4      | version         | u32  |
//! | 8      | record_size     | u32  |
//! | 12     | reserved        | u32  |
//! | 16     | tick_difference | u64  |
//! | 24     | capacity        | u64  |
//! | 32     | record_count    | u64  |
//! | 40     | crc32 of 0..40  | u32  |
//! | 44     | reserved        | u32  |
//!
//! Each entry header carries a validity marker and the CRC32 of the encoded
//! record that follows it. Record encodings are defined per type by
//! `RecordLayout`.

pub mod cursor;
pub mod recording;

use crate::memory::record::{Readout, Superchunk};
use crc32fast::Hasher;
use std::io;
use thiserror::Error;

/// Error types for recording files
#[derive(Error, Debug)]
pub enum RecordingError {
    /// An IO error occurred
    #[error("recording I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The file is not a recording, or its control block is corrupted
    #[error("not a valid recording file")]
    InvalidFile,
    /// The recording holds a different record type than requested
    #[error("recording layout mismatch: file has {found_size}-byte records at tick {found_tick}, expected {expected_size}-byte records at tick {expected_tick}")]
    LayoutMismatch {
        /// Record size stored in the file
        found_size: u32,
        /// Tick difference stored in the file
        found_tick: u64,
        /// Record size of the requested type
        expected_size: u32,
        /// Tick difference of the requested type
        expected_tick: u64,
    },
    /// An entry failed its marker or checksum test
    #[error("recording entry {0} is corrupted")]
    InvalidRecord(u64),
    /// Every entry of the recording is in use
    #[error("recording is full")]
    Full,
    /// `Recorder::start` was called while its worker thread runs
    #[error("recorder is already running")]
    AlreadyRunning,
}

/// Result type for recording operations
pub type Result<T> = std::result::Result<T, RecordingError>;

/// Explicit binary encoding of a record type
pub trait RecordLayout: Readout {
    /// Size of one encoded record in bytes
    const ENCODED_SIZE: usize;

    /// Encode into `out`, which is exactly `ENCODED_SIZE` bytes long
    fn encode(&self, out: &mut [u8]);

    /// Decode from `bytes`, which is exactly `ENCODED_SIZE` bytes long
    fn decode(bytes: &[u8]) -> Self;
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Recording control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    /// Magic number to identify the file format
    pub magic: u32,
    /// Version of the file format
    pub version: u32,
    /// Encoded size of one record
    pub record_size: u32,
    /// Tick difference of the record type
    pub tick_difference: u64,
    /// Number of entries the file has room for
    pub capacity: u64,
    /// Number of entries written so far
    pub record_count: u64,
    /// CRC32 of the encoded block up to this field
    pub crc32: u32,
}

impl ControlBlock {
    /// Size of the encoded control block in bytes
    pub const SIZE: usize = 48;

    /// Magic number for format identification ("RDRC")
    pub const MAGIC: u32 = u32::from_le_bytes(*b"RDRC");

    /// Current format version
    pub const VERSION: u32 = 1;

    const CRC_OFFSET: usize = 40;

    /// Create a control block for an empty recording of `T` records
    pub fn new<T: RecordLayout>(capacity: u64) -> Self {
        let mut block = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            record_size: T::ENCODED_SIZE as u32,
            tick_difference: T::EXPECTED_TICK_DIFFERENCE,
            capacity,
            record_count: 0,
            crc32: 0,
        };
        block.update_crc();
        block
    }

    /// Encode the block
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.record_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.tick_difference.to_le_bytes());
        out[24..32].copy_from_slice(&self.capacity.to_le_bytes());
        out[32..40].copy_from_slice(&self.record_count.to_le_bytes());
        out[40..44].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    /// Decode a block, without validating it
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            magic: read_u32(bytes, 0),
            version: read_u32(bytes, 4),
            record_size: read_u32(bytes, 8),
            tick_difference: read_u64(bytes, 16),
            capacity: read_u64(bytes, 24),
            record_count: read_u64(bytes, 32),
            crc32: read_u32(bytes, 40),
        }
    }

    /// Recalculate the CRC32 field
    pub fn update_crc(&mut self) {
        self.crc32 = checksum(&self.encode()[..Self::CRC_OFFSET]);
    }

    /// Verify the CRC32 field
    pub fn verify_crc(&self) -> bool {
        self.crc32 == checksum(&self.encode()[..Self::CRC_OFFSET])
    }

    /// Whether magic, version and checksum are all as expected
    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION && self.verify_crc()
    }

    /// Bytes taken by one entry, header included
    pub fn entry_size(&self) -> usize {
        EntryHeader::SIZE + self.record_size as usize
    }
}

/// Header in front of every recorded entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// A marker indicating a valid entry (0xAA55)
    pub marker: u16,
    /// CRC32 of the encoded record
    pub crc32: u32,
}

impl EntryHeader {
    /// Size of the encoded header in bytes
    pub const SIZE: usize = 8;

    /// Marker value for valid entries
    pub const MARKER: u16 = 0xAA55;

    /// Create the header for an encoded record
    pub fn for_record(encoded: &[u8]) -> Self {
        Self {
            marker: Self::MARKER,
            crc32: checksum(encoded),
        }
    }

    /// Encode the header
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.marker.to_le_bytes());
        out[4..8].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    /// Decode a header
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            marker: read_u16(bytes, 0),
            crc32: read_u32(bytes, 4),
        }
    }

    /// Check the marker and the checksum of the encoded record
    pub fn verify(&self, encoded: &[u8]) -> bool {
        self.marker == Self::MARKER && self.crc32 == checksum(encoded)
    }
}

// Layout: first_timestamp u64 | frame_count u32 | frame_errors [u16; 12] | payload [u8; 32]
impl RecordLayout for Superchunk {
    const ENCODED_SIZE: usize = 8 + 4 + 2 * Superchunk::FRAMES + Superchunk::PAYLOAD_SIZE;

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.first_timestamp.to_le_bytes());
        out[8..12].copy_from_slice(&self.frame_count.to_le_bytes());
        for (i, word) in self.frame_errors.iter().enumerate() {
            let at = 12 + 2 * i;
            out[at..at + 2].copy_from_slice(&word.to_le_bytes());
        }
        let payload_at = 12 + 2 * Superchunk::FRAMES;
        out[payload_at..payload_at + Superchunk::PAYLOAD_SIZE].copy_from_slice(&self.payload);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut chunk = Superchunk {
            first_timestamp: read_u64(bytes, 0),
            frame_count: read_u32(bytes, 8),
            ..Superchunk::default()
        };
        for (i, word) in chunk.frame_errors.iter_mut().enumerate() {
            *word = read_u16(bytes, 12 + 2 * i);
        }
        let payload_at = 12 + 2 * Superchunk::FRAMES;
        chunk
            .payload
            .copy_from_slice(&bytes[payload_at..payload_at + Superchunk::PAYLOAD_SIZE]);
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_block_crc() {
        let mut block = ControlBlock::new::<Superchunk>(128);
        assert!(block.is_valid());
        assert_eq!(block.record_size, 68);
        assert_eq!(block.tick_difference, 25);

        let decoded = ControlBlock::decode(&block.encode());
        assert_eq!(decoded, block);

        block.record_count = 7;
        assert!(!block.verify_crc());
        block.update_crc();
        assert!(block.is_valid());
    }

    #[test]
    fn test_magic_bytes() {
        let block = ControlBlock::new::<Superchunk>(1);
        assert_eq!(&block.encode()[0..4], b"RDRC");
    }

    #[test]
    fn test_superchunk_layout() {
        let mut chunk = Superchunk::new(0x0102_0304_0506_0708);
        chunk.frame_errors[11] = 0xBEEF;
        chunk.payload[31] = 0x7F;

        let mut bytes = [0u8; Superchunk::ENCODED_SIZE];
        chunk.encode(&mut bytes);

        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[8], 12);
        assert_eq!(&bytes[34..36], &0xBEEFu16.to_le_bytes());
        assert_eq!(bytes[67], 0x7F);
        assert_eq!(Superchunk::decode(&bytes), chunk);
    }

    #[test]
    fn test_entry_header_detects_corruption() {
        let encoded = [1u8, 2, 3, 4];
        let header = EntryHeader::for_record(&encoded);
        assert!(header.verify(&encoded));
        assert!(!header.verify(&[1, 2, 3, 5]));

        let decoded = EntryHeader::decode(&header.encode());
        assert_eq!(decoded, header);
    }
}
