//! Memory-mapped recording file
//!
//! This module implements an append-only file of fixed-size entries, mapped
//! into memory for cheap writes. Key features include:
//!
//! - Room for a fixed number of entries, allocated when the file is created
//! - Control block with magic, version and CRC32, validated on open
//! - Per-entry marker and CRC32 so a torn or corrupted entry is detected on read
//! - Record type checks: a file can only be opened as the type that wrote it
//!
//! Appends update the control block in the mapping but do not sync it to disk;
//! call `flush` to make the recording durable.

use crate::disk::{ControlBlock, EntryHeader, RecordLayout, RecordingError, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

struct Mapped {
    mmap: MmapMut,
    control: ControlBlock,
}

impl Mapped {
    fn store_control(&mut self) {
        self.control.update_crc();
        self.mmap[0..ControlBlock::SIZE].copy_from_slice(&self.control.encode());
    }

    fn entry_offset(&self, index: u64) -> usize {
        ControlBlock::SIZE + index as usize * self.control.entry_size()
    }
}

/// Append-only recording of readout records
pub struct RecordingFile<T> {
    /// Path to the recording
    path: PathBuf,
    /// Mapping and its control block, kept in sync
    mapped: RwLock<Mapped>,
    _records: PhantomData<fn() -> T>,
}

impl<T: RecordLayout> RecordingFile<T> {
    /// Create a recording with room for `capacity` records, replacing any file at `path`
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let control = ControlBlock::new::<T>(capacity);
        let total_size = ControlBlock::SIZE as u64 + capacity * control.entry_size() as u64;
        file.set_len(total_size)?;

        // SAFETY: the file was just created by us and is only accessed through this mapping
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let mut mapped = Mapped { mmap, control };
        mapped.store_control();
        mapped.mmap.flush()?;

        debug!(path = %path.display(), capacity, "Created recording file");

        Ok(Self {
            path,
            mapped: RwLock::new(mapped),
            _records: PhantomData,
        })
    }

    /// Open an existing recording written with the same record type
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < ControlBlock::SIZE as u64 {
            return Err(RecordingError::InvalidFile);
        }

        // SAFETY: the mapping is private to this value; concurrent external writers are not supported
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let control = ControlBlock::decode(&mmap[0..ControlBlock::SIZE]);
        if !control.is_valid() || control.record_count > control.capacity {
            return Err(RecordingError::InvalidFile);
        }

        if control.record_size as usize != T::ENCODED_SIZE
            || control.tick_difference != T::EXPECTED_TICK_DIFFERENCE
        {
            return Err(RecordingError::LayoutMismatch {
                found_size: control.record_size,
                found_tick: control.tick_difference,
                expected_size: T::ENCODED_SIZE as u32,
                expected_tick: T::EXPECTED_TICK_DIFFERENCE,
            });
        }

        let expected_size = ControlBlock::SIZE as u64 + control.capacity * control.entry_size() as u64;
        if file_size < expected_size {
            return Err(RecordingError::InvalidFile);
        }

        debug!(path = %path.display(), records = control.record_count, "Opened recording file");

        Ok(Self {
            path,
            mapped: RwLock::new(Mapped { mmap, control }),
            _records: PhantomData,
        })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written
    pub fn len(&self) -> u64 {
        self.mapped.read().control.record_count
    }

    /// Whether no record has been written yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records the file has room for
    pub fn capacity(&self) -> u64 {
        self.mapped.read().control.capacity
    }

    /// Get a copy of the control block
    pub fn control_block(&self) -> ControlBlock {
        self.mapped.read().control
    }

    /// Append a record, returning its index
    pub fn append(&self, record: &T) -> Result<u64> {
        let mut mapped = self.mapped.write();

        let index = mapped.control.record_count;
        if index >= mapped.control.capacity {
            return Err(RecordingError::Full);
        }

        let header_at = mapped.entry_offset(index);
        let record_at = header_at + EntryHeader::SIZE;
        let record_end = record_at + T::ENCODED_SIZE;

        record.encode(&mut mapped.mmap[record_at..record_end]);
        let header = EntryHeader::for_record(&mapped.mmap[record_at..record_end]);
        mapped.mmap[header_at..record_at].copy_from_slice(&header.encode());

        mapped.control.record_count += 1;
        mapped.store_control();

        Ok(index)
    }

    /// Read the record at `index`, or `None` past the last written record
    pub fn read_at(&self, index: u64) -> Result<Option<T>> {
        let mapped = self.mapped.read();

        if index >= mapped.control.record_count {
            return Ok(None);
        }

        let header_at = mapped.entry_offset(index);
        let record_at = header_at + EntryHeader::SIZE;
        let encoded = &mapped.mmap[record_at..record_at + T::ENCODED_SIZE];

        let header = EntryHeader::decode(&mapped.mmap[header_at..record_at]);
        if !header.verify(encoded) {
            return Err(RecordingError::InvalidRecord(index));
        }

        Ok(Some(T::decode(encoded)))
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.mapped.read().mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::record::Superchunk;
    use tempfile::tempdir;

    #[test]
    fn test_create_new_recording() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_recording.dat");

        let recording = RecordingFile::<Superchunk>::create(&path, 16).unwrap();
        assert_eq!(recording.capacity(), 16);
        assert!(recording.is_empty());

        let control = recording.control_block();
        assert_eq!(control.magic, ControlBlock::MAGIC);
        assert_eq!(control.version, ControlBlock::VERSION);
        assert!(control.verify_crc());

        let file_size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file_size, (ControlBlock::SIZE + 16 * (EntryHeader::SIZE + 68)) as u64);
    }

    #[test]
    fn test_append_read() {
        let dir = tempdir().unwrap();
        let recording = RecordingFile::create(dir.path().join("append.dat"), 8).unwrap();

        for i in 0..5u64 {
            assert_eq!(recording.append(&Superchunk::new(i * 300)).unwrap(), i);
        }

        assert_eq!(recording.len(), 5);
        for i in 0..5u64 {
            let chunk: Superchunk = recording.read_at(i).unwrap().unwrap();
            assert_eq!(chunk.first_timestamp, i * 300);
        }
        assert!(recording.read_at(5).unwrap().is_none());
    }

    #[test]
    fn test_full() {
        let dir = tempdir().unwrap();
        let recording = RecordingFile::create(dir.path().join("full.dat"), 2).unwrap();

        recording.append(&Superchunk::new(0)).unwrap();
        recording.append(&Superchunk::new(300)).unwrap();
        assert!(matches!(
            recording.append(&Superchunk::new(600)),
            Err(RecordingError::Full)
        ));
        assert_eq!(recording.len(), 2);
    }

    #[test]
    fn test_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.dat");

        {
            let recording = RecordingFile::create(&path, 4).unwrap();
            recording.append(&Superchunk::new(42)).unwrap();
            recording.flush().unwrap();
        }

        let recording = RecordingFile::<Superchunk>::open(&path).unwrap();
        assert_eq!(recording.len(), 1);
        assert_eq!(recording.capacity(), 4);
        assert_eq!(recording.read_at(0).unwrap().unwrap().first_timestamp, 42);
    }
}
