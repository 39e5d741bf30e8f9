//! Cursor implementation for reading back a recording
//!
//! The cursor keeps its own position, so several readers can walk the same
//! recording independently, including while a recorder is still appending to
//! it. It supports:
//!
//! - Record-by-record and batched reads
//! - Seeking to a saved position or to the end
//! - Seeking to the first record whose span contains or follows a timestamp

use crate::disk::recording::RecordingFile;
use crate::disk::{RecordLayout, RecordingError, Result};
use std::sync::Arc;

/// A position in a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Position {
    /// Index of the next record to read
    pub index: u64,
}

impl Position {
    /// Create a new position
    pub fn new(index: u64) -> Self {
        Self { index }
    }

    /// Position of the first record
    pub fn begin() -> Self {
        Self { index: 0 }
    }
}

/// A cursor for reading records from a recording
pub struct RecordingCursor<T> {
    /// Reference to the recording
    recording: Arc<RecordingFile<T>>,
    /// Current position
    position: Position,
}

impl<T: RecordLayout> RecordingCursor<T> {
    /// Create a new cursor
    ///
    /// # Arguments
    ///
    /// * `recording` - The recording to read
    /// * `position` - Starting position, or None to start from the first record
    pub fn new(recording: Arc<RecordingFile<T>>, position: Option<Position>) -> Self {
        Self {
            recording,
            position: position.unwrap_or_else(Position::begin),
        }
    }

    /// Get the current position
    pub fn position(&self) -> Position {
        self.position
    }

    /// Check if the cursor has caught up with the written records
    pub fn at_end(&self) -> bool {
        self.position.index >= self.recording.len()
    }

    /// Read the next record
    pub fn next(&mut self) -> Result<Option<T>> {
        let record = self.recording.read_at(self.position.index)?;
        if record.is_some() {
            self.position.index += 1;
        }
        Ok(record)
    }

    /// Read up to `max_count` records
    pub fn read_batch(&mut self, max_count: usize) -> Result<Vec<T>> {
        let mut records = Vec::with_capacity(max_count);

        for _ in 0..max_count {
            match self.next()? {
                Some(record) => records.push(record),
                None => break,
            }
        }

        Ok(records)
    }

    /// Move to `position`, clamped to the end of the written records
    pub fn seek_to(&mut self, position: Position) {
        self.position = position.min(Position::new(self.recording.len()));
    }

    /// Skip to the end of the written records
    pub fn seek_to_end(&mut self) {
        self.position = Position::new(self.recording.len());
    }

    /// Move to the first record whose span contains or follows `timestamp`
    ///
    /// Assumes records were recorded in timestamp order. A timestamp past every
    /// recorded span leaves the cursor at the end.
    pub fn seek_to_timestamp(&mut self, timestamp: u64) -> Result<()> {
        let (mut low, mut high) = (0, self.recording.len());
        while low < high {
            let mid = low + (high - low) / 2;
            let record = self
                .recording
                .read_at(mid)?
                .ok_or(RecordingError::InvalidRecord(mid))?;
            if record.end_timestamp() <= timestamp {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        self.position = Position::new(low);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::record::Superchunk;
    use tempfile::tempdir;

    fn recording_with(count: u64) -> (tempfile::TempDir, Arc<RecordingFile<Superchunk>>) {
        let dir = tempdir().unwrap();
        let recording = RecordingFile::create(dir.path().join("cursor.dat"), 64).unwrap();
        for i in 0..count {
            recording.append(&Superchunk::new(i * 300)).unwrap();
        }
        (dir, Arc::new(recording))
    }

    #[test]
    fn test_cursor_basics() {
        let (_dir, recording) = recording_with(5);
        let mut cursor = RecordingCursor::new(recording, None);

        let mut records = Vec::new();
        while let Some(record) = cursor.next().unwrap() {
            records.push(record);
        }

        assert_eq!(records.len(), 5);
        assert!(cursor.at_end());
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.first_timestamp, i as u64 * 300);
        }
    }

    #[test]
    fn test_cursor_batch_read() {
        let (_dir, recording) = recording_with(10);
        let mut cursor = RecordingCursor::new(recording, None);

        assert_eq!(cursor.read_batch(3).unwrap().len(), 3);
        assert_eq!(cursor.read_batch(3).unwrap().len(), 3);

        // Ask for 5, but only 4 remain
        let batch = cursor.read_batch(5).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].first_timestamp, 6 * 300);
        assert!(cursor.at_end());
    }

    #[test]
    fn test_cursor_seek() {
        let (_dir, recording) = recording_with(5);
        let mut cursor = RecordingCursor::new(recording, None);

        cursor.next().unwrap();
        cursor.next().unwrap();
        let saved = cursor.position();

        while cursor.next().unwrap().is_some() {}

        cursor.seek_to(saved);
        assert!(!cursor.at_end());
        assert_eq!(cursor.read_batch(10).unwrap().len(), 3);

        cursor.seek_to(Position::new(100));
        assert_eq!(cursor.position(), Position::new(5));
    }

    #[test]
    fn test_cursor_follows_appends() {
        let (_dir, recording) = recording_with(2);
        let mut cursor = RecordingCursor::new(recording.clone(), None);
        cursor.seek_to_end();
        assert!(cursor.next().unwrap().is_none());

        recording.append(&Superchunk::new(600)).unwrap();
        assert_eq!(cursor.next().unwrap().map(|c| c.first_timestamp), Some(600));
    }

    #[test]
    fn test_seek_to_timestamp() {
        let (_dir, recording) = recording_with(10);
        let mut cursor = RecordingCursor::new(recording, None);

        cursor.seek_to_timestamp(1_000).unwrap();
        assert_eq!(cursor.next().unwrap().map(|c| c.first_timestamp), Some(900));

        cursor.seek_to_timestamp(0).unwrap();
        assert_eq!(cursor.position(), Position::begin());

        cursor.seek_to_timestamp(3_000).unwrap();
        assert!(cursor.at_end());
    }
}
