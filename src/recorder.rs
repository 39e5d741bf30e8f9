//! Recorder draining a buffer into a recording file
//!
//! The recorder owns a worker thread that pops records from a `RecordSource`
//! and appends them to a `RecordingFile` until its run token is cancelled or
//! the file has reached the configured number of records.

use crate::disk::recording::RecordingFile;
use crate::disk::{RecordLayout, RecordingError, Result};
use crate::memory::RecordSource;
use crate::run::RunToken;
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for a recorder
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Recording to write, replaced if it exists
    pub output_file: PathBuf,
    /// Number of records the recording has room for
    pub max_records: u64,
    /// How long one pop waits for a record before re-checking the run token
    pub pop_timeout_ms: u64,
    /// Flush to disk after this many records, zero to flush only at the end
    pub flush_every: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_file: PathBuf::from("recording.dat"),
            max_records: 1 << 20,
            pop_timeout_ms: 100,
            flush_every: 0,
        }
    }
}

/// Snapshot of recorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecorderInfo {
    /// Records written since start
    pub packets_processed: u64,
    /// Records per second since the previous info call
    pub throughput: f64,
}

struct RecorderStats {
    packets: AtomicU64,
    last_info: Mutex<(Instant, u64)>,
}

/// Writes records from a source into a recording file
pub struct Recorder<T> {
    name: String,
    config: RecorderConfig,
    recording: Arc<RecordingFile<T>>,
    stats: Arc<RecorderStats>,
    worker: Option<JoinHandle<()>>,
}

impl<T: RecordLayout> Recorder<T> {
    /// Create a recorder and its output file
    pub fn new(name: impl Into<String>, config: RecorderConfig) -> Result<Self> {
        let name = name.into();

        if config.output_file.exists() {
            std::fs::remove_file(&config.output_file)?;
            info!(name = %name, path = %config.output_file.display(), "Removed existing output file");
        }

        let recording = RecordingFile::create(&config.output_file, config.max_records)?;

        Ok(Self {
            name,
            config,
            recording: Arc::new(recording),
            stats: Arc::new(RecorderStats {
                packets: AtomicU64::new(0),
                last_info: Mutex::new((Instant::now(), 0)),
            }),
            worker: None,
        })
    }

    /// Start draining `source` until `token` is cancelled
    pub fn start(&mut self, source: Arc<dyn RecordSource<T>>, token: RunToken) -> Result<()> {
        if self.worker.is_some() {
            return Err(RecordingError::AlreadyRunning);
        }

        *self.stats.last_info.lock() = (Instant::now(), self.stats.packets.load(Ordering::Relaxed));

        let writer = Writer {
            name: self.name.clone(),
            recording: self.recording.clone(),
            source,
            stats: self.stats.clone(),
            token,
            pop_timeout: Duration::from_millis(self.config.pop_timeout_ms),
            flush_every: self.config.flush_every,
        };

        debug!(name = %self.name, "Starting recorder thread");
        let handle = thread::Builder::new()
            .name(format!("rec-{}", self.name))
            .spawn(move || writer.run())?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Wait for the worker to finish; cancel the run token first
    pub fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "Recorder thread panicked");
            }
        }
    }

    /// Whether the worker thread is running
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Counter snapshot; throughput covers the time since the previous call
    pub fn info(&self) -> RecorderInfo {
        let packets = self.stats.packets.load(Ordering::Relaxed);
        let now = Instant::now();

        let mut last = self.stats.last_info.lock();
        let elapsed = now.duration_since(last.0).as_secs_f64();
        let throughput = if elapsed > 0.0 {
            (packets - last.1) as f64 / elapsed
        } else {
            0.0
        };
        *last = (now, packets);

        RecorderInfo {
            packets_processed: packets,
            throughput,
        }
    }

    /// The recording being written
    pub fn recording(&self) -> Arc<RecordingFile<T>> {
        self.recording.clone()
    }
}

/// State moved into the recorder thread
struct Writer<T> {
    name: String,
    recording: Arc<RecordingFile<T>>,
    source: Arc<dyn RecordSource<T>>,
    stats: Arc<RecorderStats>,
    token: RunToken,
    pop_timeout: Duration,
    flush_every: u64,
}

impl<T: RecordLayout> Writer<T> {
    fn run(self) {
        info!(name = %self.name, path = %self.recording.path().display(), "Recording started");

        while self.token.is_running() {
            let Some(record) = self.source.pop(self.pop_timeout) else {
                continue;
            };

            match self.recording.append(&record) {
                Ok(index) => {
                    self.stats.packets.fetch_add(1, Ordering::Relaxed);
                    if self.flush_every > 0 && (index + 1) % self.flush_every == 0 {
                        if let Err(e) = self.recording.flush() {
                            warn!(name = %self.name, error = %e, "Failed to flush recording");
                        }
                    }
                }
                Err(RecordingError::Full) => {
                    warn!(name = %self.name, "Recording is full, stopping");
                    break;
                }
                Err(e) => {
                    warn!(name = %self.name, error = %e, "Failed to append record, stopping");
                    break;
                }
            }
        }

        if let Err(e) = self.recording.flush() {
            warn!(name = %self.name, error = %e, "Failed to flush recording");
        }

        info!(
            name = %self.name,
            packets = self.stats.packets.load(Ordering::Relaxed),
            "Recording finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::circular::CircularBuffer;
    use crate::memory::record::Superchunk;
    use tempfile::tempdir;

    fn config(path: PathBuf, max_records: u64) -> RecorderConfig {
        RecorderConfig {
            output_file: path,
            max_records,
            pop_timeout_ms: 5,
            flush_every: 4,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("existing.dat");
        std::fs::write(&path, b"stale").unwrap();

        let recorder = Recorder::<Superchunk>::new("test", config(path.clone(), 8)).unwrap();
        assert!(recorder.recording().is_empty());
        assert!(RecordingFile::<Superchunk>::open(&path).is_ok());
    }

    #[test]
    fn test_drains_buffer() {
        let dir = tempdir().unwrap();
        let buffer: Arc<CircularBuffer<Superchunk>> = Arc::new(CircularBuffer::new(16));
        let mut recorder = Recorder::new("test", config(dir.path().join("drain.dat"), 64)).unwrap();

        let token = RunToken::new();
        recorder.start(buffer.clone(), token.clone()).unwrap();

        for i in 0..10u64 {
            assert!(buffer.push(Superchunk::new(i * 300)));
        }
        wait_for(|| recorder.recording().len() == 10);

        token.cancel();
        recorder.stop();
        assert!(!recorder.is_running());

        let recording = recorder.recording();
        assert_eq!(recording.len(), 10);
        for i in 0..10u64 {
            assert_eq!(recording.read_at(i).unwrap().unwrap().first_timestamp, i * 300);
        }
        assert_eq!(recorder.info().packets_processed, 10);
    }

    #[test]
    fn test_start_twice() {
        let dir = tempdir().unwrap();
        let buffer: Arc<CircularBuffer<Superchunk>> = Arc::new(CircularBuffer::new(16));
        let mut recorder = Recorder::new("test", config(dir.path().join("twice.dat"), 8)).unwrap();

        let token = RunToken::new();
        recorder.start(buffer.clone(), token.clone()).unwrap();
        assert!(matches!(
            recorder.start(buffer.clone(), token.clone()),
            Err(RecordingError::AlreadyRunning)
        ));

        // A stopped recorder can be started again
        token.cancel();
        recorder.stop();
        let token = RunToken::new();
        recorder.start(buffer.clone(), token.clone()).unwrap();
        buffer.push(Superchunk::new(0));
        wait_for(|| recorder.recording().len() == 1);

        token.cancel();
        recorder.stop();
        assert_eq!(recorder.recording().len(), 1);
    }

    #[test]
    fn test_stops_when_full() {
        let dir = tempdir().unwrap();
        let buffer: Arc<CircularBuffer<Superchunk>> = Arc::new(CircularBuffer::new(16));
        let mut recorder = Recorder::new("test", config(dir.path().join("full.dat"), 3)).unwrap();

        for i in 0..5u64 {
            buffer.push(Superchunk::new(i * 300));
        }

        let token = RunToken::new();
        recorder.start(buffer.clone(), token.clone()).unwrap();
        wait_for(|| !recorder.is_running());

        // The worker exits on its own; the token is still set
        assert!(token.is_running());
        recorder.stop();
        assert_eq!(recorder.recording().len(), 3);
    }

    #[test]
    fn test_config_from_json() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{"output_file": "/tmp/out.dat", "max_records": 10}"#).unwrap();
        assert_eq!(config.output_file, PathBuf::from("/tmp/out.dat"));
        assert_eq!(config.max_records, 10);
        assert_eq!(config.pop_timeout_ms, 100);
    }
}
