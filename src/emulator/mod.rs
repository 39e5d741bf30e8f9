//! Synthetic readout source for exercising the buffer without hardware
//!
//! The emulator replays a set of template records into a `RecordSink`, rewriting
//! their timestamps so the stream looks continuous. It can:
//!
//! - Hold a configured rate in kHz
//! - Drop records at random, leaving timestamp gaps behind as a real link would
//! - Flag frames with random error words
//!
//! Random populations are drawn once at start and then cycled, so a run with a
//! fixed seed produces the same dropout and error pattern every time.

mod rate_limiter;

pub use rate_limiter::RateLimiter;

use crate::disk::cursor::RecordingCursor;
use crate::disk::recording::RecordingFile;
use crate::disk::{RecordLayout, RecordingError};
use crate::memory::record::{Readout, Superchunk};
use crate::memory::RecordSink;
use crate::run::RunToken;
use once_cell::sync::OnceCell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Emulator error types
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// No template records to replay
    #[error("emulator has no template records")]
    NoTemplates,
    /// `set_sink` was called twice
    #[error("emulator sink is already set")]
    SinkAlreadySet,
    /// `start` was called before `set_sink`
    #[error("emulator has no sink")]
    NoSink,
    /// `start` was called while the producer thread runs
    #[error("emulator is already running")]
    AlreadyRunning,
    /// The producer thread could not be spawned
    #[error("failed to spawn producer thread: {0}")]
    Spawn(#[from] io::Error),
    /// Templates could not be loaded from a recording
    #[error("failed to load templates: {0}")]
    Source(#[from] RecordingError),
}

/// Record types the emulator can rewrite
pub trait Emulated: Readout {
    /// Restamp the record so its first frame is at `first_timestamp`
    fn fake_timestamps(&mut self, first_timestamp: u64);

    /// Overwrite the per-frame error words
    fn fake_frame_errors(&mut self, errors: &[u16]);
}

impl Emulated for Superchunk {
    fn fake_timestamps(&mut self, first_timestamp: u64) {
        self.first_timestamp = first_timestamp;
    }

    fn fake_frame_errors(&mut self, errors: &[u16]) {
        for (word, error) in self.frame_errors.iter_mut().zip(errors) {
            *word = *error;
        }
    }
}

/// Configuration for the source emulator
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Target production rate in kHz, zero for unlimited
    pub rate_khz: f64,
    /// Probability that a record is dropped
    pub dropout_rate: f64,
    /// Probability that a frame carries an error word
    pub frame_error_rate: f64,
    /// Tick spacing between frames, defaults to the record type's own
    pub time_tick_diff: Option<u64>,
    /// First timestamp of the run, defaults to the first template's
    pub set_t0_to: Option<u64>,
    /// Size of the cycled dropout and error populations
    pub random_population_size: usize,
    /// Seed for the random populations, random when unset
    pub seed: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            rate_khz: 166.0,
            dropout_rate: 0.0,
            frame_error_rate: 0.0,
            time_tick_diff: None,
            set_t0_to: None,
            random_population_size: 10_000,
            seed: None,
        }
    }
}

/// Snapshot of emulator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatorInfo {
    /// Records produced since start
    pub packets: u64,
    /// Records produced since the previous info call
    pub new_packets: u64,
    /// Records the sink refused
    pub rejected: u64,
}

#[derive(Default)]
struct EmulatorStats {
    packets: AtomicU64,
    new_packets: AtomicU64,
    rejected: AtomicU64,
}

/// Cycled population of error words
pub struct ErrorBitGenerator {
    population: Vec<u16>,
    position: usize,
}

impl ErrorBitGenerator {
    /// Draw `size` error words, each non-zero with probability `rate`
    pub fn new<R: Rng>(rate: f64, size: usize, rng: &mut R) -> Self {
        let population = if rate <= 0.0 {
            vec![0]
        } else {
            (0..size.max(1))
                .map(|_| {
                    if rng.gen::<f64>() < rate {
                        1u16 << rng.gen_range(0..16)
                    } else {
                        0
                    }
                })
                .collect()
        };

        Self {
            population,
            position: 0,
        }
    }

    /// Next error word in the population
    pub fn next_word(&mut self) -> u16 {
        let word = self.population[self.position];
        self.position = (self.position + 1) % self.population.len();
        word
    }
}

/// Emulated readout source
pub struct SourceEmulator<T> {
    name: String,
    config: EmulatorConfig,
    templates: Arc<Vec<T>>,
    sink: OnceCell<Arc<dyn RecordSink<T>>>,
    stats: Arc<EmulatorStats>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Emulated> SourceEmulator<T> {
    /// Create an emulator replaying `templates`
    pub fn new(name: impl Into<String>, config: EmulatorConfig, templates: Vec<T>) -> Result<Self, EmulatorError> {
        if templates.is_empty() {
            return Err(EmulatorError::NoTemplates);
        }

        Ok(Self {
            name: name.into(),
            config,
            templates: Arc::new(templates),
            sink: OnceCell::new(),
            stats: Arc::new(EmulatorStats::default()),
            worker: None,
        })
    }

    /// Create an emulator replaying up to `limit` records read from a recording
    pub fn from_recording<P: AsRef<Path>>(
        name: impl Into<String>,
        config: EmulatorConfig,
        path: P,
        limit: usize,
    ) -> Result<Self, EmulatorError>
    where
        T: RecordLayout,
    {
        let recording = Arc::new(RecordingFile::<T>::open(path)?);
        let templates = RecordingCursor::new(recording, None).read_batch(limit)?;
        Self::new(name, config, templates)
    }

    /// Connect the emulator to the sink it produces into; only the first call succeeds
    pub fn set_sink(&self, sink: Arc<dyn RecordSink<T>>) -> Result<(), EmulatorError> {
        self.sink.set(sink).map_err(|_| EmulatorError::SinkAlreadySet)
    }

    /// Start the producer thread, which runs until `token` is cancelled
    pub fn start(&mut self, token: RunToken) -> Result<(), EmulatorError> {
        if self.worker.is_some() {
            return Err(EmulatorError::AlreadyRunning);
        }
        let sink = self.sink.get().cloned().ok_or(EmulatorError::NoSink)?;

        self.stats.packets.store(0, Ordering::Relaxed);
        self.stats.new_packets.store(0, Ordering::Relaxed);

        let producer = Producer {
            name: self.name.clone(),
            config: self.config.clone(),
            templates: self.templates.clone(),
            sink,
            stats: self.stats.clone(),
            token,
        };

        debug!(name = %self.name, "Starting producer thread");
        let handle = thread::Builder::new()
            .name(format!("emu-{}", self.name))
            .spawn(move || producer.run())?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Wait for the producer thread to finish; cancel the run token first
    pub fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "Producer thread panicked");
            }
        }
    }

    /// Whether the producer thread is running
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Counter snapshot; resets `new_packets`
    pub fn info(&self) -> EmulatorInfo {
        EmulatorInfo {
            packets: self.stats.packets.load(Ordering::Relaxed),
            new_packets: self.stats.new_packets.swap(0, Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}

/// State moved into the producer thread
struct Producer<T> {
    name: String,
    config: EmulatorConfig,
    templates: Arc<Vec<T>>,
    sink: Arc<dyn RecordSink<T>>,
    stats: Arc<EmulatorStats>,
    token: RunToken,
}

impl<T: Emulated> Producer<T> {
    fn run(self) {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let population = self.config.random_population_size.max(1);
        let dropouts: Vec<bool> = if self.config.dropout_rate <= 0.0 {
            vec![true]
        } else {
            (0..population)
                .map(|_| rng.gen::<f64>() >= self.config.dropout_rate)
                .collect()
        };
        let mut error_bits = ErrorBitGenerator::new(self.config.frame_error_rate, population, &mut rng);
        let mut limiter = RateLimiter::new(self.config.rate_khz);

        let tick = self.config.time_tick_diff.unwrap_or(T::EXPECTED_TICK_DIFFERENCE);
        let mut timestamp = self
            .config
            .set_t0_to
            .unwrap_or_else(|| self.templates[0].first_timestamp());

        info!(name = %self.name, first_timestamp = timestamp, "Data generation started");

        let mut offset = 0;
        let mut dropout_index = 0;
        let mut frame_errors = Vec::new();

        while self.token.is_running() {
            let template = &self.templates[offset];
            let step = tick * u64::from(template.frame_count());

            let create = dropouts[dropout_index];
            dropout_index = (dropout_index + 1) % dropouts.len();

            if create {
                let mut payload = *template;
                payload.fake_timestamps(timestamp);

                frame_errors.clear();
                frame_errors.extend((0..payload.frame_count()).map(|_| error_bits.next_word()));
                payload.fake_frame_errors(&frame_errors);

                if self.sink.push(payload) {
                    self.stats.packets.fetch_add(1, Ordering::Relaxed);
                    self.stats.new_packets.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }

                offset = (offset + 1) % self.templates.len();
            }

            timestamp += step;
            limiter.limit();
        }

        info!(
            name = %self.name,
            packets = self.stats.packets.load(Ordering::Relaxed),
            "Data generation finished"
        );
    }
}
