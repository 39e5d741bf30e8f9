//! Basic usage example for the readout buffer
//!
//! This example demonstrates:
//! 1. Building a searchable buffer from configuration
//! 2. Feeding it from an emulated readout link with dropouts and frame errors
//! 3. Draining it into a recording with a recorder thread
//! 4. Looking up live records by timestamp with both search strategies
//! 5. Reading the recording back and seeking it by timestamp
//!
//! The recording is written to a temporary file which is removed at the end.

use readout_buffer::{
    BinarySearch, BufferConfig, CircularBuffer, EmulatorConfig, FixedRate, LowerBound, Readout, Recorder, RecorderConfig,
    RecordingCursor, RunToken, SearchableBuffer, SourceEmulator, Superchunk,
};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    // Buffer settings usually come from a configuration file
    let config: BufferConfig =
        serde_json::from_str(r#"{"capacity": 4096, "overflow_policy": "drop_oldest", "search": "binary"}"#)
            .expect("valid buffer config");
    let buffer = Arc::new(SearchableBuffer::<Superchunk>::from_config(&config));
    let live: &CircularBuffer<Superchunk> = &buffer;
    println!("Buffer holds up to {} superchunks", buffer.capacity());

    // Emulated link: 50 kHz, one record in a thousand lost, a few frames flagged
    let emulator_config = EmulatorConfig {
        rate_khz: 50.0,
        dropout_rate: 0.001,
        frame_error_rate: 0.0005,
        set_t0_to: Some(1_000_000),
        seed: Some(42),
        ..EmulatorConfig::default()
    };
    let templates: Vec<Superchunk> = (0..16u8)
        .map(|i| {
            let mut chunk = Superchunk::new(0);
            chunk.payload = [i; Superchunk::PAYLOAD_SIZE];
            chunk
        })
        .collect();
    let mut emulator = SourceEmulator::new("link0", emulator_config, templates).expect("emulator");
    emulator.set_sink(buffer.clone()).expect("sink");

    let recording_path = std::env::temp_dir().join("readout_buffer_example.dat");
    println!("Recording to {:?}", recording_path);
    let mut recorder = Recorder::<Superchunk>::new(
        "link0",
        RecorderConfig {
            output_file: recording_path.clone(),
            max_records: 1_000_000,
            ..RecorderConfig::default()
        },
    )
    .expect("recorder");

    // Recorder drains a second buffer so the first one keeps a searchable history
    let archive = Arc::new(SearchableBuffer::<Superchunk>::from_config(&config));
    let token = RunToken::new();

    recorder.start(archive.clone(), token.clone()).expect("start recorder");
    emulator.start(token.clone()).expect("start emulator");

    // Copy new records from the live buffer to the archive while looking some up
    let mut forwarded_up_to = 0;
    for round in 0..10 {
        thread::sleep(Duration::from_millis(50));

        for chunk in buffer.begin() {
            if chunk.first_timestamp() >= forwarded_up_to {
                archive.push(chunk);
                forwarded_up_to = chunk.end_timestamp();
            }
        }

        let (Some(oldest), Some(newest)) = (buffer.front(), buffer.back()) else {
            continue;
        };
        let target = oldest.first_timestamp() + (newest.end_timestamp() - oldest.first_timestamp()) / 2;

        let by_binary = BinarySearch.lower_bound(live, target, false).get();
        let by_arithmetic = FixedRate.lower_bound(live, target, false).get();
        println!(
            "Round {}: {} buffered, ts {} -> binary {:?}, fixed-rate {:?}",
            round,
            buffer.occupancy(),
            target,
            by_binary.map(|c| c.first_timestamp),
            by_arithmetic.map(|c| c.first_timestamp),
        );
    }

    token.cancel();
    emulator.stop();
    recorder.stop();

    let emulator_info = emulator.info();
    let recorder_info = recorder.info();
    let stats = buffer.stats();
    println!(
        "Emulated {} records, recorded {}, evicted {} from the live buffer",
        emulator_info.packets, recorder_info.packets_processed, stats.overwritten
    );

    // Read the recording back and jump into the middle of it
    let recording = recorder.recording();
    let mut cursor = RecordingCursor::new(recording.clone(), None);
    let first = cursor.read_batch(3).expect("read recording");
    for chunk in &first {
        println!(
            "Recorded chunk at {} with {} frames, errors: {}",
            chunk.first_timestamp,
            chunk.frame_count,
            chunk.has_errors()
        );
    }

    if let Some(first) = first.first() {
        let target = first.first_timestamp + 1_000 * Superchunk::TICK_DIFFERENCE;
        cursor.seek_to_timestamp(target).expect("seek");
        match cursor.next().expect("read recording") {
            Some(chunk) => println!("Timestamp {} is in the chunk starting at {}", target, chunk.first_timestamp),
            None => println!("Timestamp {} is past the end of the recording", target),
        }
    }

    let _ = std::fs::remove_file(&recording_path);
    println!("Example completed successfully!");
}
