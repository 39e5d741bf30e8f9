//! Fixed-capacity circular buffer for readout records
//!
//! This module implements the bounded buffer that sits between a readout producer
//! and its consumers. Key features include:
//!
//! - Lock-free push and pop using two cache-padded atomic indices
//! - Drop-oldest overflow handling so the producer never waits on a slow consumer
//! - Optional blocking pop with a timeout, backed by a condition variable
//! - Restartable cursors over the occupied window that never move the indices
//!
//! # Index discipline
//!
//! Both indices are positions in the stream of pushed records: they only grow
//! and are reduced to a slot on access. `read_index == write_index` means empty
//! and `write_index - read_index <= capacity` holds at all times. The storage
//! holds `capacity + 1` slots, so the slot under `write_index` is never part of
//! the live window. Only the producer stores `write_index`. `read_index` is
//! advanced with compare-exchange both by consumers and by the producer when it
//! evicts the oldest record, so a pop and an eviction never claim the same record,
//! and a stale position can never match again after the array has wrapped.
//!
//! Index reads used for occupancy, cursors and searches are relaxed or acquire
//! snapshots; a result may already be stale when it is returned. Publications of
//! `write_index` use release ordering so a consumer that observes the new index
//! also observes the written slot.

use crate::memory::record::Readout;
use crate::memory::{AtomicIndex, RecordSink, RecordSource, Slot};
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// What `push` does when the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest record to admit the new one
    #[default]
    DropOldest,
    /// Refuse the new record and report failure
    Reject,
}

/// Counters describing the traffic through a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Records admitted by `push`
    pub pushed: u64,
    /// Records handed out by `pop`/`try_pop`
    pub popped: u64,
    /// Records evicted under the drop-oldest policy
    pub overwritten: u64,
    /// Records refused under the reject policy
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    popped: AtomicU64,
    overwritten: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of the occupied part of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Position of the oldest record
    pub start: u64,
    /// Number of occupied slots
    pub len: usize,
    slots: usize,
}

impl Window {
    /// Position `offset` records after the start of the window
    #[inline]
    pub fn position(&self, offset: usize) -> u64 {
        self.start + offset as u64
    }

    /// Slot index `offset` records after the start of the window
    #[inline]
    pub fn index(&self, offset: usize) -> usize {
        (self.position(offset) % self.slots as u64) as usize
    }

    /// Whether the window holds no records
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-capacity, single-producer circular buffer of readout records
pub struct CircularBuffer<T> {
    /// Record storage, one slot more than the capacity
    slots: Box<[Slot<T>]>,
    /// Maximum number of records held at once
    capacity: usize,
    /// Position of the oldest record
    read_index: AtomicIndex,
    /// Position the next record is written to
    write_index: AtomicIndex,
    /// Overflow handling chosen at construction
    policy: OverflowPolicy,
    /// Parks consumers blocked in `pop`
    consumer_signal: (Mutex<()>, Condvar),
    /// Number of consumers currently parked
    waiting_consumers: AtomicUsize,
    counters: Counters,
}

impl<T: Readout> CircularBuffer<T> {
    /// Create a drop-oldest buffer holding up to `capacity` records
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::DropOldest)
    }

    /// Create a buffer holding up to `capacity` records with the given overflow policy
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "Circular buffer capacity must be non-zero");

        let num_slots = capacity + 1;
        let slots: Vec<Slot<T>> = (0..num_slots).map(|_| Slot::new(T::default())).collect();

        debug!(capacity, ?policy, "Created circular buffer");

        Self {
            slots: slots.into_boxed_slice(),
            capacity,
            read_index: AtomicIndex::new(num_slots),
            write_index: AtomicIndex::new(num_slots),
            policy,
            consumer_signal: (Mutex::new(()), Condvar::new()),
            waiting_consumers: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Push a record at the write position
    ///
    /// Must only be called from the producer thread. Never blocks. Returns false
    /// only when the buffer is full under `OverflowPolicy::Reject`.
    pub fn push(&self, record: T) -> bool {
        let write = self.write_index.load(Ordering::Relaxed);

        let read = self.read_index.load(Ordering::Acquire);
        if write - read >= self.capacity as u64 {
            match self.policy {
                OverflowPolicy::Reject => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    // A consumer may have popped meanwhile, which frees the slot just as well
                    if self
                        .read_index
                        .compare_exchange(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        self.counters.overwritten.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        self.slots[self.write_index.slot(write)].write(record);
        self.write_index.store(write + 1, Ordering::Release);
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);

        self.notify_consumers();
        true
    }

    /// Pop the oldest record without waiting
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let read = self.read_index.load(Ordering::Acquire);
            if read == self.write_index.load(Ordering::Acquire) {
                return None;
            }

            let record = self.slots[self.read_index.slot(read)].read();

            // Losing the exchange means another consumer or an eviction took this position
            if self
                .read_index
                .compare_exchange(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.counters.popped.fetch_add(1, Ordering::Relaxed);
                return Some(record);
            }
        }
    }

    /// Pop the oldest record, waiting up to `timeout` for one to arrive
    ///
    /// Returns `None` when the timeout expires on an empty buffer. A timeout too
    /// large to be represented as a deadline waits until a record arrives.
    /// Callers that need to stop waiting check their run token between calls.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        if let Some(record) = self.try_pop() {
            return Some(record);
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = Instant::now().checked_add(timeout);
        let (lock, cvar) = &self.consumer_signal;
        let mut guard = lock.lock();

        self.waiting_consumers.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let record = loop {
            if let Some(record) = self.try_pop() {
                break Some(record);
            }
            match deadline {
                Some(deadline) => {
                    if cvar.wait_until(&mut guard, deadline).timed_out() {
                        break self.try_pop();
                    }
                }
                None => cvar.wait(&mut guard),
            }
        };

        self.waiting_consumers.fetch_sub(1, Ordering::SeqCst);
        record
    }

    /// Wake consumers parked in `pop`, if any
    fn notify_consumers(&self) {
        fence(Ordering::SeqCst);
        if self.waiting_consumers.load(Ordering::Relaxed) > 0 {
            let (lock, cvar) = &self.consumer_signal;
            let _guard = lock.lock();
            cvar.notify_all();
        }
    }

    /// Snapshot of the oldest record without removing it
    pub fn front(&self) -> Option<T> {
        loop {
            let read = self.read_index.load(Ordering::Acquire);
            if read == self.write_index.load(Ordering::Acquire) {
                return None;
            }
            let record = self.slots[self.read_index.slot(read)].read();
            if self.read_index.load(Ordering::Acquire) == read {
                return Some(record);
            }
        }
    }

    /// Snapshot of the newest record
    pub fn back(&self) -> Option<T> {
        let write = self.write_index.load(Ordering::Acquire);
        self.read_valid(write.checked_sub(1)?)
    }

    /// Discard every buffered record, returning how many were dropped
    ///
    /// This is a consumer-side operation; records pushed concurrently may survive.
    pub fn clear(&self) -> usize {
        loop {
            let read = self.read_index.load(Ordering::Acquire);
            let write = self.write_index.load(Ordering::Acquire);
            if self
                .read_index
                .compare_exchange(read, write, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return (write - read) as usize;
            }
        }
    }

    /// Estimated number of buffered records
    ///
    /// Both positions are read relaxed, so the value may be stale by the time the
    /// caller uses it.
    pub fn occupancy(&self) -> usize {
        self.window().len
    }

    /// Snapshot of the occupied window
    pub fn window(&self) -> Window {
        let start = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Relaxed);
        Window {
            start,
            // Relaxed loads may see the read position ahead of a stale write position
            len: write.saturating_sub(start).min(self.capacity as u64) as usize,
            slots: self.slots.len(),
        }
    }

    /// Maximum number of records held at once
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer currently holds no records
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    /// Whether the next push overflows
    pub fn is_full(&self) -> bool {
        self.occupancy() == self.capacity
    }

    /// Overflow policy chosen at construction
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Traffic counters
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            popped: self.counters.popped.load(Ordering::Relaxed),
            overwritten: self.counters.overwritten.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Cursor at the oldest record, or `end()` when empty
    pub fn begin(&self) -> Cursor<'_, T> {
        self.at_position(self.read_index.load(Ordering::Acquire))
    }

    /// The past-the-end sentinel
    pub fn end(&self) -> Cursor<'_, T> {
        Cursor {
            buffer: self,
            position: None,
        }
    }

    /// Cursor at slot `index`, or `end()` if that slot is not occupied
    pub fn at(&self, index: usize) -> Cursor<'_, T> {
        if index >= self.slots.len() {
            return self.end();
        }
        let read = self.read_index.load(Ordering::Acquire);
        let offset = (index + self.slots.len() - self.read_index.slot(read)) % self.slots.len();
        self.at_position(read + offset as u64)
    }

    /// Cursor at `position`, or `end()` if it is not inside the live window
    pub(crate) fn at_position(&self, position: u64) -> Cursor<'_, T> {
        Cursor {
            buffer: self,
            position: self.contains(position).then_some(position),
        }
    }

    /// Copy a record straight out of its slot, without checking occupancy
    #[inline]
    pub(crate) fn read_slot(&self, index: usize) -> T {
        self.slots[index].read()
    }

    /// Copy the record at `position` if it is inside the live window before and after the copy
    fn read_valid(&self, position: u64) -> Option<T> {
        if !self.contains(position) {
            return None;
        }
        let record = self.slots[self.read_index.slot(position)].read();
        self.contains(position).then_some(record)
    }

    /// Whether `position` currently lies in `[read_index, write_index)`
    fn contains(&self, position: u64) -> bool {
        let read = self.read_index.load(Ordering::Acquire);
        let write = self.write_index.load(Ordering::Acquire);
        read <= position && position < write
    }
}

impl<T: Readout> RecordSink<T> for CircularBuffer<T> {
    fn push(&self, record: T) -> bool {
        CircularBuffer::push(self, record)
    }
}

impl<T: Readout> RecordSource<T> for CircularBuffer<T> {
    fn pop(&self, timeout: Duration) -> Option<T> {
        CircularBuffer::pop(self, timeout)
    }
}

/// Forward-only view over the occupied slots of a buffer
///
/// A cursor holds a position, never a reference into storage. `get` copies the
/// record out and re-checks that the position is still live, so a cursor
/// overtaken by the producer yields `None` instead of a mismatched record. Clone
/// a cursor to restart iteration from the same position.
pub struct Cursor<'a, T> {
    buffer: &'a CircularBuffer<T>,
    position: Option<u64>,
}

impl<'a, T: Readout> Cursor<'a, T> {
    /// Slot index, or `None` for the end sentinel
    pub fn index(&self) -> Option<usize> {
        self.position.map(|position| self.buffer.read_index.slot(position))
    }

    /// Position in the stream of pushed records, or `None` for the end sentinel
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// Whether this is the end sentinel
    pub fn is_end(&self) -> bool {
        self.position.is_none()
    }

    /// Copy of the record under the cursor, if it is still buffered
    pub fn get(&self) -> Option<T> {
        self.buffer.read_valid(self.position?)
    }

    /// Step to the next occupied slot, becoming `end()` past the newest record
    pub fn advance(&mut self) {
        if let Some(position) = self.position {
            let next = position + 1;
            self.position = self.buffer.contains(next).then_some(next);
        }
    }
}

impl<T> Clone for Cursor<'_, T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer,
            position: self.position,
        }
    }
}

impl<T> PartialEq for Cursor<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.buffer, other.buffer) && self.position == other.position
    }
}

impl<T> fmt::Debug for Cursor<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor").field("position", &self.position).finish()
    }
}

impl<T: Readout> Iterator for Cursor<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.get() {
            Some(record) => {
                self.advance();
                Some(record)
            }
            None => {
                self.position = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::record::Superchunk;
    use std::sync::Arc;
    use std::thread;

    fn timestamps(buffer: &CircularBuffer<Superchunk>) -> Vec<u64> {
        buffer.begin().map(|chunk| chunk.first_timestamp).collect()
    }

    #[test]
    fn test_push_pop_fifo() {
        let buffer = CircularBuffer::new(16);

        for ts in 0..10 {
            assert!(buffer.push(Superchunk::new(ts)));
        }
        assert_eq!(buffer.occupancy(), 10);

        for ts in 0..10 {
            assert_eq!(buffer.try_pop().map(|c| c.first_timestamp), Some(ts));
        }
        assert!(buffer.try_pop().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drop_oldest() {
        let buffer = CircularBuffer::new(4);

        for ts in 0..7 {
            assert!(buffer.push(Superchunk::new(ts)));
            assert!(buffer.occupancy() <= buffer.capacity());
        }

        assert!(buffer.is_full());
        assert_eq!(timestamps(&buffer), vec![3, 4, 5, 6]);

        let stats = buffer.stats();
        assert_eq!(stats.pushed, 7);
        assert_eq!(stats.overwritten, 3);
    }

    #[test]
    fn test_reject_policy() {
        let buffer = CircularBuffer::with_policy(3, OverflowPolicy::Reject);

        for ts in 0..3 {
            assert!(buffer.push(Superchunk::new(ts)));
        }
        assert!(!buffer.push(Superchunk::new(99)));
        assert_eq!(timestamps(&buffer), vec![0, 1, 2]);
        assert_eq!(buffer.stats().rejected, 1);

        buffer.try_pop();
        assert!(buffer.push(Superchunk::new(3)));
        assert_eq!(timestamps(&buffer), vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_capacity_panics() {
        let _ = CircularBuffer::<Superchunk>::new(0);
    }

    #[test]
    fn test_cursor_wraps() {
        let buffer = CircularBuffer::new(5);

        // Move the window across the end of the slot array
        for ts in 0..4 {
            buffer.push(Superchunk::new(ts));
        }
        for _ in 0..3 {
            buffer.try_pop();
        }
        for ts in 4..8 {
            buffer.push(Superchunk::new(ts));
        }

        assert_eq!(timestamps(&buffer), vec![3, 4, 5, 6, 7]);

        // Cursors are restartable
        let start = buffer.begin();
        let first: Vec<_> = start.clone().map(|c| c.first_timestamp).collect();
        let second: Vec<_> = start.map(|c| c.first_timestamp).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cursor_end() {
        let buffer = CircularBuffer::<Superchunk>::new(4);
        assert!(buffer.begin().is_end());
        assert_eq!(buffer.begin(), buffer.end());

        buffer.push(Superchunk::new(1));
        let mut cursor = buffer.begin();
        assert_eq!(cursor.get().map(|c| c.first_timestamp), Some(1));
        cursor.advance();
        assert!(cursor.is_end());
        assert!(cursor.get().is_none());

        // Slots outside the occupied window are end positions
        assert!(buffer.at(3).is_end());
        assert!(buffer.at(100).is_end());
    }

    #[test]
    fn test_cursor_invalidated_by_eviction() {
        let buffer = CircularBuffer::new(3);
        for ts in 0..3 {
            buffer.push(Superchunk::new(ts));
        }

        let cursor = buffer.begin();
        buffer.push(Superchunk::new(3));
        assert!(cursor.get().is_none());
    }

    #[test]
    fn test_front_back_clear() {
        let buffer = CircularBuffer::new(8);
        assert!(buffer.front().is_none());
        assert!(buffer.back().is_none());

        for ts in 10..15 {
            buffer.push(Superchunk::new(ts));
        }
        assert_eq!(buffer.front().map(|c| c.first_timestamp), Some(10));
        assert_eq!(buffer.back().map(|c| c.first_timestamp), Some(14));

        assert_eq!(buffer.clear(), 5);
        assert!(buffer.is_empty());
        assert!(buffer.begin().is_end());
    }

    #[test]
    fn test_pop_timeout() {
        let buffer = CircularBuffer::<Superchunk>::new(4);

        let started = Instant::now();
        assert!(buffer.pop(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let buffer = Arc::new(CircularBuffer::new(4));
        let consumer = buffer.clone();

        let handle = thread::spawn(move || consumer.pop(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        buffer.push(Superchunk::new(7));

        let record = handle.join().unwrap();
        assert_eq!(record.map(|c| c.first_timestamp), Some(7));
    }

    #[test]
    fn test_pop_without_deadline() {
        let buffer = Arc::new(CircularBuffer::<Superchunk>::new(4));
        let consumer = buffer.clone();

        // Too far in the future to be a deadline: waits for the next push
        let handle = thread::spawn(move || consumer.pop(Duration::MAX));

        thread::sleep(Duration::from_millis(50));
        buffer.push(Superchunk::new(11));

        let record = handle.join().unwrap();
        assert_eq!(record.map(|c| c.first_timestamp), Some(11));
    }

    #[test]
    fn test_pop_huge_timeout_returns_buffered() {
        let buffer = CircularBuffer::new(4);
        buffer.push(Superchunk::new(5));
        assert_eq!(buffer.pop(Duration::MAX).map(|c| c.first_timestamp), Some(5));
    }

    #[test]
    fn test_stale_cursor_after_full_lap() {
        let buffer = CircularBuffer::new(3);
        buffer.push(Superchunk::new(0));
        let cursor = buffer.begin();
        let slot = cursor.index();

        // The fourth push after it reuses the cursor's slot for a newer record
        for ts in 1..=4 {
            buffer.push(Superchunk::new(ts));
        }
        assert_eq!(buffer.begin().index(), Some(2));
        assert_eq!(buffer.at(slot.unwrap()).get().map(|c| c.first_timestamp), Some(4));
        assert!(cursor.get().is_none());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        const RECORDS: u64 = 50_000;

        let buffer = Arc::new(CircularBuffer::with_policy(64, OverflowPolicy::Reject));
        let producer = buffer.clone();

        let handle = thread::spawn(move || {
            let mut ts = 0;
            while ts < RECORDS {
                if producer.push(Superchunk::new(ts)) {
                    ts += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < RECORDS {
            if let Some(chunk) = buffer.pop(Duration::from_millis(100)) {
                assert_eq!(chunk.first_timestamp, expected);
                expected += 1;
            }
        }

        handle.join().unwrap();
        assert!(buffer.is_empty());
    }
}
