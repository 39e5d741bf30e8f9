//! Memory-resident circular buffer for readout records
//!
//! This module provides the core data structures of the in-memory buffer:
//!
//! - The `Readout` record trait and the `Superchunk` record type
//! - AtomicIndex, a cache-padded position counter mapped onto the slot array
//! - Slot, a sequence-stamped cell that lets readers detect a concurrent overwrite
//! - The `RecordSink` / `RecordSource` seams used by producers and consumers
//!
//! Records are always copied in and out of the buffer. A reader never holds a
//! reference into storage the producer may overwrite; instead every slot read
//! is validated against the slot's sequence stamp and retried on conflict.

pub mod circular;
pub mod record;

use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Anything a producer can push records into
pub trait RecordSink<T>: Send + Sync {
    /// Push a record, returning false if it was not admitted
    fn push(&self, record: T) -> bool;
}

/// Anything a consumer can drain records from
pub trait RecordSource<T>: Send + Sync {
    /// Pop the oldest record, waiting up to `timeout` for one to arrive
    fn pop(&self, timeout: Duration) -> Option<T>;
}

/// A monotonically increasing position into the slot array
///
/// Positions count every record ever admitted and are never stored wrapped, so
/// a compare-exchange on a stale position always fails even after the slot
/// array has gone round a full lap. `slot` maps a position to its storage index.
pub(crate) struct AtomicIndex {
    /// The current position, cache-line padded to avoid false sharing
    value: CachePadded<AtomicU64>,
    /// Number of slots positions wrap at
    slots: u64,
}

impl AtomicIndex {
    /// Create a new index at position zero over `slots` slots
    pub fn new(slots: usize) -> Self {
        assert!(slots > 1, "An index needs at least two slots");
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
            slots: slots as u64,
        }
    }

    /// Load the current position with the specified ordering
    #[inline]
    pub fn load(&self, ordering: Ordering) -> u64 {
        self.value.load(ordering)
    }

    /// Store a new position with the specified ordering
    #[inline]
    pub fn store(&self, val: u64, ordering: Ordering) {
        self.value.store(val, ordering);
    }

    /// Compare and swap the position
    #[inline]
    pub fn compare_exchange(
        &self,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64> {
        self.value.compare_exchange(current, new, success, failure)
    }

    /// Storage index of `position`
    #[inline]
    pub fn slot(&self, position: u64) -> usize {
        (position % self.slots) as usize
    }
}

/// Storage cell for one record, guarded by a sequence stamp
///
/// The stamp is even while the slot is stable and odd while a write is in
/// progress. Readers copy the value optimistically and keep the copy only if
/// the stamp was even and unchanged across the copy.
pub(crate) struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<T>,
}

// SAFETY: all access to `value` goes through the sequence protocol below, which
// hands out copies only, never references.
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T: Copy> Slot<T> {
    /// Create a slot holding `value`
    pub fn new(value: T) -> Self {
        Self {
            seq: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Overwrite the slot
    ///
    /// Writers serialize on the stamp, so two writers racing for the same slot
    /// never interleave their stores.
    pub fn write(&self, value: T) {
        let backoff = Backoff::new();
        let mut seq = self.seq.load(Ordering::Relaxed);
        loop {
            if seq & 1 == 0 {
                match self.seq.compare_exchange_weak(
                    seq,
                    seq.wrapping_add(1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => seq = current,
                }
            } else {
                backoff.snooze();
                seq = self.seq.load(Ordering::Relaxed);
            }
        }

        fence(Ordering::Release);
        // SAFETY: the odd stamp gives this thread exclusive write access; readers
        // that overlap will see the stamp change and discard their copy.
        unsafe { ptr::write_volatile(self.value.get(), value) };
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Copy the slot contents, retrying until no write overlapped the copy
    pub fn read(&self) -> T {
        let backoff = Backoff::new();
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                // SAFETY: read as MaybeUninit so a torn copy is never interpreted
                // as a T; it is only assumed initialized once the stamp check passes.
                let copy = unsafe {
                    ptr::read_volatile(self.value.get() as *const MaybeUninit<T>)
                };
                fence(Ordering::Acquire);
                if self.seq.load(Ordering::Relaxed) == before {
                    // SAFETY: no write overlapped the copy, so it is a whole T.
                    return unsafe { copy.assume_init() };
                }
            }
            backoff.snooze();
        }
    }
}
