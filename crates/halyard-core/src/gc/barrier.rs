//! SATB remembered set
//!
//! While concurrent marking is active, every reference store logs the value it
//! overwrites (snapshot-at-the-beginning). Mutators append to a private
//! [`SatbBuffer`]; a full buffer spills into the global [`RememberedSet`],
//! which the marker drains periodically and completely at Remark.
//!
//! # Design
//!
//! - **Enqueue (write barrier fast path)**: push onto an unshared `Vec`
//! - **Spill**: one lock acquisition per `buffer_size` entries
//! - **Drain**: the marker swaps the global buffer out under the lock

use crate::heap::ObjectRef;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One logged pre-write value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierRecord {
    /// The reference that was overwritten
    pub value: ObjectRef,
    /// Whether the overwritten reference pointed outside the holder's region
    pub cross_region: bool,
}

/// Per-mutator SATB buffer
#[derive(Debug)]
pub struct SatbBuffer {
    entries: Vec<BarrierRecord>,
    capacity: usize,
}

impl SatbBuffer {
    /// Create a buffer that spills after `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Log an overwritten value, spilling into `global` when full
    #[inline]
    pub fn enqueue(&mut self, record: BarrierRecord, global: &RememberedSet) {
        self.entries.push(record);
        if self.entries.len() >= self.capacity {
            global.spill(&mut self.entries);
        }
    }

    /// Move all buffered entries into `global`
    pub fn flush(&mut self, global: &RememberedSet) {
        if !self.entries.is_empty() {
            global.spill(&mut self.entries);
        }
    }

    /// Discard buffered entries (marking was aborted)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of buffered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Global SATB queue shared by all mutators
pub struct RememberedSet {
    buffer: Mutex<Vec<BarrierRecord>>,
    enqueued: AtomicUsize,
    cross_region: AtomicUsize,
}

impl RememberedSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            enqueued: AtomicUsize::new(0),
            cross_region: AtomicUsize::new(0),
        }
    }

    /// Append a batch of entries, leaving `entries` empty
    pub fn spill(&self, entries: &mut Vec<BarrierRecord>) {
        let crossing = entries.iter().filter(|r| r.cross_region).count();
        self.enqueued.fetch_add(entries.len(), Ordering::Relaxed);
        self.cross_region.fetch_add(crossing, Ordering::Relaxed);
        log::trace!("satb spill: {} entries ({} cross-region)", entries.len(), crossing);
        self.buffer.lock().append(entries);
    }

    /// Take every queued entry
    pub fn drain(&self) -> Vec<BarrierRecord> {
        std::mem::take(&mut *self.buffer.lock())
    }

    /// Drop every queued entry
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries ever spilled, and how many of them were cross-region
    pub fn totals(&self) -> (usize, usize) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.cross_region.load(Ordering::Relaxed),
        )
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::RegionId;

    fn record(slot: u32, cross_region: bool) -> BarrierRecord {
        BarrierRecord {
            value: ObjectRef::new(RegionId(1), slot),
            cross_region,
        }
    }

    #[test]
    fn test_buffer_spills_when_full() {
        let global = RememberedSet::new();
        let mut buffer = SatbBuffer::new(3);

        buffer.enqueue(record(0, false), &global);
        buffer.enqueue(record(1, true), &global);
        assert_eq!(global.len(), 0);
        buffer.enqueue(record(2, false), &global);
        assert!(buffer.is_empty());
        assert_eq!(global.len(), 3);
        assert_eq!(global.totals(), (3, 1));
    }

    #[test]
    fn test_flush_and_drain() {
        let global = RememberedSet::new();
        let mut buffer = SatbBuffer::new(16);
        buffer.enqueue(record(7, false), &global);
        buffer.flush(&global);

        let drained = global.drain();
        assert_eq!(drained, vec![record(7, false)]);
        assert!(global.is_empty());
    }
}
