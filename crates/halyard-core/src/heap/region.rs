//! Heap regions
//!
//! A region is a fixed-size span of the heap and the unit of evacuation.
//! Objects are bump-allocated into a region in slot order and never span two
//! regions. Marking state (bitmap, live bytes, top-at-mark-start) is kept
//! beside the object storage so the marker never needs the region's write lock.

use super::object::{HeapObject, RegionId};
use crate::defaults::OBJECT_HEADER_BYTES;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Lifecycle state of a region
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionState {
    /// Free, in the free set
    Empty = 0,
    /// Holds allocated objects
    Regular = 1,
    /// Holds archive objects; pinned, never collected
    Archive = 2,
    /// Selected for evacuation in the current cycle
    Cset = 3,
    /// Evacuated or found to hold only garbage; about to be recycled
    Trash = 4,
}

impl RegionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RegionState::Regular,
            2 => RegionState::Archive,
            3 => RegionState::Cset,
            4 => RegionState::Trash,
            _ => RegionState::Empty,
        }
    }

    /// Short label used in heap dumps
    pub fn label(self) -> &'static str {
        match self {
            RegionState::Empty => "empty",
            RegionState::Regular => "regular",
            RegionState::Archive => "archive",
            RegionState::Cset => "cset",
            RegionState::Trash => "trash",
        }
    }
}

/// Age classification of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionAge {
    /// Has not survived a collection yet
    Young,
    /// Survived at least one collection
    Old,
}

/// Object storage of a region
#[derive(Debug, Default)]
pub struct Region {
    /// Objects in allocation order
    pub objects: Vec<HeapObject>,
    /// Bytes allocated
    pub used: usize,
}

impl Region {
    /// Reset to an empty region
    pub fn clear(&mut self) {
        self.objects = Vec::new();
        self.used = 0;
    }
}

/// One bit per possible object slot
pub struct MarkBitmap {
    words: Box<[AtomicU64]>,
}

impl MarkBitmap {
    /// Create a bitmap large enough for a region of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let bits = (capacity / OBJECT_HEADER_BYTES).max(1);
        let words = (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    /// Set the bit for `slot`, returning true if it was previously clear
    #[inline]
    pub fn mark(&self, slot: u32) -> bool {
        let (word, bit) = Self::locate(slot);
        match self.words.get(word) {
            Some(w) => w.fetch_or(bit, Ordering::AcqRel) & bit == 0,
            None => false,
        }
    }

    /// Check the bit for `slot`
    #[inline]
    pub fn is_marked(&self, slot: u32) -> bool {
        let (word, bit) = Self::locate(slot);
        self.words
            .get(word)
            .map(|w| w.load(Ordering::Acquire) & bit != 0)
            .unwrap_or(false)
    }

    /// Clear every bit
    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Number of marked slots
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    #[inline]
    fn locate(slot: u32) -> (usize, u64) {
        let slot = slot as usize;
        (slot / 64, 1u64 << (slot % 64))
    }
}

/// A heap region with its marking metadata
pub struct HeapRegion {
    id: RegionId,
    capacity: usize,
    state: AtomicU8,
    /// Object storage
    pub data: RwLock<Region>,
    /// Mark bitmap for the current cycle
    pub bitmap: MarkBitmap,
    live_bytes: AtomicUsize,
    tams_slot: AtomicU32,
    tams_bytes: AtomicUsize,
    survived: AtomicU32,
}

impl HeapRegion {
    /// Create an empty region
    pub fn new(id: RegionId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            state: AtomicU8::new(RegionState::Empty as u8),
            data: RwLock::new(Region::default()),
            bitmap: MarkBitmap::new(capacity),
            live_bytes: AtomicUsize::new(0),
            tams_slot: AtomicU32::new(0),
            tams_bytes: AtomicUsize::new(0),
            survived: AtomicU32::new(0),
        }
    }

    /// Region id
    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Change state
    #[inline]
    pub fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Check whether the region is in the current collection set
    #[inline]
    pub fn in_cset(&self) -> bool {
        self.state() == RegionState::Cset
    }

    /// Bytes allocated
    pub fn used(&self) -> usize {
        self.data.read().used
    }

    /// Try to bump-allocate an object, returning its slot
    pub fn try_allocate(&self, obj: HeapObject) -> Result<u32, HeapObject> {
        let mut data = self.data.write();
        if data.used + obj.size() > self.capacity {
            return Err(obj);
        }
        let slot = data.objects.len() as u32;
        data.used += obj.size();
        data.objects.push(obj);
        Ok(slot)
    }

    /// Live bytes recorded by the marker
    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Add to the live byte count
    #[inline]
    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Overwrite the live byte count
    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Release);
    }

    /// Garbage bytes according to the last mark
    pub fn garbage(&self) -> usize {
        self.used().saturating_sub(self.live_bytes())
    }

    /// Record the current top as top-at-mark-start and reset marking state
    pub fn capture_tams(&self) {
        let data = self.data.read();
        self.tams_slot
            .store(data.objects.len() as u32, Ordering::Release);
        self.tams_bytes.store(data.used, Ordering::Release);
        drop(data);
        self.bitmap.clear();
        self.live_bytes.store(0, Ordering::Release);
    }

    /// Drop marking state after a collection, recording `live` bytes
    pub fn reset_mark_state(&self, live: usize) {
        self.bitmap.clear();
        self.tams_slot.store(0, Ordering::Release);
        self.tams_bytes.store(0, Ordering::Release);
        self.live_bytes.store(live, Ordering::Release);
    }

    /// Slot index of top-at-mark-start
    #[inline]
    pub fn tams(&self) -> u32 {
        self.tams_slot.load(Ordering::Acquire)
    }

    /// Bytes allocated since mark start
    pub fn allocated_since_mark(&self) -> usize {
        self.used()
            .saturating_sub(self.tams_bytes.load(Ordering::Acquire))
    }

    /// Check whether an object counts as live in the current mark
    ///
    /// Objects allocated after mark start are implicitly live.
    #[inline]
    pub fn is_marked_or_new(&self, slot: u32) -> bool {
        slot >= self.tams() || self.bitmap.is_marked(slot)
    }

    /// Age classification
    pub fn age(&self) -> RegionAge {
        if self.survived.load(Ordering::Relaxed) > 0 {
            RegionAge::Old
        } else {
            RegionAge::Young
        }
    }

    /// Number of collections this region survived
    pub fn survived(&self) -> u32 {
        self.survived.load(Ordering::Relaxed)
    }

    /// Record that the region survived a collection
    pub fn note_survived(&self) {
        self.survived.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the region to the empty state
    pub fn recycle(&self) {
        self.data.write().clear();
        self.bitmap.clear();
        self.live_bytes.store(0, Ordering::Release);
        self.tams_slot.store(0, Ordering::Release);
        self.tams_bytes.store(0, Ordering::Release);
        self.survived.store(0, Ordering::Relaxed);
        self.set_state(RegionState::Empty);
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("used", &self.used())
            .field("live", &self.live_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassId;

    fn obj(payload: usize) -> HeapObject {
        HeapObject::new(ClassId(1), 1, &vec![0u8; payload], 8)
    }

    #[test]
    fn test_bump_allocation_respects_capacity() {
        let region = HeapRegion::new(RegionId(0), 256);
        assert_eq!(region.try_allocate(obj(100)).ok(), Some(0));
        assert_eq!(region.try_allocate(obj(100)).ok(), Some(1));
        assert!(region.try_allocate(obj(100)).is_err());
        assert!(region.used() <= region.capacity());
    }

    #[test]
    fn test_bitmap_mark_once() {
        let bitmap = MarkBitmap::new(4096);
        assert!(bitmap.mark(5));
        assert!(!bitmap.mark(5));
        assert!(bitmap.is_marked(5));
        assert!(!bitmap.is_marked(6));
        assert_eq!(bitmap.count(), 1);
        bitmap.clear();
        assert!(!bitmap.is_marked(5));
    }

    #[test]
    fn test_tams_makes_new_objects_live() {
        let region = HeapRegion::new(RegionId(0), 4096);
        region.set_state(RegionState::Regular);
        region.try_allocate(obj(8)).ok();
        region.capture_tams();
        let slot = region.try_allocate(obj(8)).unwrap_or(u32::MAX);

        assert!(!region.is_marked_or_new(0));
        assert!(region.is_marked_or_new(slot));
        assert_eq!(region.allocated_since_mark(), obj(8).size());
    }

    #[test]
    fn test_recycle_resets_region() {
        let region = HeapRegion::new(RegionId(3), 4096);
        region.set_state(RegionState::Regular);
        region.try_allocate(obj(8)).ok();
        region.note_survived();
        assert_eq!(region.age(), RegionAge::Old);

        region.recycle();
        assert_eq!(region.state(), RegionState::Empty);
        assert_eq!(region.used(), 0);
        assert_eq!(region.age(), RegionAge::Young);
    }
}
