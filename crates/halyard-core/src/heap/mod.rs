//! Region-based heap
//!
//! The heap is a fixed array of equally sized regions. Mutators bump-allocate
//! into a private region (TLAB) and the collector copies survivors into its own
//! region (GCLAB). All object access goes through the barrier-aware accessors
//! here:
//!
//! - **Read barrier**: every access resolves through the forwarding slot while
//!   holding the region lock, so a reader never sees a half-moved object
//! - **SATB pre-write barrier**: while marking, overwritten references are
//!   logged into the writer's buffer
//! - **Store-value barrier**: while forwarded objects exist, stored references
//!   are resolved to their to-space copy first
//! - **Evacuating write barrier**: a write to a collection-set object copies it
//!   out before the write lands

pub mod mutator;
pub mod object;
pub mod region;

pub use mutator::{Mutator, MutatorState};
pub use object::{object_size, HeapObject, MarkWord, ObjectHeader, ObjectRef, RegionId};
pub use region::{HeapRegion, MarkBitmap, Region, RegionAge, RegionState};

use crate::class::ClassId;
use crate::config::VmOptions;
use crate::defaults::{COMPRESSED_REF_BYTES, EVAC_FAILURE_ONE_IN, FULL_REF_BYTES};
use crate::gc::barrier::{BarrierRecord, RememberedSet, SatbBuffer};
use crate::value::Value;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Heap errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum HeapError {
    /// No region can satisfy the request
    #[error("Out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
    },

    /// Object does not fit in a single region
    #[error("Object of {size} bytes exceeds region size {region_size}")]
    ObjectTooLarge {
        /// Object size
        size: usize,
        /// Region size
        region_size: usize,
    },

    /// Reference does not name an object
    #[error("Invalid reference: {0}")]
    InvalidReference(ObjectRef),

    /// Field index out of range
    #[error("Field index {index} out of bounds (object has {len} fields)")]
    FieldOutOfBounds {
        /// Requested index
        index: usize,
        /// Field count
        len: usize,
    },

    /// Payload range out of range
    #[error("Payload range {offset}..{end} out of bounds (payload is {len} bytes)")]
    PayloadOutOfBounds {
        /// Start offset
        offset: usize,
        /// End offset
        end: usize,
        /// Payload length
        len: usize,
    },

    /// Value is not a reference
    #[error("Value is not an object reference")]
    NotAnObject,

    /// Copying a collection-set object failed; the cycle has been cancelled
    #[error("Evacuation failed: no target region available")]
    EvacuationFailed,
}

/// Heap result
pub type HeapResult<T> = Result<T, HeapError>;

/// GC state flags consulted by the barriers
pub mod gc_state {
    /// No collection activity
    pub const IDLE: u8 = 0;
    /// Concurrent marking in progress (SATB barrier on)
    pub const MARKING: u8 = 1;
    /// Evacuation in progress (evacuating write barrier on)
    pub const EVACUATION: u8 = 2;
    /// Reference updating in progress
    pub const UPDATE_REFS: u8 = 4;
    /// Forwarded objects may exist (store-value barrier on)
    pub const HAS_FORWARDED: u8 = EVACUATION | UPDATE_REFS;
}

/// Heap sizing and barrier parameters
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Total heap size in bytes
    pub heap_size: usize,
    /// Region size in bytes
    pub region_size: usize,
    /// Use 4-byte reference fields
    pub compressed_refs: bool,
    /// SATB buffer capacity per mutator
    pub satb_buffer_size: usize,
    /// Inject evacuation allocation failures
    pub oom_during_evac_a_lot: bool,
}

impl HeapConfig {
    /// Derive heap parameters from VM options
    pub fn from_options(options: &VmOptions) -> Self {
        Self {
            heap_size: options.heap_size,
            region_size: options.effective_region_size(),
            compressed_refs: options.compressed_refs,
            satb_buffer_size: options.satb_buffer_size,
            oom_during_evac_a_lot: options.oom_during_evac_a_lot,
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::from_options(&VmOptions::default())
    }
}

/// What an allocation is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPurpose {
    /// Mutator allocation into a TLAB
    Mutator,
    /// Evacuation copy into a GCLAB
    Evacuation,
}

/// Allocation regions and barrier buffer owned by one thread
#[derive(Debug)]
pub struct ThreadLocalHeap {
    /// Current mutator allocation region
    pub tlab: Option<RegionId>,
    /// Current evacuation target region
    pub gclab: Option<RegionId>,
    /// SATB buffer
    pub satb: SatbBuffer,
}

impl ThreadLocalHeap {
    /// Create empty thread-local state
    pub fn new(satb_buffer_size: usize) -> Self {
        Self {
            tlab: None,
            gclab: None,
            satb: SatbBuffer::new(satb_buffer_size),
        }
    }

    /// Drop both allocation regions so the next allocation claims fresh ones
    pub fn retire_labs(&mut self) {
        self.tlab = None;
        self.gclab = None;
    }
}

struct EvacFaultInjector {
    rng: Option<Mutex<StdRng>>,
    injected: AtomicUsize,
}

impl EvacFaultInjector {
    fn new(enabled: bool) -> Self {
        Self {
            rng: enabled.then(|| Mutex::new(StdRng::from_entropy())),
            injected: AtomicUsize::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        match &self.rng {
            Some(rng) => {
                let fail = rng.lock().gen_ratio(1, EVAC_FAILURE_ONE_IN);
                if fail {
                    self.injected.fetch_add(1, Ordering::Relaxed);
                }
                fail
            }
            None => false,
        }
    }
}

/// The region heap
pub struct Heap {
    regions: Box<[HeapRegion]>,
    region_size: usize,
    ref_bytes: usize,
    satb_buffer_size: usize,
    free: Mutex<BTreeSet<u32>>,
    used: AtomicUsize,
    allocated_total: AtomicU64,
    gc_state: AtomicU8,
    cancelled: AtomicBool,
    satb: RememberedSet,
    fault: EvacFaultInjector,
}

impl Heap {
    /// Create a heap with every region empty
    pub fn new(config: HeapConfig) -> Self {
        let region_size = config.region_size.max(1);
        let count = (config.heap_size / region_size).max(1);
        let regions: Box<[HeapRegion]> = (0..count)
            .map(|i| HeapRegion::new(RegionId(i as u32), region_size))
            .collect();
        let free = (0..count as u32).collect();
        log::debug!(
            "heap: {} regions of {} bytes ({} bytes total)",
            count,
            region_size,
            count * region_size
        );
        Self {
            regions,
            region_size,
            ref_bytes: if config.compressed_refs {
                COMPRESSED_REF_BYTES
            } else {
                FULL_REF_BYTES
            },
            satb_buffer_size: config.satb_buffer_size,
            free: Mutex::new(free),
            used: AtomicUsize::new(0),
            allocated_total: AtomicU64::new(0),
            gc_state: AtomicU8::new(gc_state::IDLE),
            cancelled: AtomicBool::new(false),
            satb: RememberedSet::new(),
            fault: EvacFaultInjector::new(config.oom_during_evac_a_lot),
        }
    }

    // ===== Geometry =====

    /// Region size in bytes
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of regions
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.regions.len() * self.region_size
    }

    /// Bytes per reference field
    pub fn ref_bytes(&self) -> usize {
        self.ref_bytes
    }

    /// SATB buffer capacity for new thread-local state
    pub fn satb_buffer_size(&self) -> usize {
        self.satb_buffer_size
    }

    /// Fresh thread-local allocation state
    pub fn new_thread_local(&self) -> ThreadLocalHeap {
        ThreadLocalHeap::new(self.satb_buffer_size)
    }

    /// Look up a region
    #[inline]
    pub fn region(&self, id: RegionId) -> HeapResult<&HeapRegion> {
        self.regions
            .get(id.index())
            .ok_or(HeapError::InvalidReference(ObjectRef::new(id, 0)))
    }

    /// All regions in id order
    pub fn regions(&self) -> &[HeapRegion] {
        &self.regions
    }

    /// Bytes allocated in claimed regions
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Recompute `used` from the regions
    pub fn recompute_used(&self) -> usize {
        let used = self
            .regions
            .iter()
            .filter(|r| r.state() != RegionState::Empty)
            .map(|r| r.used())
            .sum();
        self.used.store(used, Ordering::Release);
        used
    }

    /// Monotonic count of bytes allocated by mutators
    pub fn total_allocated(&self) -> u64 {
        self.allocated_total.load(Ordering::Acquire)
    }

    /// Number of regions in the free set
    pub fn free_region_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Bytes available in free regions
    pub fn free_bytes(&self) -> usize {
        self.free_region_count() * self.region_size
    }

    // ===== GC state =====

    /// Current GC state flags
    #[inline]
    pub fn gc_state(&self) -> u8 {
        self.gc_state.load(Ordering::Acquire)
    }

    /// Replace the GC state flags (only at pauses)
    pub fn set_gc_state(&self, state: u8) {
        self.gc_state.store(state, Ordering::Release);
    }

    /// Check whether concurrent marking is active
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.gc_state() & gc_state::MARKING != 0
    }

    /// Check whether evacuation is active
    #[inline]
    pub fn is_evacuating(&self) -> bool {
        self.gc_state() & gc_state::EVACUATION != 0
    }

    /// Cancel the running cycle; returns true if this call cancelled it
    pub fn cancel_gc(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Check whether the running cycle was cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clear the cancellation flag
    pub fn clear_cancelled(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Global SATB queue
    pub fn satb(&self) -> &RememberedSet {
        &self.satb
    }

    /// Number of injected evacuation failures so far
    pub fn injected_failures(&self) -> usize {
        self.fault.injected.load(Ordering::Relaxed)
    }

    // ===== Region management =====

    /// Take the lowest-numbered free region
    pub fn claim_region(&self, purpose: AllocPurpose) -> Option<RegionId> {
        if purpose == AllocPurpose::Evacuation && self.fault.should_fail() {
            log::trace!("injected evacuation allocation failure");
            return None;
        }
        let id = self.free.lock().pop_first()?;
        let region = &self.regions[id as usize];
        region.set_state(RegionState::Regular);
        log::trace!("claimed region r{} for {:?}", id, purpose);
        Some(RegionId(id))
    }

    /// Empty a region and return it to the free set
    pub fn recycle_region(&self, id: RegionId) -> HeapResult<()> {
        let region = self.region(id)?;
        let used = region.used();
        region.recycle();
        self.used.fetch_sub(used.min(self.used()), Ordering::AcqRel);
        self.free.lock().insert(id.0);
        Ok(())
    }

    /// Rebuild the free set from region states
    pub fn rebuild_free_set(&self) {
        let mut free = self.free.lock();
        free.clear();
        for region in self.regions.iter() {
            if region.state() == RegionState::Empty {
                free.insert(region.id().0);
            }
        }
    }

    // ===== Allocation =====

    /// Allocate an object with null fields and a copy of `payload`
    pub fn allocate(
        &self,
        local: &mut ThreadLocalHeap,
        class: ClassId,
        field_count: usize,
        payload: &[u8],
    ) -> HeapResult<ObjectRef> {
        let obj = HeapObject::new(class, field_count, payload, self.ref_bytes);
        self.allocate_object(&mut local.tlab, obj, AllocPurpose::Mutator)
    }

    /// Place an object into the allocation region `lab`, claiming a new one
    /// when it is full
    pub fn allocate_object(
        &self,
        lab: &mut Option<RegionId>,
        obj: HeapObject,
        purpose: AllocPurpose,
    ) -> HeapResult<ObjectRef> {
        self.place_object(lab, obj, purpose).map_err(|(_, e)| e)
    }

    fn place_object(
        &self,
        lab: &mut Option<RegionId>,
        obj: HeapObject,
        purpose: AllocPurpose,
    ) -> Result<ObjectRef, (HeapObject, HeapError)> {
        let size = obj.size();
        if size > self.region_size {
            return Err((
                obj,
                HeapError::ObjectTooLarge {
                    size,
                    region_size: self.region_size,
                },
            ));
        }

        let mut obj = obj;
        loop {
            if let Some(id) = *lab {
                match self.regions[id.index()].try_allocate(obj) {
                    Ok(slot) => {
                        self.used.fetch_add(size, Ordering::AcqRel);
                        if purpose == AllocPurpose::Mutator {
                            self.allocated_total
                                .fetch_add(size as u64, Ordering::AcqRel);
                        }
                        return Ok(ObjectRef::new(id, slot));
                    }
                    Err(back) => {
                        obj = back;
                        *lab = None;
                    }
                }
            }
            match self.claim_region(purpose) {
                Some(id) => *lab = Some(id),
                None => return Err((obj, HeapError::OutOfMemory { requested: size })),
            }
        }
    }

    // ===== Barriers and access =====

    /// Run `f` on the current copy of `obj` while holding its region lock
    pub fn with_object<R>(
        &self,
        obj: ObjectRef,
        f: impl FnOnce(ObjectRef, &HeapObject) -> R,
    ) -> HeapResult<R> {
        let mut current = obj;
        loop {
            let data = self.region(current.region)?.data.read();
            let o = data
                .objects
                .get(current.slot as usize)
                .ok_or(HeapError::InvalidReference(current))?;
            match o.forwardee() {
                Some(to) => current = to,
                None => return Ok(f(current, o)),
            }
        }
    }

    /// Resolve a reference through its forwarding pointer (read barrier)
    pub fn resolve(&self, obj: ObjectRef) -> HeapResult<ObjectRef> {
        self.with_object(obj, |current, _| current)
    }

    /// Resolve a value if it is a reference
    pub fn resolve_value(&self, value: Value) -> HeapResult<Value> {
        match value {
            Value::Ref(obj) => Ok(Value::Ref(self.resolve(obj)?)),
            other => Ok(other),
        }
    }

    /// Check whether two references name the same object
    pub fn same_object(&self, a: ObjectRef, b: ObjectRef) -> HeapResult<bool> {
        Ok(a == b || self.resolve(a)? == self.resolve(b)?)
    }

    /// Class of an object
    pub fn class_of(&self, obj: ObjectRef) -> HeapResult<ClassId> {
        self.with_object(obj, |_, o| o.header.class)
    }

    /// Age of an object
    pub fn age_of(&self, obj: ObjectRef) -> HeapResult<u8> {
        self.with_object(obj, |_, o| o.header.mark.age())
    }

    /// Field count of an object
    pub fn field_count(&self, obj: ObjectRef) -> HeapResult<usize> {
        self.with_object(obj, |_, o| o.fields.len())
    }

    /// Payload length of an object
    pub fn payload_len(&self, obj: ObjectRef) -> HeapResult<usize> {
        self.with_object(obj, |_, o| o.payload.len())
    }

    /// Read a field
    pub fn read_field(&self, obj: ObjectRef, index: usize) -> HeapResult<Value> {
        self.with_object(obj, |_, o| {
            o.fields
                .get(index)
                .copied()
                .ok_or(HeapError::FieldOutOfBounds {
                    index,
                    len: o.fields.len(),
                })
        })?
    }

    /// Read `len` payload bytes starting at `offset`
    pub fn read_payload(&self, obj: ObjectRef, offset: usize, len: usize) -> HeapResult<Vec<u8>> {
        self.with_object(obj, |_, o| {
            let end = offset.saturating_add(len);
            o.payload
                .get(offset..end)
                .map(|bytes| bytes.to_vec())
                .ok_or(HeapError::PayloadOutOfBounds {
                    offset,
                    end,
                    len: o.payload.len(),
                })
        })?
    }

    /// Write a field through the barriers
    pub fn write_field(
        &self,
        local: &mut ThreadLocalHeap,
        obj: ObjectRef,
        index: usize,
        value: Value,
    ) -> HeapResult<()> {
        let state = self.gc_state();
        let value = if state & gc_state::HAS_FORWARDED != 0 {
            self.resolve_value(value)?
        } else {
            value
        };

        let target = self.write_target(local, obj, state)?;
        let mut current = target;
        loop {
            let mut data = self.region(current.region)?.data.write();
            let o = data
                .objects
                .get_mut(current.slot as usize)
                .ok_or(HeapError::InvalidReference(current))?;
            if let Some(to) = o.forwardee() {
                current = to;
                continue;
            }
            let len = o.fields.len();
            let slot = o
                .fields
                .get_mut(index)
                .ok_or(HeapError::FieldOutOfBounds { index, len })?;
            let old = std::mem::replace(slot, value);
            drop(data);

            if state & gc_state::MARKING != 0 {
                if let Value::Ref(prev) = old {
                    local.satb.enqueue(
                        BarrierRecord {
                            value: prev,
                            cross_region: prev.region != current.region,
                        },
                        &self.satb,
                    );
                }
            }
            return Ok(());
        }
    }

    /// Overwrite payload bytes starting at `offset`
    pub fn write_payload(
        &self,
        local: &mut ThreadLocalHeap,
        obj: ObjectRef,
        offset: usize,
        bytes: &[u8],
    ) -> HeapResult<()> {
        let state = self.gc_state();
        let mut current = self.write_target(local, obj, state)?;
        loop {
            let mut data = self.region(current.region)?.data.write();
            let o = data
                .objects
                .get_mut(current.slot as usize)
                .ok_or(HeapError::InvalidReference(current))?;
            if let Some(to) = o.forwardee() {
                current = to;
                continue;
            }
            let end = offset.saturating_add(bytes.len());
            let len = o.payload.len();
            let dest = o
                .payload
                .get_mut(offset..end)
                .ok_or(HeapError::PayloadOutOfBounds { offset, end, len })?;
            dest.copy_from_slice(bytes);
            return Ok(());
        }
    }

    /// Evacuate `obj` first if it sits in the collection set
    fn write_target(
        &self,
        local: &mut ThreadLocalHeap,
        obj: ObjectRef,
        state: u8,
    ) -> HeapResult<ObjectRef> {
        if state & gc_state::EVACUATION != 0 && self.region(obj.region)?.in_cset() {
            return self.evacuate_object(&mut local.gclab, obj);
        }
        Ok(obj)
    }

    /// Copy a collection-set object into `gclab` and install the forwarding
    /// pointer, or return the existing copy
    ///
    /// The source region's write lock is held across the copy so that only one
    /// thread ever copies a given object.
    pub fn evacuate_object(
        &self,
        gclab: &mut Option<RegionId>,
        obj: ObjectRef,
    ) -> HeapResult<ObjectRef> {
        let region = self.region(obj.region)?;
        let mut src = region.data.write();
        let o = src
            .objects
            .get_mut(obj.slot as usize)
            .ok_or(HeapError::InvalidReference(obj))?;
        if let Some(to) = o.forwardee() {
            return Ok(to);
        }
        if !region.in_cset() {
            return Ok(obj);
        }

        let copy = o.evacuation_copy();
        match self.place_object(gclab, copy, AllocPurpose::Evacuation) {
            Ok(to) => {
                o.set_forwardee(to);
                Ok(to)
            }
            Err((copy, _)) => {
                o.fields = copy.fields;
                o.payload = copy.payload;
                if self.cancel_gc() {
                    log::debug!("evacuation of {} failed; cancelling cycle", obj);
                }
                Err(HeapError::EvacuationFailed)
            }
        }
    }

    // ===== Archive space =====

    /// Claim pinned archive regions for objects of the given sizes, returning
    /// the reference each object will occupy
    pub fn reserve_archive_space(&self, sizes: &[usize]) -> HeapResult<Vec<ObjectRef>> {
        let mut placements = Vec::with_capacity(sizes.len());
        let mut current: Option<(RegionId, usize, u32)> = None;
        for &size in sizes {
            if size > self.region_size {
                return Err(HeapError::ObjectTooLarge {
                    size,
                    region_size: self.region_size,
                });
            }
            let fits = matches!(current, Some((_, used, _)) if used + size <= self.region_size);
            if !fits {
                let id = self
                    .claim_region(AllocPurpose::Mutator)
                    .ok_or(HeapError::OutOfMemory { requested: size })?;
                self.regions[id.index()].set_state(RegionState::Archive);
                current = Some((id, 0, 0));
            }
            if let Some((id, used, slot)) = current.as_mut() {
                placements.push(ObjectRef::new(*id, *slot));
                *used += size;
                *slot += 1;
            }
        }
        Ok(placements)
    }

    /// Install archive objects at the references returned by
    /// [`Heap::reserve_archive_space`], in the same order
    pub fn install_archive_objects(
        &self,
        placements: &[ObjectRef],
        objects: Vec<HeapObject>,
    ) -> HeapResult<()> {
        for (at, obj) in placements.iter().zip(objects) {
            let region = self.region(at.region)?;
            let mut data = region.data.write();
            if data.objects.len() != at.slot as usize {
                return Err(HeapError::InvalidReference(*at));
            }
            data.used += obj.size();
            self.used.fetch_add(obj.size(), Ordering::AcqRel);
            data.objects.push(obj);
        }
        Ok(())
    }

    /// Archive regions in id order
    pub fn archive_regions(&self) -> impl Iterator<Item = &HeapRegion> {
        self.regions
            .iter()
            .filter(|r| r.state() == RegionState::Archive)
    }

    // ===== Diagnostics =====

    /// Snapshot of per-region occupancy
    pub fn dump(&self) -> HeapDump {
        let regions = self
            .regions
            .iter()
            .filter(|r| r.state() != RegionState::Empty)
            .map(|r| {
                let data = r.data.read();
                RegionSummary {
                    id: r.id(),
                    state: r.state(),
                    age: r.age(),
                    used: data.used,
                    live: r.live_bytes(),
                    objects: data.objects.len(),
                }
            })
            .collect();
        HeapDump {
            capacity: self.capacity(),
            used: self.used(),
            region_size: self.region_size,
            gc_state: self.gc_state(),
            cancelled: self.is_cancelled(),
            phase: String::from("unknown"),
            cycles: 0,
            regions,
        }
    }
}

/// Occupancy of one region in a heap dump
#[derive(Debug, Clone)]
pub struct RegionSummary {
    /// Region id
    pub id: RegionId,
    /// State
    pub state: RegionState,
    /// Age classification
    pub age: RegionAge,
    /// Bytes allocated
    pub used: usize,
    /// Live bytes from the last mark
    pub live: usize,
    /// Object count
    pub objects: usize,
}

/// Diagnosable state dump emitted on fatal conditions
#[derive(Debug, Clone)]
pub struct HeapDump {
    /// Heap capacity
    pub capacity: usize,
    /// Bytes used
    pub used: usize,
    /// Region size
    pub region_size: usize,
    /// GC state flags
    pub gc_state: u8,
    /// Whether the cycle was cancelled
    pub cancelled: bool,
    /// Collector phase at the time of the dump
    pub phase: String,
    /// Cycles completed
    pub cycles: u64,
    /// Non-empty regions
    pub regions: Vec<RegionSummary>,
}

impl fmt::Display for HeapDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Heap: {} used of {} bytes ({} regions of {} bytes), phase {}, gc state {:#x}{}, {} cycles",
            self.used,
            self.capacity,
            self.capacity / self.region_size.max(1),
            self.region_size,
            self.phase,
            self.gc_state,
            if self.cancelled { " (cancelled)" } else { "" },
            self.cycles
        )?;
        for r in &self.regions {
            writeln!(
                f,
                "  {:>6} {:<8} {:?}  used {:>10}  live {:>10}  objects {}",
                r.id.to_string(),
                r.state.label(),
                r.age,
                r.used,
                r.live,
                r.objects
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::new(HeapConfig {
            heap_size: 16 * 4096,
            region_size: 4096,
            compressed_refs: false,
            satb_buffer_size: 4,
            oom_during_evac_a_lot: false,
        })
    }

    #[test]
    fn test_allocate_and_access() {
        let heap = small_heap();
        let mut local = heap.new_thread_local();
        let obj = heap.allocate(&mut local, ClassId(1), 2, b"hello").unwrap();

        heap.write_field(&mut local, obj, 1, Value::Int(42)).unwrap();
        assert_eq!(heap.read_field(obj, 1).unwrap(), Value::Int(42));
        assert_eq!(heap.read_field(obj, 0).unwrap(), Value::Null);
        assert_eq!(heap.read_payload(obj, 0, 5).unwrap(), b"hello");
        assert!(matches!(
            heap.read_field(obj, 2),
            Err(HeapError::FieldOutOfBounds { index: 2, len: 2 })
        ));
        assert_eq!(heap.used(), object_size(2, 5, 8));
    }

    #[test]
    fn test_object_too_large() {
        let heap = small_heap();
        let mut local = heap.new_thread_local();
        let result = heap.allocate(&mut local, ClassId(1), 0, &vec![0u8; 8192]);
        assert!(matches!(result, Err(HeapError::ObjectTooLarge { .. })));
    }

    #[test]
    fn test_out_of_memory_when_regions_exhausted() {
        let heap = small_heap();
        let mut local = heap.new_thread_local();
        let mut count = 0;
        loop {
            match heap.allocate(&mut local, ClassId(1), 0, &[0u8; 2000]) {
                Ok(_) => count += 1,
                Err(HeapError::OutOfMemory { .. }) => break,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        // two objects per region
        assert_eq!(count, 32);
        assert_eq!(heap.free_region_count(), 0);
    }

    #[test]
    fn test_satb_barrier_logs_overwritten_reference() {
        let heap = small_heap();
        let mut local = heap.new_thread_local();
        let holder = heap.allocate(&mut local, ClassId(1), 1, &[]).unwrap();
        let a = heap.allocate(&mut local, ClassId(1), 0, &[]).unwrap();
        let b = heap.allocate(&mut local, ClassId(1), 0, &[]).unwrap();

        heap.write_field(&mut local, holder, 0, Value::Ref(a)).unwrap();
        heap.set_gc_state(gc_state::MARKING);
        heap.write_field(&mut local, holder, 0, Value::Ref(b)).unwrap();
        assert_eq!(local.satb.len(), 1);

        local.satb.flush(heap.satb());
        let logged = heap.satb().drain();
        assert_eq!(logged[0].value, a);
    }

    #[test]
    fn test_evacuating_write_forwards_object() {
        let heap = small_heap();
        let mut local = heap.new_thread_local();
        let obj = heap.allocate(&mut local, ClassId(1), 1, b"abc").unwrap();
        heap.region(obj.region).unwrap().set_state(RegionState::Cset);
        heap.set_gc_state(gc_state::EVACUATION);

        heap.write_field(&mut local, obj, 0, Value::Int(5)).unwrap();
        let moved = heap.resolve(obj).unwrap();
        assert_ne!(moved, obj);
        assert!(heap.same_object(obj, moved).unwrap());
        assert_eq!(heap.read_field(obj, 0).unwrap(), Value::Int(5));
        assert_eq!(heap.read_payload(moved, 0, 3).unwrap(), b"abc");
        assert_eq!(heap.age_of(moved).unwrap(), 1);
    }

    #[test]
    fn test_archive_space_is_pinned() {
        let heap = small_heap();
        let placements = heap.reserve_archive_space(&[1000, 1000, 3000]).unwrap();
        assert_eq!(placements[0].region, placements[1].region);
        assert_ne!(placements[1].region, placements[2].region);

        let objects = vec![
            HeapObject::new(ClassId(1), 0, &[0u8; 900], 8),
            HeapObject::new(ClassId(1), 0, &[0u8; 900], 8),
            HeapObject::new(ClassId(1), 0, &[0u8; 2900], 8),
        ];
        heap.install_archive_objects(&placements, objects).unwrap();
        assert_eq!(heap.archive_regions().count(), 2);
        assert_eq!(heap.payload_len(placements[2]).unwrap(), 2900);
    }

    #[test]
    fn test_dump_lists_claimed_regions() {
        let heap = small_heap();
        let mut local = heap.new_thread_local();
        heap.allocate(&mut local, ClassId(1), 0, &[]).unwrap();
        let dump = heap.dump();
        assert_eq!(dump.regions.len(), 1);
        assert!(dump.to_string().contains("regular"));
    }
}
