//! Collection set selection, evacuation and reference updating
//!
//! After Final Mark the collector picks regions with enough garbage, copies
//! their live objects out alongside the mutators (mutators that write to a
//! collection-set object copy it themselves), then rewrites every reference to
//! a copied object from a forwarding map built at the Init Update Refs pause.

use crate::heap::{Heap, HeapError, ObjectRef, RegionId, RegionState};
use crate::value::Value;
use rustc_hash::FxHashMap;

/// Old location to new location of every copied object
pub type ForwardingMap = FxHashMap<ObjectRef, ObjectRef>;

/// Regions chosen for evacuation
#[derive(Debug, Clone, Default)]
pub struct CollectionSet {
    /// Chosen regions
    pub regions: Vec<RegionId>,
    /// Live bytes that will be copied
    pub live_bytes: usize,
    /// Garbage bytes that will be reclaimed
    pub garbage_bytes: usize,
}

impl CollectionSet {
    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Choose the collection set from the live data of the last mark
///
/// Regions qualify when their garbage is at least `1.0 - aggressiveness` of
/// the region size; candidates are taken most-garbage first. Below full
/// aggressiveness the copied live bytes are capped by the free space
/// available as evacuation targets.
pub fn choose_collection_set(heap: &Heap, aggressiveness: f64) -> CollectionSet {
    let everything = aggressiveness >= 1.0;
    let threshold = ((1.0 - aggressiveness).max(0.0) * heap.region_size() as f64) as usize;

    let mut candidates: Vec<(RegionId, usize, usize)> = heap
        .regions()
        .iter()
        .filter(|r| r.state() == RegionState::Regular)
        .filter_map(|r| {
            let used = r.used();
            let live = r.live_bytes().min(used);
            let garbage = used - live;
            let eligible = if everything {
                used > 0
            } else {
                garbage > 0 && garbage >= threshold
            };
            eligible.then_some((r.id(), live, garbage))
        })
        .collect();
    candidates.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));

    let reserve = heap.free_bytes();
    let mut cset = CollectionSet::default();
    for (id, live, garbage) in candidates {
        if !everything && cset.live_bytes + live > reserve {
            continue;
        }
        cset.regions.push(id);
        cset.live_bytes += live;
        cset.garbage_bytes += garbage;
    }
    cset
}

/// Copy every live object of the collection set into `gclab`
///
/// Returns the number of objects this call copied. Stops at the first failed
/// copy; by then the cycle has been cancelled.
pub fn evacuate_collection_set(
    heap: &Heap,
    cset: &CollectionSet,
    gclab: &mut Option<RegionId>,
) -> Result<usize, HeapError> {
    let mut copied = 0;
    for &id in &cset.regions {
        let region = heap.region(id)?;
        let count = region.data.read().objects.len() as u32;
        for slot in 0..count {
            if heap.is_cancelled() {
                return Err(HeapError::EvacuationFailed);
            }
            if !region.is_marked_or_new(slot) {
                continue;
            }
            let obj = ObjectRef::new(id, slot);
            let to = heap.evacuate_object(gclab, obj)?;
            if to != obj {
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Collect the forwarding pointers installed in the collection set
pub fn build_forwarding_map(heap: &Heap, cset: &CollectionSet) -> ForwardingMap {
    let mut map = ForwardingMap::default();
    for &id in &cset.regions {
        if let Ok(region) = heap.region(id) {
            let data = region.data.read();
            for (slot, obj) in data.objects.iter().enumerate() {
                if let Some(to) = obj.forwardee() {
                    map.insert(ObjectRef::new(id, slot as u32), to);
                }
            }
        }
    }
    map
}

/// Rewrite a value through the forwarding map, returning true if it changed
#[inline]
pub fn update_value(map: &ForwardingMap, value: &mut Value) -> bool {
    if let Value::Ref(obj) = value {
        if let Some(to) = map.get(&*obj) {
            *obj = *to;
            return true;
        }
    }
    false
}

/// Rewrite every reference field outside the collection set
///
/// Regions are processed one at a time under their write lock.
pub fn update_heap_references(heap: &Heap, map: &ForwardingMap) -> usize {
    let mut updated = 0;
    for region in heap.regions() {
        if !matches!(region.state(), RegionState::Regular | RegionState::Archive) {
            continue;
        }
        let mut data = region.data.write();
        for obj in data.objects.iter_mut() {
            for field in obj.fields.iter_mut() {
                if update_value(map, field) {
                    updated += 1;
                }
            }
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassId;
    use crate::heap::{gc_state, HeapConfig};

    fn heap() -> Heap {
        Heap::new(HeapConfig {
            heap_size: 16 * 4096,
            region_size: 4096,
            compressed_refs: false,
            satb_buffer_size: 8,
            oom_during_evac_a_lot: false,
        })
    }

    #[test]
    fn test_choose_prefers_garbage_and_respects_threshold() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        // region A: fill with 2 objects of ~2000 bytes, one live
        let a0 = heap.allocate(&mut local, ClassId(1), 0, &[0; 1900]).unwrap();
        heap.allocate(&mut local, ClassId(1), 0, &[0; 1900]).unwrap();
        local.tlab = None;
        // region B: one small live object
        let b0 = heap.allocate(&mut local, ClassId(1), 0, &[0; 100]).unwrap();

        for region in heap.regions() {
            region.set_live_bytes(0);
        }
        heap.region(a0.region)
            .unwrap()
            .set_live_bytes(heap.with_object(a0, |_, o| o.size()).unwrap());
        heap.region(b0.region)
            .unwrap()
            .set_live_bytes(heap.with_object(b0, |_, o| o.size()).unwrap());

        let cset = choose_collection_set(&heap, 0.6);
        assert_eq!(cset.regions, vec![a0.region]);

        let all = choose_collection_set(&heap, 1.0);
        assert_eq!(all.regions.len(), 2);
    }

    #[test]
    fn test_evacuate_and_update_references() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        let holder = heap.allocate(&mut local, ClassId(1), 1, &[]).unwrap();
        local.tlab = None;
        let target = heap.allocate(&mut local, ClassId(2), 0, b"payload").unwrap();
        heap.write_field(&mut local, holder, 0, Value::Ref(target)).unwrap();
        for region in heap.regions() {
            region.capture_tams();
        }
        // target is live: mark it
        heap.region(target.region).unwrap().bitmap.mark(target.slot);

        let cset = CollectionSet {
            regions: vec![target.region],
            ..CollectionSet::default()
        };
        heap.region(target.region).unwrap().set_state(RegionState::Cset);
        heap.set_gc_state(gc_state::EVACUATION);

        let mut gclab = None;
        assert_eq!(evacuate_collection_set(&heap, &cset, &mut gclab).unwrap(), 1);
        let map = build_forwarding_map(&heap, &cset);
        assert_eq!(map.len(), 1);

        assert_eq!(update_heap_references(&heap, &map), 1);
        let moved = heap.read_field(holder, 0).unwrap().as_object().unwrap();
        assert_ne!(moved.region, target.region);
        assert_eq!(heap.read_payload(moved, 0, 7).unwrap(), b"payload");

        let mut root = Value::Ref(target);
        assert!(update_value(&map, &mut root));
        assert_eq!(root, Value::Ref(moved));
    }
}
