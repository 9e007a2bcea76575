//! Heap verification
//!
//! Eager consistency checks run after collector phases when verification is
//! enabled. A failed check means the collector itself is broken; the caller
//! treats it as fatal.

use crate::heap::{Heap, ObjectRef, RegionState};
use crate::value::Value;
use rustc_hash::FxHashSet;

/// What the reachability walk tolerates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// No collection set exists; nothing may be forwarded
    Quiescent,
    /// Collection-set regions exist; references may still point at forwarded
    /// objects
    Forwarding,
    /// Every reachable object must also be marked (or allocated after mark
    /// start)
    Marked,
}

/// Consistency checker over a heap
pub struct HeapVerifier<'h> {
    heap: &'h Heap,
}

impl<'h> HeapVerifier<'h> {
    /// Create a verifier
    pub fn new(heap: &'h Heap) -> Self {
        Self { heap }
    }

    /// Walk everything reachable from `roots` and the archive objects
    ///
    /// Every reference must resolve to an existing object in an occupied
    /// region. Returns the number of reachable objects.
    pub fn verify_reachable(&self, roots: &[Value], mode: VerifyMode) -> Result<usize, String> {
        let mut visited = FxHashSet::default();
        let mut stack: Vec<(ObjectRef, String)> = Vec::new();

        for (i, root) in roots.iter().enumerate() {
            if let Value::Ref(obj) = root {
                stack.push((*obj, format!("root #{}", i)));
            }
        }
        for region in self.heap.archive_regions() {
            let count = region.data.read().objects.len() as u32;
            for slot in 0..count {
                stack.push((ObjectRef::new(region.id(), slot), "archive".to_string()));
            }
        }

        while let Some((obj, origin)) = stack.pop() {
            let obj = self.check_reference(obj, mode, &origin)?;
            if !visited.insert(obj) {
                continue;
            }
            let region = self
                .heap
                .region(obj.region)
                .map_err(|e| e.to_string())?;
            let data = region.data.read();
            let Some(o) = data.objects.get(obj.slot as usize) else {
                return Err(format!("{} no longer exists", obj));
            };
            for (i, child) in o.fields.iter().enumerate() {
                if let Value::Ref(child) = child {
                    stack.push((*child, format!("field {} of {}", i, obj)));
                }
            }
        }
        Ok(visited.len())
    }

    fn check_reference(&self, obj: ObjectRef, mode: VerifyMode, origin: &str) -> Result<ObjectRef, String> {
        let mut current = obj;
        loop {
            let region = self
                .heap
                .region(current.region)
                .map_err(|_| format!("{} references {} outside the heap", origin, current))?;
            match region.state() {
                RegionState::Empty | RegionState::Trash => {
                    return Err(format!(
                        "{} references {} in {} region",
                        origin,
                        current,
                        region.state().label()
                    ));
                }
                RegionState::Cset if mode != VerifyMode::Forwarding => {
                    return Err(format!(
                        "{} references {} in the collection set",
                        origin, current
                    ));
                }
                _ => {}
            }
            let data = region.data.read();
            let Some(o) = data.objects.get(current.slot as usize) else {
                return Err(format!("{} references missing object {}", origin, current));
            };
            match o.forwardee() {
                Some(to) if mode == VerifyMode::Forwarding => current = to,
                Some(to) => {
                    return Err(format!(
                        "{} references forwarded object {} (now at {})",
                        origin, current, to
                    ));
                }
                None => {
                    if mode == VerifyMode::Marked && !region.is_marked_or_new(current.slot) {
                        return Err(format!("{} references unmarked object {}", origin, current));
                    }
                    return Ok(current);
                }
            }
        }
    }

    /// Recompute per-region live bytes from the mark bitmaps and compare them
    /// with the marker's counts
    pub fn verify_live_counts(&self) -> Result<(), String> {
        for region in self.heap.regions() {
            if !matches!(region.state(), RegionState::Regular | RegionState::Archive) {
                continue;
            }
            let data = region.data.read();
            let recomputed: usize = data
                .objects
                .iter()
                .enumerate()
                .filter(|(slot, _)| region.is_marked_or_new(*slot as u32))
                .map(|(_, o)| o.size())
                .sum();
            if recomputed != region.live_bytes() {
                return Err(format!(
                    "region {} live bytes mismatch: marker counted {}, recomputed {}",
                    region.id(),
                    region.live_bytes(),
                    recomputed
                ));
            }
            if region.live_bytes() > region.capacity() {
                return Err(format!(
                    "region {} live bytes {} exceed capacity {}",
                    region.id(),
                    region.live_bytes(),
                    region.capacity()
                ));
            }
        }
        Ok(())
    }

    /// Check that no region is left in the collection set or trash state
    pub fn verify_no_cset(&self) -> Result<(), String> {
        match self
            .heap
            .regions()
            .iter()
            .find(|r| matches!(r.state(), RegionState::Cset | RegionState::Trash))
        {
            Some(r) => Err(format!("region {} left in {} state", r.id(), r.state().label())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassId;
    use crate::heap::HeapConfig;

    fn heap() -> Heap {
        Heap::new(HeapConfig {
            heap_size: 8 * 4096,
            region_size: 4096,
            compressed_refs: false,
            satb_buffer_size: 8,
            oom_during_evac_a_lot: false,
        })
    }

    #[test]
    fn test_reachable_graph_passes() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        let a = heap.allocate(&mut local, ClassId(1), 1, &[]).unwrap();
        let b = heap.allocate(&mut local, ClassId(1), 1, &[]).unwrap();
        heap.write_field(&mut local, a, 0, Value::Ref(b)).unwrap();
        heap.write_field(&mut local, b, 0, Value::Ref(a)).unwrap();

        let verifier = HeapVerifier::new(&heap);
        assert_eq!(
            verifier
                .verify_reachable(&[Value::Ref(a)], VerifyMode::Quiescent)
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_reference_into_free_region_fails() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        let a = heap.allocate(&mut local, ClassId(1), 0, &[]).unwrap();
        heap.recycle_region(a.region).unwrap();

        let err = HeapVerifier::new(&heap)
            .verify_reachable(&[Value::Ref(a)], VerifyMode::Quiescent)
            .unwrap_err();
        assert!(err.contains("empty region"), "{err}");
    }

    #[test]
    fn test_live_count_mismatch_detected() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        let a = heap.allocate(&mut local, ClassId(1), 0, &[]).unwrap();
        let region = heap.region(a.region).unwrap();
        region.capture_tams();
        region.bitmap.mark(a.slot);

        let verifier = HeapVerifier::new(&heap);
        assert!(verifier.verify_live_counts().is_err());
        region.set_live_bytes(heap.with_object(a, |_, o| o.size()).unwrap());
        assert!(verifier.verify_live_counts().is_ok());
    }

    #[test]
    fn test_unmarked_reachable_object_fails_marked_mode() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        let a = heap.allocate(&mut local, ClassId(1), 0, &[]).unwrap();
        heap.region(a.region).unwrap().capture_tams();

        let err = HeapVerifier::new(&heap)
            .verify_reachable(&[Value::Ref(a)], VerifyMode::Marked)
            .unwrap_err();
        assert!(err.contains("unmarked"), "{err}");
    }
}
