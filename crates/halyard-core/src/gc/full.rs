//! Stop-the-world mark-compact
//!
//! Used for full cycles and to finish cancelled (degenerated) cycles. It runs
//! entirely inside a pause and copes with whatever the cancelled cycle left
//! behind: forwarded collection-set objects are resolved through their
//! forwarding pointers, then every live object outside the archive regions is
//! slid down in region-id order and all references are rewritten.

use super::evacuation::ForwardingMap;
use crate::heap::{Heap, HeapError, HeapObject, ObjectRef, RegionState};
use crate::value::Value;

/// Visitor over every root slot
pub type RootVisitor<'a> = dyn FnMut(&mut dyn FnMut(&mut Value)) + 'a;

/// Result of a mark-compact
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    /// Live bytes after compaction
    pub live_bytes: usize,
    /// Bytes reclaimed
    pub reclaimed_bytes: usize,
    /// Live objects found
    pub live_objects: usize,
    /// Objects that changed location
    pub moved_objects: usize,
    /// Regions returned to the free set
    pub regions_freed: usize,
    /// Empty regions once compaction finished
    pub free_regions: usize,
}

/// Mark from the roots and compact the heap
///
/// Must run while every mutator is stopped.
pub fn mark_compact(heap: &Heap, visit_roots: &mut RootVisitor<'_>) -> Result<CompactionResult, HeapError> {
    let used_before = heap.recompute_used();
    let occupied_before = heap
        .regions()
        .iter()
        .filter(|r| r.state() != RegionState::Empty)
        .count();

    // Leftover forwarding pointers from a cancelled evacuation
    let mut stale = ForwardingMap::default();
    for region in heap.regions() {
        let mut data = region.data.write();
        for (slot, obj) in data.objects.iter_mut().enumerate() {
            if let Some(to) = obj.forwardee() {
                stale.insert(ObjectRef::new(region.id(), slot as u32), to);
                obj.clear_forwardee();
            }
        }
    }
    let resolve = |mut obj: ObjectRef| {
        while let Some(&to) = stale.get(&obj) {
            obj = to;
        }
        obj
    };

    // Mark
    for region in heap.regions() {
        region.capture_tams();
    }
    let mut stack = Vec::new();
    visit_roots(&mut |value: &mut Value| {
        if let Value::Ref(obj) = value {
            mark_ref(heap, resolve(*obj), &mut stack);
        }
    });
    for region in heap.archive_regions() {
        let count = region.data.read().objects.len() as u32;
        for slot in 0..count {
            mark_ref(heap, ObjectRef::new(region.id(), slot), &mut stack);
        }
    }
    let mut children = Vec::new();
    while let Some(obj) = stack.pop() {
        let region = heap.region(obj.region)?;
        {
            let data = region.data.read();
            if let Some(o) = data.objects.get(obj.slot as usize) {
                children.extend(o.references().map(resolve));
            }
        }
        for child in children.drain(..) {
            mark_ref(heap, child, &mut stack);
        }
    }

    // Plan new locations, sliding live objects down in region-id order
    let compactable: Vec<usize> = heap
        .regions()
        .iter()
        .filter(|r| r.state() != RegionState::Archive)
        .map(|r| r.id().index())
        .collect();
    let mut position = vec![usize::MAX; heap.region_count()];
    for (k, &index) in compactable.iter().enumerate() {
        position[index] = k;
    }

    let region_size = heap.region_size();
    let mut forwarding = ForwardingMap::default();
    let mut cursor = (0usize, 0usize, 0u32);
    let mut live_objects = 0;
    for &index in &compactable {
        let region = &heap.regions()[index];
        let data = region.data.read();
        for (slot, obj) in data.objects.iter().enumerate() {
            if !region.bitmap.is_marked(slot as u32) {
                continue;
            }
            let size = obj.size();
            if cursor.1 + size > region_size {
                cursor = (cursor.0 + 1, 0, 0);
            }
            let dest = compactable
                .get(cursor.0)
                .ok_or(HeapError::OutOfMemory { requested: size })?;
            forwarding.insert(
                ObjectRef::new(region.id(), slot as u32),
                ObjectRef::new(heap.regions()[*dest].id(), cursor.2),
            );
            cursor.1 += size;
            cursor.2 += 1;
            live_objects += 1;
        }
    }

    // Move
    let mut destinations: Vec<Vec<HeapObject>> = vec![Vec::new(); compactable.len()];
    let mut moved_objects = 0;
    for &index in &compactable {
        let region = &heap.regions()[index];
        let objects = {
            let mut data = region.data.write();
            data.used = 0;
            std::mem::take(&mut data.objects)
        };
        for (slot, mut obj) in objects.into_iter().enumerate() {
            let from = ObjectRef::new(region.id(), slot as u32);
            let Some(&to) = forwarding.get(&from) else {
                continue;
            };
            if to != from {
                moved_objects += 1;
            }
            obj.header.mark = obj.header.mark.incremented();
            destinations[position[to.region.index()]].push(obj);
        }
    }

    // Rewrite references
    let relocate = |value: &mut Value| {
        if let Value::Ref(obj) = value {
            let resolved = resolve(*obj);
            *obj = forwarding.get(&resolved).copied().unwrap_or(resolved);
        }
    };
    for objects in destinations.iter_mut() {
        for obj in objects.iter_mut() {
            obj.fields.iter_mut().for_each(relocate);
        }
    }
    for region in heap.archive_regions() {
        let mut data = region.data.write();
        for obj in data.objects.iter_mut() {
            obj.fields.iter_mut().for_each(relocate);
        }
        let used = data.used;
        drop(data);
        region.reset_mark_state(used);
    }
    visit_roots(&mut |value: &mut Value| relocate(value));

    // Install and fix region states
    let mut live_bytes = 0;
    for (k, objects) in destinations.into_iter().enumerate() {
        let region = &heap.regions()[compactable[k]];
        if objects.is_empty() {
            region.recycle();
            continue;
        }
        let used: usize = objects.iter().map(|o| o.size()).sum();
        {
            let mut data = region.data.write();
            data.objects = objects;
            data.used = used;
        }
        region.set_state(RegionState::Regular);
        region.reset_mark_state(used);
        region.note_survived();
        live_bytes += used;
    }
    heap.rebuild_free_set();
    let used_after = heap.recompute_used();
    let occupied_after = heap
        .regions()
        .iter()
        .filter(|r| r.state() != RegionState::Empty)
        .count();

    Ok(CompactionResult {
        live_bytes,
        reclaimed_bytes: used_before.saturating_sub(used_after),
        live_objects,
        moved_objects,
        regions_freed: occupied_before.saturating_sub(occupied_after),
        free_regions: heap.free_region_count(),
    })
}

fn mark_ref(heap: &Heap, obj: ObjectRef, stack: &mut Vec<ObjectRef>) {
    let region = match heap.region(obj.region) {
        Ok(r) => r,
        Err(_) => return,
    };
    if matches!(region.state(), RegionState::Empty | RegionState::Trash) {
        return;
    }
    if obj.slot < region.tams() && region.bitmap.mark(obj.slot) {
        stack.push(obj);
    }
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
    fn test_compacts_live_objects_and_rewrites_roots() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        let mut roots = Vec::new();
        for i in 0..12 {
            let obj = heap.allocate(&mut local, ClassId(1), 1, &[i as u8; 1000]).unwrap();
            if i % 3 == 0 {
                roots.push(Value::Ref(obj));
            }
        }
        let used_before = heap.used();

        let result = mark_compact(&heap, &mut |f: &mut dyn FnMut(&mut Value)| roots.iter_mut().for_each(|v| f(v))).unwrap();
        assert_eq!(result.live_objects, 4);
        assert!(result.reclaimed_bytes > 0);
        assert!(heap.used() < used_before);

        for (i, root) in roots.iter().enumerate() {
            let obj = root.as_object().unwrap();
            let payload = heap.read_payload(obj, 0, 1).unwrap();
            assert_eq!(payload[0], (i * 3) as u8);
        }
        // four 1024-byte objects pack exactly into the first region
        assert_eq!(heap.regions()[0].data.read().objects.len(), 4);
        assert_eq!(heap.free_region_count(), heap.region_count() - 1);
    }

    #[test]
    fn test_resolves_leftover_forwarding() {
        let heap = heap();
        let mut local = heap.new_thread_local();
        let holder = heap.allocate(&mut local, ClassId(1), 1, &[]).unwrap();
        local.tlab = None;
        let target = heap.allocate(&mut local, ClassId(1), 0, b"xyz").unwrap();
        heap.write_field(&mut local, holder, 0, Value::Ref(target)).unwrap();

        // a cancelled cycle copied `target` but never updated `holder`
        heap.region(target.region).unwrap().set_state(RegionState::Cset);
        heap.set_gc_state(gc_state::EVACUATION);
        let mut gclab = None;
        heap.evacuate_object(&mut gclab, target).unwrap();
        heap.set_gc_state(gc_state::IDLE);

        let mut roots = vec![Value::Ref(holder)];
        mark_compact(&heap, &mut |f: &mut dyn FnMut(&mut Value)| roots.iter_mut().for_each(|v| f(v))).unwrap();

        let holder = roots[0].as_object().unwrap();
        let target = heap.read_field(holder, 0).unwrap().as_object().unwrap();
        assert_eq!(heap.read_payload(target, 0, 3).unwrap(), b"xyz");
        assert!(heap
            .regions()
            .iter()
            .all(|r| r.state() != RegionState::Cset));
    }

    #[test]
    fn test_archive_objects_stay_pinned() {
        let heap = heap();
        let placements = heap.reserve_archive_space(&[24]).unwrap();
        heap.install_archive_objects(&placements, vec![HeapObject::new(ClassId(1), 1, &[], 8)])
            .unwrap();
        let mut local = heap.new_thread_local();
        let child = heap.allocate(&mut local, ClassId(1), 0, b"c").unwrap();
        heap.write_field(&mut local, placements[0], 0, Value::Ref(child))
            .unwrap();

        mark_compact(&heap, &mut |_: &mut dyn FnMut(&mut Value)| {}).unwrap();

        let child = heap.read_field(placements[0], 0).unwrap().as_object().unwrap();
        assert_eq!(heap.read_payload(child, 0, 1).unwrap(), b"c");
        assert_eq!(heap.archive_regions().count(), 1);
    }
}
