//! Mutator threads
//!
//! A [`Mutator`] is a thread's attachment to the collector: it owns the
//! thread's allocation regions, SATB buffer and root stack, and takes part in
//! safepoints. Object references held in Rust locals are only valid until the
//! mutator's next safepoint (any allocation, collection or poll); anything
//! that must survive one belongs on the root stack.

use super::{HeapError, ObjectRef, ThreadLocalHeap};
use crate::class::ClassId;
use crate::gc::{Collector, CycleReport, GcCause};
use crate::value::Value;
use crate::VmResult;
use parking_lot::Mutex;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

/// Per-mutator state shared with the collector
pub struct MutatorState {
    id: u64,
    /// Root stack scanned and updated at every pause
    pub roots: Mutex<Vec<Value>>,
    pub(crate) local: Mutex<ThreadLocalHeap>,
}

impl MutatorState {
    /// Create state for mutator `id`
    pub fn new(id: u64, satb_buffer_size: usize) -> Self {
        Self {
            id,
            roots: Mutex::new(Vec::new()),
            local: Mutex::new(ThreadLocalHeap::new(satb_buffer_size)),
        }
    }

    /// Mutator id
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A thread attached to the collector
///
/// Not `Sync`: a mutator belongs to exactly one thread.
pub struct Mutator {
    collector: Arc<Collector>,
    state: Arc<MutatorState>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Mutator {
    /// Register the calling thread as a mutator
    pub fn attach(collector: Arc<Collector>) -> Self {
        let state = Arc::new(MutatorState::new(
            collector.next_mutator_id(),
            collector.heap().satb_buffer_size(),
        ));
        collector.safepoint().register();
        collector.threads().add(state.clone());
        log::trace!("mutator {} attached", state.id());
        Self {
            collector,
            state,
            _not_sync: PhantomData,
        }
    }

    /// Mutator id
    pub fn id(&self) -> u64 {
        self.state.id()
    }

    /// The collector this mutator is attached to
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Safepoint poll
    #[inline]
    pub fn poll(&self) {
        self.collector.safepoint().poll();
    }

    /// Run `f` while counted as parked, e.g. while waiting on another thread
    pub fn blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.collector.safepoint().blocked(f)
    }

    /// Run an explicit collection and wait for it
    pub fn collect(&self) -> VmResult<CycleReport> {
        let collector = &self.collector;
        Ok(self.blocked(|| collector.collect(GcCause::Explicit))?)
    }

    // ===== Allocation =====

    /// Allocate an object with `field_count` null fields and a copy of
    /// `payload`
    ///
    /// When the heap is exhausted the collector runs a full compaction and
    /// the allocation is retried for as long as compactions leave free
    /// regions behind. `OutOfMemory` is only returned once a compaction run
    /// for this request left no empty region and the retry still failed.
    pub fn allocate(&self, class: ClassId, field_count: usize, payload: &[u8]) -> VmResult<ObjectRef> {
        self.poll();
        let heap = self.collector.heap();
        let mut seen = self.collector.compactions();
        let mut exhausted = false;
        loop {
            let (result, claimed) = {
                let mut local = self.state.local.lock();
                let before = local.tlab;
                let result = heap.allocate(&mut local, class, field_count, payload);
                let claimed = result.is_ok() && local.tlab != before;
                (result, claimed)
            };
            match result {
                Ok(obj) if claimed => return self.after_region_claim(obj),
                Ok(obj) => return Ok(obj),
                Err(HeapError::OutOfMemory { requested }) => {
                    if exhausted {
                        self.collector.report_out_of_memory(requested);
                        return Err(HeapError::OutOfMemory { requested }.into());
                    }
                    log::debug!(
                        "mutator {}: allocation of {} bytes failed, requesting collection",
                        self.id(),
                        requested
                    );
                    let collector = &self.collector;
                    let outcome = self.blocked(|| collector.handle_alloc_failure(seen))?;
                    exhausted = outcome.exhausted();
                    seen = self.collector.compactions();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Give the heuristics a chance to start a cycle after a new region was
    /// claimed, when no control thread does it
    fn after_region_claim(&self, obj: ObjectRef) -> VmResult<ObjectRef> {
        if self.collector.has_control_thread() || !self.collector.should_start_cycle() {
            return Ok(obj);
        }
        let collector = &self.collector;
        let ([kept], result) = self.park_with_roots([Value::Ref(obj)], || {
            collector.try_run_cycle(GcCause::Heuristics)
        });
        if let Some(Err(err)) = result {
            return Err(err.into());
        }
        Ok(kept.as_object().ok_or(HeapError::NotAnObject)?)
    }

    // ===== Object access =====

    /// Resolve a reference to the object's current location
    pub fn resolve(&self, obj: ObjectRef) -> VmResult<ObjectRef> {
        Ok(self.collector.heap().resolve(obj)?)
    }

    /// Identity comparison
    pub fn same_object(&self, a: ObjectRef, b: ObjectRef) -> VmResult<bool> {
        Ok(self.collector.heap().same_object(a, b)?)
    }

    /// Class of an object
    pub fn class_of(&self, obj: ObjectRef) -> VmResult<ClassId> {
        Ok(self.collector.heap().class_of(obj)?)
    }

    /// Number of fields of an object
    pub fn field_count(&self, obj: ObjectRef) -> VmResult<usize> {
        Ok(self.collector.heap().field_count(obj)?)
    }

    /// Payload length of an object
    pub fn payload_len(&self, obj: ObjectRef) -> VmResult<usize> {
        Ok(self.collector.heap().payload_len(obj)?)
    }

    /// Read a field
    pub fn read_field(&self, obj: ObjectRef, index: usize) -> VmResult<Value> {
        Ok(self.collector.heap().read_field(obj, index)?)
    }

    /// Read payload bytes
    pub fn read_payload(&self, obj: ObjectRef, offset: usize, len: usize) -> VmResult<Vec<u8>> {
        Ok(self.collector.heap().read_payload(obj, offset, len)?)
    }

    /// Write a field through the barriers
    ///
    /// If the object has to be copied first and no target space is left, the
    /// mutator waits for the (now cancelled) cycle to finish and retries.
    pub fn write_field(&self, obj: ObjectRef, index: usize, value: Value) -> VmResult<()> {
        let heap = self.collector.heap();
        let (mut obj, mut value) = (obj, value);
        loop {
            let result = heap.write_field(&mut self.state.local.lock(), obj, index, value);
            match result {
                Err(HeapError::EvacuationFailed) => {
                    let [o, v] = self.wait_out_cycle([Value::Ref(obj), value])?;
                    obj = o.as_object().ok_or(HeapError::NotAnObject)?;
                    value = v;
                }
                other => return Ok(other?),
            }
        }
    }

    /// Overwrite payload bytes through the barriers
    pub fn write_payload(&self, obj: ObjectRef, offset: usize, bytes: &[u8]) -> VmResult<()> {
        let heap = self.collector.heap();
        let mut obj = obj;
        loop {
            let result = heap.write_payload(&mut self.state.local.lock(), obj, offset, bytes);
            match result {
                Err(HeapError::EvacuationFailed) => {
                    let [o] = self.wait_out_cycle([Value::Ref(obj)])?;
                    obj = o.as_object().ok_or(HeapError::NotAnObject)?;
                }
                other => return Ok(other?),
            }
        }
    }

    fn wait_out_cycle<const N: usize>(&self, values: [Value; N]) -> VmResult<[Value; N]> {
        log::trace!("mutator {}: evacuation failed, waiting for the cycle", self.id());
        let collector = &self.collector;
        let (values, ()) = self.park_with_roots(values, || collector.wait_for_cycle_end());
        self.collector.check_fatal()?;
        Ok(values)
    }

    /// Keep `values` on the root stack while blocked in `f`, returning their
    /// possibly moved versions
    fn park_with_roots<const N: usize, R>(
        &self,
        values: [Value; N],
        f: impl FnOnce() -> R,
    ) -> ([Value; N], R) {
        let depth = {
            let mut roots = self.state.roots.lock();
            let depth = roots.len();
            roots.extend_from_slice(&values);
            depth
        };
        let result = self.blocked(f);
        let mut out = values;
        let mut roots = self.state.roots.lock();
        if let Some(slice) = roots.get(depth..depth + N) {
            out.copy_from_slice(slice);
        }
        roots.truncate(depth);
        (out, result)
    }

    // ===== Root stack =====

    /// Push a root, returning its index
    pub fn push_root(&self, value: Value) -> usize {
        let mut roots = self.state.roots.lock();
        roots.push(value);
        roots.len() - 1
    }

    /// Read a root
    pub fn root(&self, index: usize) -> Option<Value> {
        self.state.roots.lock().get(index).copied()
    }

    /// Overwrite a root; returns false if `index` is out of range
    pub fn set_root(&self, index: usize, value: Value) -> bool {
        match self.state.roots.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Pop the top root
    pub fn pop_root(&self) -> Option<Value> {
        self.state.roots.lock().pop()
    }

    /// Number of roots
    pub fn root_depth(&self) -> usize {
        self.state.roots.lock().len()
    }

    /// Drop roots above `depth`
    pub fn truncate_roots(&self, depth: usize) {
        self.state.roots.lock().truncate(depth);
    }

    /// Run `f` on the root stack
    ///
    /// `f` must not reach a safepoint.
    pub fn with_roots<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        f(&mut self.state.roots.lock())
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.state
            .local
            .lock()
            .satb
            .flush(self.collector.heap().satb());
        self.state.roots.lock().clear();
        self.collector.threads().remove(self.state.id());
        self.collector.safepoint().deregister();
        log::trace!("mutator {} detached", self.state.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::CollectorConfig;
    use crate::heap::HeapConfig;
    use crate::heuristics::HeuristicKind;
    use crate::VmError;
    use std::time::Duration;

    fn collector(kind: HeuristicKind, regions: usize) -> Arc<Collector> {
        Arc::new(Collector::new(
            HeapConfig {
                heap_size: regions * 4096,
                region_size: 4096,
                compressed_refs: false,
                satb_buffer_size: 8,
                oom_during_evac_a_lot: false,
            },
            kind.build(),
            CollectorConfig {
                workers: 1,
                verify: true,
                control_interval: Duration::from_millis(1),
                fatal_on_oom: false,
            },
        ))
    }

    #[test]
    fn test_roots_survive_collection() {
        let gc = collector(HeuristicKind::Aggressive, 16);
        let m = Mutator::attach(gc.clone());
        let a = m.allocate(ClassId(1), 1, b"a").unwrap();
        let idx = m.push_root(Value::Ref(a));
        let b = m.allocate(ClassId(1), 0, b"b").unwrap();
        let a = m.root(idx).and_then(|v| v.as_object()).unwrap();
        m.write_field(a, 0, Value::Ref(b)).unwrap();
        for _ in 0..20 {
            m.allocate(ClassId(1), 0, &[0; 300]).unwrap();
        }

        m.collect().unwrap();
        let a = m.root(idx).and_then(|v| v.as_object()).unwrap();
        let b = m.read_field(a, 0).unwrap().as_object().unwrap();
        assert_eq!(m.read_payload(a, 0, 1).unwrap(), b"a");
        assert_eq!(m.read_payload(b, 0, 1).unwrap(), b"b");
    }

    #[test]
    fn test_allocation_failure_collects_then_succeeds() {
        let gc = collector(HeuristicKind::Passive, 8);
        let m = Mutator::attach(gc.clone());
        // every object becomes garbage immediately
        for _ in 0..200 {
            m.allocate(ClassId(1), 0, &[0; 1000]).unwrap();
        }
        assert!(gc.stats().full_cycles > 0);
        assert!(gc.stats().allocation_failures > 0);
    }

    #[test]
    fn test_out_of_memory_when_everything_is_live() {
        let gc = collector(HeuristicKind::Passive, 4);
        let m = Mutator::attach(gc.clone());
        let err = loop {
            match m.allocate(ClassId(1), 0, &[0; 1000]) {
                Ok(obj) => {
                    m.push_root(Value::Ref(obj));
                }
                Err(err) => break err,
            }
        };
        assert!(matches!(err, VmError::Heap(HeapError::OutOfMemory { .. })));
        assert_eq!(m.root_depth(), 16);
    }

    #[test]
    fn test_drop_detaches() {
        let gc = collector(HeuristicKind::Static, 4);
        {
            let _m = Mutator::attach(gc.clone());
            assert_eq!(gc.threads().len(), 1);
            assert_eq!(gc.safepoint().registered(), 1);
        }
        assert_eq!(gc.threads().len(), 0);
        assert_eq!(gc.safepoint().registered(), 0);
    }
}
