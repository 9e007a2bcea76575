//! Parallel marking
//!
//! Marking sets one bit per reachable object below its region's
//! top-at-mark-start and accumulates live bytes per region. Objects above TAMS
//! were allocated during the cycle and are implicitly live, so they are
//! neither marked nor traced.
//!
//! Work is spread over a crossbeam work-stealing pool. Workers also drain the
//! global SATB queue, so overwritten references logged by the mutators are
//! traced while marking is still concurrent. A worker only gives up once every
//! worker is idle and both the shared queues and the SATB queue are empty.

use crate::defaults::MARK_STEP_OBJECTS;
use crate::heap::{Heap, ObjectRef, RegionState};
use crate::value::Value;
use crossbeam_deque::{Injector, Stealer, Worker};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Outcome of a marking pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The transitive closure is complete
    Complete,
    /// The cycle was cancelled before marking finished
    Cancelled,
}

/// Marks the object graph of a heap
pub struct Marker<'h> {
    heap: &'h Heap,
    workers: usize,
    traced: AtomicUsize,
}

impl<'h> Marker<'h> {
    /// Create a marker using `workers` threads
    pub fn new(heap: &'h Heap, workers: usize) -> Self {
        Self {
            heap,
            workers: workers.max(1),
            traced: AtomicUsize::new(0),
        }
    }

    /// Objects traced so far
    pub fn traced(&self) -> usize {
        self.traced.load(Ordering::Relaxed)
    }

    /// Mark a single object, returning true if it must now be traced
    pub fn try_mark(&self, obj: ObjectRef) -> bool {
        let region = match self.heap.region(obj.region) {
            Ok(r) => r,
            Err(_) => return false,
        };
        if matches!(region.state(), RegionState::Empty | RegionState::Trash) {
            return false;
        }
        if obj.slot >= region.tams() {
            return false;
        }
        region.bitmap.mark(obj.slot)
    }

    /// Mark a root value, collecting it into `grey` if newly marked
    pub fn mark_value(&self, value: Value, grey: &mut Vec<ObjectRef>) {
        if let Value::Ref(obj) = value {
            if self.try_mark(obj) {
                grey.push(obj);
            }
        }
    }

    /// Mark every archive object and collect their referents
    pub fn mark_archive_objects(&self, grey: &mut Vec<ObjectRef>) {
        for region in self.heap.archive_regions() {
            let count = region.data.read().objects.len() as u32;
            for slot in 0..count {
                let obj = ObjectRef::new(region.id(), slot);
                if self.try_mark(obj) {
                    grey.push(obj);
                }
            }
        }
    }

    /// Trace from `seeds` (already marked) until the closure is complete
    ///
    /// With `cancellable`, workers stop early once the heap's cancellation
    /// flag is raised.
    pub fn drain(&self, seeds: Vec<ObjectRef>, cancellable: bool) -> MarkOutcome {
        let injector = Injector::new();
        for obj in seeds {
            injector.push(obj);
        }
        let locals: Vec<Worker<ObjectRef>> =
            (0..self.workers).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<ObjectRef>> = locals.iter().map(|w| w.stealer()).collect();
        let idle = AtomicUsize::new(0);
        let cancelled = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for local in locals {
                let injector = &injector;
                let stealers = &stealers;
                let idle = &idle;
                let cancelled = &cancelled;
                scope.spawn(move || {
                    self.worker_loop(local, injector, stealers, idle, cancelled, cancellable)
                });
            }
        });

        if cancelled.load(Ordering::Acquire) {
            MarkOutcome::Cancelled
        } else {
            MarkOutcome::Complete
        }
    }

    fn worker_loop(
        &self,
        local: Worker<ObjectRef>,
        injector: &Injector<ObjectRef>,
        stealers: &[Stealer<ObjectRef>],
        idle: &AtomicUsize,
        cancelled: &AtomicBool,
        cancellable: bool,
    ) {
        let mut children = Vec::new();
        let mut traced = 0usize;
        loop {
            if cancellable && self.heap.is_cancelled() {
                cancelled.store(true, Ordering::Release);
                return;
            }
            if cancelled.load(Ordering::Acquire) {
                return;
            }

            if let Some(obj) = self.find_task(&local, injector, stealers) {
                self.trace(obj, &mut children);
                for child in children.drain(..) {
                    local.push(child);
                }
                traced += 1;
                if traced % MARK_STEP_OBJECTS == 0 {
                    self.drain_satb(&local);
                }
                continue;
            }

            idle.fetch_add(1, Ordering::AcqRel);
            loop {
                if idle.load(Ordering::Acquire) == self.workers {
                    return;
                }
                if cancelled.load(Ordering::Acquire)
                    || (cancellable && self.heap.is_cancelled())
                {
                    cancelled.store(true, Ordering::Release);
                    return;
                }
                if !injector.is_empty()
                    || stealers.iter().any(|s| !s.is_empty())
                    || !self.heap.satb().is_empty()
                {
                    idle.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
                std::thread::yield_now();
            }
        }
    }

    fn find_task(
        &self,
        local: &Worker<ObjectRef>,
        injector: &Injector<ObjectRef>,
        stealers: &[Stealer<ObjectRef>],
    ) -> Option<ObjectRef> {
        if let Some(obj) = local.pop() {
            return Some(obj);
        }
        let stolen = std::iter::repeat_with(|| {
            injector
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(|s| s.steal()).collect())
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success());
        if stolen.is_some() {
            return stolen;
        }

        self.drain_satb(local);
        local.pop()
    }

    /// Pull overwritten references logged by the SATB barrier
    fn drain_satb(&self, local: &Worker<ObjectRef>) {
        for record in self.heap.satb().drain() {
            if self.try_mark(record.value) {
                local.push(record.value);
            }
        }
    }

    fn trace(&self, obj: ObjectRef, children: &mut Vec<ObjectRef>) {
        let region = match self.heap.region(obj.region) {
            Ok(r) => r,
            Err(_) => return,
        };
        {
            let data = region.data.read();
            let o = match data.objects.get(obj.slot as usize) {
                Some(o) => o,
                None => return,
            };
            region.add_live_bytes(o.size());
            for child in o.references() {
                if self.try_mark(child) {
                    children.push(child);
                }
            }
        }
        self.traced.fetch_add(1, Ordering::Relaxed);
    }
}
