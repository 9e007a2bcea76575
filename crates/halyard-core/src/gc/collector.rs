//! Collector driver
//!
//! Owns the heap, the safepoint coordinator, the mutator registry and the
//! root providers, and sequences the phases of each cycle. Cycles are
//! serialized by a cycle lock; they run either on the GC control thread or,
//! when there is none, on the mutator that asked for them.

use super::control::ControlRequest;
use super::evacuation::{self, CollectionSet};
use super::full::{self, CompactionResult};
use super::marking::{MarkOutcome, Marker};
use super::phase::{CycleKind, GcCause, GcPhase, PhaseTimings, TimedPhase};
use super::roots::{RootProvider, ThreadRegistry};
use super::verifier::{HeapVerifier, VerifyMode};
use super::GcError;
use crate::config::VmOptions;
use crate::defaults::ALLOC_RATE_DECAY;
use crate::heap::{gc_state, Heap, HeapConfig, HeapDump, RegionState};
use crate::heuristics::{CycleMode, HeapStatistics, Heuristics};
use crate::safepoint::{SafepointCoordinator, StopReason};
use crate::value::Value;
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Collector tuning
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Parallel marking workers
    pub workers: usize,
    /// Verify the heap after every phase
    pub verify: bool,
    /// How often the control thread consults the heuristics
    pub control_interval: Duration,
    /// Log a heap dump when allocation fails after a full collection
    pub fatal_on_oom: bool,
}

impl CollectorConfig {
    /// Derive collector settings from VM options
    pub fn from_options(options: &VmOptions) -> Self {
        Self {
            workers: options.concurrent_workers.max(1),
            verify: options.verify,
            control_interval: Duration::from_millis(options.control_interval_ms.max(1)),
            fatal_on_oom: options.fatal_on_oom,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::from_options(&VmOptions::default())
    }
}

/// Summary of one completed cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// How the cycle ran
    pub kind: CycleKind,
    /// Why it ran
    pub cause: GcCause,
    /// Step durations
    pub timings: PhaseTimings,
    /// Heap usage when the cycle started
    pub used_before: usize,
    /// Heap usage when the cycle ended
    pub used_after: usize,
    /// Live bytes found
    pub live_bytes: usize,
    /// Regions evacuated
    pub cset_regions: usize,
    /// Regions reclaimed at Final Mark without evacuation
    pub immediate_regions: usize,
    /// Objects copied by the collector
    pub evacuated_objects: usize,
    /// Empty regions when the cycle's last pause ended
    pub free_regions: usize,
    /// Heap references rewritten during update refs
    pub updated_references: usize,
    /// Wall-clock duration
    pub duration: Duration,
}

impl CycleReport {
    fn new(kind: CycleKind, cause: GcCause, used_before: usize) -> Self {
        Self {
            kind,
            cause,
            timings: PhaseTimings::new(),
            used_before,
            used_after: used_before,
            live_bytes: 0,
            cset_regions: 0,
            immediate_regions: 0,
            evacuated_objects: 0,
            free_regions: 0,
            updated_references: 0,
            duration: Duration::ZERO,
        }
    }

    /// Bytes freed by the cycle
    pub fn reclaimed(&self) -> usize {
        self.used_before.saturating_sub(self.used_after)
    }
}

/// What an allocation-failure request found once it was serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFailureOutcome {
    /// A full compaction ran for this request
    Compacted {
        /// Empty regions left when its pause ended
        free_regions: usize,
    },
    /// A compaction newer than the request had already finished
    AlreadyCompacted,
}

impl AllocFailureOutcome {
    /// Whether the request's own compaction left no region to allocate into
    pub fn exhausted(&self) -> bool {
        matches!(self, AllocFailureOutcome::Compacted { free_regions: 0 })
    }
}

/// Garbage collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections
    pub collections: u64,

    /// Concurrent cycles that ran to completion
    pub concurrent_cycles: u64,

    /// Cancelled cycles finished stop-the-world
    pub degenerated_cycles: u64,

    /// Full stop-the-world collections
    pub full_cycles: u64,

    /// Total bytes freed
    pub bytes_reclaimed: u64,

    /// Total objects copied by the collector
    pub objects_evacuated: u64,

    /// Total pause time
    pub total_pause_time: Duration,

    /// Longest single pause
    pub max_pause_time: Duration,

    /// Total wall-clock time of completed concurrent cycles
    pub concurrent_cycle_time: Duration,

    /// Allocation failures reported by mutators
    pub allocation_failures: u64,

    /// Most recent cycle
    pub last_cycle: Option<CycleReport>,
}

impl GcStats {
    fn record(&mut self, report: &CycleReport) {
        self.collections += 1;
        match report.kind {
            CycleKind::Concurrent => {
                self.concurrent_cycles += 1;
                self.concurrent_cycle_time += report.duration;
            }
            CycleKind::Degenerated => self.degenerated_cycles += 1,
            CycleKind::Full => self.full_cycles += 1,
        }
        self.bytes_reclaimed += report.reclaimed() as u64;
        self.objects_evacuated += report.evacuated_objects as u64;
        self.total_pause_time += report.timings.total_pause();
        self.max_pause_time = self.max_pause_time.max(report.timings.max_pause());
        self.last_cycle = Some(report.clone());
    }

    /// Average duration of completed concurrent cycles
    pub fn average_cycle_time(&self) -> Duration {
        if self.concurrent_cycles == 0 {
            return Duration::ZERO;
        }
        self.concurrent_cycle_time / self.concurrent_cycles as u32
    }
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "collections: {} ({} concurrent, {} degenerated, {} full)",
            self.collections, self.concurrent_cycles, self.degenerated_cycles, self.full_cycles
        )?;
        writeln!(f, "reclaimed: {} bytes", self.bytes_reclaimed)?;
        writeln!(f, "evacuated: {} objects", self.objects_evacuated)?;
        writeln!(
            f,
            "pauses: total {:.3}ms, max {:.3}ms",
            self.total_pause_time.as_secs_f64() * 1000.0,
            self.max_pause_time.as_secs_f64() * 1000.0
        )?;
        write!(f, "allocation failures: {}", self.allocation_failures)
    }
}

struct AllocTracker {
    sample_total: u64,
    sample_at: Instant,
    rate: f64,
    total_at_cycle_end: u64,
    cycle_end_at: Instant,
    live_after_last_cycle: usize,
}

impl AllocTracker {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            sample_total: 0,
            sample_at: now,
            rate: 0.0,
            total_at_cycle_end: 0,
            cycle_end_at: now,
            live_after_last_cycle: 0,
        }
    }

    fn sample(&mut self, total: u64, now: Instant) {
        let elapsed = now.duration_since(self.sample_at).as_secs_f64();
        if elapsed < 0.001 {
            return;
        }
        let instant = total.saturating_sub(self.sample_total) as f64 / elapsed;
        self.rate = if self.rate == 0.0 {
            instant
        } else {
            ALLOC_RATE_DECAY * instant + (1.0 - ALLOC_RATE_DECAY) * self.rate
        };
        self.sample_total = total;
        self.sample_at = now;
    }
}

#[derive(Default)]
struct CycleState {
    running: bool,
    completed: u64,
    compactions: u64,
}

struct RemarkResult {
    cset: CollectionSet,
    immediate_regions: usize,
    live_bytes: usize,
}

/// The garbage collector
pub struct Collector {
    heap: Heap,
    safepoint: SafepointCoordinator,
    threads: ThreadRegistry,
    providers: RwLock<Vec<Arc<dyn RootProvider>>>,
    heuristics: Box<dyn Heuristics>,
    config: CollectorConfig,
    cycle_lock: Mutex<()>,
    phase: Mutex<GcPhase>,
    cycle: Mutex<CycleState>,
    cycle_done: Condvar,
    stats: Mutex<GcStats>,
    alloc: Mutex<AllocTracker>,
    control: Mutex<Option<Sender<ControlRequest>>>,
    fatal: Mutex<Option<GcError>>,
    next_mutator_id: AtomicU64,
}

impl Collector {
    /// Create a collector over a fresh heap
    pub fn new(heap: HeapConfig, heuristics: Box<dyn Heuristics>, config: CollectorConfig) -> Self {
        log::debug!(
            "collector: {} heuristics, {} workers{}",
            heuristics.name(),
            config.workers,
            if config.verify { ", verifying" } else { "" }
        );
        Self {
            heap: Heap::new(heap),
            safepoint: SafepointCoordinator::new(),
            threads: ThreadRegistry::new(),
            providers: RwLock::new(Vec::new()),
            heuristics,
            config,
            cycle_lock: Mutex::new(()),
            phase: Mutex::new(GcPhase::Idle),
            cycle: Mutex::new(CycleState::default()),
            cycle_done: Condvar::new(),
            stats: Mutex::new(GcStats::default()),
            alloc: Mutex::new(AllocTracker::new()),
            control: Mutex::new(None),
            fatal: Mutex::new(None),
            next_mutator_id: AtomicU64::new(1),
        }
    }

    /// Create a collector from VM options
    pub fn from_options(options: &VmOptions) -> Self {
        Self::new(
            HeapConfig::from_options(options),
            options.heuristics.build(),
            CollectorConfig::from_options(options),
        )
    }

    /// The heap
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The safepoint coordinator
    pub fn safepoint(&self) -> &SafepointCoordinator {
        &self.safepoint
    }

    /// Registered mutators
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Active heuristics
    pub fn heuristics(&self) -> &dyn Heuristics {
        self.heuristics.as_ref()
    }

    /// Collector settings
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Current phase
    pub fn phase(&self) -> GcPhase {
        *self.phase.lock()
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Cycles completed so far
    pub fn cycles_completed(&self) -> u64 {
        self.cycle.lock().completed
    }

    /// Stop-the-world compactions (degenerated and full cycles) so far
    pub fn compactions(&self) -> u64 {
        self.cycle.lock().compactions
    }

    /// Check whether a cycle is in progress
    pub fn is_cycle_running(&self) -> bool {
        self.cycle.lock().running
    }

    /// Add a root source scanned at every pause
    pub fn register_root_provider(&self, provider: Arc<dyn RootProvider>) {
        log::debug!("registered root provider '{}'", provider.name());
        self.providers.write().push(provider);
    }

    pub(crate) fn next_mutator_id(&self) -> u64 {
        self.next_mutator_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn attach_control(&self, sender: Sender<ControlRequest>) {
        *self.control.lock() = Some(sender);
    }

    pub(crate) fn detach_control(&self) -> Option<Sender<ControlRequest>> {
        self.control.lock().take()
    }

    /// Check whether a GC control thread services requests
    pub fn has_control_thread(&self) -> bool {
        self.control.lock().is_some()
    }

    /// Heap signals for the heuristics
    pub fn heap_statistics(&self) -> HeapStatistics {
        let now = Instant::now();
        let total = self.heap.total_allocated();
        let mut tracker = self.alloc.lock();
        tracker.sample(total, now);
        let (cycles_completed, avg_cycle_time) = {
            let stats = self.stats.lock();
            (stats.collections, stats.average_cycle_time())
        };
        HeapStatistics {
            capacity: self.heap.capacity(),
            used: self.heap.used(),
            free: self.heap.free_bytes(),
            live_after_last_cycle: tracker.live_after_last_cycle,
            allocated_since_last_cycle: total.saturating_sub(tracker.total_at_cycle_end) as usize,
            allocation_rate: tracker.rate,
            avg_cycle_time,
            cycles_completed,
            time_since_last_cycle: now.duration_since(tracker.cycle_end_at),
        }
    }

    /// Ask the heuristics whether a cycle should start now
    pub fn should_start_cycle(&self) -> bool {
        if self.fatal.lock().is_some() || self.is_cycle_running() {
            return false;
        }
        let stats = self.heap_statistics();
        self.heuristics.should_start_cycle(&stats)
    }

    /// Run a cycle and wait for it
    ///
    /// With a control thread the request is handed to it; otherwise the cycle
    /// runs on the calling thread. A registered mutator must call this
    /// through [`SafepointCoordinator::blocked`].
    pub fn collect(&self, cause: GcCause) -> Result<CycleReport, GcError> {
        self.check_fatal()?;
        let sender = self.control.lock().clone();
        if let Some(tx) = sender {
            let (reply, rx) = channel::bounded(1);
            if tx.send(ControlRequest::Explicit { cause, reply }).is_ok() {
                if let Ok(result) = rx.recv() {
                    return result;
                }
            }
            // control thread shut down meanwhile
        }
        self.run_cycle(cause)
    }

    /// Run a cycle on the calling thread
    pub(crate) fn run_cycle(&self, cause: GcCause) -> Result<CycleReport, GcError> {
        self.check_fatal()?;
        let _cycle = self.cycle_lock.lock();
        self.run_cycle_locked(cause, self.heuristics.cycle_mode())
    }

    /// Run a cycle unless one is already in progress
    pub(crate) fn try_run_cycle(&self, cause: GcCause) -> Option<Result<CycleReport, GcError>> {
        let _cycle = self.cycle_lock.try_lock()?;
        Some(self.run_cycle_locked(cause, self.heuristics.cycle_mode()))
    }

    /// Handle a failed mutator allocation
    ///
    /// Cancels a running concurrent cycle and makes sure a stop-the-world
    /// compaction completed after `seen_compactions` was observed. A
    /// registered mutator must call this through
    /// [`SafepointCoordinator::blocked`].
    pub fn handle_alloc_failure(&self, seen_compactions: u64) -> Result<AllocFailureOutcome, GcError> {
        self.check_fatal()?;
        self.stats.lock().allocation_failures += 1;
        if self.is_cycle_running() && self.heap.cancel_gc() {
            log::debug!("allocation failure: cancelling the running cycle");
        }
        let sender = self.control.lock().clone();
        if let Some(tx) = sender {
            let (reply, rx) = channel::bounded(1);
            let request = ControlRequest::AllocationFailure {
                seen_compactions,
                reply,
            };
            if tx.send(request).is_ok() {
                if let Ok(result) = rx.recv() {
                    return result;
                }
            }
        }
        self.compact_after_alloc_failure(seen_compactions)
    }

    pub(crate) fn compact_after_alloc_failure(
        &self,
        seen_compactions: u64,
    ) -> Result<AllocFailureOutcome, GcError> {
        self.check_fatal()?;
        let _cycle = self.cycle_lock.lock();
        if self.compactions() > seen_compactions {
            return Ok(AllocFailureOutcome::AlreadyCompacted);
        }
        let report = self.run_cycle_locked(GcCause::AllocationFailure, CycleMode::Full)?;
        Ok(AllocFailureOutcome::Compacted {
            free_regions: report.free_regions,
        })
    }

    /// Block until no cycle is running
    pub fn wait_for_cycle_end(&self) {
        let mut cycle = self.cycle.lock();
        while cycle.running {
            self.cycle_done.wait(&mut cycle);
        }
    }

    /// Log a heap dump for an allocation that failed after a full collection
    pub fn report_out_of_memory(&self, requested: usize) {
        if self.config.fatal_on_oom {
            log::error!(
                "out of memory allocating {} bytes after a full collection\n{}",
                requested,
                self.dump()
            );
        } else {
            log::warn!(
                "out of memory allocating {} bytes after a full collection",
                requested
            );
        }
    }

    /// Heap state with collector context
    pub fn dump(&self) -> HeapDump {
        let mut dump = self.heap.dump();
        dump.phase = self.phase().name().to_string();
        dump.cycles = self.cycles_completed();
        dump
    }

    /// Visit every root slot (mutator stacks and registered providers)
    ///
    /// Only sound while mutators are stopped.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        self.threads.visit_roots(visitor);
        for provider in self.providers.read().iter() {
            provider.visit_roots(visitor);
        }
    }

    /// Verify the heap inside a pause, outside any cycle
    pub fn verify_heap(&self) -> Result<usize, GcError> {
        self.check_fatal()?;
        let _cycle = self.cycle_lock.lock();
        let _pause = self.safepoint.begin_pause(StopReason::Verification);
        let roots = self.collect_roots();
        HeapVerifier::new(&self.heap)
            .verify_reachable(&roots, VerifyMode::Quiescent)
            .map_err(|message| self.verification_failure(GcPhase::Idle, message))
    }

    // ===== Cycle driver =====

    fn run_cycle_locked(&self, cause: GcCause, mode: CycleMode) -> Result<CycleReport, GcError> {
        self.check_fatal()?;
        self.cycle.lock().running = true;
        let start = Instant::now();
        let used_before = self.heap.recompute_used();
        log::debug!("GC cycle starting ({}, {} heuristics)", cause, self.heuristics.name());

        let result = match mode {
            CycleMode::Full => {
                let report = CycleReport::new(CycleKind::Full, cause, used_before);
                self.stw_collect(report, start)
            }
            CycleMode::Concurrent => self.concurrent_cycle(cause, start, used_before),
        };
        self.end_cycle(&result);
        result
    }

    fn end_cycle(&self, result: &Result<CycleReport, GcError>) {
        match result {
            Ok(report) => {
                self.stats.lock().record(report);
                {
                    let mut tracker = self.alloc.lock();
                    tracker.total_at_cycle_end = self.heap.total_allocated();
                    tracker.cycle_end_at = Instant::now();
                    tracker.live_after_last_cycle = report.live_bytes;
                }
                self.set_phase(GcPhase::Idle);
                let capacity = self.heap.capacity();
                log::info!(
                    "GC({}) {:?} ({}, {}): {}K->{}K({}K), {} cset regions, pauses {:.3}ms, {:.3}ms",
                    self.cycles_completed() + 1,
                    report.kind,
                    report.cause,
                    self.heuristics.name(),
                    report.used_before / 1024,
                    report.used_after / 1024,
                    capacity / 1024,
                    report.cset_regions,
                    report.timings.total_pause().as_secs_f64() * 1000.0,
                    report.duration.as_secs_f64() * 1000.0
                );
                log::debug!("GC phases: {}", report.timings);
            }
            Err(err) => {
                if err.is_fatal() {
                    *self.fatal.lock() = Some(err.clone());
                }
                *self.phase.lock() = GcPhase::Idle;
                log::error!("GC cycle failed: {}", err);
            }
        }

        let mut cycle = self.cycle.lock();
        cycle.running = false;
        if let Ok(report) = result {
            cycle.completed += 1;
            if report.kind != CycleKind::Concurrent {
                cycle.compactions += 1;
            }
        }
        self.cycle_done.notify_all();
    }

    fn concurrent_cycle(
        &self,
        cause: GcCause,
        start: Instant,
        used_before: usize,
    ) -> Result<CycleReport, GcError> {
        let heap = &self.heap;
        let mut report = CycleReport::new(CycleKind::Concurrent, cause, used_before);
        let mut timings = PhaseTimings::new();
        let marker = Marker::new(heap, self.config.workers);

        self.set_phase(GcPhase::MarkStart);
        let grey = self.pause(TimedPhase::InitMark, &mut timings, || {
            heap.clear_cancelled();
            heap.satb().clear();
            self.threads.for_each_local(|local| local.satb.clear());
            for region in heap.regions() {
                region.capture_tams();
            }
            heap.set_gc_state(gc_state::MARKING);
            let mut grey = Vec::new();
            self.visit_roots(&mut |value: &mut Value| marker.mark_value(*value, &mut grey));
            marker.mark_archive_objects(&mut grey);
            grey
        });

        self.set_phase(GcPhase::ConcurrentMark);
        let started = Instant::now();
        let outcome = marker.drain(grey, true);
        timings.record(TimedPhase::ConcurrentMark, started.elapsed());
        if outcome == MarkOutcome::Cancelled || heap.is_cancelled() {
            log::info!("concurrent mark cancelled; degenerating");
            report.kind = CycleKind::Degenerated;
            report.timings = timings;
            return self.stw_collect(report, start);
        }

        self.set_phase(GcPhase::Remark);
        let remark = self.pause(TimedPhase::FinalMark, &mut timings, || self.final_mark(&marker))?;
        report.live_bytes = remark.live_bytes;
        report.immediate_regions = remark.immediate_regions;
        report.cset_regions = remark.cset.regions.len();

        if remark.cset.is_empty() {
            self.set_phase(GcPhase::CleanUp);
        } else {
            self.set_phase(GcPhase::Evacuate);
            let started = Instant::now();
            let mut gclab = None;
            match evacuation::evacuate_collection_set(heap, &remark.cset, &mut gclab) {
                Ok(copied) => report.evacuated_objects = copied,
                Err(err) => {
                    log::debug!("collector evacuation stopped: {}", err);
                    heap.cancel_gc();
                }
            }
            timings.record(TimedPhase::ConcurrentEvacuation, started.elapsed());
            if heap.is_cancelled() {
                log::info!("evacuation failed; degenerating");
                report.kind = CycleKind::Degenerated;
                report.timings = timings;
                return self.stw_collect(report, start);
            }

            // From here on every collection-set object has a copy; the cycle
            // runs to the end and a pending cancellation is left to the next
            // collection.
            self.set_phase(GcPhase::UpdateRefs);
            let map = self.pause(TimedPhase::InitUpdateRefs, &mut timings, || {
                heap.set_gc_state(gc_state::UPDATE_REFS);
                self.verify(GcPhase::Evacuate, |verifier, roots| {
                    verifier
                        .verify_reachable(roots, VerifyMode::Forwarding)
                        .map(|_| ())
                })?;
                Ok::<_, GcError>(evacuation::build_forwarding_map(heap, &remark.cset))
            })?;

            let started = Instant::now();
            report.updated_references = evacuation::update_heap_references(heap, &map);
            timings.record(TimedPhase::ConcurrentUpdateRefs, started.elapsed());

            self.set_phase(GcPhase::CleanUp);
            self.pause(TimedPhase::FinalUpdateRefs, &mut timings, || {
                self.visit_roots(&mut |value: &mut Value| {
                    evacuation::update_value(&map, value);
                });
                heap.set_gc_state(gc_state::IDLE);
                for &id in &remark.cset.regions {
                    heap.recycle_region(id)?;
                }
                heap.recompute_used();
                self.verify(GcPhase::CleanUp, |verifier, roots| {
                    verifier.verify_no_cset()?;
                    verifier
                        .verify_reachable(roots, VerifyMode::Quiescent)
                        .map(|_| ())
                })
            })?;
        }

        report.used_after = heap.recompute_used();
        report.free_regions = heap.free_region_count();
        report.timings = timings;
        report.duration = start.elapsed();
        Ok(report)
    }

    fn final_mark(&self, marker: &Marker<'_>) -> Result<RemarkResult, GcError> {
        let heap = &self.heap;
        self.threads
            .for_each_local(|local| local.satb.flush(heap.satb()));
        let mut grey = Vec::new();
        self.visit_roots(&mut |value: &mut Value| marker.mark_value(*value, &mut grey));
        for record in heap.satb().drain() {
            if marker.try_mark(record.value) {
                grey.push(record.value);
            }
        }
        marker.drain(grey, false);
        heap.set_gc_state(gc_state::IDLE);

        let unloaded = self.unload_unreferenced();
        if unloaded > 0 {
            log::debug!("unloaded {} retired class versions", unloaded);
        }

        let mut live_bytes = 0;
        for region in heap.regions() {
            if matches!(region.state(), RegionState::Regular | RegionState::Archive) {
                region.add_live_bytes(region.allocated_since_mark());
                live_bytes += region.live_bytes();
            }
        }
        self.verify(GcPhase::Remark, |verifier, roots| {
            verifier.verify_live_counts()?;
            verifier
                .verify_reachable(roots, VerifyMode::Marked)
                .map(|_| ())
        })?;

        // No lab may sit in a region that becomes garbage or joins the
        // collection set
        self.threads.for_each_local(|local| local.retire_labs());

        let mut immediate_regions = 0;
        for region in heap.regions() {
            if region.state() == RegionState::Regular && region.live_bytes() == 0 {
                heap.recycle_region(region.id())?;
                immediate_regions += 1;
            }
        }

        let cset = evacuation::choose_collection_set(heap, self.heuristics.evacuation_aggressiveness());
        for &id in &cset.regions {
            heap.region(id)?.set_state(RegionState::Cset);
        }
        for region in heap.regions() {
            if region.state() == RegionState::Regular {
                region.note_survived();
            }
        }
        if !cset.is_empty() {
            heap.set_gc_state(gc_state::EVACUATION);
        }
        heap.recompute_used();
        log::debug!(
            "final mark: {} live bytes, {} immediate garbage regions, cset {} regions ({} live, {} garbage)",
            live_bytes,
            immediate_regions,
            cset.regions.len(),
            cset.live_bytes,
            cset.garbage_bytes
        );

        Ok(RemarkResult {
            cset,
            immediate_regions,
            live_bytes,
        })
    }

    fn stw_collect(&self, mut report: CycleReport, start: Instant) -> Result<CycleReport, GcError> {
        let (phase, timed) = match report.kind {
            CycleKind::Full => (GcPhase::Full, TimedPhase::FullGc),
            _ => (GcPhase::Degenerated, TimedPhase::DegeneratedGc),
        };
        self.set_phase(phase);
        let mut timings = std::mem::take(&mut report.timings);
        let result = self.pause(timed, &mut timings, || self.compact_in_pause(phase))?;
        log::debug!(
            "{}: {} live objects, {} moved, {} regions freed",
            phase,
            result.live_objects,
            result.moved_objects,
            result.regions_freed
        );

        report.timings = timings;
        report.live_bytes = result.live_bytes;
        report.free_regions = result.free_regions;
        report.used_after = self.heap.used();
        report.duration = start.elapsed();
        Ok(report)
    }

    fn compact_in_pause(&self, phase: GcPhase) -> Result<CompactionResult, GcError> {
        let heap = &self.heap;
        heap.set_gc_state(gc_state::IDLE);
        self.threads.for_each_local(|local| {
            local.satb.clear();
            local.retire_labs();
        });
        heap.satb().clear();
        self.unload_unreferenced();

        let result = full::mark_compact(heap, &mut |f: &mut dyn FnMut(&mut Value)| {
            self.visit_roots(f)
        })?;
        heap.clear_cancelled();

        self.verify(phase, |verifier, roots| {
            verifier.verify_no_cset()?;
            verifier
                .verify_reachable(roots, VerifyMode::Quiescent)
                .map(|_| ())
        })?;
        Ok(result)
    }

    // ===== Helpers =====

    fn pause<R>(&self, phase: TimedPhase, timings: &mut PhaseTimings, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let guard = self.safepoint.begin_pause(StopReason::GarbageCollection);
        let result = f();
        drop(guard);
        let elapsed = started.elapsed();
        log::trace!("pause {} took {:?}", phase.name(), elapsed);
        timings.record(phase, elapsed);
        result
    }

    fn set_phase(&self, next: GcPhase) {
        let mut phase = self.phase.lock();
        if !phase.can_transition_to(next) {
            log::warn!("unexpected GC phase transition {} -> {}", *phase, next);
        }
        *phase = next;
    }

    fn unload_unreferenced(&self) -> usize {
        self.providers
            .read()
            .iter()
            .map(|p| p.unload_unreferenced())
            .sum()
    }

    fn collect_roots(&self) -> Vec<Value> {
        let mut roots = Vec::new();
        self.visit_roots(&mut |value: &mut Value| roots.push(*value));
        roots
    }

    fn verify(
        &self,
        phase: GcPhase,
        check: impl FnOnce(&HeapVerifier<'_>, &[Value]) -> Result<(), String>,
    ) -> Result<(), GcError> {
        if !self.config.verify {
            return Ok(());
        }
        let roots = self.collect_roots();
        check(&HeapVerifier::new(&self.heap), &roots)
            .map_err(|message| self.verification_failure(phase, message))
    }

    fn verification_failure(&self, phase: GcPhase, message: String) -> GcError {
        let dump = self.dump();
        log::error!(
            "heap verification failed after {}: {}\n{}",
            phase,
            message,
            dump
        );
        GcError::VerificationFailed {
            phase: phase.name(),
            message,
            dump: Box::new(dump),
        }
    }

    pub(crate) fn check_fatal(&self) -> Result<(), GcError> {
        match self.fatal.lock().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassId;
    use crate::gc::roots::GlobalHandles;
    use crate::heap::ObjectRef;
    use crate::heuristics::HeuristicKind;
    use std::sync::atomic::AtomicBool;
    use std::sync::Weak;

    fn collector(kind: HeuristicKind) -> Collector {
        Collector::new(
            HeapConfig {
                heap_size: 32 * 4096,
                region_size: 4096,
                compressed_refs: false,
                satb_buffer_size: 8,
                oom_during_evac_a_lot: false,
            },
            kind.build(),
            CollectorConfig {
                workers: 2,
                verify: true,
                control_interval: Duration::from_millis(1),
                fatal_on_oom: false,
            },
        )
    }

    fn handle(gc: &Collector, handles: &GlobalHandles, name: &str) -> Option<ObjectRef> {
        handles
            .get(name)
            .and_then(|v| v.as_object())
            .map(|obj| gc.heap().resolve(obj).unwrap())
    }

    /// Fill regions with mostly garbage; keep every `keep`-th object in a
    /// global handle
    fn populate(gc: &Collector, handles: &GlobalHandles, count: usize, keep: usize) {
        let mut local = gc.heap().new_thread_local();
        for i in 0..count {
            let obj = gc
                .heap()
                .allocate(&mut local, ClassId(1), 1, &[i as u8; 500])
                .unwrap();
            if i % keep == 0 {
                handles.set(format!("h{}", i), Value::Ref(obj));
            }
        }
    }

    #[test]
    fn test_concurrent_cycle_reclaims_garbage() {
        let gc = collector(HeuristicKind::Static);
        let handles = Arc::new(GlobalHandles::new());
        gc.register_root_provider(handles.clone());
        populate(&gc, &handles, 40, 10);
        let before = gc.heap().used();

        let report = gc.collect(GcCause::Explicit).unwrap();
        assert_eq!(report.kind, CycleKind::Concurrent);
        assert!(report.used_after < before);
        assert_eq!(gc.phase(), GcPhase::Idle);
        assert_eq!(gc.heap().gc_state(), gc_state::IDLE);

        for i in (0..40).step_by(10) {
            let obj = handle(&gc, &handles, &format!("h{}", i)).unwrap();
            assert_eq!(gc.heap().read_payload(obj, 0, 1).unwrap(), vec![i as u8]);
        }
        assert_eq!(gc.stats().concurrent_cycles, 1);
    }

    #[test]
    fn test_aggressive_cycle_evacuates_and_updates_roots() {
        let gc = collector(HeuristicKind::Aggressive);
        let handles = Arc::new(GlobalHandles::new());
        gc.register_root_provider(handles.clone());
        populate(&gc, &handles, 12, 3);
        let original = handles.get("h0").and_then(|v| v.as_object()).unwrap();

        let report = gc.collect(GcCause::Explicit).unwrap();
        assert!(report.cset_regions > 0);
        assert!(report.evacuated_objects > 0);

        let moved = handles.get("h0").and_then(|v| v.as_object()).unwrap();
        assert_ne!(moved.region, original.region);
        assert_eq!(gc.heap().age_of(moved).unwrap(), 1);
        assert!(gc
            .heap()
            .regions()
            .iter()
            .all(|r| r.state() != RegionState::Cset));
    }

    #[test]
    fn test_passive_runs_full_collections() {
        let gc = collector(HeuristicKind::Passive);
        let handles = Arc::new(GlobalHandles::new());
        gc.register_root_provider(handles.clone());
        populate(&gc, &handles, 30, 5);

        let report = gc.collect(GcCause::Explicit).unwrap();
        assert_eq!(report.kind, CycleKind::Full);
        assert_eq!(gc.compactions(), 1);
        assert!(report.reclaimed() > 0);
        let obj = handle(&gc, &handles, "h25").unwrap();
        assert_eq!(gc.heap().read_payload(obj, 0, 1).unwrap(), vec![25]);
    }

    #[test]
    fn test_alloc_failure_skips_compaction_already_done() {
        let gc = collector(HeuristicKind::Static);
        let seen = gc.compactions();
        let outcome = gc.handle_alloc_failure(seen).unwrap();
        assert_eq!(
            outcome,
            AllocFailureOutcome::Compacted {
                free_regions: gc.heap().region_count()
            }
        );
        assert!(!outcome.exhausted());
        assert_eq!(gc.compactions(), seen + 1);
        // a second request that saw the old count does not compact again
        assert_eq!(
            gc.handle_alloc_failure(seen).unwrap(),
            AllocFailureOutcome::AlreadyCompacted
        );
        assert_eq!(gc.compactions(), seen + 1);
        assert_eq!(gc.stats().allocation_failures, 2);
    }

    /// Cancels the cycle the first time roots are scanned
    struct CancelAtInitMark {
        gc: Mutex<Weak<Collector>>,
        fired: AtomicBool,
    }

    impl RootProvider for CancelAtInitMark {
        fn name(&self) -> &'static str {
            "cancel at init mark"
        }

        fn visit_roots(&self, _visitor: &mut dyn FnMut(&mut Value)) {
            if !self.fired.swap(true, Ordering::AcqRel) {
                if let Some(gc) = self.gc.lock().upgrade() {
                    gc.heap().cancel_gc();
                }
            }
        }
    }

    #[test]
    fn test_cancelled_cycle_degenerates() {
        let gc = Arc::new(collector(HeuristicKind::Static));
        let handles = Arc::new(GlobalHandles::new());
        gc.register_root_provider(handles.clone());
        gc.register_root_provider(Arc::new(CancelAtInitMark {
            gc: Mutex::new(Arc::downgrade(&gc)),
            fired: AtomicBool::new(false),
        }));
        populate(&gc, &handles, 20, 4);

        let report = gc.collect(GcCause::Explicit).unwrap();
        assert_eq!(report.kind, CycleKind::Degenerated);
        assert_eq!(gc.compactions(), 1);
        assert!(!gc.heap().is_cancelled());
        let obj = handle(&gc, &handles, "h16").unwrap();
        assert_eq!(gc.heap().read_payload(obj, 0, 1).unwrap(), vec![16]);
    }

    #[test]
    fn test_verification_failure_is_fatal_and_sticky() {
        let gc = collector(HeuristicKind::Static);
        let handles = Arc::new(GlobalHandles::new());
        gc.register_root_provider(handles.clone());
        let mut local = gc.heap().new_thread_local();
        let obj = gc.heap().allocate(&mut local, ClassId(1), 0, &[]).unwrap();
        handles.set("dangling", Value::Ref(obj));
        // break the heap behind the collector's back
        gc.heap().recycle_region(obj.region).unwrap();

        let err = gc.collect(GcCause::Explicit).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            gc.collect(GcCause::Explicit),
            Err(GcError::VerificationFailed { .. })
        ));
    }
}
