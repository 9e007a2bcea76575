//! Safepoint Infrastructure for STW Pauses
//!
//! This module provides cooperative safepoint coordination for stop-the-world
//! (STW) operations: the collector's Init Mark, Final Mark, Init/Final Update
//! Refs and full-collection pauses, and redefinition publication.
//!
//! ## Safepoint Poll Locations
//!
//! Mutators poll at:
//! - **Allocations**: every `Mutator::allocate`
//! - **Calls**: interpreter `Invoke`
//! - **Loop back-edges**: interpreter backward jumps
//!
//! A mutator that is about to block (waiting on a GC, an agent reply, or
//! running a collection itself) wraps the wait in
//! [`SafepointCoordinator::blocked`], which counts it as parked so a pause
//! never waits on a thread that cannot poll.
//!
//! ## Guarantees
//! - Fast-path polling is a single atomic load when no pause is pending
//! - While a [`PauseGuard`] is alive, every registered mutator is parked or
//!   blocked and none of them touches the heap
//! - Pauses are serialized: at most one pause is active at a time

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Reasons for requesting a safepoint pause
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Collector pause
    GarbageCollection,
    /// Publishing a redefined class
    Redefinition,
    /// Heap verification outside a collection
    Verification,
}

/// Statistics tracking for safepoint operations
#[derive(Debug, Default)]
pub struct SafepointStats {
    /// Total number of safepoints executed
    total_safepoints: AtomicUsize,
    /// Total time spent at safepoints (microseconds)
    total_pause_time_us: AtomicUsize,
    /// Maximum pause time (microseconds)
    max_pause_time_us: AtomicUsize,
}

impl SafepointStats {
    /// Total number of safepoints executed
    pub fn total_safepoints(&self) -> usize {
        self.total_safepoints.load(Ordering::Relaxed)
    }

    /// Total time spent at safepoints (microseconds)
    pub fn total_pause_time_us(&self) -> usize {
        self.total_pause_time_us.load(Ordering::Relaxed)
    }

    /// Maximum pause time (microseconds)
    pub fn max_pause_time_us(&self) -> usize {
        self.max_pause_time_us.load(Ordering::Relaxed)
    }

    fn record(&self, elapsed_us: usize) {
        self.total_pause_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        self.total_safepoints.fetch_add(1, Ordering::Relaxed);
        self.max_pause_time_us
            .fetch_max(elapsed_us, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct SafepointState {
    registered: usize,
    parked: usize,
    pause_requested: bool,
    reason: Option<StopReason>,
}

/// Coordinates stop-the-world pauses across all mutator threads
pub struct SafepointCoordinator {
    state: Mutex<SafepointState>,
    cond: Condvar,
    /// Fast-path flag mirrored from `state.pause_requested`
    pending: AtomicBool,
    /// Serializes pause requesters
    pause_lock: Mutex<()>,
    /// Statistics
    pub stats: SafepointStats,
}

impl SafepointCoordinator {
    /// Create a coordinator with no registered mutators
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SafepointState::default()),
            cond: Condvar::new(),
            pending: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            stats: SafepointStats::default(),
        }
    }

    /// Register the calling thread as a running mutator
    ///
    /// Waits for an in-progress pause to finish first.
    pub fn register(&self) {
        let mut state = self.state.lock();
        while state.pause_requested {
            self.cond.wait(&mut state);
        }
        state.registered += 1;
    }

    /// Remove the calling thread from the mutator count
    pub fn deregister(&self) {
        let mut state = self.state.lock();
        state.registered = state.registered.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Number of registered mutators
    pub fn registered(&self) -> usize {
        self.state.lock().registered
    }

    /// Fast inline check - called frequently from mutators
    #[inline(always)]
    pub fn poll(&self) {
        if self.pending.load(Ordering::Acquire) {
            self.enter_safepoint();
        }
    }

    /// Check whether a pause has been requested
    #[inline]
    pub fn is_pause_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Slow path: park until the pause is over
    #[cold]
    #[inline(never)]
    fn enter_safepoint(&self) {
        let mut state = self.state.lock();
        if !state.pause_requested {
            return;
        }
        state.parked += 1;
        self.cond.notify_all();
        while state.pause_requested {
            self.cond.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Run `f` with the calling mutator counted as parked
    ///
    /// On return the caller waits for any pause that began meanwhile.
    pub fn blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut state = self.state.lock();
            state.parked += 1;
            self.cond.notify_all();
        }
        let result = f();
        let mut state = self.state.lock();
        while state.pause_requested {
            self.cond.wait(&mut state);
        }
        state.parked -= 1;
        result
    }

    /// Stop every registered mutator
    ///
    /// Must not be called by a running registered mutator; wrap the call in
    /// [`SafepointCoordinator::blocked`] instead.
    pub fn begin_pause(&self, reason: StopReason) -> PauseGuard<'_> {
        let serial = self.pause_lock.lock();
        let start = Instant::now();
        let mut state = self.state.lock();
        state.pause_requested = true;
        state.reason = Some(reason);
        self.pending.store(true, Ordering::Release);
        while state.parked < state.registered {
            self.cond.wait(&mut state);
        }
        log::trace!(
            "safepoint reached for {:?} ({} mutators) in {:?}",
            reason,
            state.registered,
            start.elapsed()
        );
        PauseGuard {
            coordinator: self,
            _serial: serial,
            start,
            reason,
        }
    }

    /// Reason of the active pause
    pub fn current_reason(&self) -> Option<StopReason> {
        self.state.lock().reason
    }

    fn end_pause(&self, start: Instant) {
        let mut state = self.state.lock();
        state.pause_requested = false;
        state.reason = None;
        self.pending.store(false, Ordering::Release);
        self.cond.notify_all();
        drop(state);
        self.stats.record(start.elapsed().as_micros() as usize);
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Active stop-the-world pause; mutators resume when it is dropped
pub struct PauseGuard<'a> {
    coordinator: &'a SafepointCoordinator,
    _serial: MutexGuard<'a, ()>,
    start: Instant,
    reason: StopReason,
}

impl PauseGuard<'_> {
    /// Why the pause was requested
    pub fn reason(&self) -> StopReason {
        self.reason
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.end_pause(self.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pause_without_mutators() {
        let sp = SafepointCoordinator::new();
        {
            let guard = sp.begin_pause(StopReason::GarbageCollection);
            assert_eq!(guard.reason(), StopReason::GarbageCollection);
            assert!(sp.is_pause_pending());
        }
        assert!(!sp.is_pause_pending());
        assert_eq!(sp.stats.total_safepoints(), 1);
    }

    #[test]
    fn test_pause_stops_polling_mutator() {
        let sp = Arc::new(SafepointCoordinator::new());
        let counter = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        sp.register();
        let worker = {
            let sp = sp.clone();
            let counter = counter.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    sp.poll();
                }
                sp.deregister();
            })
        };

        thread::sleep(Duration::from_millis(10));
        {
            let _guard = sp.begin_pause(StopReason::GarbageCollection);
            let before = counter.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(counter.load(Ordering::Relaxed), before);
        }
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
        assert_eq!(sp.registered(), 0);
    }

    #[test]
    fn test_blocked_mutator_does_not_hold_up_pause() {
        let sp = Arc::new(SafepointCoordinator::new());
        sp.register();
        let result = sp.blocked(|| {
            let _guard = sp.begin_pause(StopReason::Redefinition);
            7
        });
        assert_eq!(result, 7);
        sp.deregister();
    }
}
