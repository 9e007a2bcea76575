//! Collector phases and per-cycle timings

use std::fmt;
use std::time::Duration;

/// Collector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcPhase {
    /// No cycle running
    Idle,
    /// Init Mark pause: roots scanned, SATB barrier armed
    MarkStart,
    /// Marking alongside the mutators
    ConcurrentMark,
    /// Final Mark pause: SATB drained, live set final, collection set chosen
    Remark,
    /// Copying collection-set objects alongside the mutators
    Evacuate,
    /// Rewriting references to forwarded objects
    UpdateRefs,
    /// Collection-set regions recycled
    CleanUp,
    /// Stop-the-world completion of a cancelled cycle
    Degenerated,
    /// Stop-the-world mark-compact
    Full,
}

impl GcPhase {
    /// Check whether the phase machine allows moving to `next`
    pub fn can_transition_to(self, next: GcPhase) -> bool {
        use GcPhase::*;
        matches!(
            (self, next),
            (Idle, MarkStart)
                | (Idle, Full)
                | (MarkStart, ConcurrentMark)
                | (ConcurrentMark, Remark)
                | (Remark, Evacuate)
                | (Remark, CleanUp)
                | (Evacuate, UpdateRefs)
                | (UpdateRefs, CleanUp)
                | (CleanUp, Idle)
                | (MarkStart, Degenerated)
                | (ConcurrentMark, Degenerated)
                | (Remark, Degenerated)
                | (Evacuate, Degenerated)
                | (UpdateRefs, Degenerated)
                | (Degenerated, Idle)
                | (Full, Idle)
        )
    }

    /// Phase name
    pub fn name(self) -> &'static str {
        match self {
            GcPhase::Idle => "idle",
            GcPhase::MarkStart => "mark-start",
            GcPhase::ConcurrentMark => "concurrent-mark",
            GcPhase::Remark => "remark",
            GcPhase::Evacuate => "evacuate",
            GcPhase::UpdateRefs => "update-refs",
            GcPhase::CleanUp => "cleanup",
            GcPhase::Degenerated => "degenerated",
            GcPhase::Full => "full",
        }
    }
}

impl fmt::Display for GcPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// A mutator could not allocate
    AllocationFailure,
    /// The heuristics asked for a cycle
    Heuristics,
    /// Requested through `Mutator::collect` or the CLI
    Explicit,
    /// Evacuation ran out of target space
    EvacuationFailure,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcCause::AllocationFailure => "allocation failure",
            GcCause::Heuristics => "heuristics",
            GcCause::Explicit => "explicit",
            GcCause::EvacuationFailure => "evacuation failure",
        })
    }
}

/// Kind of a completed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Concurrent cycle that ran to completion
    Concurrent,
    /// Cancelled concurrent cycle finished stop-the-world
    Degenerated,
    /// Stop-the-world mark-compact
    Full,
}

/// A timed step of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedPhase {
    /// Init Mark pause
    InitMark,
    /// Concurrent marking
    ConcurrentMark,
    /// Final Mark pause
    FinalMark,
    /// Concurrent evacuation
    ConcurrentEvacuation,
    /// Init Update Refs pause
    InitUpdateRefs,
    /// Concurrent reference updating
    ConcurrentUpdateRefs,
    /// Final Update Refs pause (includes cleanup)
    FinalUpdateRefs,
    /// Degenerated collection pause
    DegeneratedGc,
    /// Full collection pause
    FullGc,
}

impl TimedPhase {
    /// Whether mutators are stopped during this step
    pub fn is_pause(self) -> bool {
        !matches!(
            self,
            TimedPhase::ConcurrentMark
                | TimedPhase::ConcurrentEvacuation
                | TimedPhase::ConcurrentUpdateRefs
        )
    }

    /// Step name
    pub fn name(self) -> &'static str {
        match self {
            TimedPhase::InitMark => "init mark",
            TimedPhase::ConcurrentMark => "concurrent mark",
            TimedPhase::FinalMark => "final mark",
            TimedPhase::ConcurrentEvacuation => "concurrent evacuation",
            TimedPhase::InitUpdateRefs => "init update refs",
            TimedPhase::ConcurrentUpdateRefs => "concurrent update refs",
            TimedPhase::FinalUpdateRefs => "final update refs",
            TimedPhase::DegeneratedGc => "degenerated gc",
            TimedPhase::FullGc => "full gc",
        }
    }
}

/// Durations of the steps of one cycle
#[derive(Debug, Clone, Default)]
pub struct PhaseTimings {
    entries: Vec<(TimedPhase, Duration)>,
}

impl PhaseTimings {
    /// Create empty timings
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step
    pub fn record(&mut self, phase: TimedPhase, duration: Duration) {
        self.entries.push((phase, duration));
    }

    /// Total time recorded for `phase`
    pub fn get(&self, phase: TimedPhase) -> Duration {
        self.entries
            .iter()
            .filter(|(p, _)| *p == phase)
            .map(|(_, d)| *d)
            .sum()
    }

    /// Total time mutators were stopped
    pub fn total_pause(&self) -> Duration {
        self.entries
            .iter()
            .filter(|(p, _)| p.is_pause())
            .map(|(_, d)| *d)
            .sum()
    }

    /// Longest single pause
    pub fn max_pause(&self) -> Duration {
        self.entries
            .iter()
            .filter(|(p, _)| p.is_pause())
            .map(|(_, d)| *d)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Recorded steps in order
    pub fn entries(&self) -> &[(TimedPhase, Duration)] {
        &self.entries
    }
}

impl fmt::Display for PhaseTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (phase, duration) in &self.entries {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{} {:.3}ms", phase.name(), duration.as_secs_f64() * 1000.0)?;
        }
        Ok(())
    }
}
