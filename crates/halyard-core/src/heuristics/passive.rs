//! Passive heuristics: never start a cycle on their own.
//!
//! Collections happen only on allocation failure or explicit request, and
//! always as full stop-the-world mark-compact. Used to check collector
//! correctness without concurrent evacuation in the picture.

use super::{CycleMode, HeapStatistics, HeuristicKind, Heuristics};

/// Allocation-failure-only strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveHeuristics;

impl Heuristics for PassiveHeuristics {
    fn name(&self) -> &'static str {
        "passive"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Passive
    }

    fn should_start_cycle(&self, _stats: &HeapStatistics) -> bool {
        false
    }

    fn evacuation_aggressiveness(&self) -> f64 {
        1.0
    }

    fn cycle_mode(&self) -> CycleMode {
        CycleMode::Full
    }
}
