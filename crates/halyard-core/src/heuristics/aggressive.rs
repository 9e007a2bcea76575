//! Aggressive heuristics: run cycles back to back and evacuate every occupied
//! region, ignoring the evacuation reserve. This deliberately drives the heap
//! into low-memory conditions to exercise evacuation-failure recovery.

use super::{HeapStatistics, HeuristicKind, Heuristics};

/// Always-collect strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct AggressiveHeuristics;

impl Heuristics for AggressiveHeuristics {
    fn name(&self) -> &'static str {
        "aggressive"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Aggressive
    }

    fn should_start_cycle(&self, _stats: &HeapStatistics) -> bool {
        true
    }

    fn evacuation_aggressiveness(&self) -> f64 {
        1.0
    }
}
