//! Continuous heuristics: start a new cycle as soon as anything has been
//! allocated since the previous one.

use super::{HeapStatistics, HeuristicKind, Heuristics};

/// Back-to-back strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct ContinuousHeuristics;

impl Heuristics for ContinuousHeuristics {
    fn name(&self) -> &'static str {
        "continuous"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Continuous
    }

    fn should_start_cycle(&self, stats: &HeapStatistics) -> bool {
        stats.allocated_since_last_cycle > 0
    }

    fn evacuation_aggressiveness(&self) -> f64 {
        0.6
    }
}
