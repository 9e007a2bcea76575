//! Static heuristics: start a cycle at a fixed occupancy.

use super::{HeapStatistics, HeuristicKind, Heuristics};

/// Fixed-threshold strategy
#[derive(Debug, Clone, Copy)]
pub struct StaticHeuristics {
    /// Occupancy at which a cycle starts
    pub threshold: f64,
}

impl Default for StaticHeuristics {
    fn default() -> Self {
        Self { threshold: 0.70 }
    }
}

impl Heuristics for StaticHeuristics {
    fn name(&self) -> &'static str {
        "static"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Static
    }

    fn should_start_cycle(&self, stats: &HeapStatistics) -> bool {
        stats.allocated_since_last_cycle > 0 && stats.occupancy() >= self.threshold
    }

    fn evacuation_aggressiveness(&self) -> f64 {
        0.40
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::stats_at;

    #[test]
    fn test_threshold() {
        let h = StaticHeuristics::default();
        assert!(!h.should_start_cycle(&stats_at(0.69)));
        assert!(h.should_start_cycle(&stats_at(0.70)));
    }
}
