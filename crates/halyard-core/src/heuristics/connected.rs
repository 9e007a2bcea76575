//! Connected heuristics: a lower fixed threshold than `static`, for object
//! graphs with long reference chains where marking takes longer to converge.

use super::{HeapStatistics, HeuristicKind, Heuristics};

/// Early fixed-threshold strategy
#[derive(Debug, Clone, Copy)]
pub struct ConnectedHeuristics {
    /// Occupancy at which a cycle starts
    pub threshold: f64,
}

impl Default for ConnectedHeuristics {
    fn default() -> Self {
        Self { threshold: 0.60 }
    }
}

impl Heuristics for ConnectedHeuristics {
    fn name(&self) -> &'static str {
        "connected"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Connected
    }

    fn should_start_cycle(&self, stats: &HeapStatistics) -> bool {
        stats.allocated_since_last_cycle > 0 && stats.occupancy() >= self.threshold
    }

    fn evacuation_aggressiveness(&self) -> f64 {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::stats_at;

    #[test]
    fn test_starts_earlier_than_static() {
        let h = ConnectedHeuristics::default();
        assert!(h.should_start_cycle(&stats_at(0.65)));
        assert!(!h.should_start_cycle(&stats_at(0.55)));
    }
}
