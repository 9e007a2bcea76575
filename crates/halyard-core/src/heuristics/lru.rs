//! LRU heuristics: collect at high occupancy, or at moderate occupancy when
//! the last cycle is long enough ago that its liveness data is stale.

use super::{HeapStatistics, HeuristicKind, Heuristics};
use std::time::Duration;

/// Staleness-aware strategy
#[derive(Debug, Clone, Copy)]
pub struct LruHeuristics {
    /// Occupancy that always triggers
    pub threshold: f64,
    /// Occupancy that triggers once the last cycle is stale
    pub stale_threshold: f64,
    /// Age of the last cycle after which it is stale
    pub stale_after: Duration,
}

impl Default for LruHeuristics {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            stale_threshold: 0.50,
            stale_after: Duration::from_secs(1),
        }
    }
}

impl Heuristics for LruHeuristics {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Lru
    }

    fn should_start_cycle(&self, stats: &HeapStatistics) -> bool {
        if stats.allocated_since_last_cycle == 0 {
            return false;
        }
        let occupancy = stats.occupancy();
        occupancy >= self.threshold
            || (occupancy >= self.stale_threshold && stats.time_since_last_cycle >= self.stale_after)
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
    fn test_stale_cycle_lowers_threshold() {
        let h = LruHeuristics::default();
        let mut stats = stats_at(0.6);
        stats.time_since_last_cycle = Duration::from_millis(100);
        assert!(!h.should_start_cycle(&stats));
        stats.time_since_last_cycle = Duration::from_secs(2);
        assert!(h.should_start_cycle(&stats));
        assert!(h.should_start_cycle(&stats_at(0.8)));
    }
}
