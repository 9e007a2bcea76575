//! Adaptive heuristics: keep enough free space to absorb the allocations
//! expected while a cycle runs.
//!
//! With cycle history, a cycle starts when
//! `free < min_free * capacity + allocation_rate * avg_cycle_time * margin`.
//! Without history it falls back to a fixed occupancy threshold.

use super::{HeapStatistics, HeuristicKind, Heuristics};
use crate::defaults::MIN_FREE_THRESHOLD;

/// Rate-driven strategy
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveHeuristics {
    /// Headroom kept free, as a fraction of capacity
    pub min_free: f64,
    /// Safety factor applied to the expected in-cycle allocation
    pub margin: f64,
    /// Occupancy trigger used until a cycle has completed
    pub initial_threshold: f64,
}

impl Default for AdaptiveHeuristics {
    fn default() -> Self {
        Self {
            min_free: MIN_FREE_THRESHOLD,
            margin: 1.5,
            initial_threshold: 0.70,
        }
    }
}

impl Heuristics for AdaptiveHeuristics {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Adaptive
    }

    fn should_start_cycle(&self, stats: &HeapStatistics) -> bool {
        if stats.allocated_since_last_cycle == 0 {
            return false;
        }
        if stats.cycles_completed == 0 {
            return stats.occupancy() >= self.initial_threshold;
        }
        let headroom = self.min_free * stats.capacity as f64;
        let expected =
            stats.allocation_rate * stats.avg_cycle_time.as_secs_f64() * self.margin;
        (stats.free as f64) < headroom + expected
    }

    fn evacuation_aggressiveness(&self) -> f64 {
        0.5
    }
}
