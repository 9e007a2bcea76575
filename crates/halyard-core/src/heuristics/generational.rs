//! Generational heuristics: young objects die fast, so a cycle starts once a
//! quarter of the heap has been allocated since the previous cycle, or when
//! occupancy gets high regardless.

use super::{HeapStatistics, HeuristicKind, Heuristics};

/// Allocation-volume strategy
#[derive(Debug, Clone, Copy)]
pub struct GenerationalHeuristics {
    /// Fraction of capacity allocated since the last cycle that triggers one
    pub young_fraction: f64,
    /// Occupancy that triggers a cycle regardless of allocation volume
    pub occupancy_threshold: f64,
}

impl Default for GenerationalHeuristics {
    fn default() -> Self {
        Self {
            young_fraction: 0.25,
            occupancy_threshold: 0.80,
        }
    }
}

impl Heuristics for GenerationalHeuristics {
    fn name(&self) -> &'static str {
        "generational"
    }

    fn kind(&self) -> HeuristicKind {
        HeuristicKind::Generational
    }

    fn should_start_cycle(&self, stats: &HeapStatistics) -> bool {
        if stats.allocated_since_last_cycle == 0 {
            return false;
        }
        let young = stats.allocated_since_last_cycle as f64 / stats.capacity.max(1) as f64;
        young >= self.young_fraction || stats.occupancy() >= self.occupancy_threshold
    }

    fn evacuation_aggressiveness(&self) -> f64 {
        0.7
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::stats_at;

    #[test]
    fn test_allocation_volume_trigger() {
        let h = GenerationalHeuristics::default();
        let mut stats = stats_at(0.3);
        assert!(!h.should_start_cycle(&stats));
        stats.allocated_since_last_cycle = stats.capacity / 4;
        assert!(h.should_start_cycle(&stats));
    }

    #[test]
    fn test_occupancy_trigger() {
        let h = GenerationalHeuristics::default();
        assert!(h.should_start_cycle(&stats_at(0.85)));
    }
}
