//! Collection heuristics
//!
//! A heuristic decides *when* a collection cycle starts and *how much* it
//! evacuates. Every strategy drives the same phase machine; they differ only
//! in their start trigger, their evacuation aggressiveness and whether cycles
//! run concurrently or as full stop-the-world collections.
//!
//! Strategies are pure functions of [`HeapStatistics`] and are selected once
//! at startup through [`HeuristicKind::build`].

mod adaptive;
mod aggressive;
mod connected;
mod continuous;
mod generational;
mod lru;
mod passive;
mod static_threshold;

pub use adaptive::AdaptiveHeuristics;
pub use aggressive::AggressiveHeuristics;
pub use connected::ConnectedHeuristics;
pub use continuous::ContinuousHeuristics;
pub use generational::GenerationalHeuristics;
pub use lru::LruHeuristics;
pub use passive::PassiveHeuristics;
pub use static_threshold::StaticHeuristics;

use crate::config::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Heap signals observed by the heuristics
#[derive(Debug, Clone, Default)]
pub struct HeapStatistics {
    /// Heap capacity in bytes
    pub capacity: usize,
    /// Bytes allocated in claimed regions
    pub used: usize,
    /// Bytes in free regions
    pub free: usize,
    /// Live bytes found by the last completed cycle
    pub live_after_last_cycle: usize,
    /// Mutator bytes allocated since the last cycle ended
    pub allocated_since_last_cycle: usize,
    /// Decaying average allocation rate in bytes per second
    pub allocation_rate: f64,
    /// Average duration of completed cycles
    pub avg_cycle_time: Duration,
    /// Cycles completed so far
    pub cycles_completed: u64,
    /// Time since the last cycle ended (or since startup)
    pub time_since_last_cycle: Duration,
}

impl HeapStatistics {
    /// Fraction of the heap in use (0.0 to 1.0)
    pub fn occupancy(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

/// How a triggered cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Concurrent mark and evacuation with short pauses
    Concurrent,
    /// Stop-the-world mark-compact
    Full,
}

/// Collection trigger strategy
pub trait Heuristics: Send + Sync {
    /// Strategy name
    fn name(&self) -> &'static str;

    /// Strategy kind
    fn kind(&self) -> HeuristicKind;

    /// Whether a cycle should start now
    fn should_start_cycle(&self, stats: &HeapStatistics) -> bool;

    /// How aggressively to evacuate (0.0 to 1.0)
    ///
    /// Regions whose garbage fraction is at least `1.0 - aggressiveness` are
    /// collection-set candidates; at 1.0 every occupied region is evacuated
    /// and the evacuation reserve is not enforced.
    fn evacuation_aggressiveness(&self) -> f64;

    /// How triggered cycles run
    fn cycle_mode(&self) -> CycleMode {
        CycleMode::Concurrent
    }
}

/// Named heuristic strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum HeuristicKind {
    /// Never triggers; collections are full and allocation-driven
    Passive,
    /// Fixed occupancy threshold
    Static,
    /// Free-space headroom sized by allocation rate and cycle time
    Adaptive,
    /// Always triggers and evacuates everything
    Aggressive,
    /// Lower fixed threshold
    Connected,
    /// Triggers on allocation volume since the last cycle
    Generational,
    /// Triggers on occupancy or staleness of the last cycle
    Lru,
    /// Triggers whenever anything was allocated
    Continuous,
}

impl HeuristicKind {
    /// Every strategy, in a stable order
    pub const ALL: [HeuristicKind; 8] = [
        HeuristicKind::Passive,
        HeuristicKind::Static,
        HeuristicKind::Adaptive,
        HeuristicKind::Aggressive,
        HeuristicKind::Connected,
        HeuristicKind::Generational,
        HeuristicKind::Lru,
        HeuristicKind::Continuous,
    ];

    /// Strategy name as accepted on the command line
    pub fn name(self) -> &'static str {
        match self {
            HeuristicKind::Passive => "passive",
            HeuristicKind::Static => "static",
            HeuristicKind::Adaptive => "adaptive",
            HeuristicKind::Aggressive => "aggressive",
            HeuristicKind::Connected => "connected",
            HeuristicKind::Generational => "generational",
            HeuristicKind::Lru => "lru",
            HeuristicKind::Continuous => "continuous",
        }
    }

    /// Instantiate the strategy
    pub fn build(self) -> Box<dyn Heuristics> {
        match self {
            HeuristicKind::Passive => Box::new(PassiveHeuristics),
            HeuristicKind::Static => Box::new(StaticHeuristics::default()),
            HeuristicKind::Adaptive => Box::new(AdaptiveHeuristics::default()),
            HeuristicKind::Aggressive => Box::new(AggressiveHeuristics),
            HeuristicKind::Connected => Box::new(ConnectedHeuristics::default()),
            HeuristicKind::Generational => Box::new(GenerationalHeuristics::default()),
            HeuristicKind::Lru => Box::new(LruHeuristics::default()),
            HeuristicKind::Continuous => Box::new(ContinuousHeuristics),
        }
    }
}

impl FromStr for HeuristicKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        HeuristicKind::ALL
            .into_iter()
            .find(|k| k.name() == lower)
            .ok_or_else(|| ConfigError::UnknownHeuristic(s.to_string()))
    }
}

impl TryFrom<String> for HeuristicKind {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for HeuristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
pub(crate) fn stats_at(occupancy: f64) -> HeapStatistics {
    let capacity = 1000 * 1024 * 1024;
    let used = (capacity as f64 * occupancy) as usize;
    HeapStatistics {
        capacity,
        used,
        free: capacity - used,
        allocated_since_last_cycle: 1024,
        ..HeapStatistics::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("PASSIVE".parse::<HeuristicKind>().unwrap(), HeuristicKind::Passive);
        assert_eq!(" lru ".parse::<HeuristicKind>().unwrap(), HeuristicKind::Lru);
        assert!("fancy".parse::<HeuristicKind>().is_err());
    }

    #[test]
    fn test_build_matches_kind() {
        for kind in HeuristicKind::ALL {
            let h = kind.build();
            assert_eq!(h.kind(), kind);
            assert_eq!(h.name(), kind.name());
            let a = h.evacuation_aggressiveness();
            assert!((0.0..=1.0).contains(&a));
        }
    }

    #[test]
    fn test_only_passive_runs_full_cycles() {
        for kind in HeuristicKind::ALL {
            let expected = if kind == HeuristicKind::Passive {
                CycleMode::Full
            } else {
                CycleMode::Concurrent
            };
            assert_eq!(kind.build().cycle_mode(), expected);
        }
    }

    #[test]
    fn test_idle_heap_triggers_only_eager_strategies() {
        let idle = HeapStatistics {
            capacity: 1 << 20,
            free: 1 << 20,
            ..HeapStatistics::default()
        };
        for kind in HeuristicKind::ALL {
            let starts = kind.build().should_start_cycle(&idle);
            assert_eq!(starts, kind == HeuristicKind::Aggressive, "{kind}");
        }
    }

    #[test]
    fn test_occupancy() {
        let stats = stats_at(0.5);
        assert!((stats.occupancy() - 0.5).abs() < 1e-6);
        assert_eq!(HeapStatistics::default().occupancy(), 0.0);
    }
}
