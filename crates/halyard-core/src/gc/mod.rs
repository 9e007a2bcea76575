//! Garbage collection
//!
//! A region-based concurrent collector. A normal cycle runs
//!
//! ```text
//! Init Mark (pause) -> concurrent mark -> Final Mark (pause)
//!   -> concurrent evacuation -> Init Update Refs (pause)
//!   -> concurrent update refs -> Final Update Refs + cleanup (pause)
//! ```
//!
//! A cycle cancelled by an allocation or evacuation failure finishes as a
//! degenerated stop-the-world mark-compact. Passive heuristics and
//! allocation-failure requests run full stop-the-world collections.

pub mod barrier;
pub mod collector;
pub mod control;
pub mod evacuation;
pub mod full;
pub mod marking;
pub mod phase;
pub mod roots;
pub mod verifier;

pub use barrier::{BarrierRecord, RememberedSet, SatbBuffer};
pub use collector::{AllocFailureOutcome, Collector, CollectorConfig, CycleReport, GcStats};
pub use control::GcControlThread;
pub use evacuation::{CollectionSet, ForwardingMap};
pub use full::CompactionResult;
pub use marking::{MarkOutcome, Marker};
pub use phase::{CycleKind, GcCause, GcPhase, PhaseTimings, TimedPhase};
pub use roots::{GlobalHandles, RootProvider, ThreadRegistry};
pub use verifier::{HeapVerifier, VerifyMode};

use crate::heap::{HeapDump, HeapError};

/// Collector errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum GcError {
    /// Heap verification found an inconsistency; the collector is broken
    #[error("Heap verification failed after {phase}: {message}")]
    VerificationFailed {
        /// Phase after which the check ran
        phase: &'static str,
        /// What was wrong
        message: String,
        /// State at the time of the failure
        dump: Box<HeapDump>,
    },

    /// Heap operation failed during a cycle
    #[error(transparent)]
    Heap(#[from] HeapError),
}

impl GcError {
    /// Whether the error leaves the collector unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, GcError::VerificationFailed { .. })
    }
}
