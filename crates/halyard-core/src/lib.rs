//! Halyard VM Core Runtime
//!
//! This crate provides the runtime pieces of the Halyard VM:
//! - Region heap with thread-local allocation and pinned archive regions
//! - Concurrent region collector with pluggable heuristics
//! - Shared class archive (dump, map, install)
//! - Class model, bytecode verifier and interpreter
//! - Class redefinition with an agent thread
//! - Safepoint coordination

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod archive;
pub mod class;
pub mod codec;
pub mod config;
pub mod defaults;
pub mod demo;
pub mod gc;
pub mod heap;
pub mod heuristics;
pub mod interpreter;
pub mod redefine;
pub mod safepoint;
pub mod value;
pub mod vm;

pub use archive::{ArchiveError, ArchiveHandle, ArchiveWriter};
pub use class::{ClassDefinition, ClassError, ClassId, ClassInfo, ClassTable, VerifyError};
pub use config::{ConfigError, VmOptions};
pub use gc::{Collector, GcCause, GcControlThread, GcError, GcStats};
pub use heap::{Heap, HeapError, Mutator, ObjectRef};
pub use heuristics::{HeuristicKind, Heuristics};
pub use interpreter::{Activation, Interpreter, Step};
pub use redefine::{AgentHandle, RedefineAgent, RedefineError, RedefinitionManager};
pub use safepoint::{SafepointCoordinator, StopReason};
pub use value::Value;
pub use vm::{Vm, VmStats};

/// VM errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Heap operation failed
    #[error(transparent)]
    Heap(#[from] HeapError),

    /// Collector failed
    #[error(transparent)]
    Gc(#[from] GcError),

    /// Archive could not be used
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Redefinition rejected
    #[error(transparent)]
    Redefine(#[from] RedefineError),

    /// Class could not be loaded
    #[error(transparent)]
    Class(#[from] ClassError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Thread spawn or other I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No class with this name is loaded
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    /// Dispatch found no method with this name
    #[error("Method {method} not found on {class}")]
    MethodNotFound {
        /// Receiver class
        class: String,
        /// Method name
        method: String,
    },

    /// Null receiver or field access through null
    #[error("Null reference")]
    NullReference,

    /// Operand of the wrong type
    #[error("Type error: {0}")]
    TypeError(String),

    /// Bytecode that slipped past verification misbehaved
    #[error("Invalid bytecode: {0}")]
    InvalidBytecode(String),

    /// Call nesting exceeded the limit
    #[error("Stack overflow ({0} frames)")]
    StackOverflow(usize),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl VmError {
    /// Whether the process cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            VmError::Gc(err) => err.is_fatal(),
            VmError::Archive(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// VM result
pub type VmResult<T> = Result<T, VmError>;
