//! Shared class archive
//!
//! An archive is dumped once ([`ArchiveWriter`]) and mapped read-only by any
//! number of processes ([`ArchiveHandle::load`]). It holds class files and,
//! optionally, a pre-built object graph that is installed into pinned heap
//! regions with a base relocation.
//!
//! Nothing in the mapping is ever written. Runtime state for archived classes
//! (statics, resolved constants) lives in the class table, and a redefined
//! archived class gets a process-private version.

pub mod format;
pub mod heap;
pub mod loader;
pub mod writer;

pub use format::{ArchiveHeader, ARCHIVE_MAGIC, ARCHIVE_VERSION};
pub use heap::{materialize, ArchivedField, ArchivedObject, HeapSection, MaterializedHeap};
pub use loader::{ArchiveHandle, ArchivedClass, InstalledArchive};
pub use writer::ArchiveWriter;

use crate::codec::DecodeError;
use crate::heap::HeapError;

/// Archive errors
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Bad magic, version, checksum or structure
    #[error("Archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    /// Archive layout parameters differ from this process
    #[error("Archive is incompatible: {0}")]
    ArchiveIncompatible(String),

    /// Reading or writing the file failed
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Class is not in the archive or not loaded
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    /// Installing archived objects failed
    #[error(transparent)]
    Heap(#[from] HeapError),
}

impl ArchiveError {
    /// Corrupt-archive error with a message
    pub fn corrupt(message: impl Into<String>) -> Self {
        ArchiveError::ArchiveCorrupt(message.into())
    }

    /// Whether the process must refuse to start with this archive
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ArchiveError::ClassNotFound(_))
    }
}

impl From<DecodeError> for ArchiveError {
    fn from(err: DecodeError) -> Self {
        ArchiveError::ArchiveCorrupt(err.to_string())
    }
}
