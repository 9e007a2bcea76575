//! Classes
//!
//! A loaded class is a [`ClassEntry`] in the [`ClassTable`]: a stable id and
//! name, the process-private mirror (static fields), and a chain of
//! [`ClassInfo`] versions. The current version is what new calls dispatch to;
//! versions replaced by redefinition are retired and stay alive while any
//! interpreter frame still holds them.
//!
//! A `ClassInfo` created from the shared archive keeps its class-file bytes in
//! the read-only mapping; versions created by redefinition own their bytes.

pub mod bytecode;
pub mod table;
pub mod verifier;

pub use bytecode::{
    Assembler, ClassBuilder, ClassDefinition, ClassFormatError, Constant, FieldDef, FieldKind,
    Instruction, Label, MethodDef, Opcode,
};
pub use table::{ClassEntry, ClassTable};
pub use verifier::{verify_class, VType, VerifyError};

use crate::archive::ArchiveHandle;
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Weak};

/// Class identifier, an index into the class table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Built-in string class; payload holds UTF-8 bytes
    pub const STRING: ClassId = ClassId(0);

    /// Table index
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Class loading errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassError {
    /// Class file could not be parsed
    #[error(transparent)]
    Format(#[from] ClassFormatError),

    /// Bytecode failed verification
    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// A class with this name is already loaded
    #[error("Class {0} is already defined")]
    AlreadyDefined(String),

    /// Superclass is not loaded
    #[error("Superclass {superclass} of {class} is not loaded")]
    UnknownSuperclass {
        /// Class being defined
        class: String,
        /// Missing superclass
        superclass: String,
    },
}

/// Where a version's class-file bytes live
#[derive(Clone)]
pub enum ClassBytes {
    /// Inside the shared archive mapping
    Archived {
        /// Mapping the bytes belong to
        archive: ArchiveHandle,
        /// Byte range within the mapping
        range: Range<usize>,
    },
    /// Owned by this process
    Private(Arc<[u8]>),
}

impl ClassBytes {
    /// The class-file bytes
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ClassBytes::Archived { archive, range } => archive.slice(range.clone()),
            ClassBytes::Private(bytes) => bytes,
        }
    }

    /// Whether the bytes live in the shared archive
    pub fn is_archived(&self) -> bool {
        matches!(self, ClassBytes::Archived { .. })
    }
}

impl fmt::Debug for ClassBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassBytes::Archived { range, .. } => write!(f, "Archived({:?})", range),
            ClassBytes::Private(bytes) => write!(f, "Private({} bytes)", bytes.len()),
        }
    }
}

/// One version of a class
pub struct ClassInfo {
    id: ClassId,
    version: u32,
    definition: ClassDefinition,
    layout: Vec<FieldDef>,
    superclass: Option<ClassId>,
    bytes: ClassBytes,
    previous: Option<Weak<ClassInfo>>,
    /// Resolved string constants, `Null` until first use; GC roots
    constants: Mutex<Vec<Value>>,
}

impl ClassInfo {
    pub(crate) fn new(
        id: ClassId,
        version: u32,
        definition: ClassDefinition,
        layout: Vec<FieldDef>,
        superclass: Option<ClassId>,
        bytes: ClassBytes,
        previous: Option<Weak<ClassInfo>>,
    ) -> Self {
        let constants = vec![Value::Null; definition.constants.len()];
        Self {
            id,
            version,
            definition,
            layout,
            superclass,
            bytes,
            previous,
            constants: Mutex::new(constants),
        }
    }

    /// Class id
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Version number, starting at 1 and bumped by each redefinition
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Parsed class file
    pub fn definition(&self) -> &ClassDefinition {
        &self.definition
    }

    /// Complete instance layout, inherited fields first
    pub fn layout(&self) -> &[FieldDef] {
        &self.layout
    }

    /// Superclass id
    pub fn superclass(&self) -> Option<ClassId> {
        self.superclass
    }

    /// Class-file bytes
    pub fn bytes(&self) -> &ClassBytes {
        &self.bytes
    }

    /// Whether this version's metadata lives in the shared archive
    pub fn is_archived(&self) -> bool {
        self.bytes.is_archived()
    }

    /// The version this one replaced, while it is still alive
    pub fn previous(&self) -> Option<Arc<ClassInfo>> {
        self.previous.as_ref().and_then(Weak::upgrade)
    }

    /// Method by name
    pub fn method(&self, name: &str) -> Option<(usize, &MethodDef)> {
        self.definition.method(name)
    }

    /// Resolved value of constant `index`, if it has been resolved
    pub fn resolved_constant(&self, index: usize) -> Option<Value> {
        self.constants
            .lock()
            .get(index)
            .copied()
            .filter(|v| !v.is_null())
    }

    /// Record the resolved value of constant `index`
    pub fn set_resolved_constant(&self, index: usize, value: Value) {
        if let Some(slot) = self.constants.lock().get_mut(index) {
            *slot = value;
        }
    }

    pub(crate) fn visit_constants(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for slot in self.constants.lock().iter_mut() {
            visitor(slot);
        }
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("id", &self.id)
            .field("name", &self.definition.name)
            .field("version", &self.version)
            .field("bytes", &self.bytes)
            .finish()
    }
}
