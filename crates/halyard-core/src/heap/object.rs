//! Object layout
//!
//! Every heap object carries a header with its class, a mark word holding the
//! object's age, and a forwarding slot that is only meaningful while a moving
//! phase is in progress.
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ ObjectHeader (16 bytes accounted)         │
//! │  - class: ClassId                         │
//! │  - mark: MarkWord (age bits)              │
//! │  - size: u32 (total accounted bytes)      │
//! │  - forwardee: Option<ObjectRef>           │
//! ├───────────────────────────────────────────┤
//! │ Fields (reference width each)             │
//! ├───────────────────────────────────────────┤
//! │ Payload (raw bytes)                       │
//! └───────────────────────────────────────────┘
//! ```

use crate::class::ClassId;
use crate::defaults::{MAX_OBJECT_AGE, OBJECT_ALIGNMENT, OBJECT_HEADER_BYTES};
use crate::value::Value;
use std::fmt;

/// Index of a region in the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    /// Region index as usize
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Reference to a heap object: the region it lives in and its allocation slot
///
/// Slots are handed out in allocation order, so a slot index doubles as the
/// object's position relative to the region's top-at-mark-start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// Owning region
    pub region: RegionId,
    /// Allocation slot within the region
    pub slot: u32,
}

impl ObjectRef {
    /// Create a new object reference
    #[inline]
    pub const fn new(region: RegionId, slot: u32) -> Self {
        Self { region, slot }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.region, self.slot)
    }
}

/// Mark word: the object's age in survived collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkWord(u8);

impl MarkWord {
    const AGE_MASK: u8 = 0x0f;

    /// Age of the object (saturates at 15)
    #[inline]
    pub fn age(self) -> u8 {
        self.0 & Self::AGE_MASK
    }

    /// Return the mark word with the age incremented by one
    #[inline]
    pub fn incremented(self) -> Self {
        let age = self.age();
        if age >= MAX_OBJECT_AGE {
            self
        } else {
            MarkWord((self.0 & !Self::AGE_MASK) | (age + 1))
        }
    }
}

/// Object header
#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader {
    /// Class of the object
    pub class: ClassId,
    /// Mark word
    pub mark: MarkWord,
    /// Accounted object size in bytes, header included
    pub size: u32,
}

/// Compute the accounted size of an object
///
/// Header bytes plus one reference width per field plus the payload, rounded
/// up to the object alignment.
pub fn object_size(field_count: usize, payload_len: usize, ref_bytes: usize) -> usize {
    let raw = OBJECT_HEADER_BYTES + field_count * ref_bytes + payload_len;
    (raw + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// A heap object
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// Header
    pub header: ObjectHeader,
    /// Forwarding slot, set once the object has been copied
    forwardee: Option<ObjectRef>,
    /// Reference and scalar fields
    pub fields: Vec<Value>,
    /// Raw payload bytes
    pub payload: Box<[u8]>,
}

impl HeapObject {
    /// Create a new object with null fields
    pub fn new(class: ClassId, field_count: usize, payload: &[u8], ref_bytes: usize) -> Self {
        let size = object_size(field_count, payload.len(), ref_bytes);
        Self {
            header: ObjectHeader {
                class,
                mark: MarkWord::default(),
                size: size as u32,
            },
            forwardee: None,
            fields: vec![Value::Null; field_count],
            payload: payload.into(),
        }
    }

    /// Accounted size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    /// Where this object was copied to, if it has been
    #[inline]
    pub fn forwardee(&self) -> Option<ObjectRef> {
        self.forwardee
    }

    /// Check whether the object has been forwarded
    #[inline]
    pub fn is_forwarded(&self) -> bool {
        self.forwardee.is_some()
    }

    /// Install the forwarding pointer
    #[inline]
    pub fn set_forwardee(&mut self, to: ObjectRef) {
        self.forwardee = Some(to);
    }

    /// Clear the forwarding pointer
    #[inline]
    pub fn clear_forwardee(&mut self) {
        self.forwardee = None;
    }

    /// Move the object's contents out into a copy with its age bumped
    ///
    /// The source keeps only its header; all further access must go through
    /// the forwarding pointer.
    pub fn evacuation_copy(&mut self) -> HeapObject {
        HeapObject {
            header: ObjectHeader {
                class: self.header.class,
                mark: self.header.mark.incremented(),
                size: self.header.size,
            },
            forwardee: None,
            fields: std::mem::take(&mut self.fields),
            payload: std::mem::take(&mut self.payload),
        }
    }

    /// Iterate over the object's reference fields
    pub fn references(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.fields.iter().filter_map(|v| v.as_object())
    }
}
