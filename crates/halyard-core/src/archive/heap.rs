//! Archived heap objects
//!
//! Objects are stored in dump order. A reference field holds the index of the
//! target object within the archive, so materializing the section only needs
//! a base relocation: index `i` becomes the heap slot reserved for object `i`.
//! Archived objects land in pinned `Archive` regions and are treated as roots
//! by the collector.

use super::ArchiveError;
use crate::class::{ClassId, ClassTable};
use crate::codec::{ByteReader, ByteWriter, DecodeError};
use crate::heap::{object_size, Heap, HeapObject, ObjectRef};
use crate::value::Value;
use rustc_hash::FxHashMap;

/// Field value of an archived object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivedField {
    /// Null reference
    Null,
    /// Integer
    Int(i64),
    /// Reference to another archived object, by index
    Ref(u32),
}

/// An archived object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedObject {
    /// Class name
    pub class: String,
    /// Fields
    pub fields: Vec<ArchivedField>,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// Heap section of an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapSection {
    /// Objects in dump order
    pub objects: Vec<ArchivedObject>,
    /// Named entry points into the object graph
    pub roots: Vec<(String, u32)>,
}

impl HeapSection {
    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Encode objects then roots
    pub fn encode(&self, writer: &mut ByteWriter) {
        for obj in &self.objects {
            writer.emit_str(&obj.class);
            writer.emit_u16(obj.fields.len() as u16);
            for field in &obj.fields {
                match *field {
                    ArchivedField::Null => writer.emit_u8(0),
                    ArchivedField::Int(v) => {
                        writer.emit_u8(1);
                        writer.emit_i64(v);
                    }
                    ArchivedField::Ref(index) => {
                        writer.emit_u8(2);
                        writer.emit_u32(index);
                    }
                }
            }
            writer.emit_blob(&obj.payload);
        }
        for (name, index) in &self.roots {
            writer.emit_str(name);
            writer.emit_u32(*index);
        }
    }

    /// Decode `object_count` objects and `root_count` roots, checking that
    /// every reference stays inside the section
    pub fn decode(
        reader: &mut ByteReader<'_>,
        object_count: u32,
        root_count: u32,
    ) -> Result<Self, ArchiveError> {
        let mut objects = Vec::with_capacity(object_count.min(1 << 16) as usize);
        for _ in 0..object_count {
            let class = reader.read_string()?;
            let field_count = reader.read_u16()? as usize;
            let mut fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                let offset = reader.position();
                let field = match reader.read_u8()? {
                    0 => ArchivedField::Null,
                    1 => ArchivedField::Int(reader.read_i64()?),
                    2 => {
                        let index = reader.read_u32()?;
                        if index >= object_count {
                            return Err(ArchiveError::corrupt(format!(
                                "object reference {} out of {} objects",
                                index, object_count
                            )));
                        }
                        ArchivedField::Ref(index)
                    }
                    tag => return Err(DecodeError::InvalidTag { tag, offset }.into()),
                };
                fields.push(field);
            }
            let payload = reader.read_blob()?.to_vec();
            objects.push(ArchivedObject {
                class,
                fields,
                payload,
            });
        }

        let mut roots = Vec::with_capacity(root_count.min(1 << 16) as usize);
        for _ in 0..root_count {
            let name = reader.read_string()?;
            let index = reader.read_u32()?;
            if index >= object_count {
                return Err(ArchiveError::corrupt(format!(
                    "root {} refers to object {} out of {}",
                    name, index, object_count
                )));
            }
            roots.push((name, index));
        }
        Ok(Self { objects, roots })
    }

    /// Snapshot the object graph reachable from `roots` into a section
    ///
    /// The caller must keep the collector from moving objects meanwhile,
    /// e.g. by not reaching a safepoint.
    pub fn capture(
        heap: &Heap,
        classes: &ClassTable,
        roots: &[(&str, ObjectRef)],
    ) -> Result<Self, ArchiveError> {
        let mut capture = Capture {
            heap,
            classes,
            section: HeapSection::default(),
            index_of: FxHashMap::default(),
            pending: Vec::new(),
        };
        for (name, obj) in roots {
            let index = capture.intern(*obj)?;
            capture.section.roots.push((name.to_string(), index));
        }
        while let Some((obj, index)) = capture.pending.pop() {
            let mut fields = Vec::new();
            for i in 0..heap.field_count(obj)? {
                let field = match heap.read_field(obj, i)? {
                    Value::Null => ArchivedField::Null,
                    Value::Int(v) => ArchivedField::Int(v),
                    Value::Ref(target) => ArchivedField::Ref(capture.intern(target)?),
                };
                fields.push(field);
            }
            let payload = heap.read_payload(obj, 0, heap.payload_len(obj)?)?;
            let archived = &mut capture.section.objects[index as usize];
            archived.fields = fields;
            archived.payload = payload;
        }
        Ok(capture.section)
    }
}

struct Capture<'a> {
    heap: &'a Heap,
    classes: &'a ClassTable,
    section: HeapSection,
    index_of: FxHashMap<ObjectRef, u32>,
    pending: Vec<(ObjectRef, u32)>,
}

impl Capture<'_> {
    /// Archive index of `obj`, queueing it on first sight
    fn intern(&mut self, obj: ObjectRef) -> Result<u32, ArchiveError> {
        let obj = self.heap.resolve(obj)?;
        if let Some(index) = self.index_of.get(&obj) {
            return Ok(*index);
        }
        let class = self.heap.class_of(obj)?;
        let name = self
            .classes
            .current(class)
            .map(|c| c.name().to_string())
            .ok_or_else(|| ArchiveError::ClassNotFound(class.to_string()))?;
        let index = self.section.objects.len() as u32;
        self.index_of.insert(obj, index);
        self.section.objects.push(ArchivedObject {
            class: name,
            fields: Vec::new(),
            payload: Vec::new(),
        });
        self.pending.push((obj, index));
        Ok(index)
    }
}

/// Archive objects installed in the heap
#[derive(Debug, Clone, Default)]
pub struct MaterializedHeap {
    /// Heap location of each archived object, by archive index
    pub objects: Vec<ObjectRef>,
    roots: FxHashMap<String, ObjectRef>,
}

impl MaterializedHeap {
    /// Named root object
    pub fn root(&self, name: &str) -> Option<ObjectRef> {
        self.roots.get(name).copied()
    }

    /// Root names
    pub fn root_names(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }
}

/// Install `section` into pinned archive regions of `heap`
///
/// Every object's class must already be loaded in `classes`.
pub fn materialize(
    section: &HeapSection,
    heap: &Heap,
    classes: &ClassTable,
) -> Result<MaterializedHeap, ArchiveError> {
    let class_ids = section
        .objects
        .iter()
        .enumerate()
        .map(|(index, obj)| {
            let class = classes
                .current_by_name(&obj.class)
                .ok_or_else(|| ArchiveError::ClassNotFound(obj.class.clone()))?;
            if class.layout().len() != obj.fields.len() {
                return Err(ArchiveError::corrupt(format!(
                    "archived object {} has {} fields, class {} declares {}",
                    index,
                    obj.fields.len(),
                    obj.class,
                    class.layout().len()
                )));
            }
            Ok(class.id())
        })
        .collect::<Result<Vec<ClassId>, _>>()?;

    let ref_bytes = heap.ref_bytes();
    let sizes: Vec<usize> = section
        .objects
        .iter()
        .map(|obj| object_size(obj.fields.len(), obj.payload.len(), ref_bytes))
        .collect();
    let placements = heap.reserve_archive_space(&sizes)?;

    let objects = section
        .objects
        .iter()
        .zip(&class_ids)
        .map(|(archived, class)| {
            let mut obj =
                HeapObject::new(*class, archived.fields.len(), &archived.payload, ref_bytes);
            for (slot, field) in obj.fields.iter_mut().zip(&archived.fields) {
                *slot = match *field {
                    ArchivedField::Null => Value::Null,
                    ArchivedField::Int(v) => Value::Int(v),
                    ArchivedField::Ref(index) => Value::Ref(placements[index as usize]),
                };
            }
            obj
        })
        .collect();
    heap.install_archive_objects(&placements, objects)?;

    let roots = section
        .roots
        .iter()
        .map(|(name, index)| (name.clone(), placements[*index as usize]))
        .collect();
    log::info!(
        "materialized {} archived objects ({} bytes) in {} regions",
        placements.len(),
        sizes.iter().sum::<usize>(),
        heap.archive_regions().count()
    );
    Ok(MaterializedHeap {
        objects: placements,
        roots,
    })
}
