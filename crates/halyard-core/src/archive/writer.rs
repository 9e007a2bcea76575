//! Archive writer - dumps classes and heap objects to an archive file

use super::format::{
    checksum, ArchiveHeader, ARCHIVE_VERSION, FLAG_HEAP_OBJECTS, NATIVE_POINTER_WIDTH,
};
use super::heap::{ArchivedObject, HeapSection};
use super::ArchiveError;
use crate::class::ClassDefinition;
use crate::codec::ByteWriter;
use rustc_hash::FxHashSet;
use std::io::Write;
use std::path::Path;

/// Builds an archive
#[derive(Debug)]
pub struct ArchiveWriter {
    compressed_refs: bool,
    region_size: usize,
    classes: Vec<(String, Option<String>, Vec<u8>)>,
    heap: HeapSection,
}

impl ArchiveWriter {
    /// Create a writer for a process with the given layout parameters
    pub fn new(compressed_refs: bool, region_size: usize) -> Self {
        Self {
            compressed_refs,
            region_size,
            classes: Vec::new(),
            heap: HeapSection::default(),
        }
    }

    /// Add a class
    pub fn add_class(&mut self, definition: &ClassDefinition) -> Result<(), ArchiveError> {
        if self.classes.iter().any(|(name, _, _)| *name == definition.name) {
            return Err(ArchiveError::corrupt(format!(
                "class {} added twice",
                definition.name
            )));
        }
        self.classes.push((
            definition.name.clone(),
            definition.superclass.clone(),
            definition.encode(),
        ));
        Ok(())
    }

    /// Add a class from class-file bytes
    pub fn add_class_bytes(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        let definition = ClassDefinition::parse(bytes)
            .map_err(|e| ArchiveError::corrupt(format!("class file: {}", e)))?;
        self.add_class(&definition)
    }

    /// Add a heap object, returning its archive index
    pub fn add_object(&mut self, object: ArchivedObject) -> u32 {
        self.heap.objects.push(object);
        (self.heap.objects.len() - 1) as u32
    }

    /// Name an object as a heap root
    pub fn add_root(&mut self, name: impl Into<String>, index: u32) {
        self.heap.roots.push((name.into(), index));
    }

    /// Replace the heap section, e.g. with one captured from a live heap
    pub fn set_heap_section(&mut self, section: HeapSection) {
        self.heap = section;
    }

    /// Number of classes added
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Classes in an order where every superclass precedes its subclasses
    fn ordered_classes(&self) -> Vec<&(String, Option<String>, Vec<u8>)> {
        let archived: FxHashSet<&str> = self.classes.iter().map(|(n, _, _)| n.as_str()).collect();
        let mut emitted: FxHashSet<&str> = FxHashSet::default();
        let mut ordered = Vec::with_capacity(self.classes.len());
        while ordered.len() < self.classes.len() {
            let before = ordered.len();
            for entry in &self.classes {
                let (name, superclass, _) = entry;
                if emitted.contains(name.as_str()) {
                    continue;
                }
                let ready = match superclass {
                    Some(sup) => !archived.contains(sup.as_str()) || emitted.contains(sup.as_str()),
                    None => true,
                };
                if ready {
                    emitted.insert(name);
                    ordered.push(entry);
                }
            }
            if ordered.len() == before {
                // cyclic hierarchy; keep insertion order and let loading fail
                ordered.extend(
                    self.classes
                        .iter()
                        .filter(|(n, _, _)| !emitted.contains(n.as_str())),
                );
                break;
            }
        }
        ordered
    }

    /// Encode the archive
    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        if !self.region_size.is_power_of_two() {
            return Err(ArchiveError::corrupt(format!(
                "region size {} is not a power of two",
                self.region_size
            )));
        }
        let mut payload = ByteWriter::new();
        for (name, _, bytes) in self.ordered_classes() {
            payload.emit_str(name);
            payload.emit_blob(bytes);
        }
        self.heap.encode(&mut payload);
        let payload = payload.into_bytes();

        let header = ArchiveHeader {
            version: ARCHIVE_VERSION,
            pointer_width: NATIVE_POINTER_WIDTH,
            compressed_refs: self.compressed_refs,
            region_size_log2: self.region_size.trailing_zeros() as u8,
            flags: if self.heap.is_empty() {
                0
            } else {
                FLAG_HEAP_OBJECTS
            },
            class_count: self.classes.len() as u32,
            object_count: self.heap.objects.len() as u32,
            root_count: self.heap.roots.len() as u32,
            payload_len: payload.len() as u64,
        };

        let mut out = ByteWriter::new();
        header.encode(&mut out);
        out.emit_bytes(&payload);
        out.emit_bytes(&checksum(&payload));
        Ok(out.into_bytes())
    }

    /// Write the archive to `path`
    pub fn write_to(&self, path: &Path) -> Result<usize, ArchiveError> {
        let bytes = self.to_bytes()?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        log::info!(
            "dumped archive {} ({} classes, {} heap objects, {} bytes)",
            path.display(),
            self.classes.len(),
            self.heap.objects.len(),
            bytes.len()
        );
        Ok(bytes.len())
    }
}
