//! Archive loader
//!
//! Maps an archive read-only, validates it, and indexes its classes. Class
//! files are decoded on first lookup; the decoded definitions borrow nothing
//! from the mapping, while [`ClassBytes::Archived`] keeps a handle so the raw
//! bytes stay reachable for as long as any class version refers to them.

use super::format::{checksum, split_checked, ArchiveHeader, CHECKSUM_SIZE};
use super::heap::{materialize, HeapSection, MaterializedHeap};
use super::ArchiveError;
use crate::class::{ClassBytes, ClassDefinition, ClassId, ClassTable};
use crate::codec::ByteReader;
use crate::heap::Heap;
use dashmap::DashMap;
use memmap2::Mmap;
use std::fmt;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A class decoded from the archive
#[derive(Debug)]
pub struct ArchivedClass {
    /// Parsed class file
    pub definition: ClassDefinition,
    /// Byte range of the class file within the mapping
    pub range: Range<usize>,
}

impl ArchivedClass {
    /// Class name
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

struct ArchiveInner {
    path: PathBuf,
    map: Mmap,
    header: ArchiveHeader,
    payload: Range<usize>,
    /// Class names in archive order with their class-file ranges
    index: Vec<(String, Range<usize>)>,
    resolved: DashMap<String, Arc<ArchivedClass>>,
    heap: Option<HeapSection>,
}

/// Handle to a mapped archive
///
/// Cheap to clone; the mapping lives until the last handle is dropped.
#[derive(Clone)]
pub struct ArchiveHandle {
    inner: Arc<ArchiveInner>,
}

/// What [`ArchiveHandle::install`] put into the process
#[derive(Debug, Default)]
pub struct InstalledArchive {
    /// Classes defined, in archive order
    pub classes: Vec<ClassId>,
    /// Materialized heap objects, if heap sharing was used
    pub heap: Option<MaterializedHeap>,
}

impl ArchiveHandle {
    /// Map and validate the archive at `path`
    ///
    /// Fails with `ArchiveCorrupt` on a bad header, checksum or structure and
    /// with `ArchiveIncompatible` when the archive was dumped with different
    /// pointer width or reference compression.
    pub fn load(path: &Path, compressed_refs: bool) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the file is never written
        // while mapped by this process.
        let map = unsafe { Mmap::map(&file)? };

        let (header, payload) = split_checked(&map)?;
        header.check_compatible(compressed_refs)?;

        let mut reader = ByteReader::new(&map[payload.clone()]);
        let mut index = Vec::with_capacity(header.class_count.min(1 << 16) as usize);
        for _ in 0..header.class_count {
            let name = reader.read_string()?;
            let blob = reader.read_blob()?;
            let end = payload.start + reader.position();
            index.push((name, end - blob.len()..end));
        }

        let heap = if header.has_heap_objects() {
            Some(HeapSection::decode(
                &mut reader,
                header.object_count,
                header.root_count,
            )?)
        } else if header.object_count != 0 || header.root_count != 0 {
            return Err(ArchiveError::corrupt(
                "heap objects recorded without the heap-object flag",
            ));
        } else {
            None
        };
        if reader.remaining() != 0 {
            return Err(ArchiveError::corrupt(format!(
                "{} trailing payload bytes",
                reader.remaining()
            )));
        }

        log::info!(
            "mapped archive {}: version {}, {}-bit pointers, compressed refs {}, region size {}, {} classes, {} heap objects",
            path.display(),
            header.version,
            header.pointer_width,
            header.compressed_refs,
            header.region_size(),
            header.class_count,
            header.object_count
        );

        Ok(Self {
            inner: Arc::new(ArchiveInner {
                path: path.to_path_buf(),
                map,
                header,
                payload,
                index,
                resolved: DashMap::new(),
                heap,
            }),
        })
    }

    /// File the archive was mapped from
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Header
    pub fn header(&self) -> &ArchiveHeader {
        &self.inner.header
    }

    /// Bytes of the mapping in `range`; empty if out of bounds
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        self.inner.map.get(range).unwrap_or(&[])
    }

    /// Class names in archive order
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.inner.index.iter().map(|(name, _)| name.as_str())
    }

    /// Heap section, if the archive has one
    pub fn heap_section(&self) -> Option<&HeapSection> {
        self.inner.heap.as_ref()
    }

    /// Look up and decode a class by name
    pub fn resolve_class(&self, name: &str) -> Result<Arc<ArchivedClass>, ArchiveError> {
        if let Some(class) = self.inner.resolved.get(name) {
            return Ok(class.clone());
        }
        let range = self
            .inner
            .index
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, range)| range.clone())
            .ok_or_else(|| ArchiveError::ClassNotFound(name.to_string()))?;
        let definition = ClassDefinition::parse(self.slice(range.clone()))
            .map_err(|e| ArchiveError::corrupt(format!("class {}: {}", name, e)))?;
        if definition.name != name {
            return Err(ArchiveError::corrupt(format!(
                "entry {} holds class {}",
                name, definition.name
            )));
        }
        let class = Arc::new(ArchivedClass { definition, range });
        Ok(self
            .inner
            .resolved
            .entry(name.to_string())
            .or_insert(class)
            .clone())
    }

    /// Re-hash the mapped payload against the stored checksum
    pub fn verify_integrity(&self) -> Result<(), ArchiveError> {
        let payload = &self.inner.map[self.inner.payload.clone()];
        let end = self.inner.payload.end;
        let stored = &self.inner.map[end..end + CHECKSUM_SIZE];
        if checksum(payload).as_slice() != stored {
            return Err(ArchiveError::corrupt(format!(
                "{} changed since it was mapped",
                self.inner.path.display()
            )));
        }
        Ok(())
    }

    /// Define every archived class in `classes` and, when `share_heap_objects`
    /// is set, materialize the heap section into `heap`
    ///
    /// A heap section laid out for a different region size is skipped with a
    /// warning; the classes are still usable.
    pub fn install(
        &self,
        classes: &ClassTable,
        heap: &Heap,
        share_heap_objects: bool,
    ) -> Result<InstalledArchive, ArchiveError> {
        let mut installed = InstalledArchive::default();
        for name in self.class_names() {
            let archived = self.resolve_class(name)?;
            let bytes = ClassBytes::Archived {
                archive: self.clone(),
                range: archived.range.clone(),
            };
            let info = classes
                .define(archived.definition.clone(), bytes)
                .map_err(|e| ArchiveError::corrupt(format!("class {}: {}", name, e)))?;
            installed.classes.push(info.id());
        }

        if let Some(section) = self.heap_section().filter(|s| !s.is_empty()) {
            if !share_heap_objects {
                log::debug!("heap object sharing disabled, skipping archived objects");
            } else if self.header().region_size() != heap.region_size() {
                log::warn!(
                    "archive heap objects were laid out for {}-byte regions, heap uses {}; not sharing them",
                    self.header().region_size(),
                    heap.region_size()
                );
            } else {
                installed.heap = Some(materialize(section, heap, classes)?);
            }
        }
        Ok(installed)
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("path", &self.inner.path)
            .field("classes", &self.inner.index.len())
            .field("len", &self.inner.map.len())
            .finish()
    }
}
