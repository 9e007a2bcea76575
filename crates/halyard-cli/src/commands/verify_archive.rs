//! `halyard verify-archive` - check an archive's header and checksum.

use anyhow::Context;
use halyard_core::ArchiveHandle;
use std::path::Path;

pub fn execute(path: &Path, compressed_refs: bool) -> anyhow::Result<()> {
    let archive = ArchiveHandle::load(path, compressed_refs)
        .with_context(|| format!("loading {}", path.display()))?;
    archive.verify_integrity()?;

    let header = archive.header();
    println!("{}: ok", path.display());
    println!(
        "  format version {}, {}-bit pointers, {} references, regions {} bytes",
        header.version,
        header.pointer_width,
        if header.compressed_refs {
            "compressed"
        } else {
            "uncompressed"
        },
        header.region_size()
    );
    println!(
        "  {} classes, {} heap objects, {} roots",
        header.class_count, header.object_count, header.root_count
    );
    for name in archive.class_names() {
        let class = archive.resolve_class(name)?;
        println!(
            "  {} ({} methods, {} bytes)",
            class.name(),
            class.definition.methods.len(),
            class.range.len()
        );
    }
    Ok(())
}
