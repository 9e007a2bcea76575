//! `halyard dump` - write a class archive.

use anyhow::Context;
use halyard_core::archive::{ArchivedField, ArchivedObject};
use halyard_core::demo::demo_classes;
use halyard_core::ArchiveWriter;
use std::path::PathBuf;

pub struct DumpArgs {
    pub output: PathBuf,
    pub classes: Vec<PathBuf>,
    pub heap_objects: bool,
    pub compressed_refs: bool,
    pub region_size: usize,
}

pub fn execute(args: DumpArgs) -> anyhow::Result<()> {
    let mut writer = ArchiveWriter::new(args.compressed_refs, args.region_size);

    if args.classes.is_empty() {
        for class in demo_classes() {
            writer.add_class(&class)?;
        }
        if args.heap_objects {
            add_demo_objects(&mut writer);
        }
    } else {
        for path in &args.classes {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            writer
                .add_class_bytes(&bytes)
                .with_context(|| format!("archiving {}", path.display()))?;
        }
    }

    let written = writer
        .write_to(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!(
        "wrote {} ({} classes, {} bytes)",
        args.output.display(),
        writer.class_count(),
        written
    );
    Ok(())
}

/// One instance of each subclass, reachable through named roots
fn add_demo_objects(writer: &mut ArchiveWriter) {
    let label = writer.add_object(ArchivedObject {
        class: "String".into(),
        fields: Vec::new(),
        payload: b"archived".to_vec(),
    });
    let sub = writer.add_object(ArchivedObject {
        class: "SubclassOfB".into(),
        fields: vec![ArchivedField::Int(0)],
        payload: Vec::new(),
    });
    let sub2 = writer.add_object(ArchivedObject {
        class: "Subclass2OfB".into(),
        fields: vec![ArchivedField::Int(0), ArchivedField::Ref(label)],
        payload: Vec::new(),
    });
    writer.add_root("SubclassOfB", sub);
    writer.add_root("Subclass2OfB", sub2);
}
