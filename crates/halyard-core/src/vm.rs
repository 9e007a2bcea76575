//! VM Lifecycle
//!
//! [`Vm`] wires the pieces together: a collector over a fresh heap, the class
//! table registered as a root provider, the optional shared archive, the
//! redefinition manager with its agent thread, and the GC control thread.

use crate::archive::{ArchiveError, ArchiveHandle, MaterializedHeap};
use crate::class::{ClassInfo, ClassTable};
use crate::config::VmOptions;
use crate::gc::{Collector, GcControlThread, GcStats, RootProvider};
use crate::heap::{Mutator, ObjectRef};
use crate::interpreter::Interpreter;
use crate::redefine::{AgentHandle, RedefineAgent, RedefinitionManager};
use crate::{VmError, VmResult};
use std::sync::Arc;

/// Statistics for a running VM
#[derive(Debug, Clone)]
pub struct VmStats {
    /// Heap bytes in use
    pub heap_used: usize,
    /// Heap capacity
    pub heap_capacity: usize,
    /// Loaded classes, the string class included
    pub classes: usize,
    /// Retired class versions still pinned by running frames
    pub retired_versions: usize,
    /// Collector statistics
    pub gc: GcStats,
}

/// High-level VM handle
pub struct Vm {
    options: VmOptions,
    collector: Arc<Collector>,
    classes: Arc<ClassTable>,
    archive: Option<ArchiveHandle>,
    archived_heap: Option<MaterializedHeap>,
    redefinition: Arc<RedefinitionManager>,
    agent: RedefineAgent,
    control: Option<GcControlThread>,
}

impl Vm {
    /// Create a VM with a GC control thread
    ///
    /// # Arguments
    /// * `options` - Launch configuration; `options.archive` is mapped and
    ///   installed if set
    ///
    /// # Returns
    /// * `Ok(Vm)` - VM ready for mutators to attach
    /// * `Err(VmError)` - Invalid options or an unusable archive
    pub fn new(options: VmOptions) -> VmResult<Self> {
        let mut vm = Self::new_without_control(options)?;
        vm.control = Some(GcControlThread::start(vm.collector.clone())?);
        Ok(vm)
    }

    /// Create a VM whose cycles only run when a mutator requests them
    ///
    /// Allocation failures are handled on the failing thread, and nothing
    /// polls the heuristics, so runs are deterministic.
    pub fn new_without_control(options: VmOptions) -> VmResult<Self> {
        options.validate()?;
        let collector = Arc::new(Collector::from_options(&options));
        let classes = Arc::new(ClassTable::new());
        collector.register_root_provider(classes.clone() as Arc<dyn RootProvider>);

        let (archive, archived_heap) = match &options.archive {
            Some(path) => {
                let installed = ArchiveHandle::load(path, options.compressed_refs).and_then(|archive| {
                    let installed =
                        archive.install(&classes, collector.heap(), options.share_heap_objects)?;
                    Ok((archive, installed))
                });
                match installed {
                    Ok((archive, installed)) => {
                        log::info!(
                            "archive {}: {} classes installed{}",
                            path.display(),
                            installed.classes.len(),
                            if installed.heap.is_some() { ", heap objects shared" } else { "" }
                        );
                        (Some(archive), installed.heap)
                    }
                    Err(err) => return Err(fatal_archive_error(&collector, err)),
                }
            }
            None => (None, None),
        };

        let redefinition = Arc::new(RedefinitionManager::new(classes.clone(), collector.clone()));
        let agent = RedefineAgent::start(redefinition.clone())?;
        log::info!(
            "VM started: heap {} bytes in {}-byte regions, {} heuristics",
            collector.heap().capacity(),
            collector.heap().region_size(),
            collector.heuristics().name()
        );
        Ok(Self {
            options,
            collector,
            classes,
            archive,
            archived_heap,
            redefinition,
            agent,
            control: None,
        })
    }

    /// Launch configuration
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Collector
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Class table
    pub fn classes(&self) -> &Arc<ClassTable> {
        &self.classes
    }

    /// Mapped archive, if any
    pub fn archive(&self) -> Option<&ArchiveHandle> {
        self.archive.as_ref()
    }

    /// Archived heap object registered under `name`
    ///
    /// Archive objects are pinned, so the reference stays valid.
    pub fn archived_root(&self, name: &str) -> Option<ObjectRef> {
        self.archived_heap.as_ref().and_then(|heap| heap.root(name))
    }

    /// Attach the calling thread as a mutator
    pub fn attach(&self) -> Mutator {
        Mutator::attach(self.collector.clone())
    }

    /// Interpreter running on `mutator`
    pub fn interpreter<'a>(&'a self, mutator: &'a Mutator) -> Interpreter<'a> {
        Interpreter::new(mutator, &self.classes)
    }

    /// Define a class from class-file bytes
    pub fn define_class(&self, bytes: &[u8]) -> VmResult<Arc<ClassInfo>> {
        Ok(self.classes.define_bytes(bytes)?)
    }

    /// Redefine a class directly; must not be called from a running mutator
    pub fn redefine(&self, class_name: &str, bytes: &[u8]) -> VmResult<u32> {
        Ok(self.redefinition.redefine(class_name, bytes)?)
    }

    /// Handle to the redefinition agent
    pub fn agent(&self) -> AgentHandle {
        self.agent.handle()
    }

    /// Current statistics
    pub fn stats(&self) -> VmStats {
        let heap = self.collector.heap();
        VmStats {
            heap_used: heap.used(),
            heap_capacity: heap.capacity(),
            classes: self.classes.len(),
            retired_versions: self.classes.retired_count(),
            gc: self.collector.stats(),
        }
    }

    /// Stop the agent and control threads
    pub fn shutdown(&mut self) {
        self.agent.shutdown();
        if let Some(mut control) = self.control.take() {
            control.shutdown();
        }
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.verify_integrity() {
                log::error!("{}", err);
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fatal_archive_error(collector: &Collector, err: ArchiveError) -> VmError {
    log::error!("unusable archive: {}\n{}", err, collector.dump());
    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::class::{Assembler, ClassBuilder, Instruction};
    use crate::heuristics::HeuristicKind;
    use tempfile::TempDir;

    fn options() -> VmOptions {
        VmOptions {
            heap_size: 4 * 1024 * 1024,
            region_size: 64 * 1024,
            heuristics: HeuristicKind::Passive,
            ..VmOptions::default()
        }
    }

    fn class_returning(value: i64) -> Vec<u8> {
        let mut asm = Assembler::new();
        asm.emit(Instruction::PushInt(value)).emit(Instruction::Return);
        let mut b = ClassBuilder::new("B");
        b.method("m", 1, 1, asm.finish());
        b.build().encode()
    }

    #[test]
    fn test_vm_runs_and_redefines() {
        let vm = Vm::new_without_control(options()).unwrap();
        vm.define_class(&class_returning(1)).unwrap();
        let mutator = vm.attach();
        let interp = vm.interpreter(&mutator);
        let b = interp.new_instance("B").unwrap();
        mutator.push_root(b.into());
        assert_eq!(interp.invoke(b, "m", &[]).unwrap().as_int(), Some(1));

        let version = mutator
            .blocked(|| vm.agent().redefine("B", class_returning(5)))
            .unwrap();
        assert_eq!(version, 2);
        let b = mutator.root(0).and_then(|v| v.as_object()).unwrap();
        assert_eq!(interp.invoke(b, "m", &[]).unwrap().as_int(), Some(5));
        assert_eq!(vm.stats().classes, 2);
    }

    #[test]
    fn test_vm_with_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.hsa");
        let mut writer = ArchiveWriter::new(true, 64 * 1024);
        writer.add_class_bytes(&class_returning(3)).unwrap();
        writer.write_to(&path).unwrap();

        let vm = Vm::new(VmOptions {
            archive: Some(path.clone()),
            ..options()
        })
        .unwrap();
        assert!(vm.classes().current_by_name("B").unwrap().is_archived());
        assert!(vm.archive().is_some());

        let err = Vm::new_without_control(VmOptions {
            archive: Some(path),
            compressed_refs: false,
            ..options()
        });
        assert!(matches!(
            err,
            Err(VmError::Archive(ArchiveError::ArchiveIncompatible(_)))
        ));
    }
}
