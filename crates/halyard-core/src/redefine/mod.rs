//! Class redefinition
//!
//! [`RedefinitionManager::redefine`] replaces the methods of a loaded class.
//! The new class file must keep the shape of the old one: same superclass,
//! same instance fields, same static count and the same set of methods with
//! the same arities. Only method bodies and constants may change.
//!
//! The new version is always process-private, also for classes loaded from
//! the archive. It is published inside a safepoint pause so no thread
//! dispatches through a half-updated class. Frames already running the old
//! version keep their `Arc` and finish on the old code; the retired version is
//! unloaded by the collector once the last such frame returns.

pub mod agent;

pub use agent::{AgentHandle, RedefineAgent, RedefineRequest};

use crate::class::table::next_version;
use crate::class::{verify_class, ClassDefinition, ClassFormatError, ClassInfo, ClassTable, VerifyError};
use crate::gc::Collector;
use crate::safepoint::StopReason;
use parking_lot::Mutex;
use std::sync::Arc;

/// Redefinition errors; the class keeps its current definition
#[derive(Debug, Clone, thiserror::Error)]
pub enum RedefineError {
    /// New definition changes the class shape
    #[error("Incompatible change to {class}: {reason}")]
    IncompatibleChange {
        /// Class being redefined
        class: String,
        /// What changed
        reason: String,
    },

    /// New bytecode failed verification
    #[error("Verification failed: {0}")]
    VerificationError(#[from] VerifyError),

    /// No class with this name is loaded
    #[error("Unknown class: {0}")]
    UnknownClass(String),

    /// New class file could not be parsed
    #[error("Malformed class file: {0}")]
    MalformedClass(#[from] ClassFormatError),

    /// The agent thread is not running
    #[error("Redefinition agent is not running")]
    AgentUnavailable,
}

/// Performs class redefinitions
pub struct RedefinitionManager {
    classes: Arc<ClassTable>,
    collector: Arc<Collector>,
    /// One redefinition at a time
    lock: Mutex<()>,
}

impl RedefinitionManager {
    /// Create a manager over `classes`, pausing mutators of `collector`
    pub fn new(classes: Arc<ClassTable>, collector: Arc<Collector>) -> Self {
        Self {
            classes,
            collector,
            lock: Mutex::new(()),
        }
    }

    /// Class table
    pub fn classes(&self) -> &Arc<ClassTable> {
        &self.classes
    }

    /// Replace `class_name` with the class file in `bytes`, returning the new
    /// version number
    ///
    /// Blocks until all mutators reach a safepoint. A registered mutator must
    /// call this from inside `SafepointCoordinator::blocked`.
    pub fn redefine(&self, class_name: &str, bytes: &[u8]) -> Result<u32, RedefineError> {
        let _serial = self.lock.lock();
        let entry = self
            .classes
            .lookup(class_name)
            .and_then(|id| self.classes.entry(id))
            .ok_or_else(|| RedefineError::UnknownClass(class_name.to_string()))?;
        let definition = ClassDefinition::parse(bytes)?;
        let current = entry.current();
        check_shape(&current, &definition)?;

        let layout = current.layout().to_vec();
        verify_class(&definition, &layout)?;
        let next = Arc::new(next_version(&current, definition, layout, bytes.into()));

        let retired = {
            let _pause = self.collector.safepoint().begin_pause(StopReason::Redefinition);
            self.classes.publish(next.clone())
        };
        log::info!(
            "redefined {}: version {} -> {}{}",
            class_name,
            current.version(),
            next.version(),
            if current.is_archived() {
                " (archived version retired, new version is private)"
            } else {
                ""
            }
        );
        debug_assert!(retired.map_or(false, |r| Arc::ptr_eq(&r, &current)));
        Ok(next.version())
    }
}

/// Reject definitions whose shape differs from `current`
fn check_shape(current: &ClassInfo, next: &ClassDefinition) -> Result<(), RedefineError> {
    let old = current.definition();
    let incompatible = |reason: String| RedefineError::IncompatibleChange {
        class: old.name.clone(),
        reason,
    };
    if next.name != old.name {
        return Err(incompatible(format!("class file defines {}", next.name)));
    }
    if next.superclass != old.superclass {
        return Err(incompatible(format!(
            "superclass changed from {} to {}",
            old.superclass.as_deref().unwrap_or("<none>"),
            next.superclass.as_deref().unwrap_or("<none>")
        )));
    }
    if next.fields != old.fields {
        return Err(incompatible("instance field layout changed".to_string()));
    }
    if next.static_count != old.static_count {
        return Err(incompatible(format!(
            "static count changed from {} to {}",
            old.static_count, next.static_count
        )));
    }
    for method in &old.methods {
        match next.method(&method.name) {
            None => return Err(incompatible(format!("method {} removed", method.name))),
            Some((_, m)) if m.arity != method.arity => {
                return Err(incompatible(format!(
                    "method {} arity changed from {} to {}",
                    method.name, method.arity, m.arity
                )))
            }
            Some(_) => {}
        }
    }
    if let Some(added) = next.methods.iter().find(|m| old.method(&m.name).is_none()) {
        return Err(incompatible(format!("method {} added", added.name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{Assembler, ClassBuilder, FieldKind, Instruction};
    use crate::gc::CollectorConfig;
    use crate::heap::HeapConfig;
    use crate::heuristics::HeuristicKind;

    fn returning(value: i64) -> Vec<u8> {
        let mut asm = Assembler::new();
        asm.emit(Instruction::PushInt(value)).emit(Instruction::Return);
        asm.finish()
    }

    fn b_class(result: i64) -> ClassBuilder {
        let mut b = ClassBuilder::new("B");
        b.field("x", FieldKind::Int)
            .statics(1)
            .method("m", 1, 1, returning(result));
        b
    }

    fn manager() -> RedefinitionManager {
        let collector = Arc::new(Collector::new(
            HeapConfig {
                heap_size: 8 * 4096,
                region_size: 4096,
                compressed_refs: false,
                satb_buffer_size: 4,
                oom_during_evac_a_lot: false,
            },
            HeuristicKind::Passive.build(),
            CollectorConfig::default(),
        ));
        let classes = Arc::new(ClassTable::new());
        classes.define_bytes(&b_class(1).build().encode()).unwrap();
        RedefinitionManager::new(classes, collector)
    }

    #[test]
    fn test_redefine_publishes_new_version() {
        let manager = manager();
        let before = manager.classes().current_by_name("B").unwrap();
        let version = manager
            .redefine("B", &b_class(10).build().encode())
            .unwrap();
        assert_eq!(version, 2);

        let after = manager.classes().current_by_name("B").unwrap();
        assert_eq!(after.id(), before.id());
        assert!(!after.is_archived());
        assert_eq!(after.previous().unwrap().version(), 1);
        assert_eq!(manager.classes().retired_count(), 1);
    }

    #[test]
    fn test_shape_changes_rejected() {
        let manager = manager();

        let mut extra_field = b_class(1);
        extra_field.field("y", FieldKind::Int);
        let mut extra_method = b_class(1);
        extra_method.method("n", 1, 1, returning(0));
        let mut new_super = b_class(1);
        new_super.extends("String");
        let mut more_statics = b_class(1);
        more_statics.statics(2);

        for builder in [extra_field, extra_method, new_super, more_statics] {
            assert!(matches!(
                manager.redefine("B", &builder.build().encode()),
                Err(RedefineError::IncompatibleChange { .. })
            ));
        }
        assert_eq!(manager.classes().current_by_name("B").unwrap().version(), 1);
    }

    #[test]
    fn test_failed_verification_keeps_current_version() {
        let manager = manager();
        let mut asm = Assembler::new();
        asm.emit(Instruction::Add).emit(Instruction::Return);
        let mut bad = ClassBuilder::new("B");
        bad.field("x", FieldKind::Int)
            .statics(1)
            .method("m", 1, 1, asm.finish());

        assert!(matches!(
            manager.redefine("B", &bad.build().encode()),
            Err(RedefineError::VerificationError(_))
        ));
        assert!(matches!(
            manager.redefine("B", b"not a class"),
            Err(RedefineError::MalformedClass(_))
        ));
        assert!(matches!(
            manager.redefine("Nope", &b_class(1).build().encode()),
            Err(RedefineError::UnknownClass(_))
        ));
        let current = manager.classes().current_by_name("B").unwrap();
        assert_eq!(current.version(), 1);
        assert_eq!(manager.classes().retired_count(), 0);
    }
}
