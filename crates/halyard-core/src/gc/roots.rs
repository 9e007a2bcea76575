//! GC root tracking
//!
//! Roots are starting points for GC traversal and include:
//! - Mutator root stacks (interpreter operand stacks and locals, handles)
//! - Class mirrors: static fields and resolved constants, for current and
//!   retired class versions
//! - Named global handles
//!
//! Every root source implements [`RootProvider`]. Providers are only visited
//! at safepoints, so no root is observed mid-mutation; visitors receive
//! `&mut Value` so moving phases can rewrite roots in place.

use crate::heap::{MutatorState, ThreadLocalHeap};
use crate::value::Value;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A source of GC roots
pub trait RootProvider: Send + Sync {
    /// Provider name for diagnostics
    fn name(&self) -> &'static str;

    /// Visit every root slot
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value));

    /// Drop metadata that no longer pins anything, returning how much was
    /// released. Called at Final Mark and during full collections.
    fn unload_unreferenced(&self) -> usize {
        0
    }
}

/// Registry of live mutators
#[derive(Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<MutatorState>>>,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mutator
    pub fn add(&self, state: Arc<MutatorState>) {
        self.threads.lock().push(state);
    }

    /// Remove a mutator
    pub fn remove(&self, id: u64) {
        self.threads.lock().retain(|s| s.id() != id);
    }

    /// Number of registered mutators
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on every mutator's thread-local heap state
    pub fn for_each_local(&self, mut f: impl FnMut(&mut ThreadLocalHeap)) {
        for state in self.threads.lock().iter() {
            f(&mut state.local.lock());
        }
    }
}

impl RootProvider for ThreadRegistry {
    fn name(&self) -> &'static str {
        "mutator stacks"
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for state in self.threads.lock().iter() {
            for slot in state.roots.lock().iter_mut() {
                visitor(slot);
            }
        }
    }
}

/// Named global roots
#[derive(Default)]
pub struct GlobalHandles {
    handles: Mutex<FxHashMap<String, Value>>,
}

impl GlobalHandles {
    /// Create an empty handle table
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a handle
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.handles.lock().insert(name.into(), value);
    }

    /// Read a handle
    pub fn get(&self, name: &str) -> Option<Value> {
        self.handles.lock().get(name).copied()
    }

    /// Remove a handle
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.handles.lock().remove(name)
    }

    /// Number of handles
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootProvider for GlobalHandles {
    fn name(&self) -> &'static str {
        "global handles"
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in self.handles.lock().values_mut() {
            visitor(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ObjectRef, RegionId};

    #[test]
    fn test_global_handles_visit_and_rewrite() {
        let globals = GlobalHandles::new();
        let a = ObjectRef::new(RegionId(0), 1);
        let b = ObjectRef::new(RegionId(5), 0);
        globals.set("config", Value::Ref(a));
        globals.set("count", Value::Int(3));

        let mut seen = 0;
        globals.visit_roots(&mut |v| {
            if v.is_heap_allocated() {
                seen += 1;
                *v = Value::Ref(b);
            }
        });
        assert_eq!(seen, 1);
        assert_eq!(globals.get("config"), Some(Value::Ref(b)));
        assert_eq!(globals.get("count"), Some(Value::Int(3)));
        assert_eq!(globals.remove("count"), Some(Value::Int(3)));
        assert_eq!(globals.len(), 1);
    }

    #[test]
    fn test_thread_registry_visits_root_stacks() {
        let registry = ThreadRegistry::new();
        let state = Arc::new(MutatorState::new(7, 16));
        state.roots.lock().push(Value::Int(1));
        state
            .roots
            .lock()
            .push(Value::Ref(ObjectRef::new(RegionId(2), 3)));
        registry.add(state);

        let mut refs = Vec::new();
        registry.visit_roots(&mut |v| {
            if let Some(obj) = v.as_object() {
                refs.push(obj);
            }
        });
        assert_eq!(refs, vec![ObjectRef::new(RegionId(2), 3)]);

        registry.remove(7);
        assert!(registry.is_empty());
    }
}
