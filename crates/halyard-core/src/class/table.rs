//! Class table
//!
//! Maps class ids and names to loaded classes. Entries are never removed, so
//! a `ClassId` stays valid for the life of the table; only retired versions
//! of a class are dropped, once nothing executes them any more.

use super::bytecode::{ClassDefinition, FieldDef};
use super::verifier::verify_class;
use super::{ClassBytes, ClassError, ClassId, ClassInfo};
use crate::gc::RootProvider;
use crate::value::Value;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// A loaded class
pub struct ClassEntry {
    id: ClassId,
    name: String,
    current: RwLock<Arc<ClassInfo>>,
    /// Static fields, shared by every version
    statics: Mutex<Vec<Value>>,
    /// Replaced versions that may still be executing
    retired: Mutex<Vec<Arc<ClassInfo>>>,
}

impl ClassEntry {
    /// Class id
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current version
    pub fn current(&self) -> Arc<ClassInfo> {
        self.current.read().clone()
    }

    /// Read a static field
    pub fn static_value(&self, index: usize) -> Option<Value> {
        self.statics.lock().get(index).copied()
    }

    /// Write a static field; false if `index` is out of range
    pub fn set_static(&self, index: usize, value: Value) -> bool {
        match self.statics.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Versions of retired definitions still held
    pub fn retired_versions(&self) -> Vec<u32> {
        self.retired.lock().iter().map(|v| v.version()).collect()
    }

    /// Swap in `next`, retiring the current version
    fn publish(&self, next: Arc<ClassInfo>) -> Arc<ClassInfo> {
        let previous = std::mem::replace(&mut *self.current.write(), next);
        self.retired.lock().push(previous.clone());
        previous
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for slot in self.statics.lock().iter_mut() {
            visitor(slot);
        }
        self.current.read().visit_constants(visitor);
        for version in self.retired.lock().iter() {
            version.visit_constants(visitor);
        }
    }

    fn unload_unreferenced(&self) -> usize {
        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|version| {
            // the retired list's own reference is the last one
            let pinned = Arc::strong_count(version) > 1;
            if !pinned {
                log::debug!("unloading {} version {}", self.name, version.version());
            }
            pinned
        });
        before - retired.len()
    }
}

/// Registry of loaded classes
pub struct ClassTable {
    entries: RwLock<Vec<Arc<ClassEntry>>>,
    by_name: DashMap<String, ClassId>,
    /// Serializes definitions so the name check and insert are atomic
    define_lock: Mutex<()>,
}

impl ClassTable {
    /// Create a table holding only the built-in string class
    pub fn new() -> Self {
        let table = Self {
            entries: RwLock::new(Vec::new()),
            by_name: DashMap::new(),
            define_lock: Mutex::new(()),
        };
        let string = ClassDefinition {
            name: "String".to_string(),
            superclass: None,
            fields: Vec::new(),
            static_count: 0,
            constants: Vec::new(),
            methods: Vec::new(),
        };
        let bytes = ClassBytes::Private(string.encode().into());
        let info = ClassInfo::new(ClassId::STRING, 1, string, Vec::new(), None, bytes, None);
        table.insert(Arc::new(info), 0);
        table
    }

    fn insert(&self, info: Arc<ClassInfo>, static_count: usize) {
        let entry = Arc::new(ClassEntry {
            id: info.id(),
            name: info.name().to_string(),
            current: RwLock::new(info),
            statics: Mutex::new(vec![Value::Null; static_count]),
            retired: Mutex::new(Vec::new()),
        });
        let (name, id) = (entry.name.clone(), entry.id);
        self.entries.write().push(entry);
        self.by_name.insert(name, id);
    }

    /// Parse and define a class from process-private bytes
    pub fn define_bytes(&self, bytes: &[u8]) -> Result<Arc<ClassInfo>, ClassError> {
        let definition = ClassDefinition::parse(bytes)?;
        self.define(definition, ClassBytes::Private(bytes.into()))
    }

    /// Verify and define a class whose superclass is already loaded
    pub fn define(
        &self,
        definition: ClassDefinition,
        bytes: ClassBytes,
    ) -> Result<Arc<ClassInfo>, ClassError> {
        let _guard = self.define_lock.lock();
        if self.by_name.contains_key(&definition.name) {
            return Err(ClassError::AlreadyDefined(definition.name));
        }

        let (superclass, mut layout) = match &definition.superclass {
            Some(name) => {
                let parent = self.current_by_name(name).ok_or_else(|| {
                    ClassError::UnknownSuperclass {
                        class: definition.name.clone(),
                        superclass: name.clone(),
                    }
                })?;
                (Some(parent.id()), parent.layout().to_vec())
            }
            None => (None, Vec::new()),
        };
        layout.extend(definition.fields.iter().cloned());
        verify_class(&definition, &layout)?;

        let id = ClassId(self.entries.read().len() as u32);
        let static_count = definition.static_count as usize;
        log::debug!(
            "defined class {} as {} ({} fields, {} methods, {})",
            definition.name,
            id,
            layout.len(),
            definition.methods.len(),
            if bytes.is_archived() { "archived" } else { "private" }
        );
        let info = Arc::new(ClassInfo::new(
            id, 1, definition, layout, superclass, bytes, None,
        ));
        self.insert(info.clone(), static_count);
        Ok(info)
    }

    /// Number of loaded classes, the string class included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a class id by name
    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).map(|id| *id)
    }

    /// Entry for `id`
    pub fn entry(&self, id: ClassId) -> Option<Arc<ClassEntry>> {
        self.entries.read().get(id.index()).cloned()
    }

    /// Current version of `id`
    pub fn current(&self, id: ClassId) -> Option<Arc<ClassInfo>> {
        self.entry(id).map(|e| e.current())
    }

    /// Current version of the class named `name`
    pub fn current_by_name(&self, name: &str) -> Option<Arc<ClassInfo>> {
        self.lookup(name).and_then(|id| self.current(id))
    }

    /// Names of all loaded classes in id order
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.clone()).collect()
    }

    /// Find `name` on the current version of `class` or its superclasses
    pub fn resolve_method(&self, class: ClassId, name: &str) -> Option<(Arc<ClassInfo>, usize)> {
        let mut next = Some(class);
        while let Some(id) = next {
            let info = self.current(id)?;
            if let Some((index, _)) = info.method(name) {
                return Some((info, index));
            }
            next = info.superclass();
        }
        None
    }

    /// Whether `class` is `ancestor` or inherits from it
    pub fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut next = Some(class);
        while let Some(id) = next {
            if id == ancestor {
                return true;
            }
            next = self.current(id).and_then(|info| info.superclass());
        }
        false
    }

    /// Direct and indirect subclasses of `class`
    pub fn subclasses_of(&self, class: ClassId) -> Vec<ClassId> {
        self.entries
            .read()
            .iter()
            .map(|e| e.id)
            .filter(|id| *id != class && self.is_subclass_of(*id, class))
            .collect()
    }

    /// Make `next` the current version of its class, retiring the old one
    ///
    /// Must run inside a safepoint pause so no mutator sees the swap halfway.
    pub(crate) fn publish(&self, next: Arc<ClassInfo>) -> Option<Arc<ClassInfo>> {
        let entry = self.entry(next.id())?;
        Some(entry.publish(next))
    }

    /// Total retired versions still held
    pub fn retired_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .map(|e| e.retired.lock().len())
            .sum()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RootProvider for ClassTable {
    fn name(&self) -> &'static str {
        "class mirrors"
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in self.entries.read().iter() {
            entry.visit_roots(visitor);
        }
    }

    fn unload_unreferenced(&self) -> usize {
        self.entries
            .read()
            .iter()
            .map(|e| e.unload_unreferenced())
            .sum()
    }
}

/// Build the successor of `current` from a verified definition
pub(crate) fn next_version(
    current: &Arc<ClassInfo>,
    definition: ClassDefinition,
    layout: Vec<FieldDef>,
    bytes: Arc<[u8]>,
) -> ClassInfo {
    ClassInfo::new(
        current.id(),
        current.version() + 1,
        definition,
        layout,
        current.superclass(),
        ClassBytes::Private(bytes),
        Some(Arc::downgrade(current)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::bytecode::{Assembler, ClassBuilder, FieldKind, Instruction};
    use crate::class::VerifyError;
    use crate::heap::{ObjectRef, RegionId};

    fn returning(value: i64) -> Vec<u8> {
        let mut asm = Assembler::new();
        asm.emit(Instruction::PushInt(value)).emit(Instruction::Return);
        asm.finish()
    }

    fn define(table: &ClassTable, builder: &ClassBuilder) -> Result<Arc<ClassInfo>, ClassError> {
        table.define_bytes(&builder.build().encode())
    }

    fn hierarchy() -> ClassTable {
        let table = ClassTable::new();
        let mut b = ClassBuilder::new("B");
        b.field("x", FieldKind::Int)
            .statics(1)
            .method("m", 1, 1, returning(1))
            .method("only_b", 1, 1, returning(7));
        define(&table, &b).unwrap();

        let mut sub = ClassBuilder::new("SubclassOfB");
        sub.extends("B")
            .field("y", FieldKind::Ref)
            .method("m", 1, 1, returning(2));
        define(&table, &sub).unwrap();
        table
    }

    #[test]
    fn test_builtin_string_class() {
        let table = ClassTable::new();
        assert_eq!(table.lookup("String"), Some(ClassId::STRING));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_layout_and_dispatch() {
        let table = hierarchy();
        let b = table.lookup("B").unwrap();
        let sub = table.current_by_name("SubclassOfB").unwrap();
        assert_eq!(sub.layout().len(), 2);
        assert_eq!(sub.layout()[0].name, "x");
        assert_eq!(sub.superclass(), Some(b));
        assert!(table.is_subclass_of(sub.id(), b));
        assert!(!table.is_subclass_of(b, sub.id()));
        assert_eq!(table.subclasses_of(b), vec![sub.id()]);

        let (owner, _) = table.resolve_method(sub.id(), "m").unwrap();
        assert_eq!(owner.name(), "SubclassOfB");
        let (owner, _) = table.resolve_method(sub.id(), "only_b").unwrap();
        assert_eq!(owner.name(), "B");
        assert!(table.resolve_method(sub.id(), "missing").is_none());
    }

    #[test]
    fn test_define_errors() {
        let table = hierarchy();
        let dup = ClassBuilder::new("B");
        assert!(matches!(define(&table, &dup), Err(ClassError::AlreadyDefined(_))));

        let mut orphan = ClassBuilder::new("Orphan");
        orphan.extends("Nowhere");
        assert!(matches!(
            define(&table, &orphan),
            Err(ClassError::UnknownSuperclass { .. })
        ));

        // the inherited layout has only two fields
        let mut asm = Assembler::new();
        asm.emit(Instruction::Load(0))
            .emit(Instruction::GetField(2))
            .emit(Instruction::Return);
        let mut bad = ClassBuilder::new("Bad");
        bad.extends("SubclassOfB").method("m", 1, 1, asm.finish());
        assert!(matches!(
            define(&table, &bad),
            Err(ClassError::Verify(VerifyError::InvalidFieldRef { max: 2, .. }))
        ));
        assert!(table.lookup("Bad").is_none());
    }

    #[test]
    fn test_publish_retires_until_unpinned() {
        let table = hierarchy();
        let old = table.current_by_name("B").unwrap();
        let mut b2 = ClassBuilder::new("B");
        b2.field("x", FieldKind::Int).method("m", 1, 1, returning(10));
        let def = b2.build();
        let bytes: Arc<[u8]> = def.encode().into();
        let next = Arc::new(next_version(&old, def, old.layout().to_vec(), bytes));
        table.publish(next.clone());

        assert_eq!(table.current_by_name("B").unwrap().version(), 2);
        assert_eq!(next.previous().map(|p| p.version()), Some(1));

        // `old` still pins version 1
        assert_eq!(table.unload_unreferenced(), 0);
        assert_eq!(table.retired_count(), 1);
        drop(old);
        assert_eq!(table.unload_unreferenced(), 1);
        assert_eq!(table.retired_count(), 0);
        assert!(next.previous().is_none());
    }

    #[test]
    fn test_roots_include_statics_and_constants() {
        let table = hierarchy();
        let b = table.entry(table.lookup("B").unwrap()).unwrap();
        let obj = ObjectRef::new(RegionId(3), 1);
        assert!(b.set_static(0, Value::Ref(obj)));
        assert!(!b.set_static(1, Value::Int(1)));

        let mut seen = Vec::new();
        table.visit_roots(&mut |v| {
            if let Some(o) = v.as_object() {
                seen.push(o);
                *v = Value::Ref(ObjectRef::new(RegionId(4), 0));
            }
        });
        assert_eq!(seen, vec![obj]);
        assert_eq!(
            b.static_value(0),
            Some(Value::Ref(ObjectRef::new(RegionId(4), 0)))
        );
    }
}
