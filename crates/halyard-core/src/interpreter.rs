//! Bytecode interpreter
//!
//! Runs verified methods on a [`Mutator`]. Locals and operand stacks live on
//! the mutator's root stack, so the collector scans and rewrites them at every
//! pause; references are only held in Rust locals between two safepoints.
//!
//! Root stack layout of an activation:
//!
//! ```text
//! ┌──────────── frame 0 ────────────┬──────────── frame 1 ────────────┐
//! │ locals[max_locals] │ operands.. │ locals[max_locals] │ operands.. │
//! └────────────────────┴────────────┴────────────────────┴────────────┘
//!   ^ base                            ^ base = caller top - argc
//! ```
//!
//! Each frame holds the `Arc` of the class version it was entered with, so a
//! frame that was running when its class was redefined finishes on the old
//! code; every new call dispatches through the current versions.

use crate::class::{ClassId, ClassInfo, ClassTable, Constant, Instruction};
use crate::heap::{Mutator, ObjectRef};
use crate::value::Value;
use crate::{VmError, VmResult};
use std::sync::Arc;

/// Deepest call nesting before `StackOverflow`
pub const MAX_FRAMES: usize = 1024;

/// Interpreter bound to one mutator
pub struct Interpreter<'a> {
    mutator: &'a Mutator,
    classes: &'a ClassTable,
}

impl<'a> Interpreter<'a> {
    /// Create an interpreter
    pub fn new(mutator: &'a Mutator, classes: &'a ClassTable) -> Self {
        Self { mutator, classes }
    }

    /// Allocate an instance of the class named `name` with null fields
    pub fn new_instance(&self, name: &str) -> VmResult<ObjectRef> {
        let info = self
            .classes
            .current_by_name(name)
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))?;
        self.mutator.allocate(info.id(), info.layout().len(), &[])
    }

    /// Allocate a string
    pub fn new_string(&self, value: &str) -> VmResult<ObjectRef> {
        self.mutator.allocate(ClassId::STRING, 0, value.as_bytes())
    }

    /// Contents of a string object
    pub fn read_string(&self, obj: ObjectRef) -> VmResult<String> {
        if self.mutator.class_of(obj)? != ClassId::STRING {
            return Err(VmError::TypeError(format!("{} is not a string", obj)));
        }
        let len = self.mutator.payload_len(obj)?;
        let bytes = self.mutator.read_payload(obj, 0, len)?;
        String::from_utf8(bytes).map_err(|_| VmError::TypeError("invalid UTF-8 string".into()))
    }

    /// Call `method` on `receiver` and run it to completion
    pub fn invoke(&self, receiver: ObjectRef, method: &str, args: &[Value]) -> VmResult<Value> {
        self.activate(receiver, method, args)?.run()
    }

    /// Set up a call of `method` on `receiver` without running it
    pub fn activate(
        &self,
        receiver: ObjectRef,
        method: &str,
        args: &[Value],
    ) -> VmResult<Activation<'a>> {
        let root_base = self.mutator.root_depth();
        let mut activation = Activation {
            mutator: self.mutator,
            classes: self.classes,
            frames: Vec::new(),
            root_base,
            finished: false,
        };
        let argc = args.len() + 1;
        self.mutator.with_roots(|roots| {
            roots.push(Value::Ref(receiver));
            roots.extend_from_slice(args);
        });
        activation.enter(method, argc)?;
        Ok(activation)
    }
}

/// Outcome of one interpreter step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More instructions to run
    Running,
    /// The outermost frame returned
    Returned(Value),
}

struct Frame {
    class: Arc<ClassInfo>,
    method: usize,
    pc: usize,
    /// Root-stack index of local 0
    base: usize,
}

/// A resumable call in progress
///
/// Dropping an unfinished activation pops its frames off the root stack.
pub struct Activation<'a> {
    mutator: &'a Mutator,
    classes: &'a ClassTable,
    frames: Vec<Frame>,
    root_base: usize,
    finished: bool,
}

impl Activation<'_> {
    /// Current call depth
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Class version executing in the innermost frame
    pub fn current_class(&self) -> Option<&Arc<ClassInfo>> {
        self.frames.last().map(|f| &f.class)
    }

    /// Run to completion
    pub fn run(mut self) -> VmResult<Value> {
        loop {
            if let Step::Returned(value) = self.step()? {
                return Ok(value);
            }
        }
    }

    /// Execute one instruction
    pub fn step(&mut self) -> VmResult<Step> {
        if self.finished {
            return Err(VmError::InvalidState("activation already returned".into()));
        }
        let (class, method, pc) = match self.frames.last() {
            Some(f) => (f.class.clone(), f.method, f.pc),
            None => return Err(VmError::InvalidState("no active frame".into())),
        };
        let code = &class.definition().methods[method].code;
        let (insn, len) = Instruction::decode(code, pc)
            .map_err(|err| VmError::InvalidBytecode(format!("{:?} at offset {}", err, pc)))?;
        let next_pc = pc + len;
        self.set_pc(next_pc);

        match insn {
            Instruction::Nop => {}
            Instruction::PushInt(v) => self.push(Value::Int(v)),
            Instruction::PushConst(index) => {
                let value = self.constant(&class, index as usize)?;
                self.push(value);
            }
            Instruction::Load(index) => {
                let slot = self.local_slot(index)?;
                let value = self.mutator.root(slot).unwrap_or_default();
                self.push(value);
            }
            Instruction::Store(index) => {
                let slot = self.local_slot(index)?;
                let value = self.pop()?;
                self.mutator.set_root(slot, value);
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul | Instruction::Lt => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let result = match insn {
                    Instruction::Add => a.wrapping_add(b),
                    Instruction::Sub => a.wrapping_sub(b),
                    Instruction::Mul => a.wrapping_mul(b),
                    _ => (a < b) as i64,
                };
                self.push(Value::Int(result));
            }
            Instruction::Dup => {
                let top = self.pop()?;
                self.push(top);
                self.push(top);
            }
            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::GetField(index) => {
                let obj = self.pop_object()?;
                let value = self.mutator.read_field(obj, index as usize)?;
                self.push(value);
            }
            Instruction::PutField(index) => {
                let value = self.pop()?;
                let obj = self.pop_object()?;
                self.mutator.write_field(obj, index as usize, value)?;
            }
            Instruction::GetStatic(index) => {
                let entry = self.entry(class.id())?;
                let value = entry.static_value(index as usize).ok_or_else(|| {
                    VmError::InvalidBytecode(format!("static {} out of range", index))
                })?;
                self.push(value);
            }
            Instruction::PutStatic(index) => {
                let value = self.pop()?;
                let entry = self.entry(class.id())?;
                if !entry.set_static(index as usize, value) {
                    return Err(VmError::InvalidBytecode(format!(
                        "static {} out of range",
                        index
                    )));
                }
            }
            Instruction::New(index) => {
                let name = string_constant(&class, index)?;
                let target = self
                    .classes
                    .current_by_name(name)
                    .ok_or_else(|| VmError::ClassNotFound(name.to_string()))?;
                let obj = self
                    .mutator
                    .allocate(target.id(), target.layout().len(), &[])?;
                self.push(Value::Ref(obj));
            }
            Instruction::Invoke { name, argc } => {
                let name = string_constant(&class, name)?.to_string();
                self.mutator.poll();
                self.enter(&name, argc as usize)?;
            }
            Instruction::Jump(target) => self.branch(pc, target as usize),
            Instruction::JumpIfZero(target) => {
                let zero = match self.pop()? {
                    Value::Int(v) => v == 0,
                    Value::Null => true,
                    Value::Ref(_) => false,
                };
                if zero {
                    self.branch(pc, target as usize);
                }
            }
            Instruction::Return => {
                let value = self.pop()?;
                return Ok(self.leave(value));
            }
        }
        Ok(Step::Running)
    }

    /// Push a frame for `name`, dispatched on the receiver `argc` slots down
    fn enter(&mut self, name: &str, argc: usize) -> VmResult<()> {
        if self.frames.len() == MAX_FRAMES {
            return Err(VmError::StackOverflow(MAX_FRAMES));
        }
        let depth = self.mutator.root_depth();
        let base = depth
            .checked_sub(argc)
            .filter(|base| *base >= self.operand_floor())
            .ok_or_else(|| VmError::InvalidBytecode("operand stack underflow".into()))?;
        let receiver = self
            .mutator
            .root(base)
            .and_then(|v| v.as_object())
            .ok_or(VmError::NullReference)?;
        let class_id = self.mutator.class_of(receiver)?;
        let (info, method) = self.classes.resolve_method(class_id, name).ok_or_else(|| {
            VmError::MethodNotFound {
                class: self
                    .classes
                    .current(class_id)
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| class_id.to_string()),
                method: name.to_string(),
            }
        })?;

        let def = &info.definition().methods[method];
        if def.arity as usize != argc {
            return Err(VmError::TypeError(format!(
                "{}.{} takes {} arguments, got {}",
                info.name(),
                name,
                def.arity,
                argc
            )));
        }
        let extra = def.max_locals as usize - argc;
        self.mutator
            .with_roots(|roots| roots.resize(roots.len() + extra, Value::Null));
        log::trace!(
            "enter {}.{} (version {}, depth {})",
            info.name(),
            name,
            info.version(),
            self.frames.len() + 1
        );
        self.frames.push(Frame {
            class: info,
            method,
            pc: 0,
            base,
        });
        Ok(())
    }

    fn leave(&mut self, value: Value) -> Step {
        let Some(frame) = self.frames.pop() else {
            return Step::Returned(value);
        };
        self.mutator.truncate_roots(frame.base);
        if self.frames.is_empty() {
            self.finished = true;
            self.mutator.truncate_roots(self.root_base);
            Step::Returned(value)
        } else {
            self.push(value);
            Step::Running
        }
    }

    fn branch(&mut self, pc: usize, target: usize) {
        if target <= pc {
            self.mutator.poll();
        }
        self.set_pc(target);
    }

    fn set_pc(&mut self, pc: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
        }
    }

    /// Lowest root index the innermost frame may pop
    fn operand_floor(&self) -> usize {
        match self.frames.last() {
            Some(frame) => {
                frame.base + frame.class.definition().methods[frame.method].max_locals as usize
            }
            None => self.root_base,
        }
    }

    fn local_slot(&self, index: u16) -> VmResult<usize> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| VmError::InvalidState("no active frame".into()))?;
        let max = frame.class.definition().methods[frame.method].max_locals;
        if index >= max {
            return Err(VmError::InvalidBytecode(format!("local {} out of range", index)));
        }
        Ok(frame.base + index as usize)
    }

    fn entry(&self, id: ClassId) -> VmResult<Arc<crate::class::ClassEntry>> {
        self.classes
            .entry(id)
            .ok_or_else(|| VmError::ClassNotFound(id.to_string()))
    }

    fn push(&self, value: Value) {
        self.mutator.push_root(value);
    }

    fn pop(&self) -> VmResult<Value> {
        if self.mutator.root_depth() <= self.operand_floor() {
            return Err(VmError::InvalidBytecode("operand stack underflow".into()));
        }
        self.mutator
            .pop_root()
            .ok_or_else(|| VmError::InvalidBytecode("operand stack underflow".into()))
    }

    fn pop_int(&self) -> VmResult<i64> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(VmError::TypeError(format!("expected int, found {}", other))),
        }
    }

    fn pop_object(&self) -> VmResult<ObjectRef> {
        match self.pop()? {
            Value::Ref(obj) => Ok(obj),
            Value::Null => Err(VmError::NullReference),
            other => Err(VmError::TypeError(format!("expected object, found {}", other))),
        }
    }

    /// Value of constant `index`, allocating string constants on first use
    fn constant(&self, class: &Arc<ClassInfo>, index: usize) -> VmResult<Value> {
        match class.definition().constants.get(index) {
            Some(Constant::Int(v)) => Ok(Value::Int(*v)),
            Some(Constant::Str(s)) => {
                if let Some(resolved) = class.resolved_constant(index) {
                    return Ok(resolved);
                }
                let obj = self.mutator.allocate(ClassId::STRING, 0, s.as_bytes())?;
                class.set_resolved_constant(index, Value::Ref(obj));
                Ok(Value::Ref(obj))
            }
            None => Err(VmError::InvalidBytecode(format!(
                "constant {} out of range",
                index
            ))),
        }
    }
}

impl Drop for Activation<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.mutator.truncate_roots(self.root_base);
        }
    }
}

fn string_constant(class: &ClassInfo, index: u16) -> VmResult<&str> {
    class
        .definition()
        .constants
        .get(index as usize)
        .and_then(Constant::as_str)
        .ok_or_else(|| VmError::InvalidBytecode(format!("constant {} is not a string", index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{Assembler, ClassBuilder, FieldKind};
    use crate::gc::{Collector, CollectorConfig};
    use crate::heap::HeapConfig;
    use crate::heuristics::HeuristicKind;
    use std::time::Duration;

    fn setup(kind: HeuristicKind) -> Arc<Collector> {
        Arc::new(Collector::new(
            HeapConfig {
                heap_size: 32 * 4096,
                region_size: 4096,
                compressed_refs: false,
                satb_buffer_size: 8,
                oom_during_evac_a_lot: false,
            },
            kind.build(),
            CollectorConfig {
                workers: 1,
                verify: true,
                control_interval: Duration::from_millis(1),
                fatal_on_oom: false,
            },
        ))
    }

    /// Node { next: ref, value: int } with:
    /// - `sum(n)`: builds a list of n nodes and returns the sum 1..=n
    /// - `value()`: reads its own field
    /// - `label()`: returns a string constant
    fn node_class(classes: &ClassTable) {
        let mut b = ClassBuilder::new("Node");
        b.field("next", FieldKind::Ref).field("value", FieldKind::Int);
        let node = b.string("Node");
        let value_name = b.string("value");
        let label = b.string("node-label");

        // locals: 0 self, 1 n, 2 head, 3 cursor, 4 total
        let mut sum = Assembler::new();
        let build = sum.label();
        let built = sum.label();
        let walk = sum.label();
        let done = sum.label();
        sum.bind(build)
            .emit(Instruction::Load(1))
            .jump_if_zero(built)
            .emit(Instruction::New(node))
            .emit(Instruction::Store(3))
            .emit(Instruction::Load(3))
            .emit(Instruction::Load(1))
            .emit(Instruction::PutField(1))
            .emit(Instruction::Load(3))
            .emit(Instruction::Load(2))
            .emit(Instruction::PutField(0))
            .emit(Instruction::Load(3))
            .emit(Instruction::Store(2))
            .emit(Instruction::Load(1))
            .emit(Instruction::PushInt(1))
            .emit(Instruction::Sub)
            .emit(Instruction::Store(1))
            .jump(build)
            .bind(built)
            .emit(Instruction::PushInt(0))
            .emit(Instruction::Store(4))
            .bind(walk)
            .emit(Instruction::Load(2))
            .jump_if_zero(done)
            .emit(Instruction::Load(4))
            .emit(Instruction::Load(2))
            .emit(Instruction::Invoke {
                name: value_name,
                argc: 1,
            })
            .emit(Instruction::Add)
            .emit(Instruction::Store(4))
            .emit(Instruction::Load(2))
            .emit(Instruction::GetField(0))
            .emit(Instruction::Store(2))
            .jump(walk)
            .bind(done)
            .emit(Instruction::Load(4))
            .emit(Instruction::Return);
        b.method("sum", 2, 5, sum.finish());

        let mut value = Assembler::new();
        value
            .emit(Instruction::Load(0))
            .emit(Instruction::GetField(1))
            .emit(Instruction::Return);
        b.method("value", 1, 1, value.finish());

        let mut label_code = Assembler::new();
        label_code
            .emit(Instruction::PushConst(label))
            .emit(Instruction::Return);
        b.method("label", 1, 1, label_code.finish());

        classes.define_bytes(&b.build().encode()).unwrap();
    }

    #[test]
    fn test_invoke_builds_and_walks_list() {
        let gc = setup(HeuristicKind::Static);
        let classes = ClassTable::new();
        node_class(&classes);
        let m = Mutator::attach(gc.clone());
        let interp = Interpreter::new(&m, &classes);

        let root = interp.new_instance("Node").unwrap();
        let result = interp.invoke(root, "sum", &[Value::Int(10)]).unwrap();
        assert_eq!(result, Value::Int(55));
        assert_eq!(m.root_depth(), 0);
    }

    #[test]
    fn test_stack_survives_collection_mid_call() {
        let gc = setup(HeuristicKind::Aggressive);
        let classes = Arc::new(ClassTable::new());
        gc.register_root_provider(classes.clone());
        node_class(&classes);
        let m = Mutator::attach(gc.clone());
        let interp = Interpreter::new(&m, &classes);

        let root = interp.new_instance("Node").unwrap();
        let mut activation = interp.activate(root, "sum", &[Value::Int(6)]).unwrap();
        for i in 0.. {
            if i % 7 == 0 {
                m.collect().unwrap();
            }
            if let Step::Returned(v) = activation.step().unwrap() {
                assert_eq!(v, Value::Int(21));
                break;
            }
        }
        assert!(gc.stats().collections > 0);
    }

    #[test]
    fn test_string_constants_resolve_once() {
        let gc = setup(HeuristicKind::Aggressive);
        let classes = Arc::new(ClassTable::new());
        gc.register_root_provider(classes.clone());
        node_class(&classes);
        let m = Mutator::attach(gc.clone());
        let interp = Interpreter::new(&m, &classes);

        let node = interp.new_instance("Node").unwrap();
        let idx = m.push_root(Value::Ref(node));
        let first = interp.invoke(node, "label", &[]).unwrap();
        let first_idx = m.push_root(first);
        m.collect().unwrap();

        let node = m.root(idx).and_then(|v| v.as_object()).unwrap();
        let second = interp.invoke(node, "label", &[]).unwrap();
        let first = m.root(first_idx).unwrap();
        assert!(m
            .same_object(first.as_object().unwrap(), second.as_object().unwrap())
            .unwrap());
        assert_eq!(
            interp.read_string(second.as_object().unwrap()).unwrap(),
            "node-label"
        );
    }

    #[test]
    fn test_runtime_errors() {
        let gc = setup(HeuristicKind::Static);
        let classes = ClassTable::new();
        node_class(&classes);
        let m = Mutator::attach(gc.clone());
        let interp = Interpreter::new(&m, &classes);
        let node = interp.new_instance("Node").unwrap();

        assert!(matches!(
            interp.invoke(node, "missing", &[]),
            Err(VmError::MethodNotFound { .. })
        ));
        assert!(matches!(
            interp.invoke(node, "sum", &[]),
            Err(VmError::TypeError(_))
        ));
        assert!(matches!(
            interp.new_instance("Nope"),
            Err(VmError::ClassNotFound(_))
        ));
        assert_eq!(m.root_depth(), 0);
    }
}
