//! Bytecode verification
//!
//! Every method is checked by abstract interpretation before its class is
//! published: operands must be in range, jumps must land on instruction
//! boundaries, the stack must have the same height (and compatible types)
//! wherever control flow merges, and no path may run off the end of the code.

use super::bytecode::{ClassDefinition, Constant, FieldDef, FieldKind, Instruction, InstructionError, MethodDef};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

/// Deepest operand stack a method may build
pub const MAX_STACK_DEPTH: usize = 256;

/// Bytecode verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Invalid opcode
    #[error("{method}: invalid opcode {opcode:#x} at offset {offset}")]
    InvalidOpcode {
        method: String,
        opcode: u8,
        offset: usize,
    },

    /// Operands cut off by the end of the code
    #[error("{method}: truncated instruction at offset {offset}")]
    Truncated { method: String, offset: usize },

    /// Stack underflow
    #[error("{method}: stack underflow at offset {offset}")]
    StackUnderflow { method: String, offset: usize },

    /// Stack overflow
    #[error("{method}: stack overflow at offset {offset}")]
    StackOverflow { method: String, offset: usize },

    /// Invalid jump target
    #[error("{method}: invalid jump target {target} at offset {offset}")]
    InvalidJumpTarget {
        method: String,
        target: usize,
        offset: usize,
    },

    /// Invalid constant pool reference
    #[error("{method}: invalid constant pool reference {index} at offset {offset}")]
    InvalidConstantRef {
        method: String,
        index: usize,
        offset: usize,
    },

    /// Invalid local variable reference
    #[error("{method}: invalid local {index} (max {max}) at offset {offset}")]
    InvalidLocalRef {
        method: String,
        index: usize,
        max: usize,
        offset: usize,
    },

    /// Invalid instance field reference
    #[error("{method}: invalid field {index} (max {max}) at offset {offset}")]
    InvalidFieldRef {
        method: String,
        index: usize,
        max: usize,
        offset: usize,
    },

    /// Invalid static field reference
    #[error("{method}: invalid static {index} (max {max}) at offset {offset}")]
    InvalidStaticRef {
        method: String,
        index: usize,
        max: usize,
        offset: usize,
    },

    /// Operand of the wrong type
    #[error("{method}: expected {expected} but found {found} at offset {offset}")]
    TypeMismatch {
        method: String,
        expected: &'static str,
        found: VType,
        offset: usize,
    },

    /// Stack heights differ where control flow merges
    #[error("{method}: stack height {found} does not match {expected} at offset {offset}")]
    StackHeightMismatch {
        method: String,
        expected: usize,
        found: usize,
        offset: usize,
    },

    /// Execution falls off end
    #[error("{method}: execution falls off end of method at offset {offset}")]
    FallOffEnd { method: String, offset: usize },

    /// Invoke without a receiver
    #[error("{method}: invoke with no receiver at offset {offset}")]
    MissingReceiver { method: String, offset: usize },

    /// Arguments do not fit in the locals
    #[error("{method}: arity {arity} exceeds max locals {max_locals}")]
    ArityExceedsLocals {
        method: String,
        arity: u8,
        max_locals: u16,
    },

    /// Two methods share a name
    #[error("duplicate method {0}")]
    DuplicateMethod(String),
}

/// Abstract value type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VType {
    /// Integer
    Int,
    /// Reference (possibly null)
    Ref,
    /// Unknown: either of the above, or null
    Any,
}

impl VType {
    fn merge(self, other: VType) -> VType {
        if self == other {
            self
        } else {
            VType::Any
        }
    }

    fn is_int(self) -> bool {
        self != VType::Ref
    }

    fn is_ref(self) -> bool {
        self != VType::Int
    }
}

impl From<FieldKind> for VType {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Int => VType::Int,
            FieldKind::Ref => VType::Ref,
        }
    }
}

impl fmt::Display for VType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VType::Int => "int",
            VType::Ref => "ref",
            VType::Any => "any",
        })
    }
}

/// Verify every method of `def`
///
/// `layout` is the complete instance layout, inherited fields first.
pub fn verify_class(def: &ClassDefinition, layout: &[FieldDef]) -> Result<(), VerifyError> {
    let mut names = FxHashSet::default();
    for method in &def.methods {
        if !names.insert(method.name.as_str()) {
            return Err(VerifyError::DuplicateMethod(method.name.clone()));
        }
        verify_method(def, method, layout)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct Frame {
    stack: Vec<VType>,
    locals: Vec<VType>,
}

struct MethodVerifier<'a> {
    def: &'a ClassDefinition,
    method: &'a MethodDef,
    layout: &'a [FieldDef],
}

fn verify_method(
    def: &ClassDefinition,
    method: &MethodDef,
    layout: &[FieldDef],
) -> Result<(), VerifyError> {
    if method.arity as u16 > method.max_locals {
        return Err(VerifyError::ArityExceedsLocals {
            method: method.name.clone(),
            arity: method.arity,
            max_locals: method.max_locals,
        });
    }
    MethodVerifier {
        def,
        method,
        layout,
    }
    .run()
}

impl MethodVerifier<'_> {
    fn name(&self) -> String {
        self.method.name.clone()
    }

    fn run(&self) -> Result<(), VerifyError> {
        let instructions = self.parse_instructions()?;
        if instructions.is_empty() {
            return Err(VerifyError::FallOffEnd {
                method: self.name(),
                offset: 0,
            });
        }
        let index_of: FxHashMap<usize, usize> = instructions
            .iter()
            .enumerate()
            .map(|(i, (offset, _))| (*offset, i))
            .collect();

        // every jump, reachable or not, must land on a boundary
        let mut targets = vec![Vec::new(); instructions.len()];
        for (i, (offset, insn)) in instructions.iter().enumerate() {
            if let Some(target) = insn.branch_target() {
                let index = index_of.get(&(target as usize)).copied().ok_or(
                    VerifyError::InvalidJumpTarget {
                        method: self.name(),
                        target: target as usize,
                        offset: *offset,
                    },
                )?;
                targets[i].push(index);
            }
        }

        let mut states: Vec<Option<Frame>> = vec![None; instructions.len()];
        states[0] = Some(Frame {
            stack: Vec::new(),
            locals: vec![VType::Any; self.method.max_locals as usize],
        });
        let mut worklist = vec![0usize];

        while let Some(i) = worklist.pop() {
            let Some(mut frame) = states[i].clone() else {
                continue;
            };
            let (offset, insn) = instructions[i];
            self.step(offset, &insn, &mut frame)?;

            let mut successors = targets[i].clone();
            if !insn.is_terminator() {
                if i + 1 == instructions.len() {
                    return Err(VerifyError::FallOffEnd {
                        method: self.name(),
                        offset,
                    });
                }
                successors.push(i + 1);
            }

            for next in successors {
                if self.merge_into(&mut states[next], &frame, instructions[next].0)? {
                    worklist.push(next);
                }
            }
        }
        Ok(())
    }

    fn parse_instructions(&self) -> Result<Vec<(usize, Instruction)>, VerifyError> {
        let code = &self.method.code;
        let mut instructions = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            let (insn, len) = Instruction::decode(code, offset).map_err(|err| match err {
                InstructionError::InvalidOpcode(opcode) => VerifyError::InvalidOpcode {
                    method: self.name(),
                    opcode,
                    offset,
                },
                InstructionError::Truncated => VerifyError::Truncated {
                    method: self.name(),
                    offset,
                },
            })?;
            instructions.push((offset, insn));
            offset += len;
        }
        Ok(instructions)
    }

    /// Merge `incoming` into a successor's state; true if the state changed
    fn merge_into(
        &self,
        state: &mut Option<Frame>,
        incoming: &Frame,
        offset: usize,
    ) -> Result<bool, VerifyError> {
        let Some(existing) = state else {
            *state = Some(incoming.clone());
            return Ok(true);
        };
        if existing.stack.len() != incoming.stack.len() {
            return Err(VerifyError::StackHeightMismatch {
                method: self.name(),
                expected: existing.stack.len(),
                found: incoming.stack.len(),
                offset,
            });
        }
        let merged = Frame {
            stack: existing
                .stack
                .iter()
                .zip(&incoming.stack)
                .map(|(a, b)| a.merge(*b))
                .collect(),
            locals: existing
                .locals
                .iter()
                .zip(&incoming.locals)
                .map(|(a, b)| a.merge(*b))
                .collect(),
        };
        if merged == *existing {
            return Ok(false);
        }
        *existing = merged;
        Ok(true)
    }

    fn pop(&self, frame: &mut Frame, offset: usize) -> Result<VType, VerifyError> {
        frame.stack.pop().ok_or(VerifyError::StackUnderflow {
            method: self.name(),
            offset,
        })
    }

    fn pop_int(&self, frame: &mut Frame, offset: usize) -> Result<(), VerifyError> {
        let found = self.pop(frame, offset)?;
        if !found.is_int() {
            return Err(self.mismatch("int", found, offset));
        }
        Ok(())
    }

    fn pop_ref(&self, frame: &mut Frame, offset: usize) -> Result<(), VerifyError> {
        let found = self.pop(frame, offset)?;
        if !found.is_ref() {
            return Err(self.mismatch("ref", found, offset));
        }
        Ok(())
    }

    fn push(&self, frame: &mut Frame, ty: VType, offset: usize) -> Result<(), VerifyError> {
        if frame.stack.len() == MAX_STACK_DEPTH {
            return Err(VerifyError::StackOverflow {
                method: self.name(),
                offset,
            });
        }
        frame.stack.push(ty);
        Ok(())
    }

    fn mismatch(&self, expected: &'static str, found: VType, offset: usize) -> VerifyError {
        VerifyError::TypeMismatch {
            method: self.name(),
            expected,
            found,
            offset,
        }
    }

    fn constant(&self, index: u16, offset: usize) -> Result<&Constant, VerifyError> {
        self.def
            .constants
            .get(index as usize)
            .ok_or(VerifyError::InvalidConstantRef {
                method: self.name(),
                index: index as usize,
                offset,
            })
    }

    fn string_constant(&self, index: u16, offset: usize) -> Result<(), VerifyError> {
        match self.constant(index, offset)? {
            Constant::Str(_) => Ok(()),
            Constant::Int(_) => Err(VerifyError::InvalidConstantRef {
                method: self.name(),
                index: index as usize,
                offset,
            }),
        }
    }

    fn local(&self, index: u16, offset: usize) -> Result<usize, VerifyError> {
        let max = self.method.max_locals as usize;
        if index as usize >= max {
            return Err(VerifyError::InvalidLocalRef {
                method: self.name(),
                index: index as usize,
                max,
                offset,
            });
        }
        Ok(index as usize)
    }

    fn field(&self, index: u16, offset: usize) -> Result<FieldKind, VerifyError> {
        self.layout
            .get(index as usize)
            .map(|f| f.kind)
            .ok_or(VerifyError::InvalidFieldRef {
                method: self.name(),
                index: index as usize,
                max: self.layout.len(),
                offset,
            })
    }

    fn check_static(&self, index: u16, offset: usize) -> Result<(), VerifyError> {
        let max = self.def.static_count as usize;
        if index as usize >= max {
            return Err(VerifyError::InvalidStaticRef {
                method: self.name(),
                index: index as usize,
                max,
                offset,
            });
        }
        Ok(())
    }

    fn step(&self, offset: usize, insn: &Instruction, frame: &mut Frame) -> Result<(), VerifyError> {
        match *insn {
            Instruction::Nop | Instruction::Jump(_) => {}
            Instruction::PushInt(_) => self.push(frame, VType::Int, offset)?,
            Instruction::PushConst(index) => {
                let ty = match self.constant(index, offset)? {
                    Constant::Int(_) => VType::Int,
                    Constant::Str(_) => VType::Ref,
                };
                self.push(frame, ty, offset)?;
            }
            Instruction::Load(index) => {
                let ty = frame.locals[self.local(index, offset)?];
                self.push(frame, ty, offset)?;
            }
            Instruction::Store(index) => {
                let slot = self.local(index, offset)?;
                frame.locals[slot] = self.pop(frame, offset)?;
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul | Instruction::Lt => {
                self.pop_int(frame, offset)?;
                self.pop_int(frame, offset)?;
                self.push(frame, VType::Int, offset)?;
            }
            Instruction::Dup => {
                let top = self.pop(frame, offset)?;
                self.push(frame, top, offset)?;
                self.push(frame, top, offset)?;
            }
            Instruction::Pop => {
                self.pop(frame, offset)?;
            }
            Instruction::GetField(index) => {
                let kind = self.field(index, offset)?;
                self.pop_ref(frame, offset)?;
                self.push(frame, kind.into(), offset)?;
            }
            Instruction::PutField(index) => {
                let kind = self.field(index, offset)?;
                let value = self.pop(frame, offset)?;
                let fits = match kind {
                    FieldKind::Int => value.is_int(),
                    FieldKind::Ref => value.is_ref(),
                };
                if !fits {
                    let expected = match kind {
                        FieldKind::Int => "int",
                        FieldKind::Ref => "ref",
                    };
                    return Err(self.mismatch(expected, value, offset));
                }
                self.pop_ref(frame, offset)?;
            }
            Instruction::GetStatic(index) => {
                self.check_static(index, offset)?;
                self.push(frame, VType::Any, offset)?;
            }
            Instruction::PutStatic(index) => {
                self.check_static(index, offset)?;
                self.pop(frame, offset)?;
            }
            Instruction::New(index) => {
                self.string_constant(index, offset)?;
                self.push(frame, VType::Ref, offset)?;
            }
            Instruction::Invoke { name, argc } => {
                self.string_constant(name, offset)?;
                if argc == 0 {
                    return Err(VerifyError::MissingReceiver {
                        method: self.name(),
                        offset,
                    });
                }
                for _ in 1..argc {
                    self.pop(frame, offset)?;
                }
                self.pop_ref(frame, offset)?;
                self.push(frame, VType::Any, offset)?;
            }
            Instruction::JumpIfZero(_) => self.pop_int(frame, offset)?,
            Instruction::Return => {
                self.pop(frame, offset)?;
            }
        }
        Ok(())
    }
}
