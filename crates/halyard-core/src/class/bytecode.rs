//! Class files and bytecode
//!
//! A class file is a small little-endian container:
//!
//! ```text
//! magic "HCLS" | version u16 | name | superclass (0/1 + name)
//! fields:    u16 count, (name, kind u8)*
//! statics:   u16 count
//! constants: u16 count, (tag u8, i64 | string)*
//! methods:   u16 count, (name, arity u8, max_locals u16, code blob)*
//! ```
//!
//! Method code is a flat byte stream of [`Opcode`]s followed by their
//! operands. Jump targets are absolute byte offsets into the method code.

use crate::codec::{ByteReader, ByteWriter, DecodeError};

/// Class file magic
pub const CLASS_MAGIC: [u8; 4] = *b"HCLS";

/// Class file format version
pub const CLASS_VERSION: u16 = 1;

/// Class file errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassFormatError {
    /// Wrong magic number
    #[error("Invalid class file magic")]
    InvalidMagic,

    /// Unsupported format version
    #[error("Unsupported class file version {0}")]
    UnsupportedVersion(u16),

    /// Malformed contents
    #[error("Malformed class file: {0}")]
    Decode(#[from] DecodeError),

    /// Bytes left after the last method
    #[error("{0} trailing bytes after class definition")]
    TrailingBytes(usize),
}

/// Bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// No operation
    Nop = 0x00,
    /// Push an i64 immediate
    PushInt = 0x01,
    /// Push a constant pool entry (u16 index)
    PushConst = 0x02,
    /// Push a local (u16 index)
    Load = 0x03,
    /// Pop into a local (u16 index)
    Store = 0x04,
    /// Integer add
    Add = 0x10,
    /// Integer subtract
    Sub = 0x11,
    /// Integer multiply
    Mul = 0x12,
    /// Integer less-than, pushes 1 or 0
    Lt = 0x13,
    /// Duplicate top of stack
    Dup = 0x20,
    /// Discard top of stack
    Pop = 0x21,
    /// Read an instance field (u16 index)
    GetField = 0x30,
    /// Write an instance field (u16 index)
    PutField = 0x31,
    /// Read a static field (u16 index)
    GetStatic = 0x32,
    /// Write a static field (u16 index)
    PutStatic = 0x33,
    /// Allocate an instance of the class named by a string constant (u16)
    New = 0x40,
    /// Virtual call by name (u16 constant index, u8 argument count)
    Invoke = 0x50,
    /// Unconditional jump (u32 target)
    Jump = 0x60,
    /// Pop and jump when zero (u32 target)
    JumpIfZero = 0x61,
    /// Return the top of stack
    Return = 0x70,
}

impl Opcode {
    /// Convert a byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::PushInt),
            0x02 => Some(Self::PushConst),
            0x03 => Some(Self::Load),
            0x04 => Some(Self::Store),
            0x10 => Some(Self::Add),
            0x11 => Some(Self::Sub),
            0x12 => Some(Self::Mul),
            0x13 => Some(Self::Lt),
            0x20 => Some(Self::Dup),
            0x21 => Some(Self::Pop),
            0x30 => Some(Self::GetField),
            0x31 => Some(Self::PutField),
            0x32 => Some(Self::GetStatic),
            0x33 => Some(Self::PutStatic),
            0x40 => Some(Self::New),
            0x50 => Some(Self::Invoke),
            0x60 => Some(Self::Jump),
            0x61 => Some(Self::JumpIfZero),
            0x70 => Some(Self::Return),
            _ => None,
        }
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Operand bytes following the opcode
    pub fn operand_size(self) -> usize {
        match self {
            Self::PushInt => 8,
            Self::PushConst
            | Self::Load
            | Self::Store
            | Self::GetField
            | Self::PutField
            | Self::GetStatic
            | Self::PutStatic
            | Self::New => 2,
            Self::Invoke => 3,
            Self::Jump | Self::JumpIfZero => 4,
            _ => 0,
        }
    }

    /// Mnemonic
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::PushInt => "PUSH_INT",
            Self::PushConst => "PUSH_CONST",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Lt => "LT",
            Self::Dup => "DUP",
            Self::Pop => "POP",
            Self::GetField => "GET_FIELD",
            Self::PutField => "PUT_FIELD",
            Self::GetStatic => "GET_STATIC",
            Self::PutStatic => "PUT_STATIC",
            Self::New => "NEW",
            Self::Invoke => "INVOKE",
            Self::Jump => "JUMP",
            Self::JumpIfZero => "JUMP_IF_ZERO",
            Self::Return => "RETURN",
        }
    }
}

/// A decoded instruction, one variant per [`Opcode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Instruction {
    Nop,
    PushInt(i64),
    PushConst(u16),
    Load(u16),
    Store(u16),
    Add,
    Sub,
    Mul,
    Lt,
    Dup,
    Pop,
    GetField(u16),
    PutField(u16),
    GetStatic(u16),
    PutStatic(u16),
    New(u16),
    Invoke { name: u16, argc: u8 },
    Jump(u32),
    JumpIfZero(u32),
    Return,
}

/// Errors decoding a single instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionError {
    /// Unknown opcode byte
    InvalidOpcode(u8),
    /// Operands run past the end of the code
    Truncated,
}

impl Instruction {
    /// Decode the instruction at `offset`, returning it and its encoded length
    pub fn decode(code: &[u8], offset: usize) -> Result<(Instruction, usize), InstructionError> {
        let byte = *code.get(offset).ok_or(InstructionError::Truncated)?;
        let opcode = Opcode::from_u8(byte).ok_or(InstructionError::InvalidOpcode(byte))?;
        let len = 1 + opcode.operand_size();
        let operands = code
            .get(offset + 1..offset + len)
            .ok_or(InstructionError::Truncated)?;
        let u16_at = |i: usize| u16::from_le_bytes([operands[i], operands[i + 1]]);
        let u32_at = || u32::from_le_bytes([operands[0], operands[1], operands[2], operands[3]]);

        let insn = match opcode {
            Opcode::Nop => Instruction::Nop,
            Opcode::PushInt => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(operands);
                Instruction::PushInt(i64::from_le_bytes(bytes))
            }
            Opcode::PushConst => Instruction::PushConst(u16_at(0)),
            Opcode::Load => Instruction::Load(u16_at(0)),
            Opcode::Store => Instruction::Store(u16_at(0)),
            Opcode::Add => Instruction::Add,
            Opcode::Sub => Instruction::Sub,
            Opcode::Mul => Instruction::Mul,
            Opcode::Lt => Instruction::Lt,
            Opcode::Dup => Instruction::Dup,
            Opcode::Pop => Instruction::Pop,
            Opcode::GetField => Instruction::GetField(u16_at(0)),
            Opcode::PutField => Instruction::PutField(u16_at(0)),
            Opcode::GetStatic => Instruction::GetStatic(u16_at(0)),
            Opcode::PutStatic => Instruction::PutStatic(u16_at(0)),
            Opcode::New => Instruction::New(u16_at(0)),
            Opcode::Invoke => Instruction::Invoke {
                name: u16_at(0),
                argc: operands[2],
            },
            Opcode::Jump => Instruction::Jump(u32_at()),
            Opcode::JumpIfZero => Instruction::JumpIfZero(u32_at()),
            Opcode::Return => Instruction::Return,
        };
        Ok((insn, len))
    }

    /// Opcode of this instruction
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nop => Opcode::Nop,
            Instruction::PushInt(_) => Opcode::PushInt,
            Instruction::PushConst(_) => Opcode::PushConst,
            Instruction::Load(_) => Opcode::Load,
            Instruction::Store(_) => Opcode::Store,
            Instruction::Add => Opcode::Add,
            Instruction::Sub => Opcode::Sub,
            Instruction::Mul => Opcode::Mul,
            Instruction::Lt => Opcode::Lt,
            Instruction::Dup => Opcode::Dup,
            Instruction::Pop => Opcode::Pop,
            Instruction::GetField(_) => Opcode::GetField,
            Instruction::PutField(_) => Opcode::PutField,
            Instruction::GetStatic(_) => Opcode::GetStatic,
            Instruction::PutStatic(_) => Opcode::PutStatic,
            Instruction::New(_) => Opcode::New,
            Instruction::Invoke { .. } => Opcode::Invoke,
            Instruction::Jump(_) => Opcode::Jump,
            Instruction::JumpIfZero(_) => Opcode::JumpIfZero,
            Instruction::Return => Opcode::Return,
        }
    }

    /// Append the encoded instruction to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode().to_u8());
        match *self {
            Instruction::PushInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Instruction::PushConst(i)
            | Instruction::Load(i)
            | Instruction::Store(i)
            | Instruction::GetField(i)
            | Instruction::PutField(i)
            | Instruction::GetStatic(i)
            | Instruction::PutStatic(i)
            | Instruction::New(i) => out.extend_from_slice(&i.to_le_bytes()),
            Instruction::Invoke { name, argc } => {
                out.extend_from_slice(&name.to_le_bytes());
                out.push(argc);
            }
            Instruction::Jump(t) | Instruction::JumpIfZero(t) => {
                out.extend_from_slice(&t.to_le_bytes())
            }
            _ => {}
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(self, Instruction::Jump(_) | Instruction::Return)
    }

    /// Branch target, if any
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Instruction::Jump(t) | Instruction::JumpIfZero(t) => Some(*t),
            _ => None,
        }
    }
}

/// Kind of an instance field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Integer scalar
    Int,
    /// Object reference (or null)
    Ref,
}

impl FieldKind {
    fn to_u8(self) -> u8 {
        match self {
            FieldKind::Int => 0,
            FieldKind::Ref => 1,
        }
    }

    fn from_u8(tag: u8, offset: usize) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(FieldKind::Int),
            1 => Ok(FieldKind::Ref),
            _ => Err(DecodeError::InvalidTag { tag, offset }),
        }
    }
}

/// Instance field declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field kind
    pub kind: FieldKind,
}

/// Constant pool entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Integer
    Int(i64),
    /// String (resolved to a heap string on first use)
    Str(String),
}

impl Constant {
    /// String contents, if this is a string constant
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) => Some(s),
            Constant::Int(_) => None,
        }
    }
}

/// Method declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    /// Method name, the dispatch key
    pub name: String,
    /// Argument count, receiver included
    pub arity: u8,
    /// Local slots, arguments included
    pub max_locals: u16,
    /// Bytecode
    pub code: Vec<u8>,
}

/// A parsed class file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDefinition {
    /// Class name
    pub name: String,
    /// Superclass name
    pub superclass: Option<String>,
    /// Fields declared by this class (inherited fields come first at runtime)
    pub fields: Vec<FieldDef>,
    /// Static field count
    pub static_count: u16,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Methods
    pub methods: Vec<MethodDef>,
}

impl ClassDefinition {
    /// Parse a class file
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFormatError> {
        let mut reader = ByteReader::new(bytes);
        if reader.read_bytes(4)? != CLASS_MAGIC {
            return Err(ClassFormatError::InvalidMagic);
        }
        let version = reader.read_u16()?;
        if version != CLASS_VERSION {
            return Err(ClassFormatError::UnsupportedVersion(version));
        }

        let name = reader.read_string()?;
        let superclass = match reader.read_u8()? {
            0 => None,
            _ => Some(reader.read_string()?),
        };

        let field_count = reader.read_u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let name = reader.read_string()?;
            let offset = reader.position();
            let kind = FieldKind::from_u8(reader.read_u8()?, offset)?;
            fields.push(FieldDef { name, kind });
        }

        let static_count = reader.read_u16()?;

        let constant_count = reader.read_u16()? as usize;
        let mut constants = Vec::with_capacity(constant_count);
        for _ in 0..constant_count {
            let offset = reader.position();
            let constant = match reader.read_u8()? {
                0 => Constant::Int(reader.read_i64()?),
                1 => Constant::Str(reader.read_string()?),
                tag => return Err(DecodeError::InvalidTag { tag, offset }.into()),
            };
            constants.push(constant);
        }

        let method_count = reader.read_u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let name = reader.read_string()?;
            let arity = reader.read_u8()?;
            let max_locals = reader.read_u16()?;
            let code = reader.read_blob()?.to_vec();
            methods.push(MethodDef {
                name,
                arity,
                max_locals,
                code,
            });
        }

        if reader.remaining() != 0 {
            return Err(ClassFormatError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            name,
            superclass,
            fields,
            static_count,
            constants,
            methods,
        })
    }

    /// Encode as a class file
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.emit_bytes(&CLASS_MAGIC);
        writer.emit_u16(CLASS_VERSION);
        writer.emit_str(&self.name);
        match &self.superclass {
            Some(name) => {
                writer.emit_u8(1);
                writer.emit_str(name);
            }
            None => writer.emit_u8(0),
        }

        writer.emit_u16(self.fields.len() as u16);
        for field in &self.fields {
            writer.emit_str(&field.name);
            writer.emit_u8(field.kind.to_u8());
        }

        writer.emit_u16(self.static_count);

        writer.emit_u16(self.constants.len() as u16);
        for constant in &self.constants {
            match constant {
                Constant::Int(v) => {
                    writer.emit_u8(0);
                    writer.emit_i64(*v);
                }
                Constant::Str(s) => {
                    writer.emit_u8(1);
                    writer.emit_str(s);
                }
            }
        }

        writer.emit_u16(self.methods.len() as u16);
        for method in &self.methods {
            writer.emit_str(&method.name);
            writer.emit_u8(method.arity);
            writer.emit_u16(method.max_locals);
            writer.emit_blob(&method.code);
        }

        writer.into_bytes()
    }

    /// Find a method by name
    pub fn method(&self, name: &str) -> Option<(usize, &MethodDef)> {
        self.methods.iter().enumerate().find(|(_, m)| m.name == name)
    }
}

/// A forward-referenceable code position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Builds method code with symbolic jump targets
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len() as u32);
        self
    }

    /// Append an instruction
    pub fn emit(&mut self, insn: Instruction) -> &mut Self {
        insn.encode(&mut self.code);
        self
    }

    /// Append a jump to `label`
    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.emit_branch(Instruction::Jump(0), label)
    }

    /// Append a conditional jump to `label`
    pub fn jump_if_zero(&mut self, label: Label) -> &mut Self {
        self.emit_branch(Instruction::JumpIfZero(0), label)
    }

    fn emit_branch(&mut self, insn: Instruction, label: Label) -> &mut Self {
        self.emit(insn);
        self.fixups.push((self.code.len() - 4, label));
        self
    }

    /// Resolve labels and return the code
    ///
    /// Jumps to labels that were never bound point past the end of the code
    /// and are rejected by the verifier.
    pub fn finish(mut self) -> Vec<u8> {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].unwrap_or(u32::MAX);
            self.code[at..at + 4].copy_from_slice(&target.to_le_bytes());
        }
        self.code
    }
}

/// Builds a [`ClassDefinition`]
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    definition: ClassDefinition,
}

impl ClassBuilder {
    /// Start a class named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: ClassDefinition {
                name: name.into(),
                superclass: None,
                fields: Vec::new(),
                static_count: 0,
                constants: Vec::new(),
                methods: Vec::new(),
            },
        }
    }

    /// Set the superclass
    pub fn extends(&mut self, superclass: impl Into<String>) -> &mut Self {
        self.definition.superclass = Some(superclass.into());
        self
    }

    /// Declare an instance field
    pub fn field(&mut self, name: impl Into<String>, kind: FieldKind) -> &mut Self {
        self.definition.fields.push(FieldDef {
            name: name.into(),
            kind,
        });
        self
    }

    /// Set the static field count
    pub fn statics(&mut self, count: u16) -> &mut Self {
        self.definition.static_count = count;
        self
    }

    /// Intern a constant, returning its pool index
    pub fn constant(&mut self, constant: Constant) -> u16 {
        if let Some(i) = self.definition.constants.iter().position(|c| *c == constant) {
            return i as u16;
        }
        self.definition.constants.push(constant);
        (self.definition.constants.len() - 1) as u16
    }

    /// Intern a string constant
    pub fn string(&mut self, value: impl Into<String>) -> u16 {
        self.constant(Constant::Str(value.into()))
    }

    /// Add a method
    pub fn method(
        &mut self,
        name: impl Into<String>,
        arity: u8,
        max_locals: u16,
        code: Vec<u8>,
    ) -> &mut Self {
        self.definition.methods.push(MethodDef {
            name: name.into(),
            arity,
            max_locals,
            code,
        });
        self
    }

    /// Finish the definition
    pub fn build(&self) -> ClassDefinition {
        self.definition.clone()
    }
}
