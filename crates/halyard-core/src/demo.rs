//! Demo class hierarchy
//!
//! `B` with two subclasses, used by the CLI scenarios and the tests:
//!
//! ```text
//! B             count: int, 1 static
//!   m()         "B.m"                (redefined: "B.m redefined")
//!   call_m()    self.m()
//!   spin(n)     count += n in a loop, returns the version marker
//!   version()   1                    (redefined: 2)
//! SubclassOfB   extends B, inherits everything
//! Subclass2OfB  extends B, extra: ref
//!   m()         "Subclass2OfB.m"
//! ```

use crate::class::{Assembler, ClassBuilder, ClassDefinition, FieldKind, Instruction};

/// Demo class names, superclass first
pub const DEMO_CLASSES: [&str; 3] = ["B", "SubclassOfB", "Subclass2OfB"];

/// String returned by `B.m` before redefinition
pub const B_M_ORIGINAL: &str = "B.m";

/// String returned by `B.m` after redefinition
pub const B_M_REDEFINED: &str = "B.m redefined";

/// String returned by `Subclass2OfB.m`
pub const SUBCLASS2_M: &str = "Subclass2OfB.m";

/// The demo classes in definition order
pub fn demo_classes() -> Vec<ClassDefinition> {
    vec![class_b(B_M_ORIGINAL, 1), subclass_of_b(), subclass2_of_b()]
}

/// The replacement for `B`: same shape, new method bodies
pub fn redefined_b() -> ClassDefinition {
    class_b(B_M_REDEFINED, 2)
}

fn returning_string(builder: &mut ClassBuilder, value: &str) -> Vec<u8> {
    let constant = builder.string(value);
    let mut asm = Assembler::new();
    asm.emit(Instruction::PushConst(constant))
        .emit(Instruction::Return);
    asm.finish()
}

fn class_b(m_result: &str, version: i64) -> ClassDefinition {
    let mut b = ClassBuilder::new("B");
    b.field("count", FieldKind::Int).statics(1);

    let m = returning_string(&mut b, m_result);
    b.method("m", 1, 1, m);

    let m_name = b.string("m");
    let mut call_m = Assembler::new();
    call_m
        .emit(Instruction::Load(0))
        .emit(Instruction::Invoke {
            name: m_name,
            argc: 1,
        })
        .emit(Instruction::Return);
    b.method("call_m", 1, 1, call_m.finish());

    // locals: 0 self, 1 n
    let mut spin = Assembler::new();
    let top = spin.label();
    let done = spin.label();
    spin.bind(top)
        .emit(Instruction::Load(1))
        .jump_if_zero(done)
        .emit(Instruction::Load(0))
        .emit(Instruction::Load(0))
        .emit(Instruction::GetField(0))
        .emit(Instruction::PushInt(1))
        .emit(Instruction::Add)
        .emit(Instruction::PutField(0))
        .emit(Instruction::Load(1))
        .emit(Instruction::PushInt(1))
        .emit(Instruction::Sub)
        .emit(Instruction::Store(1))
        .jump(top)
        .bind(done)
        .emit(Instruction::PushInt(version))
        .emit(Instruction::Return);
    b.method("spin", 2, 2, spin.finish());

    let mut version_code = Assembler::new();
    version_code
        .emit(Instruction::PushInt(version))
        .emit(Instruction::Return);
    b.method("version", 1, 1, version_code.finish());
    b.build()
}

fn subclass_of_b() -> ClassDefinition {
    let mut sub = ClassBuilder::new("SubclassOfB");
    sub.extends("B");
    sub.build()
}

fn subclass2_of_b() -> ClassDefinition {
    let mut sub = ClassBuilder::new("Subclass2OfB");
    sub.extends("B").field("extra", FieldKind::Ref);
    let m = returning_string(&mut sub, SUBCLASS2_M);
    sub.method("m", 1, 1, m);
    sub.build()
}
