//! Workload helpers shared by the integration tests

#![allow(dead_code)]

use halyard_core::class::{ClassBuilder, FieldKind};
use halyard_core::{ClassId, Mutator, Value, Vm, VmResult};

/// Field holding the next node
pub const NEXT: usize = 0;
/// Field holding the node's value
pub const VALUE: usize = 1;

/// Define `Node { next: ref, value: int }`
pub fn node_class(vm: &Vm) -> ClassId {
    let mut node = ClassBuilder::new("Node");
    node.field("next", FieldKind::Ref).field("value", FieldKind::Int);
    vm.define_class(&node.build().encode()).unwrap().id()
}

/// Prepend a node holding `value` to the list whose head is root `head`
pub fn push_node(
    m: &Mutator,
    class: ClassId,
    head: usize,
    value: i64,
    payload: &[u8],
) -> VmResult<()> {
    let node = m.allocate(class, 2, payload)?;
    let slot = m.push_root(node.into());
    let next = m.root(head).unwrap_or_default();
    m.write_field(node, NEXT, next)?;
    let node = m.root(slot).and_then(|v| v.as_object()).unwrap();
    m.write_field(node, VALUE, Value::Int(value))?;
    let node = m.pop_root().unwrap();
    m.set_root(head, node);
    Ok(())
}

/// Length and value sum of the list whose head is root `head`
pub fn walk(m: &Mutator, head: usize) -> (usize, i64) {
    let (mut len, mut sum) = (0, 0);
    let mut cursor = m.root(head).and_then(|v| v.as_object());
    while let Some(node) = cursor {
        len += 1;
        sum += m.read_field(node, VALUE).unwrap().as_int().unwrap();
        cursor = m.read_field(node, NEXT).unwrap().as_object();
    }
    (len, sum)
}

/// Grow a long-lived list by `long_lived` nodes per batch while allocating
/// `short_lived` garbage objects; every object carries `object_size` payload
/// bytes
pub fn old_biased(
    m: &Mutator,
    class: ClassId,
    batches: usize,
    long_lived: usize,
    short_lived: usize,
    object_size: usize,
) -> VmResult<(usize, i64)> {
    let head = m.push_root(Value::Null);
    grow(m, class, head, batches, long_lived, short_lived, object_size)?;
    Ok(walk(m, head))
}

/// Run `rounds` old-biased workloads on one list head, dropping the previous
/// round's list first so its old nodes die
///
/// Returns the final list's length and sum.
pub fn replacing_lists(
    m: &Mutator,
    class: ClassId,
    rounds: usize,
    batches: usize,
    long_lived: usize,
    short_lived: usize,
    object_size: usize,
) -> VmResult<(usize, i64)> {
    let head = m.push_root(Value::Null);
    for _ in 0..rounds {
        m.set_root(head, Value::Null);
        grow(m, class, head, batches, long_lived, short_lived, object_size)?;
        let (len, sum) = walk(m, head);
        let expected = (batches * long_lived) as i64;
        assert_eq!(len as i64, expected);
        assert_eq!(sum, expected * (expected + 1) / 2);
    }
    Ok(walk(m, head))
}

fn grow(
    m: &Mutator,
    class: ClassId,
    head: usize,
    batches: usize,
    long_lived: usize,
    short_lived: usize,
    object_size: usize,
) -> VmResult<()> {
    let payload = vec![0xA5u8; object_size];
    let mut next_value = 1;
    for _ in 0..batches {
        for _ in 0..long_lived {
            push_node(m, class, head, next_value, &payload)?;
            next_value += 1;
        }
        for _ in 0..short_lived {
            m.allocate(class, 2, &payload)?;
        }
    }
    Ok(())
}
