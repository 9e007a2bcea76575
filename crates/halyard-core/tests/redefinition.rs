//! Integration tests for class redefinition
//!
//! Tests cover:
//! - Redefining `B` while a frame of the old version is still running
//! - Dispatch through subclasses picks up the new methods
//! - Retired versions are unloaded once their last frame returns
//! - Equivalent redefinitions leave behavior unchanged
//! - Rejected redefinitions leave the class untouched

use halyard_core::demo::{
    demo_classes, redefined_b, B_M_ORIGINAL, B_M_REDEFINED, DEMO_CLASSES, SUBCLASS2_M,
};
use halyard_core::interpreter::Step;
use halyard_core::{
    HeuristicKind, Interpreter, ObjectRef, RedefineError, Value, Vm, VmError, VmOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn vm() -> Vm {
    let vm = Vm::new(VmOptions {
        heap_size: 4 * 1024 * 1024,
        region_size: 64 * 1024,
        heuristics: HeuristicKind::Static,
        verify: true,
        ..VmOptions::default()
    })
    .unwrap();
    for class in demo_classes() {
        vm.define_class(&class.encode()).unwrap();
    }
    vm
}

fn call_string(interp: &Interpreter<'_>, receiver: ObjectRef, method: &str) -> String {
    let result = interp.invoke(receiver, method, &[]).unwrap();
    interp.read_string(result.as_object().unwrap()).unwrap()
}

fn object(root: Option<Value>) -> ObjectRef {
    root.and_then(|v| v.as_object()).unwrap()
}

#[test]
fn test_redefine_while_old_frame_runs() {
    let vm = vm();
    let m = vm.attach();
    let interp = vm.interpreter(&m);

    let mut slots = Vec::new();
    for name in DEMO_CLASSES {
        let obj = interp.new_instance(name).unwrap();
        slots.push(m.push_root(obj.into()));
    }
    let (b, sub, sub2) = (slots[0], slots[1], slots[2]);
    assert_eq!(call_string(&interp, object(m.root(sub)), "call_m"), B_M_ORIGINAL);

    let mut activation = interp
        .activate(object(m.root(sub)), "spin", &[Value::Int(1000)])
        .unwrap();
    for _ in 0..500 {
        assert_eq!(activation.step().unwrap(), Step::Running);
    }
    assert_eq!(activation.current_class().map(|c| c.version()), Some(1));

    let version = m
        .blocked(|| vm.agent().redefine("B", redefined_b().encode()))
        .unwrap();
    assert_eq!(version, 2);
    assert_eq!(vm.stats().retired_versions, 1);

    // the running frame finishes on version 1
    let result = loop {
        if let Step::Returned(value) = activation.step().unwrap() {
            break value;
        }
    };
    assert_eq!(result, Value::Int(1));
    drop(activation);

    // new calls use version 2, through the subclasses too
    let spun = interp
        .invoke(object(m.root(sub)), "spin", &[Value::Int(10)])
        .unwrap();
    assert_eq!(spun, Value::Int(2));
    let count = m.read_field(object(m.root(sub)), 0).unwrap();
    assert_eq!(count, Value::Int(1010));
    assert_eq!(
        interp.invoke(object(m.root(b)), "version", &[]).unwrap(),
        Value::Int(2)
    );
    assert_eq!(call_string(&interp, object(m.root(sub)), "call_m"), B_M_REDEFINED);
    assert_eq!(call_string(&interp, object(m.root(sub2)), "call_m"), SUBCLASS2_M);

    // nothing runs version 1 any more
    m.collect().unwrap();
    assert_eq!(vm.stats().retired_versions, 0);
}

#[test]
fn test_equivalent_redefinition_keeps_behavior() {
    let vm = vm();
    let m = vm.attach();
    let interp = vm.interpreter(&m);
    let sub = m.push_root(interp.new_instance("SubclassOfB").unwrap().into());

    let original = demo_classes()[0].encode();
    for expected_version in 2..=4 {
        let version = m
            .blocked(|| vm.agent().redefine("B", original.clone()))
            .unwrap();
        assert_eq!(version, expected_version);
        assert_eq!(call_string(&interp, object(m.root(sub)), "call_m"), B_M_ORIGINAL);
        assert_eq!(
            interp.invoke(object(m.root(sub)), "spin", &[Value::Int(3)]).unwrap(),
            Value::Int(1)
        );
    }
    m.collect().unwrap();
    assert_eq!(vm.stats().retired_versions, 0);
}

#[test]
fn test_rejected_redefinition_leaves_class_intact() {
    let vm = vm();
    let m = vm.attach();
    let interp = vm.interpreter(&m);
    let sub = m.push_root(interp.new_instance("SubclassOfB").unwrap().into());

    let mut reshaped = redefined_b();
    reshaped.fields.clear();
    let err = m
        .blocked(|| vm.agent().redefine("B", reshaped.encode()))
        .unwrap_err();
    assert!(matches!(err, RedefineError::IncompatibleChange { .. }));

    let mut unverifiable = redefined_b();
    unverifiable.methods[0].code = vec![0x10, 0x70];
    let err = m
        .blocked(|| vm.agent().redefine("B", unverifiable.encode()))
        .unwrap_err();
    assert!(matches!(err, RedefineError::VerificationError(_)));

    assert!(matches!(
        vm.redefine("SubclassOfB", b"garbage"),
        Err(VmError::Redefine(RedefineError::MalformedClass(_)))
    ));

    let current = vm.classes().current_by_name("B").unwrap();
    assert_eq!(current.version(), 1);
    assert_eq!(vm.stats().retired_versions, 0);
    assert_eq!(call_string(&interp, object(m.root(sub)), "call_m"), B_M_ORIGINAL);
}

#[test]
fn test_redefinition_from_agent_while_workers_run() {
    let vm = &vm();
    let started = &AtomicUsize::new(0);

    thread::scope(|scope| {
        let workers: Vec<_> = (0..3)
            .map(|_| {
                scope.spawn(move || {
                    let m = vm.attach();
                    let interp = vm.interpreter(&m);
                    let sub = m.push_root(interp.new_instance("SubclassOfB").unwrap().into());
                    let mut seen: Vec<String> = Vec::new();
                    loop {
                        let text = call_string(&interp, object(m.root(sub)), "call_m");
                        if seen.is_empty() {
                            started.fetch_add(1, Ordering::AcqRel);
                        }
                        if seen.last() != Some(&text) {
                            seen.push(text.clone());
                        }
                        if text == B_M_REDEFINED {
                            return seen;
                        }
                    }
                })
            })
            .collect();

        while started.load(Ordering::Acquire) < workers.len() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(vm.agent().redefine("B", redefined_b().encode()).unwrap(), 2);

        for worker in workers {
            // the old result until the swap, then the new one, never back
            assert_eq!(worker.join().unwrap(), vec![B_M_ORIGINAL, B_M_REDEFINED]);
        }
    });
}
