//! Integration tests for the collector under old-biased workloads
//!
//! Tests cover:
//! - Every heuristic keeps long-lived data intact while garbage churns
//! - Verification after every phase stays clean
//! - A live set larger than the heap ends in OutOfMemory, not corruption
//! - Injected evacuation failures degrade the cycle instead of failing it

mod common;

use common::{node_class, old_biased, push_node, walk};
use halyard_core::heap::HeapError;
use halyard_core::{HeuristicKind, Value, Vm, VmError, VmOptions};

fn options(heuristics: HeuristicKind) -> VmOptions {
    VmOptions {
        heap_size: 2 * 1024 * 1024,
        region_size: 64 * 1024,
        heuristics,
        verify: true,
        ..VmOptions::default()
    }
}

#[test]
fn test_every_heuristic_keeps_old_objects() {
    for kind in HeuristicKind::ALL {
        let vm = Vm::new_without_control(options(kind)).unwrap();
        let class = node_class(&vm);
        let m = vm.attach();

        let (len, sum) = old_biased(&m, class, 15, 20, 400, 512)
            .unwrap_or_else(|e| panic!("{} heuristics: {}", kind.name(), e));
        assert_eq!(len, 300, "{} heuristics", kind.name());
        assert_eq!(sum, 300 * 301 / 2, "{} heuristics", kind.name());

        let stats = vm.stats();
        assert!(stats.gc.collections > 0, "{} heuristics never collected", kind.name());
        assert!(stats.heap_used <= stats.heap_capacity);
        if kind == HeuristicKind::Passive {
            assert_eq!(stats.gc.concurrent_cycles, 0);
        }
    }
}

#[test]
fn test_live_set_larger_than_heap_is_out_of_memory() {
    let vm = Vm::new_without_control(options(HeuristicKind::Adaptive)).unwrap();
    let class = node_class(&vm);
    let m = vm.attach();
    let head = m.push_root(Value::Null);

    let payload = vec![0u8; 4096];
    let mut result = Ok(());
    for i in 0..1024 {
        result = push_node(&m, class, head, i, &payload);
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(
        result,
        Err(VmError::Heap(HeapError::OutOfMemory { .. }))
    ));
    assert!(vm.stats().gc.allocation_failures > 0);

    // everything allocated before the failure is still there
    let (len, _) = walk(&m, head);
    assert!(len > 0);
    m.truncate_roots(0);
    m.collect().unwrap();
    assert!(vm.stats().heap_used < 2 * 64 * 1024);
}

#[test]
fn test_injected_evacuation_failures_degrade() {
    let vm = Vm::new_without_control(VmOptions {
        oom_during_evac_a_lot: true,
        ..options(HeuristicKind::Aggressive)
    })
    .unwrap();
    let class = node_class(&vm);
    let m = vm.attach();

    let (len, sum) = old_biased(&m, class, 20, 25, 300, 256).unwrap();
    assert_eq!(len, 500);
    assert_eq!(sum, 500 * 501 / 2);

    let stats = vm.stats();
    assert!(stats.gc.collections > 0);
    assert!(vm.collector().heap().injected_failures() > 0);
    assert!(stats.gc.degenerated_cycles + stats.gc.full_cycles > 0);
}

#[test]
fn test_explicit_collection_reclaims_garbage() {
    let vm = Vm::new_without_control(options(HeuristicKind::Passive)).unwrap();
    let class = node_class(&vm);
    let m = vm.attach();
    let head = m.push_root(Value::Null);
    for i in 0..50 {
        push_node(&m, class, head, i, &[]).unwrap();
        m.allocate(class, 2, &[0u8; 1024]).unwrap();
    }
    let before = vm.stats().heap_used;
    let report = m.collect().unwrap();
    assert!(report.reclaimed() > 0);
    assert!(vm.stats().heap_used < before);
    assert_eq!(walk(&m, head), (50, (0..50).sum()));
}
