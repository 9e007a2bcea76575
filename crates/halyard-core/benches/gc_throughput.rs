use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use halyard_core::class::{ClassBuilder, FieldKind};
use halyard_core::{ClassId, HeuristicKind, Mutator, Value, Vm, VmOptions};

fn vm(heuristics: HeuristicKind) -> (Vm, ClassId) {
    let vm = Vm::new_without_control(VmOptions {
        heap_size: 16 * 1024 * 1024,
        region_size: 256 * 1024,
        heuristics,
        ..VmOptions::default()
    })
    .unwrap();
    let mut node = ClassBuilder::new("Node");
    node.field("next", FieldKind::Ref).field("value", FieldKind::Int);
    let class = vm.define_class(&node.build().encode()).unwrap().id();
    (vm, class)
}

/// Allocate `count` nodes, keeping every `keep`th one on a list
fn churn(m: &Mutator, class: ClassId, count: usize, keep: usize, payload: &[u8]) {
    let head = m.push_root(Value::Null);
    for i in 0..count {
        let obj = m.allocate(class, 2, payload).unwrap();
        if i % keep == 0 {
            let slot = m.push_root(obj.into());
            let next = m.root(head).unwrap();
            let obj = m.root(slot).and_then(|v| v.as_object()).unwrap();
            m.write_field(obj, 0, next).unwrap();
            let obj = m.root(slot).and_then(|v| v.as_object()).unwrap();
            m.write_field(obj, 1, Value::Int(i as i64)).unwrap();
            let obj = m.pop_root().unwrap();
            m.set_root(head, obj);
        }
    }
    m.truncate_roots(0);
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    for size in [0usize, 64, 1024] {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(BenchmarkId::new("garbage", size), &size, |b, &size| {
            let (vm, class) = vm(HeuristicKind::Adaptive);
            let m = vm.attach();
            let payload = vec![0u8; size];
            b.iter(|| churn(&m, class, black_box(10_000), usize::MAX, &payload));
        });
    }
    group.finish();
}

fn bench_heuristics(c: &mut Criterion) {
    let mut group = c.benchmark_group("old_biased");
    group.sample_size(20);
    for kind in [
        HeuristicKind::Adaptive,
        HeuristicKind::Static,
        HeuristicKind::Aggressive,
        HeuristicKind::Generational,
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(kind), &kind, |b, &kind| {
            let (vm, class) = vm(kind);
            let m = vm.attach();
            let payload = vec![0u8; 256];
            b.iter(|| churn(&m, class, black_box(20_000), 16, &payload));
        });
    }
    group.finish();
}

fn bench_collect(c: &mut Criterion) {
    let (vm, class) = vm(HeuristicKind::Passive);
    let m = vm.attach();
    let payload = vec![0u8; 128];

    c.bench_function("explicit_collect", |b| {
        b.iter(|| {
            churn(&m, class, 5_000, 8, &payload);
            m.collect().unwrap()
        });
    });
}

criterion_group!(benches, bench_allocation, bench_heuristics, bench_collect);
criterion_main!(benches);
