//! `halyard stress` - old-biased allocation workload.
//!
//! Each worker grows a long-lived list while churning through short-lived
//! two-node chains, then checks that every long-lived node survived. With
//! `--replace-every` the list is dropped and rebuilt every few batches, so old
//! regions fill with garbage too.

use anyhow::{anyhow, bail, Context};
use halyard_core::class::{ClassBuilder, FieldKind};
use halyard_core::{ClassId, Mutator, Value, Vm, VmOptions, VmResult};
use std::thread;
use std::time::Instant;

const NEXT: usize = 0;
const VALUE: usize = 1;

pub struct StressArgs {
    pub batches: usize,
    pub workers: usize,
    pub long_lived: usize,
    pub short_lived: usize,
    pub object_size: usize,
    pub replace_every: Option<usize>,
}

impl StressArgs {
    /// Batches whose nodes are on the list when a worker finishes
    fn kept_batches(&self) -> usize {
        match self.replace_every {
            Some(every) if self.batches > 0 => self.batches - (self.batches - 1) / every * every,
            _ => self.batches,
        }
    }
}

pub fn execute(options: VmOptions, args: StressArgs) -> anyhow::Result<()> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }
    if args.replace_every == Some(0) {
        bail!("--replace-every must be at least 1");
    }
    println!(
        "heap {} bytes, regions {} bytes, {} heuristics{}{}",
        options.heap_size,
        options.effective_region_size(),
        options.heuristics,
        if options.verify { ", verifying" } else { "" },
        if options.oom_during_evac_a_lot {
            ", injecting evacuation failures"
        } else {
            ""
        }
    );

    let vm = Vm::new(options)?;
    let mut node = ClassBuilder::new("Node");
    node.field("next", FieldKind::Ref).field("value", FieldKind::Int);
    let class = vm.define_class(&node.build().encode())?.id();

    let start = Instant::now();
    let results = thread::scope(|scope| {
        let vm = &vm;
        let args = &args;
        let handles: Vec<_> = (0..args.workers)
            .map(|_| scope.spawn(move || run_worker(vm, class, args)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("stress worker panicked")))
            .collect::<anyhow::Result<Vec<VmResult<(usize, i64)>>>>()
    })?;
    let elapsed = start.elapsed();

    let expected_len = args.kept_batches() * args.long_lived;
    let expected_sum = (1..=expected_len as i64).sum::<i64>();
    for (worker, result) in results.into_iter().enumerate() {
        let (len, sum) = result.with_context(|| format!("worker {}", worker))?;
        if len != expected_len || sum != expected_sum {
            bail!(
                "worker {} lost long-lived objects: {} nodes (sum {}), expected {} (sum {})",
                worker,
                len,
                sum,
                expected_len,
                expected_sum
            );
        }
    }

    let stats = vm.stats();
    println!(
        "{} workers finished in {:.3}s, {} long-lived nodes each",
        args.workers,
        elapsed.as_secs_f64(),
        expected_len
    );
    if let Some(every) = args.replace_every {
        println!(
            "long-lived lists replaced every {} batches ({} times per worker)",
            every,
            args.batches.saturating_sub(1) / every
        );
    }
    println!("heap: {} / {} bytes", stats.heap_used, stats.heap_capacity);
    println!("{}", stats.gc);
    if let Some(last) = &stats.gc.last_cycle {
        println!(
            "last cycle: {:?} ({}), {} -> {} bytes, {}",
            last.kind, last.cause, last.used_before, last.used_after, last.timings
        );
    }
    Ok(())
}

fn run_worker(vm: &Vm, class: ClassId, args: &StressArgs) -> VmResult<(usize, i64)> {
    let m = vm.attach();
    let head = m.push_root(Value::Null);
    let garbage = vec![0x5Au8; args.object_size];
    let mut next_value = 1;
    for batch in 0..args.batches {
        if batch > 0 && args.replace_every.is_some_and(|every| batch % every == 0) {
            m.set_root(head, Value::Null);
            next_value = 1;
        }
        for _ in 0..args.long_lived {
            prepend(&m, class, head, next_value, &garbage)?;
            next_value += 1;
        }
        let scratch = m.push_root(Value::Null);
        for i in 0..args.short_lived {
            // chains of two, dropped when the next chain starts
            if i % 2 == 0 {
                m.set_root(scratch, Value::Null);
            }
            prepend(&m, class, scratch, 0, &garbage)?;
        }
        m.truncate_roots(scratch);
    }

    let (mut len, mut sum) = (0, 0);
    let mut cursor = m.root(head).and_then(|v| v.as_object());
    while let Some(node) = cursor {
        len += 1;
        sum += m.read_field(node, VALUE)?.as_int().unwrap_or(0);
        cursor = m.read_field(node, NEXT)?.as_object();
    }
    Ok((len, sum))
}

/// Prepend a node to the list whose head is root `head`
fn prepend(m: &Mutator, class: ClassId, head: usize, value: i64, payload: &[u8]) -> VmResult<()> {
    let node = m.allocate(class, 2, payload)?;
    let slot = m.push_root(node.into());
    let next = m.root(head).unwrap_or(Value::Null);
    m.write_field(node, NEXT, next)?;
    if let Some(node) = m.root(slot).and_then(|v| v.as_object()) {
        m.write_field(node, VALUE, Value::Int(value))?;
    }
    if let Some(node) = m.pop_root() {
        m.set_root(head, node);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(batches: usize, replace_every: Option<usize>) -> StressArgs {
        StressArgs {
            batches,
            workers: 1,
            long_lived: 3,
            short_lived: 4,
            object_size: 64,
            replace_every,
        }
    }

    #[test]
    fn test_kept_batches() {
        assert_eq!(args(10, None).kept_batches(), 10);
        assert_eq!(args(10, Some(4)).kept_batches(), 2);
        assert_eq!(args(12, Some(4)).kept_batches(), 4);
        assert_eq!(args(3, Some(5)).kept_batches(), 3);
        assert_eq!(args(0, Some(2)).kept_batches(), 0);
    }

    #[test]
    fn test_replacing_workload_completes() {
        let options = VmOptions {
            heap_size: 2 * 1024 * 1024,
            region_size: 64 * 1024,
            verify: true,
            ..VmOptions::default()
        };
        execute(
            options,
            StressArgs {
                batches: 40,
                workers: 3,
                long_lived: 20,
                short_lived: 100,
                object_size: 512,
                replace_every: Some(8),
            },
        )
        .unwrap();
    }
}
