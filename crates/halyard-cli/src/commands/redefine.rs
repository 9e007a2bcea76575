//! `halyard redefine` - redefine an archived class under load.
//!
//! Workers call `call_m` through instances of both subclasses of `B` (the
//! archived instances when the archive carries them). Once every worker has
//! made its warm-up calls, `B` is redefined through the agent and each worker
//! reports the sequence of results it observed.

use anyhow::{anyhow, bail, Context};
use halyard_core::demo::{redefined_b, B_M_REDEFINED, DEMO_CLASSES};
use halyard_core::{Mutator, ObjectRef, Vm, VmError, VmOptions, VmResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Results observed by one worker, consecutive repeats collapsed
struct Observed {
    calls: usize,
    subclass: Vec<String>,
    subclass2: Vec<String>,
}

pub fn execute(options: VmOptions, workers: usize, calls: usize) -> anyhow::Result<()> {
    if workers == 0 || calls == 0 {
        bail!("--workers and --calls must be at least 1");
    }
    let vm = Vm::new(options)?;
    for name in DEMO_CLASSES {
        let class = vm
            .classes()
            .current_by_name(name)
            .ok_or_else(|| anyhow!("archive does not contain {}", name))?;
        println!(
            "{} version {} ({})",
            name,
            class.version(),
            if class.is_archived() { "archived" } else { "private" }
        );
    }

    let warmed_up = AtomicUsize::new(0);
    let redefined = AtomicBool::new(false);
    let (observed, version) = thread::scope(|scope| {
        let vm = &vm;
        let warmed_up = &warmed_up;
        let redefined = &redefined;
        let handles: Vec<_> = (0..workers)
            .map(|_| scope.spawn(move || run_worker(vm, calls, warmed_up, redefined)))
            .collect();

        while warmed_up.load(Ordering::Acquire) < workers {
            if handles.iter().any(|h| h.is_finished()) {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let version = vm.agent().redefine("B", redefined_b().encode());
        redefined.store(true, Ordering::Release);

        let observed = handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("redefine worker panicked")))
            .collect::<anyhow::Result<Vec<VmResult<Observed>>>>();
        (observed, version)
    });
    let version = version.context("redefining B")?;
    println!("B redefined to version {}", version);

    for (worker, result) in observed?.into_iter().enumerate() {
        let observed = result.with_context(|| format!("worker {}", worker))?;
        println!(
            "worker {}: {} calls, SubclassOfB.call_m {:?}, Subclass2OfB.call_m {:?}",
            worker, observed.calls, observed.subclass, observed.subclass2
        );
    }

    let m = vm.attach();
    m.collect()?;
    drop(m);
    let stats = vm.stats();
    println!(
        "{} classes loaded, {} retired versions alive",
        stats.classes, stats.retired_versions
    );
    if let Some(archive) = vm.archive() {
        archive.verify_integrity()?;
        println!("{}: unchanged", archive.path().display());
    }
    Ok(())
}

fn run_worker(
    vm: &Vm,
    calls: usize,
    warmed_up: &AtomicUsize,
    redefined: &AtomicBool,
) -> VmResult<Observed> {
    let m = vm.attach();
    let sub = m.push_root(instance(vm, &m, "SubclassOfB")?.into());
    let sub2 = m.push_root(instance(vm, &m, "Subclass2OfB")?.into());
    let mut observed = Observed {
        calls: 0,
        subclass: Vec::new(),
        subclass2: Vec::new(),
    };

    loop {
        // a request that was already answered is visible to the next call
        let finishing = redefined.load(Ordering::Acquire);
        let text = call_m(vm, &m, sub)?;
        let seen_new = text == B_M_REDEFINED;
        record(&mut observed.subclass, text);
        record(&mut observed.subclass2, call_m(vm, &m, sub2)?);
        observed.calls += 1;
        if observed.calls == calls {
            warmed_up.fetch_add(1, Ordering::AcqRel);
        }
        if observed.calls >= calls && (seen_new || finishing) {
            return Ok(observed);
        }
    }
}

fn instance(vm: &Vm, m: &Mutator, class: &str) -> VmResult<ObjectRef> {
    match vm.archived_root(class) {
        Some(obj) => Ok(obj),
        None => vm.interpreter(m).new_instance(class),
    }
}

fn call_m(vm: &Vm, m: &Mutator, root: usize) -> VmResult<String> {
    let interp = vm.interpreter(m);
    let receiver = m
        .root(root)
        .and_then(|v| v.as_object())
        .ok_or(VmError::NullReference)?;
    let result = interp.invoke(receiver, "call_m", &[])?;
    let text = result.as_object().ok_or(VmError::NullReference)?;
    interp.read_string(text)
}

fn record(seen: &mut Vec<String>, text: String) {
    if seen.last() != Some(&text) {
        seen.push(text);
    }
}
