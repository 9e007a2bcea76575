//! GC control thread
//!
//! Polls the heuristics every control interval and services requests from
//! mutators: allocation failures (which need a stop-the-world compaction
//! before the mutator retries) and explicit collections.

use super::collector::{AllocFailureOutcome, Collector, CycleReport};
use super::phase::GcCause;
use super::GcError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Request handed to the control thread
pub(crate) enum ControlRequest {
    /// A mutator could not allocate; reply once a compaction newer than
    /// `seen_compactions` has completed
    AllocationFailure {
        seen_compactions: u64,
        reply: Sender<Result<AllocFailureOutcome, GcError>>,
    },
    /// Run a cycle now
    Explicit {
        cause: GcCause,
        reply: Sender<Result<CycleReport, GcError>>,
    },
    /// Stop the thread
    Shutdown,
}

/// Handle to the running control thread
pub struct GcControlThread {
    collector: Arc<Collector>,
    sender: Sender<ControlRequest>,
    handle: Option<JoinHandle<()>>,
}

impl GcControlThread {
    /// Spawn the control thread and route the collector's requests to it
    pub fn start(collector: Arc<Collector>) -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let worker = collector.clone();
        let handle = std::thread::Builder::new()
            .name("halyard-gc-control".to_string())
            .spawn(move || control_loop(worker, receiver))?;
        collector.attach_control(sender.clone());
        log::debug!(
            "GC control thread started (interval {:?})",
            collector.config().control_interval
        );
        Ok(Self {
            collector,
            sender,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    ///
    /// Requests sent after this point run on the requesting thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.collector.detach_control();
        let _ = self.sender.send(ControlRequest::Shutdown);
        if handle.join().is_err() {
            log::error!("GC control thread panicked");
        }
        log::debug!("GC control thread stopped");
    }
}

impl Drop for GcControlThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn control_loop(collector: Arc<Collector>, receiver: Receiver<ControlRequest>) {
    let interval = collector.config().control_interval;
    loop {
        match receiver.recv_timeout(interval) {
            Ok(ControlRequest::AllocationFailure {
                seen_compactions,
                reply,
            }) => {
                let result = collector.compact_after_alloc_failure(seen_compactions);
                let _ = reply.send(result);
            }
            Ok(ControlRequest::Explicit { cause, reply }) => {
                let _ = reply.send(collector.run_cycle(cause));
            }
            Ok(ControlRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if collector.should_start_cycle() {
                    if let Err(err) = collector.run_cycle(GcCause::Heuristics) {
                        log::error!("heuristic-triggered cycle failed: {}", err);
                    }
                }
            }
        }
    }
}
