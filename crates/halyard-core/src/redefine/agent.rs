//! Redefinition agent
//!
//! A control thread that accepts redefinition requests from outside the
//! running program and applies them through the [`RedefinitionManager`].
//! Requesters block on a reply channel; a mutator thread must wait inside
//! `SafepointCoordinator::blocked`, since the publication pause waits for it.

use super::{RedefineError, RedefinitionManager};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A redefinition request
pub struct RedefineRequest {
    /// Class to redefine
    pub class_name: String,
    /// New class file
    pub bytecode: Vec<u8>,
    /// Receives the new version number or the rejection
    pub reply: Sender<Result<u32, RedefineError>>,
}

enum AgentMessage {
    Redefine(RedefineRequest),
    Shutdown,
}

/// Running agent thread
pub struct RedefineAgent {
    sender: Sender<AgentMessage>,
    handle: Option<JoinHandle<()>>,
}

/// Cloneable handle for submitting requests to the agent
#[derive(Clone)]
pub struct AgentHandle {
    sender: Sender<AgentMessage>,
}

impl RedefineAgent {
    /// Spawn the agent thread
    pub fn start(manager: Arc<RedefinitionManager>) -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("halyard-redefine-agent".to_string())
            .spawn(move || agent_loop(manager, receiver))?;
        log::debug!("redefinition agent started");
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Handle for submitting requests
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            sender: self.sender.clone(),
        }
    }

    /// Stop the thread after it finishes queued requests
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.sender.send(AgentMessage::Shutdown);
        if handle.join().is_err() {
            log::error!("redefinition agent panicked");
        }
        log::debug!("redefinition agent stopped");
    }
}

impl Drop for RedefineAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AgentHandle {
    /// Queue a request; the result arrives on the returned channel
    pub fn submit(
        &self,
        class_name: impl Into<String>,
        bytecode: Vec<u8>,
    ) -> Result<Receiver<Result<u32, RedefineError>>, RedefineError> {
        let (reply, result) = channel::bounded(1);
        self.sender
            .send(AgentMessage::Redefine(RedefineRequest {
                class_name: class_name.into(),
                bytecode,
                reply,
            }))
            .map_err(|_| RedefineError::AgentUnavailable)?;
        Ok(result)
    }

    /// Redefine a class and wait for the outcome
    pub fn redefine(
        &self,
        class_name: impl Into<String>,
        bytecode: Vec<u8>,
    ) -> Result<u32, RedefineError> {
        self.submit(class_name, bytecode)?
            .recv()
            .map_err(|_| RedefineError::AgentUnavailable)?
    }
}

fn agent_loop(manager: Arc<RedefinitionManager>, receiver: Receiver<AgentMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            AgentMessage::Redefine(request) => {
                log::debug!(
                    "agent: redefining {} ({} bytes)",
                    request.class_name,
                    request.bytecode.len()
                );
                let result = manager.redefine(&request.class_name, &request.bytecode);
                if let Err(err) = &result {
                    log::warn!("agent: redefinition of {} rejected: {}", request.class_name, err);
                }
                let _ = request.reply.send(result);
            }
            AgentMessage::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{Assembler, ClassBuilder, ClassTable, Instruction};
    use crate::gc::{Collector, CollectorConfig};
    use crate::heap::HeapConfig;
    use crate::heuristics::HeuristicKind;

    fn class_returning(value: i64) -> Vec<u8> {
        let mut asm = Assembler::new();
        asm.emit(Instruction::PushInt(value)).emit(Instruction::Return);
        let mut b = ClassBuilder::new("B");
        b.method("m", 1, 1, asm.finish());
        b.build().encode()
    }

    fn agent() -> (RedefineAgent, Arc<ClassTable>) {
        let collector = Arc::new(Collector::new(
            HeapConfig {
                heap_size: 8 * 4096,
                region_size: 4096,
                compressed_refs: false,
                satb_buffer_size: 4,
                oom_during_evac_a_lot: false,
            },
            HeuristicKind::Passive.build(),
            CollectorConfig::default(),
        ));
        let classes = Arc::new(ClassTable::new());
        classes.define_bytes(&class_returning(1)).unwrap();
        let manager = Arc::new(RedefinitionManager::new(classes.clone(), collector));
        (RedefineAgent::start(manager).unwrap(), classes)
    }

    #[test]
    fn test_agent_applies_requests_in_order() {
        let (agent, classes) = agent();
        let handle = agent.handle();
        let first = handle.submit("B", class_returning(2)).unwrap();
        let second = handle.submit("B", class_returning(3)).unwrap();
        assert_eq!(first.recv().unwrap().unwrap(), 2);
        assert_eq!(second.recv().unwrap().unwrap(), 3);
        assert_eq!(classes.current_by_name("B").unwrap().version(), 3);
    }

    #[test]
    fn test_agent_reports_rejection() {
        let (agent, _) = agent();
        assert!(matches!(
            agent.handle().redefine("Missing", class_returning(2)),
            Err(RedefineError::UnknownClass(_))
        ));
    }

    #[test]
    fn test_handle_after_shutdown() {
        let (mut agent, _) = agent();
        let handle = agent.handle();
        agent.shutdown();
        assert!(matches!(
            handle.redefine("B", class_returning(2)),
            Err(RedefineError::AgentUnavailable)
        ));
    }
}
