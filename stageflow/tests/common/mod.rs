//! Common test utilities for Stageflow integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use stageflow::error::AgentError;
use stageflow::workflow::{
    AgentConfig, AgentExecutor, AgentOutput, AgentRequest, ExecutionCoordinator, ExecutionHandle,
    MemoryBackend, StateStore, StaticModeResolver, WorkflowConfig, WorkflowStage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// How the mock agent answers for a stage.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Succeed after `delay` with `"{stage} done"`
    Succeed { delay: Duration },
    /// Fail every attempt with the message
    Fail(String),
    /// Fail the first `n` attempts, then succeed
    FailTimes(u32),
    /// Never return; only an abort or timeout ends the call
    Hang,
}

/// One recorded invocation.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub stage: String,
    pub attempt: u32,
    pub instruction: String,
    pub correlation_id: String,
    pub started: tokio::time::Instant,
    pub finished: Option<tokio::time::Instant>,
}

/// Scripted agent executor.
///
/// Counts invocations per stage, tracks the peak number of concurrent
/// invocations, and records aborts.
pub struct MockExecutor {
    behaviors: Mutex<HashMap<String, Behavior>>,
    default: Behavior,
    invocations: Mutex<Vec<Invocation>>,
    failures_left: Mutex<HashMap<String, u32>>,
    aborted: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    started: Notify,
}

impl MockExecutor {
    /// Mock where every stage succeeds after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            default: Behavior::Succeed { delay },
            invocations: Mutex::new(Vec::new()),
            failures_left: Mutex::new(HashMap::new()),
            aborted: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Notify::new(),
        }
    }

    /// Mock where every stage succeeds immediately.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Scripts `stage`.
    pub fn with(self, stage: &str, behavior: Behavior) -> Self {
        if let Behavior::FailTimes(n) = &behavior {
            self.failures_left.lock().unwrap().insert(stage.to_string(), *n);
        }
        self.behaviors.lock().unwrap().insert(stage.to_string(), behavior);
        self
    }

    /// Number of invocations of `stage`.
    pub fn calls(&self, stage: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| inv.stage == stage)
            .count()
    }

    /// Stages in invocation order.
    pub fn call_order(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|inv| inv.stage.clone())
            .collect()
    }

    /// All recorded invocations.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Highest number of simultaneous invocations seen.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Stages whose invocation was aborted.
    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }

    /// Waits until `stage` has been invoked at least once.
    pub async fn wait_for_start(&self, stage: &str) {
        loop {
            let notified = self.started.notified();
            if self.calls(stage) > 0 {
                return;
            }
            notified.await;
        }
    }

    fn behavior_for(&self, stage: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(stage)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    fn finish(&self, index: usize) {
        if let Some(inv) = self.invocations.lock().unwrap().get_mut(index) {
            inv.finished = Some(tokio::time::Instant::now());
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn execute(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let stage = request.handle.stage.clone();
        let index = {
            let mut invocations = self.invocations.lock().unwrap();
            invocations.push(Invocation {
                stage: stage.clone(),
                attempt: request.handle.attempt,
                instruction: request.instruction.clone(),
                correlation_id: request.correlation_id.clone(),
                started: tokio::time::Instant::now(),
                finished: None,
            });
            invocations.len() - 1
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);
        self.started.notify_waiters();

        let result = match self.behavior_for(&stage) {
            Behavior::Succeed { delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(AgentOutput::new(format!("{} done", stage)))
            }
            Behavior::Fail(message) => Err(AgentError::Failed(message)),
            Behavior::FailTimes(_) => {
                let mut left = self.failures_left.lock().unwrap();
                let remaining = left.entry(stage.clone()).or_insert(0);
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(AgentError::Failed(format!("{} flaked", stage)))
                } else {
                    Ok(AgentOutput::new(format!("{} done", stage)))
                }
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Err(AgentError::Aborted)
            }
        };

        self.finish(index);
        result
    }

    async fn abort(&self, handle: &ExecutionHandle) {
        self.aborted.lock().unwrap().push(handle.stage.clone());
    }
}

/// Resolver knowing the modes used by the test workflows.
pub fn resolver() -> StaticModeResolver {
    StaticModeResolver::new()
        .with_mode("code", "Code")
        .with_mode("architect", "Architect")
}

/// Coordinator over an in-memory store.
pub fn coordinator(executor: Arc<MockExecutor>) -> (ExecutionCoordinator, Arc<StateStore>) {
    let store = Arc::new(StateStore::new(Arc::new(MemoryBackend::new())));
    let coordinator = ExecutionCoordinator::new(store.clone(), executor, Arc::new(resolver()));
    (coordinator, store)
}

/// Workflow with one `code` agent named `dev`.
pub fn workflow(name: &str) -> WorkflowConfig {
    WorkflowConfig::new(name).agent(AgentConfig::new("dev", "code"))
}

/// Stage executed by `dev`.
pub fn stage(name: &str) -> WorkflowStage {
    WorkflowStage::new(name, "dev")
}
