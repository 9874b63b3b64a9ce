//! Stage scheduler.
//!
//! Walks the stage graph of one run. A batch of stages is split into
//! parallel and sequential stages: parallel stages run in chunks of
//! `max_parallel_stages` (each chunk drains before the next starts), then
//! sequential stages run one at a time in the given order. Each stage is
//! attempted until it succeeds or its retry budget is spent, and its outcome
//! selects the next stage(s).
//!
//! All state changes go through the [`StateStore`]; the scheduler itself only
//! tracks what is in flight.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

use crate::workflow::agent::{AgentExecutor, AgentRequest, Capability, ExecutionHandle};
use crate::workflow::cancellation::CancellationTokenSource;
use crate::workflow::config::{StageStrategy, WorkflowConfig, WorkflowStage, END_STAGE};
use crate::workflow::prompt::render_instruction;
use crate::workflow::state::{StageStatus, StageUpdate};
use crate::workflow::store::StateStore;
use crate::workflow::timeout::{self, StageTimeout};

/// Error message recorded for stages interrupted by a stop.
pub const STOPPED_MESSAGE: &str = "Workflow stopped: agent invocation aborted";

/// Scheduler for a single run.
///
/// Shared as `Arc<StageScheduler>` between the branches of the run and the
/// coordinator, which uses [`abort_all`](Self::abort_all) to stop it.
pub struct StageScheduler {
    run_id: String,
    correlation_id: String,
    config: Arc<WorkflowConfig>,
    capabilities: HashMap<String, Capability>,
    store: Arc<StateStore>,
    executor: Arc<dyn AgentExecutor>,
    cancellation: CancellationTokenSource,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
    handles: Mutex<HashMap<String, ExecutionHandle>>,
    resumed: Mutex<HashSet<String>>,
}

impl StageScheduler {
    /// Creates a scheduler for `run_id`.
    ///
    /// # Arguments
    ///
    /// * `run_id` - Run whose state the scheduler mutates
    /// * `config` - Validated workflow definition
    /// * `store` - State store holding the run
    /// * `executor` - Agent execution capability
    pub fn new(
        run_id: impl Into<String>,
        config: Arc<WorkflowConfig>,
        store: Arc<StateStore>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        let run_id = run_id.into();
        let permits = Arc::new(Semaphore::new(config.max_parallel_stages.max(1)));
        Self {
            correlation_id: run_id.clone(),
            run_id,
            config,
            capabilities: HashMap::new(),
            store,
            executor,
            cancellation: CancellationTokenSource::new(),
            permits,
            in_flight: Mutex::new(HashSet::new()),
            handles: Mutex::new(HashMap::new()),
            resumed: Mutex::new(HashSet::new()),
        }
    }

    /// Sets the id passed to agents for correlation.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Sets the resolved capability of each agent, keyed by agent id.
    pub fn with_capabilities(mut self, capabilities: HashMap<String, Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Marks stages completed by an earlier execution of the run.
    ///
    /// The first time such a stage is reached it is not executed again; its
    /// success transition is followed instead.
    pub fn with_resumed_stages(mut self, stages: impl IntoIterator<Item = String>) -> Self {
        self.resumed = Mutex::new(stages.into_iter().collect());
        self
    }

    /// Run this scheduler drives.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// True once the run was stopped.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Executes the entry stages and everything reachable from them.
    ///
    /// Returns once every branch has terminated.
    pub async fn run(self: Arc<Self>, entry_stages: Vec<String>) {
        tracing::info!(
            run_id = %self.run_id,
            entry = ?entry_stages,
            "scheduling entry stages"
        );
        self.execute_batch(entry_stages, Vec::new()).await;
    }

    /// Stops the run: no new stage starts and every in-flight invocation is aborted.
    ///
    /// # Returns
    ///
    /// Names of the stages whose invocation was aborted.
    pub async fn abort_all(&self) -> Vec<String> {
        self.cancellation.cancel();

        let handles: Vec<ExecutionHandle> = self.handles.lock().await.values().cloned().collect();
        let mut aborted = Vec::with_capacity(handles.len());
        for handle in handles {
            tracing::info!(run_id = %self.run_id, stage = %handle.stage, "aborting stage");
            self.executor.abort(&handle).await;
            handle.cancel();
            aborted.push(handle.stage.clone());
        }
        aborted
    }

    /// Executes a set of stages: parallel chunks first, then sequential stages.
    ///
    /// `lineage` is the path of stages the branch took to get here.
    fn execute_batch(self: Arc<Self>, names: Vec<String>, lineage: Vec<String>) -> BoxFuture<'static, ()> {
        async move {
            let mut parallel = Vec::new();
            let mut sequential = Vec::new();
            for name in names {
                match self.config.find_stage(&name) {
                    Some(stage) if stage.parallel => parallel.push(name),
                    Some(_) => sequential.push(name),
                    None => {
                        tracing::error!(run_id = %self.run_id, stage = %name, "unknown stage in batch")
                    }
                }
            }

            let chunk_size = self.config.max_parallel_stages.max(1);
            for chunk in parallel.chunks(chunk_size) {
                if self.is_cancelled() {
                    return;
                }
                tracing::debug!(run_id = %self.run_id, chunk = ?chunk, "starting parallel chunk");
                join_all(
                    chunk
                        .iter()
                        .map(|name| self.clone().execute_stage(name.clone(), lineage.clone())),
                )
                .await;
            }

            for name in sequential {
                if self.is_cancelled() {
                    return;
                }
                self.clone().execute_stage(name, lineage.clone()).await;
            }
        }
        .boxed()
    }

    /// Executes one stage, then follows its transition.
    ///
    /// A stage another branch already completed is not run again. Reaching a
    /// completed stage that is on the branch's own lineage is a loop, and the
    /// stage runs again.
    fn execute_stage(self: Arc<Self>, name: String, lineage: Vec<String>) -> BoxFuture<'static, ()> {
        async move {
            if self.is_cancelled() {
                return;
            }
            let Some(stage) = self.config.find_stage(&name).cloned() else {
                tracing::error!(run_id = %self.run_id, stage = %name, "unknown stage");
                return;
            };

            if !self.in_flight.lock().await.insert(name.clone()) {
                tracing::debug!(run_id = %self.run_id, stage = %name, "stage already running");
                return;
            }

            let resumed = self.resumed.lock().await.remove(&name);
            if !resumed && !lineage.contains(&name) && self.is_completed(&name).await {
                tracing::debug!(run_id = %self.run_id, stage = %name, "stage already completed");
                self.in_flight.lock().await.remove(&name);
                return;
            }

            let succeeded = if resumed {
                tracing::info!(run_id = %self.run_id, stage = %name, "stage completed in earlier execution");
                true
            } else {
                self.attempt_stage(&stage).await
            };

            self.in_flight.lock().await.remove(&name);

            if self.is_cancelled() {
                return;
            }
            self.follow_transition(&stage, succeeded, extend_lineage(lineage, &name))
                .await;
        }
        .boxed()
    }

    async fn is_completed(&self, name: &str) -> bool {
        matches!(
            self.store.stage_status(&self.run_id, name).await,
            Ok(Some(StageStatus::Completed))
        )
    }

    async fn follow_transition(
        self: &Arc<Self>,
        stage: &WorkflowStage,
        succeeded: bool,
        lineage: Vec<String>,
    ) {
        match stage.strategy {
            StageStrategy::Fixed => {
                let next = if succeeded {
                    stage.on_success.as_deref()
                } else {
                    stage.on_failure.as_deref()
                };
                match next {
                    Some(next) if next != END_STAGE => {
                        self.clone().execute_stage(next.to_string(), lineage).await;
                    }
                    _ => {
                        tracing::debug!(run_id = %self.run_id, stage = %stage.name, "branch ended");
                    }
                }
            }
            StageStrategy::Orchestrate => {
                if !succeeded {
                    tracing::debug!(
                        run_id = %self.run_id,
                        stage = %stage.name,
                        "orchestrate stage failed, branch ended"
                    );
                    return;
                }
                let steps: Vec<String> = stage
                    .next_steps
                    .iter()
                    .filter(|step| step.as_str() != END_STAGE)
                    .cloned()
                    .collect();
                if steps.is_empty() {
                    return;
                }
                if let Err(e) = self.store.record_decision(&self.run_id, &stage.name, &steps).await {
                    tracing::warn!(run_id = %self.run_id, error = %e, "failed to record decision");
                }
                self.clone().execute_batch(steps, lineage).await;
            }
        }
    }

    /// Runs attempts until one succeeds or the retry budget is spent.
    async fn attempt_stage(&self, stage: &WorkflowStage) -> bool {
        let Some(agent) = self.config.find_agent(&stage.agent).cloned() else {
            self.record_failure(stage, format!("Unknown agent '{}'", stage.agent))
                .await;
            return false;
        };
        let Some(capability) = self.capabilities.get(&agent.id).cloned() else {
            self.record_failure(stage, format!("No capability resolved for agent '{}'", agent.id))
                .await;
            return false;
        };

        let deadline = StageTimeout::for_stage(&self.config, stage);
        let run_token = self.cancellation.token();
        let mut retry_count = 0;
        let mut instruction: Option<String> = None;

        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit,
                _ = run_token.cancelled() => return false,
            };
            let Ok(permit) = permit else {
                return false;
            };
            if self.is_cancelled() {
                return false;
            }

            let mut update = StageUpdate::status(StageStatus::InProgress).with_agent(&agent.id);
            if retry_count == 0 {
                update = update.with_retry_count(0);
            }
            if let Err(e) = self.store.upsert_stage_state(&self.run_id, &stage.name, update).await {
                tracing::error!(run_id = %self.run_id, stage = %stage.name, error = %e, "run state missing");
                return false;
            }

            // Rendered once; retries reuse the first attempt's instruction.
            if instruction.is_none() {
                let context = match self.store.snapshot(&self.run_id).await {
                    Ok(state) => state.context,
                    Err(_) => Map::new(),
                };
                instruction = Some(render_instruction(&self.config, stage, &capability, &context));
            }

            tracing::info!(
                run_id = %self.run_id,
                stage = %stage.name,
                agent = %agent.id,
                attempt = retry_count,
                "stage started"
            );

            let request = AgentRequest {
                agent: agent.clone(),
                capability: capability.clone(),
                instruction: instruction.clone().unwrap_or_default(),
                correlation_id: self.correlation_id.clone(),
                handle: ExecutionHandle {
                    run_id: self.run_id.clone(),
                    stage: stage.name.clone(),
                    attempt: retry_count,
                    token: self.cancellation.child_token(),
                },
            };

            let outcome = self.invoke(request, deadline).await;
            drop(permit);

            match outcome {
                Ok(summary) => {
                    self.record_success(stage, summary).await;
                    return true;
                }
                Err(message) => {
                    self.record_failure(stage, message).await;
                    if self.is_cancelled() || retry_count >= stage.retry_count {
                        return false;
                    }
                    retry_count += 1;
                    tracing::warn!(
                        run_id = %self.run_id,
                        stage = %stage.name,
                        retry = retry_count,
                        max_retries = stage.retry_count,
                        "retrying stage"
                    );
                    if let Err(e) = self
                        .store
                        .mark_retrying(&self.run_id, &stage.name, retry_count, stage.retry_count)
                        .await
                    {
                        tracing::error!(run_id = %self.run_id, error = %e, "run state missing");
                        return false;
                    }
                }
            }
        }
    }

    /// One agent invocation raced against its deadline and the run's stop signal.
    async fn invoke(
        &self,
        request: AgentRequest,
        deadline: Option<StageTimeout>,
    ) -> Result<String, String> {
        let handle = request.handle.clone();
        self.handles
            .lock()
            .await
            .insert(handle.stage.clone(), handle.clone());

        let outcome = tokio::select! {
            biased;
            result = self.executor.execute(request) => {
                result.map(|output| output.summary).map_err(|e| e.to_string())
            }
            _ = handle.token.cancelled() => {
                if handle.token.is_parent_cancelled() {
                    Err(STOPPED_MESSAGE.to_string())
                } else {
                    Err(format!("Stage '{}' aborted", handle.stage))
                }
            }
            _ = timeout::elapsed(deadline) => {
                self.executor.abort(&handle).await;
                handle.cancel();
                let message = deadline
                    .map(|d| d.error(&handle.stage).to_string())
                    .unwrap_or_else(|| format!("Stage '{}' timed out", handle.stage));
                Err(message)
            }
        };

        self.handles.lock().await.remove(&handle.stage);
        outcome
    }

    async fn record_success(&self, stage: &WorkflowStage, summary: String) {
        tracing::info!(run_id = %self.run_id, stage = %stage.name, "stage completed");
        let update = StageUpdate::status(StageStatus::Completed).with_result(summary.clone());
        if let Err(e) = self.store.upsert_stage_state(&self.run_id, &stage.name, update).await {
            tracing::error!(run_id = %self.run_id, error = %e, "run state missing");
            return;
        }
        self.merge_outcome(stage, json!(summary), true).await;
    }

    async fn record_failure(&self, stage: &WorkflowStage, message: String) {
        tracing::warn!(run_id = %self.run_id, stage = %stage.name, error = %message, "stage failed");
        let update = StageUpdate::status(StageStatus::Failed)
            .with_agent(&stage.agent)
            .with_error(message.clone());
        if let Err(e) = self.store.upsert_stage_state(&self.run_id, &stage.name, update).await {
            tracing::error!(run_id = %self.run_id, error = %e, "run state missing");
            return;
        }
        self.merge_outcome(stage, json!(message), false).await;
    }

    async fn merge_outcome(&self, stage: &WorkflowStage, value: Value, succeeded: bool) {
        let key = if succeeded {
            format!("{}_result", stage.name)
        } else {
            format!("{}_error", stage.name)
        };
        let mut updates = Map::new();
        updates.insert(key, value);
        updates.insert(format!("{}_success", stage.name), Value::Bool(succeeded));
        if let Err(e) = self.store.merge_context(&self.run_id, updates).await {
            tracing::error!(run_id = %self.run_id, error = %e, "run state missing");
        }
    }
}

/// Appends `stage` to a branch lineage. Re-entering a stage already on the
/// lineage restarts the lineage at that stage, so loops stay bounded.
fn extend_lineage(mut lineage: Vec<String>, stage: &str) -> Vec<String> {
    if let Some(pos) = lineage.iter().position(|name| name == stage) {
        lineage.truncate(pos);
    }
    lineage.push(stage.to_string());
    lineage
}
