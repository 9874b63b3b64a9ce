//! Execution coordinator.
//!
//! Composition root of a run: validates the definition, creates or resumes
//! the run state, hands the entry stages to a [`StageScheduler`], waits for
//! the run to drain, and assembles an [`ExecutionResult`].
//!
//! Configuration problems are returned as errors before any state exists.
//! Stage failures are not errors; they are reported inside the result.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

use crate::error::{EngineError, Result, StoreError};
use crate::events::WorkflowEvent;
use crate::settings::Settings;
use crate::workflow::agent::{AgentExecutor, Capability, ModeResolver};
use crate::workflow::config::WorkflowConfig;
use crate::workflow::scheduler::StageScheduler;
use crate::workflow::state::{
    RunStatus, StageStatus, StageUpdate, WorkflowStageState, WorkflowState,
};
use crate::workflow::store::{NewRun, StateStore};
use crate::workflow::validate::WorkflowValidator;

/// Options for a single run.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Existing run to resume, or id for the new run
    pub run_id: Option<String>,
    /// Correlation id of the caller
    pub parent_task_id: Option<String>,
    /// Context the run starts with
    pub initial_context: Map<String, Value>,
    /// Overrides [`Settings::detect_cycles`] for this run
    pub detect_cycles: Option<bool>,
}

impl RunOptions {
    /// Options for a fresh run with a generated id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `run_id`, resuming it if it was persisted before.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the parent correlation id.
    pub fn with_parent_task_id(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    /// Adds a value to the initial context.
    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_context.insert(key.into(), value);
        self
    }

    /// Replaces the initial context.
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.initial_context = context;
        self
    }

    /// Enables or disables cycle detection for this run.
    pub fn with_cycle_detection(mut self, enabled: bool) -> Self {
        self.detect_cycles = Some(enabled);
        self
    }
}

/// Outcome of a run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Run identifier
    pub run_id: String,
    /// Terminal run status
    pub status: RunStatus,
    /// Stage states in definition order
    pub stages: Vec<WorkflowStageState>,
    /// Final shared context
    pub context: Map<String, Value>,
    /// Wall time of this execution in milliseconds; a resumed run does not
    /// count the time before it was resumed
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn from_state(
        config: &WorkflowConfig,
        mut state: WorkflowState,
        execution_started: DateTime<Utc>,
    ) -> Self {
        let mut stages: Vec<WorkflowStageState> = config
            .workflow
            .iter()
            .filter_map(|stage| state.stages.remove(&stage.name))
            .collect();
        stages.extend(state.stages.into_values());

        Self {
            duration_ms: state
                .completed_at
                .map(|end| (end - execution_started).num_milliseconds().max(0) as u64)
                .unwrap_or_default(),
            run_id: state.id,
            status: state.status,
            stages,
            context: state.context,
        }
    }

    /// True when the run completed.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// First failed stage in definition order.
    pub fn first_failure(&self) -> Option<&WorkflowStageState> {
        self.stages
            .iter()
            .find(|stage| stage.status == StageStatus::Failed)
    }

    /// State of a stage by name.
    pub fn stage(&self, name: &str) -> Option<&WorkflowStageState> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

struct ActiveRun {
    scheduler: Arc<StageScheduler>,
    done: watch::Receiver<bool>,
}

/// Entry point for executing workflows.
///
/// # Example
///
/// ```ignore
/// let coordinator = ExecutionCoordinator::new(
///     Arc::new(StateStore::file(".stageflow/runs")),
///     Arc::new(ShellAgentExecutor::new("my-agent")),
///     Arc::new(StaticModeResolver::permissive()),
/// );
///
/// let config = WorkflowConfig::from_file("review.yaml")?;
/// let result = coordinator.run(&config, RunOptions::new()).await?;
/// println!("{} finished as {:?}", result.run_id, result.status);
/// ```
pub struct ExecutionCoordinator {
    store: Arc<StateStore>,
    executor: Arc<dyn AgentExecutor>,
    resolver: Arc<dyn ModeResolver>,
    settings: Settings,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl ExecutionCoordinator {
    /// Creates a coordinator.
    ///
    /// # Arguments
    ///
    /// * `store` - State store; its event bus carries the coordinator's events
    /// * `executor` - Agent execution capability
    /// * `resolver` - Mode resolver used to validate agents
    pub fn new(
        store: Arc<StateStore>,
        executor: Arc<dyn AgentExecutor>,
        resolver: Arc<dyn ModeResolver>,
    ) -> Self {
        Self {
            store,
            executor,
            resolver,
            settings: Settings::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Applies engine settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// The state store.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Subscribes to events of every run of this coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.store.events().subscribe()
    }

    /// Ids of runs currently executing.
    pub async fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Executes `config` to completion.
    ///
    /// If `options.run_id` names a persisted run, that run is resumed:
    /// completed stages are kept and everything else runs again.
    ///
    /// # Returns
    ///
    /// - `Ok(ExecutionResult)` once the run is terminal, whatever the stage outcomes
    /// - `Err(EngineError::Config)` if the definition is invalid (no state is created)
    /// - `Err(EngineError::WorkflowChanged)` if a resumed run was created from another definition
    /// - `Err(EngineError::RunActive)` if the run is already executing
    pub async fn run(&self, config: &WorkflowConfig, options: RunOptions) -> Result<ExecutionResult> {
        config.validate()?;
        config.validate_modes(self.resolver.as_ref())?;

        let validator = WorkflowValidator::new();
        if options.detect_cycles.unwrap_or(self.settings.detect_cycles) {
            validator.check_acyclic(config)?;
        }
        let report = validator.analyze(config);
        if !report.unreachable().is_empty() {
            tracing::warn!(
                workflow = %config.name,
                stages = ?report.unreachable(),
                "stages are unreachable from any entry stage"
            );
        }

        let capabilities: HashMap<String, Capability> = config
            .agents
            .iter()
            .filter_map(|agent| {
                self.resolver
                    .resolve(&agent.mode)
                    .map(|capability| (agent.id.clone(), capability))
            })
            .collect();
        let fingerprint = config.fingerprint();

        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let previous = match self.store.load(&run_id).await {
            Ok(state) => Some(state),
            Err(StoreError::RunNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let resumed_stages: Vec<String> = match &previous {
            Some(state) => {
                if let Some(checksum) = state.definition_checksum.as_deref() {
                    if checksum != fingerprint {
                        return Err(EngineError::WorkflowChanged { run_id });
                    }
                }
                state
                    .stages
                    .values()
                    .filter(|stage| stage.status == StageStatus::Completed)
                    .map(|stage| stage.name.clone())
                    .collect()
            }
            None => Vec::new(),
        };

        let config = Arc::new(config.clone());
        let correlation_id = options
            .parent_task_id
            .clone()
            .or_else(|| previous.as_ref().and_then(|s| s.parent_task_id.clone()))
            .unwrap_or_else(|| run_id.clone());
        let scheduler = Arc::new(
            StageScheduler::new(
                run_id.clone(),
                config.clone(),
                self.store.clone(),
                self.executor.clone(),
            )
            .with_correlation_id(correlation_id)
            .with_capabilities(capabilities)
            .with_resumed_stages(resumed_stages),
        );

        let execution_started = Utc::now();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut active = self.active.lock().await;
            if active.contains_key(&run_id) {
                return Err(EngineError::RunActive(run_id));
            }
            active.insert(
                run_id.clone(),
                ActiveRun {
                    scheduler: scheduler.clone(),
                    done: done_rx,
                },
            );
        }

        let outcome = self
            .drive(&config, &run_id, previous.is_some(), fingerprint, options, scheduler)
            .await;

        let _ = done_tx.send(true);
        self.active.lock().await.remove(&run_id);
        self.store.release(&run_id).await;

        let result = ExecutionResult::from_state(&config, outcome?, execution_started);
        tracing::info!(
            run_id = %run_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "run finished"
        );
        Ok(result)
    }

    async fn drive(
        &self,
        config: &WorkflowConfig,
        run_id: &str,
        resume: bool,
        fingerprint: String,
        options: RunOptions,
        scheduler: Arc<StageScheduler>,
    ) -> Result<WorkflowState> {
        let state = if resume {
            self.store.reopen_run(run_id).await?
        } else {
            self.store
                .create_run(
                    NewRun::new(run_id, config.name.clone())
                        .with_parent(options.parent_task_id)
                        .with_context(options.initial_context)
                        .with_checksum(fingerprint),
                )
                .await?
        };

        for stage in &config.workflow {
            if !state.stages.contains_key(&stage.name) {
                self.store
                    .upsert_stage_state(run_id, &stage.name, StageUpdate::default().with_agent(&stage.agent))
                    .await?;
            }
        }
        self.store.set_run_status(run_id, RunStatus::InProgress).await?;

        scheduler.clone().run(config.entry_stages()).await;

        let stopped = scheduler.is_cancelled();
        if !stopped {
            let pending: Vec<String> = self
                .store
                .snapshot(run_id)
                .await?
                .stages
                .values()
                .filter(|stage| stage.status == StageStatus::Pending)
                .map(|stage| stage.name.clone())
                .collect();
            for name in pending {
                self.store
                    .upsert_stage_state(run_id, &name, StageUpdate::status(StageStatus::Skipped))
                    .await?;
            }
        }

        let status = if stopped {
            RunStatus::Failed
        } else {
            self.store.snapshot(run_id).await?.outcome()
        };
        self.store.set_run_status(run_id, status).await?;
        Ok(self.store.snapshot(run_id).await?)
    }

    /// Stops a running run.
    ///
    /// No further stage starts, every in-flight invocation is aborted through
    /// the agent executor, and the run finishes as `failed`. Stages that had
    /// not started stay `pending`. Returns once the run has drained.
    ///
    /// # Returns
    ///
    /// Names of the stages that were aborted.
    pub async fn stop(&self, run_id: &str) -> Result<Vec<String>> {
        let (scheduler, mut done) = {
            let active = self.active.lock().await;
            let run = active
                .get(run_id)
                .ok_or_else(|| EngineError::RunNotActive(run_id.to_string()))?;
            (run.scheduler.clone(), run.done.clone())
        };

        tracing::info!(run_id, "stopping run");
        let aborted = scheduler.abort_all().await;
        let _ = done.wait_for(|finished| *finished).await;
        Ok(aborted)
    }
}
