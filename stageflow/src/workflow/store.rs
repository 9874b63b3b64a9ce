//! State store: the single owner of run state.
//!
//! Every mutation goes through [`StateStore`], which updates the in-memory
//! state, persists it through a [`StateBackend`], and emits the matching
//! event while holding the run's lock. Writes and events are therefore
//! ordered per run, and concurrent stages of one run never lose updates.
//!
//! Persistence is best effort: a failed write is logged and the in-memory
//! state stays authoritative.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::events::{EventBus, EventType};
use crate::settings::Settings;
use crate::workflow::state::{
    RunStatus, StageStatus, StageUpdate, WorkflowStageState, WorkflowState,
};

/// Durable storage for serialized runs.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Writes the full state of a run.
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError>;

    /// Reads a run, `None` if it does not exist.
    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, StoreError>;

    /// Lists stored run ids.
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Removes a run; returns whether it existed.
    async fn delete(&self, run_id: &str) -> Result<bool, StoreError>;
}

/// Canonical persisted form: pretty-printed camelCase JSON.
pub fn encode_state(state: &WorkflowState) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec_pretty(state)?)
}

/// Parses the persisted form.
pub fn decode_state(bytes: &[u8]) -> Result<WorkflowState, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// One JSON file per run: `{dir}/{run_id}.json`.
#[derive(Clone, Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Stores runs under `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the run files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a run's file.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl StateBackend for FileBackend {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = encode_state(state)?;
        let path = self.path_for(&state.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        match tokio::fs::read(self.path_for(run_id)).await {
            Ok(bytes) => Ok(Some(decode_state(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, run_id: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process backend holding the serialized form of each run.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    runs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw persisted bytes of a run.
    pub async fn raw(&self, run_id: &str) -> Option<Vec<u8>> {
        self.runs.lock().await.get(run_id).cloned()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let bytes = encode_state(state)?;
        self.runs.lock().await.insert(state.id.clone(), bytes);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        match self.runs.lock().await.get(run_id) {
            Some(bytes) => Ok(Some(decode_state(bytes)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.runs.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.runs.lock().await.remove(run_id).is_some())
    }
}

/// Parameters of a new run.
#[derive(Clone, Debug, Default)]
pub struct NewRun {
    /// Run identifier
    pub id: String,
    /// Workflow name
    pub name: String,
    /// Correlation id of the caller
    pub parent_task_id: Option<String>,
    /// Initial shared context
    pub context: Map<String, Value>,
    /// Definition fingerprint
    pub definition_checksum: Option<String>,
}

impl NewRun {
    /// Creates run parameters with an empty context.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the parent correlation id.
    pub fn with_parent(mut self, parent_task_id: Option<String>) -> Self {
        self.parent_task_id = parent_task_id;
        self
    }

    /// Sets the initial context.
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Records the definition fingerprint.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.definition_checksum = Some(checksum.into());
        self
    }
}

type RunSlot = Arc<Mutex<WorkflowState>>;

/// Owner of all run state.
pub struct StateStore {
    runs: RwLock<HashMap<String, RunSlot>>,
    backend: Arc<dyn StateBackend>,
    events: EventBus,
}

impl StateStore {
    /// Creates a store over `backend` with a fresh event bus.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            backend,
            events: EventBus::default(),
        }
    }

    /// Store persisting runs as JSON files under `dir`.
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(dir)))
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// File store configured from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::file(settings.state_dir.clone()).with_event_bus(EventBus::new(settings.event_capacity))
    }

    /// Replaces the event bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Event bus the store publishes to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Creates a pending run, persists it, and emits `workflow:started`.
    pub async fn create_run(&self, run: NewRun) -> Result<WorkflowState, StoreError> {
        let mut state = WorkflowState::new(run.id.clone(), run.name);
        state.parent_task_id = run.parent_task_id;
        state.context = run.context;
        state.definition_checksum = run.definition_checksum;

        let slot = Arc::new(Mutex::new(state));
        let guard = slot.lock().await;
        self.runs.write().await.insert(run.id.clone(), slot.clone());

        self.persist(&guard).await;
        self.events.publish(
            EventType::WorkflowStarted,
            &guard.id,
            json!({
                "name": guard.name,
                "parentTaskId": guard.parent_task_id,
                "resumed": false,
            }),
        );
        tracing::info!(run_id = %guard.id, workflow = %guard.name, "run created");
        Ok(guard.clone())
    }

    /// Sets the run status.
    ///
    /// Entering a terminal status stamps `completedAt` and emits
    /// `workflow:completed` or `workflow:failed`. A run that is already
    /// terminal is left unchanged.
    pub async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        let slot = self.slot(run_id).await?;
        let mut state = slot.lock().await;

        if state.status.is_terminal() {
            tracing::debug!(run_id, current = ?state.status, requested = ?status, "run already terminal");
            return Ok(());
        }

        state.set_status(status);
        self.persist(&state).await;

        let event_type = match status {
            RunStatus::Completed => Some(EventType::WorkflowCompleted),
            RunStatus::Failed => Some(EventType::WorkflowFailed),
            _ => None,
        };
        if let Some(event_type) = event_type {
            self.events.publish(
                event_type,
                run_id,
                json!({
                    "status": state.status,
                    "durationMs": state.duration_ms(),
                    "completedStages": state.completed_stages,
                    "failedStages": state.failed_stages,
                }),
            );
        }
        Ok(())
    }

    /// Merges a partial update into a stage and performs its bookkeeping.
    ///
    /// Entering `in_progress`, `completed`, or `failed` emits
    /// `stage:started`, `stage:completed`, or `stage:failed`.
    pub async fn upsert_stage_state(
        &self,
        run_id: &str,
        stage: &str,
        update: StageUpdate,
    ) -> Result<WorkflowStageState, StoreError> {
        let slot = self.slot(run_id).await?;
        let mut state = slot.lock().await;

        let transition = state.apply_stage_update(stage, update);
        self.persist(&state).await;

        if transition.changed() {
            let stage_state = &transition.state;
            let event = match transition.to {
                StageStatus::InProgress => Some((
                    EventType::StageStarted,
                    json!({
                        "stage": stage,
                        "agent": stage_state.agent,
                        "retryCount": stage_state.retry_count,
                    }),
                )),
                StageStatus::Completed => Some((
                    EventType::StageCompleted,
                    json!({
                        "stage": stage,
                        "agent": stage_state.agent,
                        "result": stage_state.result,
                    }),
                )),
                StageStatus::Failed => Some((
                    EventType::StageFailed,
                    json!({
                        "stage": stage,
                        "agent": stage_state.agent,
                        "error": stage_state.error,
                        "retryCount": stage_state.retry_count,
                    }),
                )),
                StageStatus::Pending | StageStatus::Skipped => None,
            };
            if let Some((event_type, data)) = event {
                self.events.publish(event_type, run_id, data);
            }
        }

        Ok(transition.state)
    }

    /// Resets a failed stage to pending for another attempt and emits
    /// `stage:retrying`.
    pub async fn mark_retrying(
        &self,
        run_id: &str,
        stage: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<WorkflowStageState, StoreError> {
        let slot = self.slot(run_id).await?;
        let mut state = slot.lock().await;

        let transition = state.apply_stage_update(
            stage,
            StageUpdate::status(StageStatus::Pending).with_retry_count(retry_count),
        );
        self.persist(&state).await;

        self.events.publish(
            EventType::StageRetrying,
            run_id,
            json!({
                "stage": stage,
                "retryCount": retry_count,
                "maxRetries": max_retries,
                "lastError": transition.state.error,
            }),
        );
        Ok(transition.state)
    }

    /// Shallow-merges values into the run context.
    pub async fn merge_context(
        &self,
        run_id: &str,
        updates: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let slot = self.slot(run_id).await?;
        let mut state = slot.lock().await;
        state.merge_context(updates);
        self.persist(&state).await;
        Ok(())
    }

    /// Emits `orchestrator:decision` for the stages an orchestrate stage fans out to.
    pub async fn record_decision(
        &self,
        run_id: &str,
        stage: &str,
        next_steps: &[String],
    ) -> Result<(), StoreError> {
        let slot = self.slot(run_id).await?;
        let _state = slot.lock().await;
        self.events.publish(
            EventType::OrchestratorDecision,
            run_id,
            json!({ "stage": stage, "nextSteps": next_steps }),
        );
        Ok(())
    }

    /// Copy of a run that is loaded in memory.
    pub async fn snapshot(&self, run_id: &str) -> Result<WorkflowState, StoreError> {
        let slot = self.slot(run_id).await?;
        let state = slot.lock().await;
        Ok(state.clone())
    }

    /// Status of one stage of a run that is loaded in memory.
    pub async fn stage_status(
        &self,
        run_id: &str,
        stage: &str,
    ) -> Result<Option<StageStatus>, StoreError> {
        let slot = self.slot(run_id).await?;
        let state = slot.lock().await;
        Ok(state.stages.get(stage).map(|s| s.status))
    }

    /// Loads a run from memory, falling back to the backend.
    pub async fn load(&self, run_id: &str) -> Result<WorkflowState, StoreError> {
        if let Ok(state) = self.snapshot(run_id).await {
            return Ok(state);
        }
        self.backend
            .load(run_id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    /// All known run ids, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: BTreeSet<String> = self.backend.list().await?.into_iter().collect();
        ids.extend(self.runs.read().await.keys().cloned());
        Ok(ids.into_iter().collect())
    }

    /// Deletes a run from memory and storage; returns whether it existed.
    pub async fn delete(&self, run_id: &str) -> Result<bool, StoreError> {
        let in_memory = self.runs.write().await.remove(run_id).is_some();
        let stored = self.backend.delete(run_id).await?;
        Ok(in_memory || stored)
    }

    /// Deletes terminal runs completed more than `days` days ago.
    ///
    /// Runs without `completedAt` are never deleted.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut deleted = 0;

        for run_id in self.list().await? {
            let state = match self.load(&run_id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "skipping unreadable run during cleanup");
                    continue;
                }
            };
            let expired = state
                .completed_at
                .map(|completed| completed < cutoff)
                .unwrap_or(false);
            if expired && self.delete(&run_id).await? {
                deleted += 1;
            }
        }

        tracing::info!(days, deleted, "cleaned up old runs");
        Ok(deleted)
    }

    /// Loads a persisted run into memory without changing it.
    pub async fn open_run(&self, run_id: &str) -> Result<WorkflowState, StoreError> {
        if let Ok(state) = self.snapshot(run_id).await {
            return Ok(state);
        }
        let state = self
            .backend
            .load(run_id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        let mut runs = self.runs.write().await;
        let slot = runs
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone();
        drop(runs);

        let state = slot.lock().await;
        Ok(state.clone())
    }

    /// Prepares a persisted run for resumption and emits `workflow:started`.
    ///
    /// Completed stages are kept; every other stage goes back to pending.
    pub async fn reopen_run(&self, run_id: &str) -> Result<WorkflowState, StoreError> {
        self.open_run(run_id).await?;
        let slot = self.slot(run_id).await?;
        let mut state = slot.lock().await;

        state.reset_for_resume();
        self.persist(&state).await;
        self.events.publish(
            EventType::WorkflowStarted,
            run_id,
            json!({
                "name": state.name,
                "parentTaskId": state.parent_task_id,
                "resumed": true,
                "completedStages": state.completed_stages,
            }),
        );
        tracing::info!(run_id, completed = state.completed_stages.len(), "run reopened");
        Ok(state.clone())
    }

    /// Drops a run from memory. Persisted state is kept.
    pub async fn release(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }

    async fn slot(&self, run_id: &str) -> Result<RunSlot, StoreError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    async fn persist(&self, state: &WorkflowState) {
        if let Err(e) = self.backend.save(state).await {
            tracing::warn!(run_id = %state.id, error = %e, "failed to persist run state");
        }
    }
}
