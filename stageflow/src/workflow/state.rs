//! Run state model.
//!
//! [`WorkflowState`] is the aggregate root of a run. Stage transitions are
//! applied through [`WorkflowState::apply_stage_update`], which keeps the
//! `current_stages` / `completed_stages` / `failed_stages` bookkeeping
//! consistent: a stage name is in at most one of those lists at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not started
    Pending,
    /// Stages are being scheduled
    InProgress,
    /// Finished with no failed stage
    Completed,
    /// Finished with failures, or stopped
    Failed,
}

impl RunStatus {
    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Serialized name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status of a stage within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not started (or reset for a retry)
    Pending,
    /// Agent invocation running
    InProgress,
    /// Agent returned a summary
    Completed,
    /// Last attempt failed
    Failed,
    /// Never reached
    Skipped,
}

impl StageStatus {
    /// Completed, failed, or skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }

    /// Serialized name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-run state of one stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStageState {
    /// Stage name
    pub name: String,
    /// Agent executing the stage
    pub agent: String,
    /// Current status
    pub status: StageStatus,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Start of the latest attempt
    pub started_at: Option<DateTime<Utc>>,
    /// End of the latest attempt
    pub completed_at: Option<DateTime<Utc>>,
    /// Summary returned on success
    pub result: Option<String>,
    /// Error message of the latest failure
    pub error: Option<String>,
}

impl WorkflowStageState {
    /// Creates a pending stage state.
    pub fn pending(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            status: StageStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// Partial update merged into a stage state.
///
/// `None` fields leave the existing value untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageUpdate {
    /// New agent id
    pub agent: Option<String>,
    /// New status
    pub status: Option<StageStatus>,
    /// New retry counter
    pub retry_count: Option<u32>,
    /// Success summary
    pub result: Option<String>,
    /// Failure message
    pub error: Option<String>,
}

impl StageUpdate {
    /// Update that only changes the status.
    pub fn status(status: StageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Sets the agent id.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Sets the retry counter.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Sets the success summary.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Sets the failure message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Outcome of applying a [`StageUpdate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageTransition {
    /// Status before the update (`Pending` for a new stage)
    pub from: StageStatus,
    /// Status after the update
    pub to: StageStatus,
    /// Stage state after the update
    pub state: WorkflowStageState,
}

impl StageTransition {
    /// True when the status actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Complete state of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Run identifier
    pub id: String,
    /// Workflow name
    pub name: String,
    /// Run status
    pub status: RunStatus,
    /// Stage states keyed by stage name
    pub stages: BTreeMap<String, WorkflowStageState>,
    /// Stages currently in progress
    pub current_stages: Vec<String>,
    /// Stages that completed
    pub completed_stages: Vec<String>,
    /// Stages whose last attempt failed
    pub failed_stages: Vec<String>,
    /// Run creation time
    pub started_at: DateTime<Utc>,
    /// Time the run became terminal
    pub completed_at: Option<DateTime<Utc>>,
    /// Correlation id of the caller
    pub parent_task_id: Option<String>,
    /// Values shared between stages
    pub context: Map<String, Value>,
    /// Fingerprint of the definition the run was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_checksum: Option<String>,
}

impl WorkflowState {
    /// Creates a pending run with no stages.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: RunStatus::Pending,
            stages: BTreeMap::new(),
            current_stages: Vec::new(),
            completed_stages: Vec::new(),
            failed_stages: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            parent_task_id: None,
            context: Map::new(),
            definition_checksum: None,
        }
    }

    /// Merges `update` into the stage's state, creating it as pending if needed.
    ///
    /// Entering a new status performs its bookkeeping:
    /// - `InProgress`: stamps `started_at`, clears the previous attempt's
    ///   outcome, and lists the stage as current
    /// - `Completed` / `Failed`: stamps `completed_at` and moves the stage to
    ///   the matching terminal list
    /// - `Skipped`: removes the stage from the current list
    /// - `Pending`: removes the stage from every list
    pub fn apply_stage_update(&mut self, name: &str, update: StageUpdate) -> StageTransition {
        let now = Utc::now();
        let stage = self.stages.entry(name.to_string()).or_insert_with(|| {
            WorkflowStageState::pending(name, update.agent.clone().unwrap_or_default())
        });

        let from = stage.status;
        let to = update.status.unwrap_or(from);
        let entering = to != from;

        if entering && to == StageStatus::InProgress {
            stage.started_at = Some(now);
            stage.completed_at = None;
            stage.result = None;
            stage.error = None;
        }

        if let Some(agent) = update.agent {
            stage.agent = agent;
        }
        if let Some(count) = update.retry_count {
            stage.retry_count = count;
        }
        if let Some(result) = update.result {
            stage.result = Some(result);
        }
        if let Some(error) = update.error {
            stage.error = Some(error);
        }
        stage.status = to;

        if entering && matches!(to, StageStatus::Completed | StageStatus::Failed) {
            stage.completed_at = Some(now);
        }

        let state = stage.clone();

        if entering {
            match to {
                StageStatus::InProgress => {
                    remove_name(&mut self.completed_stages, name);
                    remove_name(&mut self.failed_stages, name);
                    push_unique(&mut self.current_stages, name);
                }
                StageStatus::Completed => {
                    remove_name(&mut self.current_stages, name);
                    remove_name(&mut self.failed_stages, name);
                    push_unique(&mut self.completed_stages, name);
                }
                StageStatus::Failed => {
                    remove_name(&mut self.current_stages, name);
                    remove_name(&mut self.completed_stages, name);
                    push_unique(&mut self.failed_stages, name);
                }
                StageStatus::Skipped => {
                    remove_name(&mut self.current_stages, name);
                }
                StageStatus::Pending => {
                    remove_name(&mut self.current_stages, name);
                    remove_name(&mut self.completed_stages, name);
                    remove_name(&mut self.failed_stages, name);
                }
            }
        }

        StageTransition { from, to, state }
    }

    /// Sets the run status; terminal statuses stamp `completed_at`.
    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        } else {
            self.completed_at = None;
        }
    }

    /// Shallow-merges values into the shared context.
    pub fn merge_context(&mut self, updates: Map<String, Value>) {
        for (key, value) in updates {
            self.context.insert(key, value);
        }
    }

    /// True when nothing is in progress and every stage is terminal.
    pub fn is_drained(&self) -> bool {
        self.current_stages.is_empty() && self.stages.values().all(|s| s.status.is_terminal())
    }

    /// Final status implied by the stage outcomes.
    pub fn outcome(&self) -> RunStatus {
        if self.failed_stages.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }

    /// Milliseconds between start and completion (or now, if still running).
    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Prepares a persisted run for another execution.
    ///
    /// Completed stages keep their outcome; every other stage goes back to
    /// pending with a fresh retry budget.
    pub fn reset_for_resume(&mut self) {
        for stage in self.stages.values_mut() {
            if stage.status != StageStatus::Completed {
                stage.status = StageStatus::Pending;
                stage.retry_count = 0;
                stage.started_at = None;
                stage.completed_at = None;
                stage.result = None;
                stage.error = None;
            }
        }
        self.current_stages.clear();
        self.failed_stages.clear();
        let stages = &self.stages;
        self.completed_stages
            .retain(|name| stages.get(name).map(|s| s.status) == Some(StageStatus::Completed));
        self.set_status(RunStatus::InProgress);
    }
}

fn remove_name(list: &mut Vec<String>, name: &str) {
    list.retain(|entry| entry != name);
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|entry| entry == name) {
        list.push(name.to_string());
    }
}
