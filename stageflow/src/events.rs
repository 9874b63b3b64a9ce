//! Workflow event stream.
//!
//! Every lifecycle transition of a run is published as a [`WorkflowEvent`]
//! on an [`EventBus`]. The bus is created per coordinator and injected into
//! the state store and scheduler; there is no process-wide emitter.
//!
//! # Event Types
//!
//! - `workflow:started`, `workflow:completed`, `workflow:failed`
//! - `stage:started`, `stage:completed`, `stage:failed`, `stage:retrying`
//! - `orchestrator:decision`
//!
//! Consumers subscribe with [`EventBus::subscribe`]. Publishing never waits
//! for acknowledgement; a lagging subscriber loses the oldest events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;

/// Kind of a workflow event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Run created or resumed
    #[serde(rename = "workflow:started")]
    WorkflowStarted,
    /// Run finished with no failed stage
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted,
    /// Run finished with failures or was stopped
    #[serde(rename = "workflow:failed")]
    WorkflowFailed,
    /// Stage attempt began
    #[serde(rename = "stage:started")]
    StageStarted,
    /// Stage succeeded
    #[serde(rename = "stage:completed")]
    StageCompleted,
    /// Stage attempt failed
    #[serde(rename = "stage:failed")]
    StageFailed,
    /// Failed stage is about to be attempted again
    #[serde(rename = "stage:retrying")]
    StageRetrying,
    /// Orchestrate stage chose its next stages
    #[serde(rename = "orchestrator:decision")]
    OrchestratorDecision,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow:started",
            EventType::WorkflowCompleted => "workflow:completed",
            EventType::WorkflowFailed => "workflow:failed",
            EventType::StageStarted => "stage:started",
            EventType::StageCompleted => "stage:completed",
            EventType::StageFailed => "stage:failed",
            EventType::StageRetrying => "stage:retrying",
            EventType::OrchestratorDecision => "orchestrator:decision",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    /// Event kind
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Run the event belongs to
    pub run_id: String,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload
    pub data: Value,
}

impl WorkflowEvent {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: EventType, run_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            run_id: run_id.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Broadcast channel for workflow events.
///
/// Cloning the bus yields another handle to the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Default channel capacity.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Creates a bus holding up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: WorkflowEvent) {
        tracing::debug!(
            run_id = %event.run_id,
            event = %event.event_type,
            "workflow event"
        );
        let _ = self.sender.send(event);
    }

    /// Builds and publishes an event.
    pub fn publish(&self, event_type: EventType, run_id: &str, data: Value) {
        self.emit(WorkflowEvent::new(event_type, run_id, data));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
