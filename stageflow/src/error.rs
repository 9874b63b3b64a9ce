//! Error types for Stageflow.
//!
//! Errors are split by concern. Only configuration problems and internal
//! failures surface from [`ExecutionCoordinator::run`]; ordinary stage
//! failures are reported inside the execution result.
//!
//! [`ExecutionCoordinator::run`]: crate::workflow::coordinator::ExecutionCoordinator::run

use std::path::PathBuf;

/// Problems with a workflow definition.
///
/// Raised before any stage executes and never retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Definition has no stages.
    #[error("Workflow '{0}' has no stages")]
    EmptyWorkflow(String),

    /// Two stages share a name.
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    /// Two agents share an id.
    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    /// A stage references an agent that is not declared.
    #[error("Stage '{stage}' references unknown agent '{agent}'")]
    UnknownAgent {
        /// Stage holding the reference
        stage: String,
        /// Referenced agent id
        agent: String,
    },

    /// The mode resolver does not know an agent's mode.
    #[error("Agent '{agent}' uses unresolvable mode '{mode}'")]
    UnresolvedMode {
        /// Agent id
        agent: String,
        /// Mode identifier
        mode: String,
    },

    /// A transition names a stage that does not exist.
    #[error("Stage '{stage}' transitions to unknown stage '{target}'")]
    UnknownTransition {
        /// Stage holding the transition
        stage: String,
        /// Missing target
        target: String,
    },

    /// Every stage is the target of some transition, so nothing can start.
    ///
    /// Checked regardless of cycle detection: a graph with a cycle and an
    /// entry stage is accepted.
    #[error("Workflow '{0}' has no entry stage: every stage is the target of a transition")]
    NoEntryStage(String),

    /// `max_parallel_stages` must allow at least one stage.
    #[error("max_parallel_stages must be at least 1")]
    InvalidParallelism,

    /// Cycle found by opt-in cycle detection.
    #[error("Cycle detected between stages: {0:?}")]
    CycleDetected(Vec<String>),
}

/// Failure to turn a definition source into a [`WorkflowConfig`].
///
/// [`WorkflowConfig`]: crate::workflow::config::WorkflowConfig
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    /// Definition file could not be read.
    #[error("Failed to read workflow file '{path}': {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// YAML syntax or schema error.
    #[error("Failed to parse workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON syntax or schema error.
    #[error("Failed to parse workflow JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// File extension is neither YAML nor JSON.
    #[error("Unsupported workflow file extension: {0}")]
    UnsupportedFormat(String),

    /// Parsed definition failed validation.
    #[error("Invalid workflow: {0}")]
    Invalid(#[from] ConfigError),
}

/// State store errors.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// No run with this id is known.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Storage I/O failed.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State could not be (de)serialized.
    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reported by an agent execution capability.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    /// The agent ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The invocation was aborted.
    #[error("Agent invocation aborted")]
    Aborted,

    /// I/O error while driving the agent.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("Agent error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors returned by the execution coordinator.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Invalid workflow configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State store failure.
    #[error("State error: {0}")]
    Store(#[from] StoreError),

    /// Resume attempted with a definition that differs from the persisted run.
    #[error("Workflow definition changed since run '{run_id}' was created")]
    WorkflowChanged {
        /// Run being resumed
        run_id: String,
    },

    /// The run is already executing in this coordinator.
    #[error("Run '{0}' is already active")]
    RunActive(String),

    /// The run is not executing in this coordinator.
    #[error("Run '{0}' is not active")]
    RunNotActive(String),
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, EngineError>;
