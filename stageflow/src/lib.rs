//! Stageflow - agent workflow orchestration engine.
//!
//! Executes declarative graphs of stages, each delegated to an external
//! agent, with retries, deadlines, bounded parallel fan-out, resumable
//! persisted state, and a structured event stream.
//!
//! - [`workflow`]: definitions, state, scheduling, and execution
//! - [`events`]: event types and the broadcast bus
//! - [`settings`]: engine-wide configuration
//! - [`error`]: error taxonomy
//! - [`cli`]: the `stageflow` command

pub mod cli;
pub mod error;
pub mod events;
pub mod settings;
pub mod workflow;

pub use error::{AgentError, ConfigError, EngineError, LoadError, Result, StoreError};
pub use events::{EventBus, EventType, WorkflowEvent};
pub use settings::Settings;
pub use workflow::{
    ExecutionCoordinator, ExecutionResult, RunOptions, StateStore, WorkflowConfig,
};
