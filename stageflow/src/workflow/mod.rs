//! Workflow orchestration for multi-agent stage graphs.
//!
//! A workflow is a graph of named stages, each delegated to an agent. The
//! engine walks the graph from its entry stages, runs parallel stages in
//! bounded chunks, applies retry and timeout policy, and persists the run
//! state after every change so runs can be inspected and resumed.
//!
//! # Architecture
//!
//! - [`WorkflowConfig`]: typed definition, loaded from YAML or JSON
//! - [`StateStore`]: owner of run state, persistence, and events
//! - [`StageScheduler`]: decides what runs next and supervises agent calls
//! - [`ExecutionCoordinator`]: entry point tying the pieces together
//!
//! # Example
//!
//! ```ignore
//! use stageflow::workflow::{ExecutionCoordinator, RunOptions, StateStore, WorkflowConfig};
//!
//! let config = WorkflowConfig::from_file("review.yaml")?;
//! let coordinator = ExecutionCoordinator::new(store, executor, resolver);
//! let result = coordinator.run(&config, RunOptions::new()).await?;
//!
//! if let Some(stage) = result.first_failure() {
//!     eprintln!("{} failed: {:?}", stage.name, stage.error);
//! }
//! ```
//!
//! # Execution Model
//!
//! 1. Validate references (and, if enabled, reject cycles)
//! 2. Create or reopen the run state
//! 3. Execute the entry stages as one batch
//! 4. Follow `on_success` / `on_failure` or fan out to `next_steps`
//! 5. Skip stages never reached and record the final status

pub mod agent;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod prompt;
pub mod scheduler;
pub mod shell;
pub mod state;
pub mod store;
pub mod timeout;
pub mod validate;
pub mod yaml;

pub use agent::{
    AgentExecutor, AgentOutput, AgentRequest, Capability, ExecutionHandle, ModeResolver,
    StaticModeResolver,
};
pub use cancellation::{CancellationToken, CancellationTokenSource, ChildToken};
pub use config::{AgentConfig, StageStrategy, WorkflowConfig, WorkflowStage, END_STAGE};
pub use coordinator::{ExecutionCoordinator, ExecutionResult, RunOptions};
pub use scheduler::StageScheduler;
pub use shell::{ShellAgentExecutor, ShellCommandConfig};
pub use state::{RunStatus, StageStatus, StageUpdate, WorkflowStageState, WorkflowState};
pub use store::{FileBackend, MemoryBackend, NewRun, StateBackend, StateStore};
pub use timeout::{StageTimeout, TimeoutError};
pub use validate::{ValidationReport, WorkflowValidator};
