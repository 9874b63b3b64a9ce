//! Typed workflow definition.
//!
//! A definition declares agents and a graph of stages. Stages are linked by
//! transitions (`on_success`, `on_failure`, `next_steps`); the sentinel
//! [`END_STAGE`] terminates a branch.
//!
//! ```yaml
//! name: "Review Flow"
//! agents:
//!   - id: planner
//!     mode: architect
//!   - id: coder
//!     mode: code
//! workflow:
//!   - name: plan
//!     agent: planner
//!     strategy: orchestrate
//!     next_steps: [backend, frontend]
//!   - name: backend
//!     agent: coder
//!     parallel: true
//!     retry_count: 1
//!   - name: frontend
//!     agent: coder
//!     parallel: true
//!     timeout: 600
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;

/// Transition target that terminates a branch.
pub const END_STAGE: &str = "end";

/// Default number of parallel stages per chunk.
pub const DEFAULT_MAX_PARALLEL_STAGES: usize = 5;

/// An agent a stage can delegate to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique id within the workflow
    pub id: String,
    /// Capability/role identifier, resolved externally
    pub mode: String,
    /// Optional human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AgentConfig {
    /// Creates an agent with the given id and mode.
    pub fn new(id: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mode: mode.into(),
            description: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// How a stage picks its successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStrategy {
    /// `on_success` / `on_failure` select a single next stage
    #[default]
    Fixed,
    /// Success fans out to `next_steps` as a new batch
    Orchestrate,
}

/// A stage of the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStage {
    /// Unique stage name
    pub name: String,
    /// Id of the agent executing this stage
    pub agent: String,
    /// Transition strategy
    #[serde(default)]
    pub strategy: StageStrategy,
    /// What the stage should accomplish; rendered into the agent instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Next stage on success (`fixed` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    /// Next stage on failure (`fixed` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    /// Stages launched on success (`orchestrate` only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
    /// Whether the stage may run concurrently with siblings in a batch
    #[serde(default)]
    pub parallel: bool,
    /// Additional attempts after the first failure
    #[serde(default)]
    pub retry_count: u32,
    /// Attempt deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl WorkflowStage {
    /// Creates a `fixed`, sequential stage with no transitions.
    pub fn new(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            strategy: StageStrategy::Fixed,
            description: None,
            on_success: None,
            on_failure: None,
            next_steps: Vec::new(),
            parallel: false,
            retry_count: 0,
            timeout: None,
        }
    }

    /// Sets the description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the success transition.
    pub fn on_success(mut self, next: impl Into<String>) -> Self {
        self.on_success = Some(next.into());
        self
    }

    /// Sets the failure transition.
    pub fn on_failure(mut self, next: impl Into<String>) -> Self {
        self.on_failure = Some(next.into());
        self
    }

    /// Turns the stage into an `orchestrate` stage fanning out to `steps`.
    pub fn orchestrate<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strategy = StageStrategy::Orchestrate;
        self.next_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the stage as parallel.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Sets the retry budget.
    pub fn retries(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Sets the attempt deadline in seconds.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// All transition targets other than [`END_STAGE`].
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.on_success
            .iter()
            .chain(self.on_failure.iter())
            .chain(self.next_steps.iter())
            .map(String::as_str)
            .filter(|target| *target != END_STAGE)
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Declared agents
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Stages in definition order
    pub workflow: Vec<WorkflowStage>,
    /// Chunk size for parallel stages
    #[serde(default = "default_max_parallel_stages")]
    pub max_parallel_stages: usize,
    /// Deadline in seconds for stages without their own timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout: Option<u64>,
}

fn default_max_parallel_stages() -> usize {
    DEFAULT_MAX_PARALLEL_STAGES
}

impl WorkflowConfig {
    /// Creates an empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            agents: Vec::new(),
            workflow: Vec::new(),
            max_parallel_stages: DEFAULT_MAX_PARALLEL_STAGES,
            default_timeout: None,
        }
    }

    /// Adds an agent.
    pub fn agent(mut self, agent: AgentConfig) -> Self {
        self.agents.push(agent);
        self
    }

    /// Adds a stage.
    pub fn stage(mut self, stage: WorkflowStage) -> Self {
        self.workflow.push(stage);
        self
    }

    /// Sets the parallel chunk size.
    pub fn with_max_parallel_stages(mut self, max: usize) -> Self {
        self.max_parallel_stages = max;
        self
    }

    /// Sets the default stage timeout in seconds.
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout = Some(secs);
        self
    }

    /// Looks up a stage by name.
    pub fn find_stage(&self, name: &str) -> Option<&WorkflowStage> {
        self.workflow.iter().find(|stage| stage.name == name)
    }

    /// Looks up an agent by id.
    pub fn find_agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    /// Stage names in definition order.
    pub fn stage_names(&self) -> Vec<String> {
        self.workflow.iter().map(|stage| stage.name.clone()).collect()
    }

    /// Stages that no transition points at, in definition order.
    ///
    /// All of them are runnable when a run starts.
    pub fn entry_stages(&self) -> Vec<String> {
        let referenced: HashSet<&str> = self
            .workflow
            .iter()
            .flat_map(|stage| stage.targets())
            .collect();

        self.workflow
            .iter()
            .filter(|stage| !referenced.contains(stage.name.as_str()))
            .map(|stage| stage.name.clone())
            .collect()
    }

    /// Effective deadline for a stage attempt.
    pub fn stage_timeout(&self, stage: &WorkflowStage) -> Option<Duration> {
        stage
            .timeout
            .or(self.default_timeout)
            .map(Duration::from_secs)
    }

    /// SHA-256 over the canonical JSON form of the definition.
    ///
    /// Stored with each run so a resume can detect an edited definition.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        format!("{:x}", hasher.finalize())
    }
}
