//! Agent execution boundary.
//!
//! The engine never does the work itself. It hands a rendered instruction to
//! an [`AgentExecutor`] and supervises the call. Agent modes are resolved to
//! a [`Capability`] through a [`ModeResolver`] before a run starts.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::AgentError;
use crate::workflow::cancellation::ChildToken;
use crate::workflow::config::AgentConfig;

/// A resolved agent mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    /// Mode identifier
    pub mode: String,
    /// Display name
    pub name: String,
    /// Role instructions prepended to every stage instruction
    pub instructions: Option<String>,
}

impl Capability {
    /// Creates a capability without role instructions.
    pub fn new(mode: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            name: name.into(),
            instructions: None,
        }
    }

    /// Sets the role instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// Resolves mode identifiers to capabilities.
pub trait ModeResolver: Send + Sync {
    /// Returns the capability for `mode`, or `None` if the mode is unknown.
    fn resolve(&self, mode: &str) -> Option<Capability>;
}

/// Resolver backed by a fixed registry.
///
/// In permissive mode unknown modes resolve to a bare capability named after
/// the mode.
#[derive(Clone, Debug, Default)]
pub struct StaticModeResolver {
    modes: HashMap<String, Capability>,
    permissive: bool,
}

impl StaticModeResolver {
    /// Creates an empty, strict resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver that accepts every mode.
    pub fn permissive() -> Self {
        Self {
            modes: HashMap::new(),
            permissive: true,
        }
    }

    /// Registers a mode with a display name.
    pub fn with_mode(self, mode: impl Into<String>, name: impl Into<String>) -> Self {
        let mode = mode.into();
        let capability = Capability::new(mode.clone(), name);
        self.with_capability(capability)
    }

    /// Registers a fully specified capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.modes.insert(capability.mode.clone(), capability);
        self
    }
}

impl ModeResolver for StaticModeResolver {
    fn resolve(&self, mode: &str) -> Option<Capability> {
        match self.modes.get(mode) {
            Some(capability) => Some(capability.clone()),
            None if self.permissive => Some(Capability::new(mode, mode)),
            None => None,
        }
    }
}

/// Identifies one agent invocation so it can be aborted.
#[derive(Clone, Debug)]
pub struct ExecutionHandle {
    /// Run the invocation belongs to
    pub run_id: String,
    /// Stage being executed
    pub stage: String,
    /// Zero-based attempt number
    pub attempt: u32,
    /// Cancelled on abort, timeout, or run stop
    pub token: ChildToken,
}

impl ExecutionHandle {
    /// Signals the invocation to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once the invocation was asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Everything an executor needs for one invocation.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    /// Agent configuration
    pub agent: AgentConfig,
    /// Resolved mode
    pub capability: Capability,
    /// Rendered instruction
    pub instruction: String,
    /// Parent task id, else run id
    pub correlation_id: String,
    /// Abort handle for this invocation
    pub handle: ExecutionHandle,
}

/// Successful invocation result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentOutput {
    /// Summary text recorded as the stage result
    pub summary: String,
}

impl AgentOutput {
    /// Wraps a summary.
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

/// External capability that performs a stage's work.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl AgentExecutor for Echo {
///     async fn execute(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
///         Ok(AgentOutput::new(request.instruction))
///     }
///
///     async fn abort(&self, handle: &ExecutionHandle) {
///         handle.cancel();
///     }
/// }
/// ```
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Runs the agent and returns its summary.
    async fn execute(&self, request: AgentRequest) -> Result<AgentOutput, AgentError>;

    /// Asks a running invocation to stop.
    ///
    /// The scheduler stops waiting for the invocation right after calling
    /// this, so implementations only need to release resources.
    async fn abort(&self, handle: &ExecutionHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::cancellation::CancellationTokenSource;

    #[test]
    fn test_strict_resolver() {
        let resolver = StaticModeResolver::new().with_mode("code", "Code");
        assert_eq!(resolver.resolve("code").unwrap().name, "Code");
        assert!(resolver.resolve("architect").is_none());
    }

    #[test]
    fn test_permissive_resolver() {
        let resolver = StaticModeResolver::permissive().with_capability(
            Capability::new("review", "Reviewer").with_instructions("Be strict."),
        );

        let known = resolver.resolve("review").unwrap();
        assert_eq!(known.instructions.as_deref(), Some("Be strict."));

        let unknown = resolver.resolve("anything").unwrap();
        assert_eq!(unknown.mode, "anything");
        assert_eq!(unknown.name, "anything");
    }

    #[test]
    fn test_handle_cancel() {
        let source = CancellationTokenSource::new();
        let handle = ExecutionHandle {
            run_id: "run-1".to_string(),
            stage: "a".to_string(),
            attempt: 0,
            token: source.child_token(),
        };

        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(!source.is_cancelled());
    }
}
