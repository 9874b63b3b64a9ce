//! Process-backed agent executor.
//!
//! Runs one external program per invocation. The rendered instruction is
//! written to the program's stdin and its stdout becomes the stage summary.
//! A non-zero exit status is a stage failure. Aborting the invocation kills
//! the child process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

use crate::error::AgentError;
use crate::workflow::agent::{AgentExecutor, AgentOutput, AgentRequest, ExecutionHandle};

/// Command run for an agent invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommandConfig {
    /// Program to execute
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Working directory (inherits the current one if unset)
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl ShellCommandConfig {
    /// Creates a config running `program` without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Parses a command line split on whitespace, e.g. `"agent --fast"`.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }
}

/// Agent executor that spawns a process per invocation.
///
/// The command is chosen by the agent's mode, falling back to the default
/// command. The child sees `STAGEFLOW_RUN_ID`, `STAGEFLOW_STAGE`,
/// `STAGEFLOW_AGENT`, `STAGEFLOW_MODE`, `STAGEFLOW_ATTEMPT` and
/// `STAGEFLOW_CORRELATION_ID` in its environment.
#[derive(Clone, Debug, Default)]
pub struct ShellAgentExecutor {
    default_command: Option<ShellCommandConfig>,
    mode_commands: HashMap<String, ShellCommandConfig>,
}

impl ShellAgentExecutor {
    /// Executor running `command` for every mode.
    pub fn new(command: ShellCommandConfig) -> Self {
        Self {
            default_command: Some(command),
            mode_commands: HashMap::new(),
        }
    }

    /// Executor with no default command.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Uses `command` for agents of `mode`.
    pub fn with_mode_command(mut self, mode: impl Into<String>, command: ShellCommandConfig) -> Self {
        self.mode_commands.insert(mode.into(), command);
        self
    }

    fn command_for(&self, mode: &str) -> Option<&ShellCommandConfig> {
        self.mode_commands.get(mode).or(self.default_command.as_ref())
    }
}

#[async_trait]
impl AgentExecutor for ShellAgentExecutor {
    async fn execute(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let config = self.command_for(&request.capability.mode).ok_or_else(|| {
            AgentError::Failed(format!(
                "No command configured for mode '{}'",
                request.capability.mode
            ))
        })?;

        let mut cmd = tokio::process::Command::new(&config.program);
        cmd.args(&config.args)
            .envs(&config.env)
            .env("STAGEFLOW_RUN_ID", &request.handle.run_id)
            .env("STAGEFLOW_STAGE", &request.handle.stage)
            .env("STAGEFLOW_AGENT", &request.agent.id)
            .env("STAGEFLOW_MODE", &request.capability.mode)
            .env("STAGEFLOW_ATTEMPT", request.handle.attempt.to_string())
            .env("STAGEFLOW_CORRELATION_ID", &request.correlation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        tracing::debug!(
            program = %config.program,
            pid = ?child.id(),
            stage = %request.handle.stage,
            "spawned agent process"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let instruction = request.instruction.clone();
            tokio::spawn(async move {
                // The child may exit without reading its input.
                let _ = stdin.write_all(instruction.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = request.handle.token.cancelled() => return Err(AgentError::Aborted),
        };

        if output.status.success() {
            let summary = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
            Ok(AgentOutput::new(summary))
        } else {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("exit code: {}", exit_code)
            } else {
                format!("exit code: {}, stderr: {}", exit_code, stderr)
            };
            Err(AgentError::Failed(message))
        }
    }

    async fn abort(&self, handle: &ExecutionHandle) {
        tracing::debug!(run_id = %handle.run_id, stage = %handle.stage, "killing agent process");
        handle.cancel();
    }
}
