//! Stage attempt deadlines.
//!
//! A stage's deadline is its own `timeout`, else the workflow's
//! `default_timeout`, else none. When it elapses the agent is asked to abort
//! and the attempt fails with a [`TimeoutError`] message.

use std::fmt;
use std::time::Duration;

use crate::workflow::config::{WorkflowConfig, WorkflowStage};

/// A stage attempt exceeded its deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutError {
    /// Stage name
    pub stage: String,
    /// Deadline that elapsed
    pub timeout: Duration,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stage '{}' timed out after {}s",
            self.stage,
            self.timeout.as_secs_f64()
        )
    }
}

impl std::error::Error for TimeoutError {}

/// Deadline for one stage attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTimeout(Duration);

impl StageTimeout {
    /// Creates a deadline of `duration`.
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Creates a deadline from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Returns the deadline duration.
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Resolves the effective deadline of `stage`.
    ///
    /// # Returns
    ///
    /// - `Some(timeout)` from `stage.timeout`, falling back to `config.default_timeout`
    /// - `None` if neither is set
    pub fn for_stage(config: &WorkflowConfig, stage: &WorkflowStage) -> Option<Self> {
        config.stage_timeout(stage).map(Self)
    }

    /// Builds the error reported when this deadline elapses for `stage`.
    pub fn error(&self, stage: &str) -> TimeoutError {
        TimeoutError {
            stage: stage.to_string(),
            timeout: self.0,
        }
    }
}

/// Sleeps for the deadline, or forever when there is none.
///
/// Meant as one arm of a `tokio::select!` racing the agent invocation.
pub async fn elapsed(deadline: Option<StageTimeout>) {
    match deadline {
        Some(timeout) => tokio::time::sleep(timeout.duration()).await,
        None => std::future::pending::<()>().await,
    }
}
