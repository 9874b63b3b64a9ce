//! Engine-wide runtime settings.
//!
//! Workflow-level knobs (`max_parallel_stages`, `default_timeout`) belong to
//! the definition; these settings cover storage, the event channel, and
//! opt-in validation.

use std::path::PathBuf;

use crate::events::EventBus;

/// Environment variable for the persisted run directory.
pub const ENV_STATE_DIR: &str = "STAGEFLOW_STATE_DIR";
/// Environment variable for the event channel capacity.
pub const ENV_EVENT_CAPACITY: &str = "STAGEFLOW_EVENT_CAPACITY";
/// Environment variable enabling cycle detection.
pub const ENV_DETECT_CYCLES: &str = "STAGEFLOW_DETECT_CYCLES";

/// Default directory for persisted runs.
pub const DEFAULT_STATE_DIR: &str = ".stageflow/runs";

/// Engine settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding one JSON file per run
    pub state_dir: PathBuf,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Reject cyclic definitions before running them
    pub detect_cycles: bool,
}

impl Settings {
    /// Creates settings with defaults.
    pub fn new() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            event_capacity: EventBus::DEFAULT_CAPACITY,
            detect_cycles: false,
        }
    }

    /// Reads settings from the process environment, falling back to defaults.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::new();

        if let Some(dir) = lookup(ENV_STATE_DIR).filter(|d| !d.trim().is_empty()) {
            settings.state_dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup(ENV_EVENT_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => settings.event_capacity = capacity,
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_EVENT_CAPACITY),
            }
        }

        if let Some(raw) = lookup(ENV_DETECT_CYCLES) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => settings.detect_cycles = true,
                "0" | "false" | "no" | "off" => settings.detect_cycles = false,
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_DETECT_CYCLES),
            }
        }

        settings
    }

    /// Sets the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Enables or disables cycle detection.
    pub fn with_cycle_detection(mut self, enabled: bool) -> Self {
        self.detect_cycles = enabled;
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}
