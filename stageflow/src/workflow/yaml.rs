//! Workflow definition loading.
//!
//! Parses YAML or JSON definitions into a validated [`WorkflowConfig`].
//! Parsing only checks the schema; [`WorkflowConfig::validate`] is applied
//! afterwards so that every loaded config has resolvable references.

use crate::error::LoadError;
use crate::workflow::config::WorkflowConfig;
use std::path::Path;

impl WorkflowConfig {
    /// Parses and validates a YAML definition.
    pub fn from_yaml(yaml: &str) -> Result<Self, LoadError> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON definition.
    pub fn from_json(json: &str) -> Result<Self, LoadError> {
        let config: WorkflowConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a definition file, choosing the format by extension.
    ///
    /// # Arguments
    ///
    /// * `path` - A `.yaml`, `.yml`, or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            other => Err(LoadError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Serializes the definition back to YAML.
    pub fn to_yaml(&self) -> Result<String, LoadError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
