//! Instruction rendering.
//!
//! The instruction handed to an agent combines the capability's role
//! instructions, the stage description, and the run context at the time the
//! stage starts. The rendered context is informational; agents are free to
//! ignore it.

use serde_json::{Map, Value};
use std::fmt::Write;

use crate::workflow::agent::Capability;
use crate::workflow::config::{WorkflowConfig, WorkflowStage};

/// Renders the instruction for one stage.
///
/// # Arguments
///
/// * `config` - Workflow the stage belongs to
/// * `stage` - Stage being executed
/// * `capability` - Resolved mode of the stage's agent
/// * `context` - Run context snapshot
pub fn render_instruction(
    config: &WorkflowConfig,
    stage: &WorkflowStage,
    capability: &Capability,
    context: &Map<String, Value>,
) -> String {
    let mut prompt = String::new();

    if let Some(instructions) = capability.instructions.as_deref() {
        prompt.push_str(instructions.trim_end());
        prompt.push_str("\n\n");
    }

    let _ = writeln!(prompt, "# Workflow: {}", config.name);
    if !config.description.is_empty() {
        let _ = writeln!(prompt, "{}", config.description);
    }
    let _ = writeln!(
        prompt,
        "\n## Stage: {} (agent: {}, mode: {})\n",
        stage.name, stage.agent, capability.name
    );

    match stage.description.as_deref() {
        Some(description) => prompt.push_str(description.trim_end()),
        None => {
            let _ = write!(prompt, "Complete the '{}' stage.", stage.name);
        }
    }
    prompt.push('\n');

    if !context.is_empty() {
        prompt.push_str("\n## Context\n\n");
        for (key, value) in context {
            let _ = writeln!(prompt, "- {}: {}", key, display_value(value));
        }
    }

    prompt
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
