//! Command-line interface for Stageflow.
//!
//! # Examples
//!
//! Run a workflow, handing each stage to an external agent program:
//!
//! ```bash
//! $ stageflow run review.yaml --program "my-agent --quiet" --context ticket=ABC-12
//! ```
//!
//! Resume a failed run:
//!
//! ```bash
//! $ stageflow run review.yaml --run-id 7f0c... --program my-agent
//! ```
//!
//! Inspect persisted runs:
//!
//! ```bash
//! $ stageflow list
//! $ stageflow show 7f0c...
//! $ stageflow cleanup --days 30
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::settings::Settings;
use crate::workflow::{
    ExecutionCoordinator, ExecutionResult, RunOptions, ShellAgentExecutor, ShellCommandConfig,
    StateStore, StaticModeResolver, WorkflowConfig, WorkflowStageState, WorkflowValidator,
};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "stageflow", version, about = "Agent workflow orchestration engine")]
struct Cli {
    /// Directory holding persisted runs (overrides STAGEFLOW_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Execute a workflow definition
    Run {
        /// YAML or JSON workflow definition
        definition: PathBuf,

        /// Run id; resumes the run if it was persisted before
        #[arg(long)]
        run_id: Option<String>,

        /// Parent task id passed to agents for correlation
        #[arg(long)]
        parent: Option<String>,

        /// Initial context entry as key=value (value parsed as JSON when possible)
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// Agent program; receives the instruction on stdin
        #[arg(long, env = "STAGEFLOW_AGENT_PROGRAM")]
        program: String,

        /// Reject definitions whose stage graph has a cycle
        #[arg(long)]
        detect_cycles: bool,

        /// Print workflow events as they happen
        #[arg(long)]
        events: bool,
    },

    /// Validate a workflow definition without running it
    Validate {
        /// YAML or JSON workflow definition
        definition: PathBuf,
    },

    /// List persisted runs
    List,

    /// Show a persisted run as JSON
    Show {
        /// Run id
        run_id: String,
    },

    /// Delete a persisted run
    Delete {
        /// Run id
        run_id: String,
    },

    /// Delete runs that finished more than N days ago
    Cleanup {
        /// Age in days
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

/// Entry point for the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(dir) = cli.state_dir {
        settings = settings.with_state_dir(dir);
    }
    let store = Arc::new(StateStore::from_settings(&settings));

    match cli.action {
        Action::Run {
            definition,
            run_id,
            parent,
            context,
            program,
            detect_cycles,
            events,
        } => {
            let config = WorkflowConfig::from_file(&definition)
                .with_context(|| format!("loading {}", definition.display()))?;
            let command = ShellCommandConfig::parse(&program)
                .context("--program must name an executable")?;

            let mut options = RunOptions::new();
            if let Some(run_id) = run_id {
                options = options.with_run_id(run_id);
            }
            if let Some(parent) = parent {
                options = options.with_parent_task_id(parent);
            }
            for entry in &context {
                let (key, value) = parse_context_entry(entry)?;
                options = options.with_context_value(key, value);
            }
            if detect_cycles {
                options = options.with_cycle_detection(true);
            }

            let coordinator = Arc::new(
                ExecutionCoordinator::new(
                    store,
                    Arc::new(ShellAgentExecutor::new(command)),
                    Arc::new(StaticModeResolver::permissive()),
                )
                .with_settings(settings),
            );

            if events {
                let mut rx = coordinator.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        println!(
                            "   [{}] {} {}",
                            event.timestamp.format("%H:%M:%S"),
                            event.event_type,
                            event.data
                        );
                    }
                });
            }

            println!("🔄 Running workflow '{}'...", config.name);
            let runner = {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.run(&config, options).await })
            };
            tokio::pin!(runner);

            let result = tokio::select! {
                joined = &mut runner => joined?,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("⏹  Interrupted, stopping active runs...");
                    for run_id in coordinator.active_runs().await {
                        if let Err(e) = coordinator.stop(&run_id).await {
                            tracing::warn!(run_id = %run_id, error = %e, "failed to stop run");
                        }
                    }
                    runner.await?
                }
            }?;

            print_result(&result);
            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }

        Action::Validate { definition } => {
            let config = WorkflowConfig::from_file(&definition)
                .with_context(|| format!("loading {}", definition.display()))?;
            let report = WorkflowValidator::new().analyze(&config);

            println!("✅ '{}' is valid", config.name);
            println!("   Stages: {}", config.workflow.len());
            println!("   Entry stages: {}", config.entry_stages().join(", "));
            for cycle in report.cycles() {
                println!("   ⚠ Cycle: {}", cycle.join(" -> "));
            }
            if !report.unreachable().is_empty() {
                println!("   ⚠ Unreachable: {}", report.unreachable().join(", "));
            }
            Ok(())
        }

        Action::List => {
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No runs in {}", settings.state_dir.display());
                return Ok(());
            }
            for id in ids {
                match store.load(&id).await {
                    Ok(state) => println!(
                        "{}  {:<11}  {}  {}",
                        state.id,
                        state.status,
                        state.started_at.format("%Y-%m-%d %H:%M:%S"),
                        state.name
                    ),
                    Err(e) => println!("{}  <unreadable: {}>", id, e),
                }
            }
            Ok(())
        }

        Action::Show { run_id } => {
            let state = store.load(&run_id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }

        Action::Delete { run_id } => {
            if store.delete(&run_id).await? {
                println!("🗑  Deleted run {}", run_id);
            } else {
                println!("Run {} not found", run_id);
            }
            Ok(())
        }

        Action::Cleanup { days } => {
            let deleted = store.cleanup_older_than(days).await?;
            println!("🧹 Deleted {} run(s) older than {} days", deleted, days);
            Ok(())
        }
    }
}

fn parse_context_entry(entry: &str) -> anyhow::Result<(String, Value)> {
    let (key, raw) = entry
        .split_once('=')
        .with_context(|| format!("context entry '{}' is not KEY=VALUE", entry))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.trim().to_string(), value))
}

fn print_result(result: &ExecutionResult) {
    let icon = if result.is_success() { "✅" } else { "❌" };
    println!(
        "{} Run {} finished as {} in {} ms",
        icon, result.run_id, result.status, result.duration_ms
    );
    for stage in &result.stages {
        println!("   {}", format_stage(stage));
    }
    if let Some(failed) = result.first_failure() {
        eprintln!(
            "   First failure: {}: {}",
            failed.name,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn format_stage(stage: &WorkflowStageState) -> String {
    let retries = if stage.retry_count > 0 {
        format!(" (retries: {})", stage.retry_count)
    } else {
        String::new()
    };
    format!("{:<20} {:<12} {}{}", stage.name, stage.status.as_str(), stage.agent, retries)
}
