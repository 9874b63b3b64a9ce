//! Workflow definition validation.
//!
//! Structural validation ([`WorkflowConfig::validate`]) always runs before a
//! definition is executed: every agent and transition reference must
//! resolve. Graph analysis ([`WorkflowValidator`]) additionally reports
//! cycles and unreachable stages; rejecting cycles is opt-in because cyclic
//! `on_success` chains are legal and simply loop at runtime.

use crate::error::ConfigError;
use crate::workflow::agent::ModeResolver;
use crate::workflow::config::WorkflowConfig;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

impl WorkflowConfig {
    /// Checks names and references.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if every agent and transition reference resolves
    /// - `Err(ConfigError)` describing the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflow.is_empty() {
            return Err(ConfigError::EmptyWorkflow(self.name.clone()));
        }
        if self.max_parallel_stages == 0 {
            return Err(ConfigError::InvalidParallelism);
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.id.clone()));
            }
        }

        let mut stage_names = HashSet::new();
        for stage in &self.workflow {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
        }

        for stage in &self.workflow {
            if !agent_ids.contains(stage.agent.as_str()) {
                return Err(ConfigError::UnknownAgent {
                    stage: stage.name.clone(),
                    agent: stage.agent.clone(),
                });
            }
            for target in stage.targets() {
                if !stage_names.contains(target) {
                    return Err(ConfigError::UnknownTransition {
                        stage: stage.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        if self.entry_stages().is_empty() {
            return Err(ConfigError::NoEntryStage(self.name.clone()));
        }

        Ok(())
    }

    /// Checks that every agent used by a stage has a resolvable mode.
    pub fn validate_modes(&self, resolver: &dyn ModeResolver) -> Result<(), ConfigError> {
        let mut checked = HashSet::new();
        for stage in &self.workflow {
            if !checked.insert(stage.agent.as_str()) {
                continue;
            }
            let agent = self
                .find_agent(&stage.agent)
                .ok_or_else(|| ConfigError::UnknownAgent {
                    stage: stage.name.clone(),
                    agent: stage.agent.clone(),
                })?;
            if resolver.resolve(&agent.mode).is_none() {
                return Err(ConfigError::UnresolvedMode {
                    agent: agent.id.clone(),
                    mode: agent.mode.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Result of graph analysis.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    /// Groups of stages that form cycles
    cycles: Vec<Vec<String>>,
    /// Stages no entry stage can reach (warning only)
    unreachable: Vec<String>,
}

impl ValidationReport {
    /// Returns true when no cycle was found.
    pub fn is_acyclic(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Cycles found, each listed in definition order.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    /// Stages that can never run.
    pub fn unreachable(&self) -> &[String] {
        &self.unreachable
    }
}

/// Graph analysis over the stage transitions.
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Creates a validator.
    pub fn new() -> Self {
        Self
    }

    /// Analyzes a structurally valid definition.
    pub fn analyze(&self, config: &WorkflowConfig) -> ValidationReport {
        let (graph, nodes) = build_graph(config);
        let mut report = ValidationReport::default();

        if is_cyclic_directed(&graph) {
            let order: HashMap<&str, usize> = config
                .workflow
                .iter()
                .enumerate()
                .map(|(i, stage)| (stage.name.as_str(), i))
                .collect();

            for scc in tarjan_scc(&graph) {
                let self_loop = scc.len() == 1 && graph.contains_edge(scc[0], scc[0]);
                if scc.len() > 1 || self_loop {
                    let mut names: Vec<String> = scc
                        .iter()
                        .filter_map(|&idx| graph.node_weight(idx))
                        .cloned()
                        .collect();
                    names.sort_by_key(|name| order.get(name.as_str()).copied().unwrap_or(usize::MAX));
                    report.cycles.push(names);
                }
            }
        }

        let mut reachable = HashSet::new();
        for entry in config.entry_stages() {
            if let Some(&start) = nodes.get(entry.as_str()) {
                let mut dfs = Dfs::new(&graph, start);
                while let Some(idx) = dfs.next(&graph) {
                    reachable.insert(idx);
                }
            }
        }
        report.unreachable = config
            .workflow
            .iter()
            .filter(|stage| {
                nodes
                    .get(stage.name.as_str())
                    .map(|idx| !reachable.contains(idx))
                    .unwrap_or(false)
            })
            .map(|stage| stage.name.clone())
            .collect();

        report
    }

    /// Rejects definitions containing a cycle.
    pub fn check_acyclic(&self, config: &WorkflowConfig) -> Result<(), ConfigError> {
        match self.analyze(config).cycles.into_iter().next() {
            Some(cycle) => Err(ConfigError::CycleDetected(cycle)),
            None => Ok(()),
        }
    }
}

impl Default for WorkflowValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn build_graph(config: &WorkflowConfig) -> (DiGraph<String, ()>, HashMap<&str, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for stage in &config.workflow {
        let idx = graph.add_node(stage.name.clone());
        nodes.insert(stage.name.as_str(), idx);
    }

    for stage in &config.workflow {
        let from = nodes[stage.name.as_str()];
        for target in stage.targets() {
            if let Some(&to) = nodes.get(target) {
                graph.update_edge(from, to, ());
            }
        }
    }

    (graph, nodes)
}
