// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! DAG (Directed Acyclic Graph) builder for action dependencies
//!
//! Actions depend on each other through artifacts (producer → consumer) and
//! through deferred parameters (exporter → importer). The graph is checked
//! for cycles and against the stage barrier: a dependency must always be
//! satisfied by an earlier stage.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, HashMap};

use crate::errors::DeployflowError;
use crate::pipeline::Pipeline;

/// Why one action depends on another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Consumer reads an artifact slot
    Artifact(String),
    /// Importer reads a deferred parameter
    Parameter(String),
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Artifact(slot) => write!(f, "{}", slot),
            Self::Parameter(name) => write!(f, "${}", name),
        }
    }
}

/// Builder for action dependency DAGs
pub struct DagBuilder {
    graph: DiGraph<usize, Dependency>,
    name_to_index: HashMap<String, NodeIndex>,
    index_to_name: HashMap<NodeIndex, String>,
    producers: BTreeMap<String, String>,
    consumers: BTreeMap<String, Vec<String>>,
}

impl DagBuilder {
    /// Create a new DAG builder
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            name_to_index: HashMap::new(),
            index_to_name: HashMap::new(),
            producers: BTreeMap::new(),
            consumers: BTreeMap::new(),
        }
    }

    /// Build a DAG from a pipeline
    pub fn build(pipeline: &Pipeline) -> Result<Self, DeployflowError> {
        let mut builder = Self::new();

        // Add all actions as nodes, weighted by stage index
        for (stage_idx, action) in pipeline.actions() {
            if builder.name_to_index.contains_key(&action.name) {
                return Err(DeployflowError::InvalidPipeline {
                    reason: format!("Duplicate action name: '{}'", action.name),
                    help: None,
                });
            }
            let node = builder.graph.add_node(stage_idx);
            builder.name_to_index.insert(action.name.clone(), node);
            builder.index_to_name.insert(node, action.name.clone());
        }

        // Exactly one producer per slot
        for (_, action) in pipeline.actions() {
            for slot in &action.outputs {
                if let Some(first) = builder.producers.get(slot) {
                    return Err(DeployflowError::DuplicateProducer {
                        artifact: slot.clone(),
                        first: first.clone(),
                        second: action.name.clone(),
                    });
                }
                builder.producers.insert(slot.clone(), action.name.clone());
                builder.consumers.entry(slot.clone()).or_default();
            }
        }

        let exporters: HashMap<String, String> =
            pipeline.declared_parameters().into_iter().collect();

        for (_, action) in pipeline.actions() {
            let node = builder.name_to_index[&action.name];

            // Artifact edges
            for slot in action.consumed_artifacts() {
                let producer = builder.producers.get(slot).ok_or_else(|| {
                    DeployflowError::UnknownArtifact {
                        action: action.name.clone(),
                        artifact: slot.to_string(),
                    }
                })?;
                let producer_node = builder.name_to_index[producer];
                builder
                    .graph
                    .add_edge(producer_node, node, Dependency::Artifact(slot.to_string()));
                builder
                    .consumers
                    .entry(slot.to_string())
                    .or_default()
                    .push(action.name.clone());
            }

            // Deferred parameter edges
            for name in action.imported_parameters() {
                let exporter = exporters.get(name).ok_or_else(|| {
                    DeployflowError::UndeclaredParameter {
                        name: name.to_string(),
                    }
                })?;
                let exporter_node = builder.name_to_index[exporter];
                builder
                    .graph
                    .add_edge(exporter_node, node, Dependency::Parameter(name.to_string()));
            }
        }

        builder.validate_acyclic()?;
        builder.validate_stage_barrier(pipeline)?;

        Ok(builder)
    }

    /// Validate that the graph is acyclic
    fn validate_acyclic(&self) -> Result<(), DeployflowError> {
        match toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => {
                let actions = self.find_cycle_members(cycle.node_id());
                Err(DeployflowError::CircularDependency { actions })
            }
        }
    }

    /// Every dependency must be produced by a strictly earlier stage
    fn validate_stage_barrier(&self, pipeline: &Pipeline) -> Result<(), DeployflowError> {
        for edge in self.graph.edge_references() {
            let from_stage = self.graph[edge.source()];
            let to_stage = self.graph[edge.target()];

            if from_stage >= to_stage {
                let from = &self.index_to_name[&edge.source()];
                let to = &self.index_to_name[&edge.target()];
                return Err(DeployflowError::InvalidPipeline {
                    reason: format!(
                        "Action '{}' in stage '{}' depends on '{}' from '{}' in stage '{}'",
                        to,
                        pipeline.stages[to_stage].name,
                        edge.weight(),
                        from,
                        pipeline.stages[from_stage].name,
                    ),
                    help: Some(
                        "Actions in one stage run concurrently; move the producer to an earlier stage"
                            .into(),
                    ),
                });
            }
        }

        Ok(())
    }

    /// Find all actions involved in a cycle
    fn find_cycle_members(&self, start: NodeIndex) -> Vec<String> {
        use petgraph::visit::{depth_first_search, Control, DfsEvent};

        let mut in_cycle = vec![self.index_to_name[&start].clone()];

        depth_first_search(&self.graph, Some(start), |event| {
            match event {
                DfsEvent::TreeEdge(_, node) => {
                    in_cycle.push(self.index_to_name[&node].clone());
                }
                DfsEvent::BackEdge(_, node) if node == start => {
                    return Control::Break(());
                }
                _ => {}
            }
            Control::Continue
        });

        in_cycle
    }

    /// Get topologically sorted action names
    pub fn topological_order_names(&self) -> Result<Vec<String>, DeployflowError> {
        toposort(&self.graph, None)
            .map(|nodes| {
                nodes
                    .into_iter()
                    .map(|n| self.index_to_name[&n].clone())
                    .collect()
            })
            .map_err(|cycle| {
                let actions = self.find_cycle_members(cycle.node_id());
                DeployflowError::CircularDependency { actions }
            })
    }

    /// Action producing a slot
    pub fn producer_of(&self, slot: &str) -> Option<&str> {
        self.producers.get(slot).map(String::as_str)
    }

    /// Actions consuming a slot, in pipeline order
    pub fn consumers_of(&self, slot: &str) -> &[String] {
        self.consumers.get(slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every produced slot with its producer
    pub fn slots(&self) -> impl Iterator<Item = (&str, &str)> {
        self.producers
            .iter()
            .map(|(slot, producer)| (slot.as_str(), producer.as_str()))
    }

    /// Get dependencies for an action (actions that must run before it)
    pub fn dependencies(&self, action: &str) -> Option<Vec<String>> {
        let node = self.name_to_index.get(action)?;
        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(*node, petgraph::Direction::Incoming)
            .map(|n| self.index_to_name[&n].clone())
            .collect();
        deps.sort();
        deps.dedup();
        Some(deps)
    }

    /// Get dependents for an action (actions that depend on it)
    pub fn dependents(&self, action: &str) -> Option<Vec<String>> {
        let node = self.name_to_index.get(action)?;
        let mut deps: Vec<String> = self
            .graph
            .neighbors_directed(*node, petgraph::Direction::Outgoing)
            .map(|n| self.index_to_name[&n].clone())
            .collect();
        deps.sort();
        deps.dedup();
        Some(deps)
    }

    /// Check if action A depends (directly or transitively) on action B
    pub fn depends_on(&self, action_a: &str, action_b: &str) -> bool {
        let Some(node_a) = self.name_to_index.get(action_a) else {
            return false;
        };
        let Some(node_b) = self.name_to_index.get(action_b) else {
            return false;
        };

        petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    /// Generate Mermaid diagram of the DAG
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        let mut names: Vec<&String> = self.name_to_index.keys().collect();
        names.sort();
        for name in names {
            out.push_str(&format!("    {}[{}]\n", name, name));
        }

        for edge in self.graph.edge_references() {
            let from_name = &self.index_to_name[&edge.source()];
            let to_name = &self.index_to_name[&edge.target()];
            match edge.weight() {
                Dependency::Artifact(slot) => {
                    out.push_str(&format!("    {} -->|{}| {}\n", from_name, slot, to_name))
                }
                Dependency::Parameter(name) => {
                    out.push_str(&format!("    {} -.->|{}| {}\n", from_name, name, to_name))
                }
            }
        }

        out
    }

    /// Generate DOT diagram of the DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for edge in self.graph.edge_references() {
            let from_name = &self.index_to_name[&edge.source()];
            let to_name = &self.index_to_name[&edge.target()];
            let style = match edge.weight() {
                Dependency::Artifact(_) => "solid",
                Dependency::Parameter(_) => "dashed",
            };
            out.push_str(&format!(
                "    \"{}\" -> \"{}\" [label=\"{}\", style={}];\n",
                from_name,
                to_name,
                edge.weight(),
                style
            ));
        }

        // Add isolated nodes (no edges)
        let mut names: Vec<(&String, &NodeIndex)> = self.name_to_index.iter().collect();
        names.sort();
        for (name, node) in names {
            if self.graph.neighbors_undirected(*node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", name));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of the stage plan
    pub fn to_text(&self, pipeline: &Pipeline) -> String {
        let mut out = String::new();

        for (i, stage) in pipeline.stages.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, stage.name));

            for action in &stage.actions {
                out.push_str(&format!("   - {} ({})", action.name, action.kind_name()));

                let deps = self.dependencies(&action.name).unwrap_or_default();
                if !deps.is_empty() {
                    out.push_str(&format!(" [depends: {}]", deps.join(", ")));
                }

                out.push('\n');
            }
        }

        out
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::USER_PIPELINE;
    use crate::pipeline::{Action, ActionKind, Stage};

    fn source(name: &str, inputs: Vec<&str>, outputs: Vec<&str>) -> Action {
        Action {
            name: name.into(),
            description: None,
            kind: ActionKind::Source {
                repository: "repo".into(),
                branch: "main".into(),
            },
            inputs: inputs.into_iter().map(String::from).collect(),
            outputs: outputs.into_iter().map(String::from).collect(),
            env: Default::default(),
        }
    }

    fn make_test_pipeline(stages: Vec<Vec<Action>>) -> Pipeline {
        Pipeline {
            version: "1".into(),
            name: "test".into(),
            description: None,
            stages: stages
                .into_iter()
                .enumerate()
                .map(|(i, actions)| Stage {
                    name: format!("stage-{}", i),
                    description: None,
                    actions,
                })
                .collect(),
            env: Default::default(),
            state: Default::default(),
        }
    }

    #[test]
    fn test_user_pipeline_dag() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let dag = DagBuilder::build(&pipeline).unwrap();

        assert_eq!(dag.producer_of("cdk-build-output"), Some("synth"));
        assert_eq!(dag.consumers_of("cdk-build-output"), ["deploy".to_string()]);
        assert!(dag.consumers_of("app-build-output").is_empty());
        assert!(dag.depends_on("deploy", "app-build"));
        assert!(dag.depends_on("deploy", "cdk-source"));
        assert!(!dag.depends_on("app-build", "synth"));
        assert_eq!(
            dag.dependencies("deploy").unwrap(),
            vec!["app-build".to_string(), "synth".to_string()]
        );
    }

    #[test]
    fn test_linear_order() {
        let pipeline = make_test_pipeline(vec![
            vec![source("a", vec![], vec!["x"])],
            vec![source("b", vec!["x"], vec!["y"])],
            vec![source("c", vec!["y"], vec![])],
        ]);

        let dag = DagBuilder::build(&pipeline).unwrap();
        let order = dag.topological_order_names().unwrap();

        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_same_stage_dependency_rejected() {
        let pipeline = make_test_pipeline(vec![vec![
            source("a", vec![], vec!["x"]),
            source("b", vec!["x"], vec![]),
        ]]);

        let result = DagBuilder::build(&pipeline);
        assert!(matches!(
            result,
            Err(DeployflowError::InvalidPipeline { .. })
        ));
    }

    #[test]
    fn test_circular_dependency_detection() {
        let pipeline = make_test_pipeline(vec![
            vec![source("a", vec!["y"], vec!["x"])],
            vec![source("b", vec!["x"], vec!["y"])],
        ]);

        let result = DagBuilder::build(&pipeline);
        assert!(matches!(
            result,
            Err(DeployflowError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_artifact() {
        let pipeline = make_test_pipeline(vec![vec![source("a", vec!["nope"], vec![])]]);

        let result = DagBuilder::build(&pipeline);
        assert!(matches!(result, Err(DeployflowError::UnknownArtifact { .. })));
    }

    #[test]
    fn test_duplicate_producer() {
        let pipeline = make_test_pipeline(vec![vec![
            source("a", vec![], vec!["x"]),
            source("b", vec![], vec!["x"]),
        ]]);

        let result = DagBuilder::build(&pipeline);
        assert!(matches!(
            result,
            Err(DeployflowError::DuplicateProducer { .. })
        ));
    }

    #[test]
    fn test_undeclared_parameter() {
        let yaml = USER_PIPELINE.replace("from: app-build.imageTag", "from: app-build.missing");
        let pipeline = Pipeline::from_yaml(&yaml).unwrap();

        let result = DagBuilder::build(&pipeline);
        assert!(matches!(
            result,
            Err(DeployflowError::UndeclaredParameter { .. })
        ));
    }

    #[test]
    fn test_mermaid_output() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let dag = DagBuilder::build(&pipeline).unwrap();
        let mermaid = dag.to_mermaid();

        assert!(mermaid.contains("graph TD"));
        assert!(mermaid.contains("synth -->|cdk-build-output| deploy"));
        assert!(mermaid.contains("app-build -.->|app-build.imageTag| deploy"));
    }

    #[test]
    fn test_text_output() {
        let pipeline = Pipeline::from_yaml(USER_PIPELINE).unwrap();
        let dag = DagBuilder::build(&pipeline).unwrap();
        let text = dag.to_text(&pipeline);

        assert!(text.starts_with("1. Source\n"));
        assert!(text.contains("   - deploy (deploy) [depends: app-build, synth]"));
    }
}
