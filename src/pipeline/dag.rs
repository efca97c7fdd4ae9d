// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Stage dependency graph
//!
//! Holds the declared stages and the edges implied by their stage inputs.
//! The graph is acyclic by construction; ordering is deterministic, with
//! declaration order breaking ties between independent stages.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::plan::{ExecutionPlan, PlanEntry, Target};
use super::{BuildFile, CompositionSpec, StageSpec};
use crate::errors::{StagehandError, StagehandResult};

/// Name of the composition target
pub const FINAL_TARGET: &str = "final";

/// Directed acyclic graph of stages
///
/// Edges point from a producer to the stage that reads its output. Node
/// weights are declaration indices into `specs`.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    graph: DiGraph<usize, ()>,
    specs: Vec<StageSpec>,
    name_to_index: HashMap<String, NodeIndex>,
    composition: Option<CompositionSpec>,
}

impl StageGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one stage whose references are all already registered
    pub fn register(&mut self, spec: StageSpec) -> StagehandResult<()> {
        if self.name_to_index.contains_key(&spec.name) {
            return Err(StagehandError::DuplicateStage { stage: spec.name });
        }

        let mut producers = Vec::new();
        for reference in spec.referenced_stages() {
            if reference == spec.name {
                return Err(StagehandError::CycleDetected {
                    stages: vec![spec.name.clone()],
                });
            }
            let node = self.name_to_index.get(reference).ok_or_else(|| {
                StagehandError::UnknownReference {
                    stage: spec.name.clone(),
                    reference: reference.to_string(),
                }
            })?;
            producers.push(*node);
        }

        let node = self.add_node(spec);
        for producer in producers {
            self.graph.add_edge(producer, node, ());
        }
        Ok(())
    }

    /// Build a graph from stages in declaration order
    ///
    /// Unlike [`StageGraph::register`], a stage may reference one declared
    /// after it.
    pub fn build(specs: Vec<StageSpec>) -> StagehandResult<Self> {
        let mut graph = Self::new();

        for spec in specs {
            if graph.name_to_index.contains_key(&spec.name) {
                return Err(StagehandError::DuplicateStage { stage: spec.name });
            }
            graph.add_node(spec);
        }

        let mut edges = Vec::new();
        for (idx, spec) in graph.specs.iter().enumerate() {
            for reference in spec.referenced_stages() {
                let producer = graph.name_to_index.get(reference).ok_or_else(|| {
                    StagehandError::UnknownReference {
                        stage: spec.name.clone(),
                        reference: reference.to_string(),
                    }
                })?;
                edges.push((*producer, NodeIndex::new(idx)));
            }
        }
        for (from, to) in edges {
            graph.graph.add_edge(from, to, ());
        }

        graph.validate_acyclic()?;
        Ok(graph)
    }

    /// Build the graph of a build file, including its composition
    pub fn from_build_file(file: &BuildFile) -> StagehandResult<Self> {
        let mut graph = Self::build(file.stages.clone())?;

        if let Some(composition) = &file.composition {
            for stage in composition.stages() {
                if !graph.name_to_index.contains_key(stage) {
                    return Err(StagehandError::UnknownReference {
                        stage: FINAL_TARGET.to_string(),
                        reference: stage.to_string(),
                    });
                }
            }
            graph.composition = Some(composition.clone());
        }

        Ok(graph)
    }

    fn add_node(&mut self, spec: StageSpec) -> NodeIndex {
        let idx = self.specs.len();
        let node = self.graph.add_node(idx);
        self.name_to_index.insert(spec.name.clone(), node);
        self.specs.push(spec);
        node
    }

    /// Validate that the graph is acyclic
    fn validate_acyclic(&self) -> StagehandResult<()> {
        let mut members: Vec<usize> = Vec::new();
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|n| self.graph.contains_edge(*n, *n));
            if cyclic {
                members.extend(component.iter().map(|n| self.graph[*n]));
            }
        }

        if members.is_empty() {
            return Ok(());
        }

        members.sort_unstable();
        Err(StagehandError::CycleDetected {
            stages: members
                .into_iter()
                .map(|i| self.specs[i].name.clone())
                .collect(),
        })
    }

    /// Interpret a requested target name
    ///
    /// `final` selects the composition unless a stage carries that name.
    pub fn target(&self, name: &str) -> StagehandResult<Target> {
        if self.name_to_index.contains_key(name) {
            return Ok(Target::Stage(name.to_string()));
        }
        if name == FINAL_TARGET && self.composition.is_some() {
            return Ok(Target::Final);
        }
        Err(StagehandError::UnknownTarget {
            target: name.to_string(),
        })
    }

    /// Stages the target directly requires
    pub fn roots(&self, target: &Target) -> StagehandResult<Vec<String>> {
        match target {
            Target::Stage(name) => {
                if !self.name_to_index.contains_key(name) {
                    return Err(StagehandError::UnknownTarget {
                        target: name.clone(),
                    });
                }
                Ok(vec![name.clone()])
            }
            Target::Final => {
                let composition =
                    self.composition
                        .as_ref()
                        .ok_or_else(|| StagehandError::UnknownTarget {
                            target: FINAL_TARGET.to_string(),
                        })?;
                Ok(composition.stages().into_iter().map(String::from).collect())
            }
        }
    }

    /// Resolve a target into the ordered set of stages it needs
    ///
    /// Every entry starts out as must-run; the planner refines statuses.
    pub fn resolve(&self, target: &Target) -> StagehandResult<ExecutionPlan> {
        let roots = self.roots(target)?;

        // Collect the transitive dependency closure
        let mut closure: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = roots
            .iter()
            .filter_map(|r| self.name_to_index.get(r).copied())
            .collect();
        while let Some(node) = stack.pop() {
            if closure.insert(node) {
                stack.extend(self.graph.neighbors_directed(node, Direction::Incoming));
            }
        }

        let order = self.kahn_order(&closure)?;
        let entries = order
            .into_iter()
            .map(|idx| {
                let name = &self.specs[idx].name;
                PlanEntry::new(name, self.dependencies(name).unwrap_or_default())
            })
            .collect();

        Ok(ExecutionPlan::new(target.clone(), entries))
    }

    /// Kahn's algorithm restricted to `nodes`, ties broken by declaration order
    fn kahn_order(&self, nodes: &HashSet<NodeIndex>) -> StagehandResult<Vec<usize>> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for node in nodes {
            let degree = self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .filter(|p| nodes.contains(p))
                .count();
            in_degree.insert(*node, degree);
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| self.graph[*n])
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for next in self
                .graph
                .neighbors_directed(NodeIndex::new(idx), Direction::Outgoing)
            {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(self.graph[next]);
                    }
                }
            }
        }

        if order.len() < nodes.len() {
            let done: HashSet<usize> = order.iter().copied().collect();
            let mut stuck: Vec<usize> = nodes
                .iter()
                .map(|n| self.graph[*n])
                .filter(|i| !done.contains(i))
                .collect();
            stuck.sort_unstable();
            return Err(StagehandError::CycleDetected {
                stages: stuck
                    .into_iter()
                    .map(|i| self.specs[i].name.clone())
                    .collect(),
            });
        }

        Ok(order)
    }

    /// All stage names in deterministic topological order
    pub fn topological_order(&self) -> StagehandResult<Vec<String>> {
        let all: HashSet<NodeIndex> = self.graph.node_indices().collect();
        Ok(self
            .kahn_order(&all)?
            .into_iter()
            .map(|i| self.specs[i].name.clone())
            .collect())
    }

    /// Get dependencies for a stage (stages that must run before it)
    pub fn dependencies(&self, stage_name: &str) -> Option<Vec<String>> {
        let node = self.name_to_index.get(stage_name)?;
        Some(self.neighbor_names(*node, Direction::Incoming))
    }

    /// Get dependents for a stage (stages that read its output)
    pub fn dependents(&self, stage_name: &str) -> Option<Vec<String>> {
        let node = self.name_to_index.get(stage_name)?;
        Some(self.neighbor_names(*node, Direction::Outgoing))
    }

    fn neighbor_names(&self, node: NodeIndex, direction: Direction) -> Vec<String> {
        let mut indices: Vec<usize> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n])
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|i| self.specs[i].name.clone())
            .collect()
    }

    /// Check if stage A depends (directly or transitively) on stage B
    pub fn depends_on(&self, stage_a: &str, stage_b: &str) -> bool {
        let Some(node_a) = self.name_to_index.get(stage_a) else {
            return false;
        };
        let Some(node_b) = self.name_to_index.get(stage_b) else {
            return false;
        };

        node_a != node_b
            && petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    /// Look up a stage definition
    pub fn spec(&self, stage_name: &str) -> Option<&StageSpec> {
        self.name_to_index
            .get(stage_name)
            .map(|n| &self.specs[self.graph[*n]])
    }

    /// Stage definitions in declaration order
    pub fn specs(&self) -> &[StageSpec] {
        &self.specs
    }

    pub fn composition(&self) -> Option<&CompositionSpec> {
        self.composition.as_ref()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn edge_names(&self) -> Vec<(&str, &str)> {
        let mut edges: Vec<(usize, usize)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| (self.graph[from], self.graph[to]))
            .collect();
        edges.sort_unstable();
        edges.dedup();
        edges
            .into_iter()
            .map(|(from, to)| (self.specs[from].name.as_str(), self.specs[to].name.as_str()))
            .collect()
    }

    /// Generate Mermaid diagram of the graph
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for spec in &self.specs {
            let shape = if spec.optional {
                format!("{}([{}])", mermaid_id(&spec.name), spec.name)
            } else {
                format!("{}[{}]", mermaid_id(&spec.name), spec.name)
            };
            out.push_str(&format!("    {}\n", shape));
        }

        for (from, to) in self.edge_names() {
            out.push_str(&format!("    {} --> {}\n", mermaid_id(from), mermaid_id(to)));
        }

        if let Some(composition) = &self.composition {
            out.push_str(&format!("    {}{{{{{}}}}}\n", "__final", FINAL_TARGET));
            for stage in composition.stages() {
                out.push_str(&format!("    {} -.-> __final\n", mermaid_id(stage)));
            }
        }

        out
    }

    /// Generate DOT diagram of the graph
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stages {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for spec in &self.specs {
            if spec.optional {
                out.push_str(&format!("    \"{}\" [style=\"rounded,dashed\"];\n", spec.name));
            } else {
                out.push_str(&format!("    \"{}\";\n", spec.name));
            }
        }

        for (from, to) in self.edge_names() {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }

        if let Some(composition) = &self.composition {
            out.push_str(&format!(
                "    \"{}\" [shape=doubleoctagon];\n",
                FINAL_TARGET
            ));
            for stage in composition.stages() {
                out.push_str(&format!(
                    "    \"{}\" -> \"{}\" [style=dotted];\n",
                    stage, FINAL_TARGET
                ));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of execution order
    pub fn to_text(&self) -> StagehandResult<String> {
        let order = self.topological_order()?;
        let mut out = String::new();

        for (i, name) in order.iter().enumerate() {
            let Some(spec) = self.spec(name) else {
                continue;
            };
            let deps = self.dependencies(name).unwrap_or_default();

            out.push_str(&format!(
                "{}. {} ({} command{})",
                i + 1,
                name,
                spec.commands.len(),
                if spec.commands.len() == 1 { "" } else { "s" }
            ));

            if spec.optional {
                out.push_str(" [optional]");
            }
            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }

            out.push('\n');
        }

        if let Some(composition) = &self.composition {
            out.push_str(&format!(
                "{}. {} [composes: {}]\n",
                order.len() + 1,
                FINAL_TARGET,
                composition.stages().join(", ")
            ));
        }

        Ok(out)
    }
}

fn mermaid_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CompositionEntry, InputRef};

    fn stage(name: &str, deps: &[&str]) -> StageSpec {
        deps.iter()
            .fold(StageSpec::new(name).with_command("true"), |spec, dep| {
                spec.with_input(InputRef::stage(*dep, ""))
            })
    }

    fn graph(stages: Vec<(&str, Vec<&str>)>) -> StagehandResult<StageGraph> {
        StageGraph::build(
            stages
                .into_iter()
                .map(|(name, deps)| stage(name, &deps))
                .collect(),
        )
    }

    #[test]
    fn test_linear_graph() {
        let g = graph(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])]).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_uses_declaration_order() {
        let g = graph(vec![
            ("a", vec![]),
            ("c", vec!["a"]),
            ("b", vec!["a"]),
            ("d", vec!["b", "c"]),
        ])
        .unwrap();

        assert_eq!(g.topological_order().unwrap(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_forward_reference_allowed_in_build() {
        let g = graph(vec![("b", vec!["a"]), ("a", vec![])]).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_reports_members() {
        let result = graph(vec![
            ("x", vec![]),
            ("a", vec!["c"]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
        ]);

        match result {
            Err(StagehandError::CycleDetected { stages }) => {
                assert_eq!(stages, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let mut g = StageGraph::new();
        let result = g.register(stage("a", &["a"]));
        assert!(matches!(result, Err(StagehandError::CycleDetected { .. })));

        assert!(matches!(
            graph(vec![("a", vec!["a"])]),
            Err(StagehandError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_register_rejects_duplicates_and_unknown() {
        let mut g = StageGraph::new();
        g.register(stage("a", &[])).unwrap();

        assert!(matches!(
            g.register(stage("a", &[])),
            Err(StagehandError::DuplicateStage { .. })
        ));
        assert!(matches!(
            g.register(stage("b", &["missing"])),
            Err(StagehandError::UnknownReference { .. })
        ));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_resolve_collects_closure_only() {
        let g = graph(vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("unrelated", vec![]),
            ("c", vec!["b"]),
        ])
        .unwrap();

        let plan = g.resolve(&Target::Stage("c".into())).unwrap();
        assert_eq!(plan.names(), vec!["a", "b", "c"]);
        assert_eq!(plan.get("c").unwrap().dependencies, vec!["b"]);
    }

    #[test]
    fn test_resolve_unknown_target() {
        let g = graph(vec![("a", vec![])]).unwrap();
        assert!(matches!(
            g.target("nope"),
            Err(StagehandError::UnknownTarget { .. })
        ));
        // no composition declared
        assert!(g.target("final").is_err());
    }

    #[test]
    fn test_final_target_uses_composition() {
        let file = BuildFile {
            version: "1".into(),
            name: "t".into(),
            description: None,
            stages: vec![stage("a", &[]), stage("b", &["a"]), stage("c", &[])],
            composition: Some(CompositionSpec::new(vec![CompositionEntry::new("b", "", "")])),
            settings: Default::default(),
        };
        let g = StageGraph::from_build_file(&file).unwrap();

        let target = g.target("final").unwrap();
        assert_eq!(target, Target::Final);
        assert_eq!(g.resolve(&target).unwrap().names(), vec!["a", "b"]);
    }

    #[test]
    fn test_composition_reference_must_exist() {
        let file = BuildFile {
            version: "1".into(),
            name: "t".into(),
            description: None,
            stages: vec![stage("a", &[])],
            composition: Some(CompositionSpec::new(vec![CompositionEntry::new("zzz", "", "")])),
            settings: Default::default(),
        };
        assert!(matches!(
            StageGraph::from_build_file(&file),
            Err(StagehandError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_depends_on_check() {
        let g = graph(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])]).unwrap();

        assert!(g.depends_on("c", "a")); // transitive
        assert!(g.depends_on("c", "b")); // direct
        assert!(!g.depends_on("a", "c"));
        assert!(!g.depends_on("a", "a"));
        assert_eq!(g.dependents("a").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_diagrams() {
        let g = graph(vec![("a-1", vec![]), ("b", vec!["a-1"])]).unwrap();

        let mermaid = g.to_mermaid();
        assert!(mermaid.contains("graph TD"));
        assert!(mermaid.contains("a_1 --> b"));

        let dot = g.to_dot();
        assert!(dot.contains("\"a-1\" -> \"b\";"));

        let text = g.to_text().unwrap();
        assert!(text.contains("2. b (1 command) [depends: a-1]"));
    }
}
