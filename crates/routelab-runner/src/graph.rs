//! A small state-graph engine: named nodes, direct and conditional edges,
//! and a `step` primitive that runs one node and folds its update into the
//! blackboard.

use crate::agents::Node;
use routelab_core::{ExperimentState, MergeError, StateUpdate};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

pub const START: &str = "__start__";
pub const END: &str = "__end__";

pub type Router = Box<dyn Fn(&ExperimentState) -> String + Send>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("node `{0}` is registered twice")]
    DuplicateNode(String),
    #[error("graph has no entry point")]
    NoEntryPoint,
    #[error("edge from `{from}` targets unknown node `{to}`")]
    DanglingEdge { from: String, to: String },
    #[error("node `{0}` has no outgoing edge")]
    NoOutgoingEdge(String),
    #[error("node `{node}` routed to `{key}`, which has no mapping")]
    UnmappedRoute { node: String, key: String },
    #[error("node `{0}` returned an update without an audit entry")]
    MissingAudit(String),
    #[error("update from node `{node}` could not be merged: {source}")]
    Merge {
        node: String,
        #[source]
        source: MergeError,
    },
}

enum Edge {
    Direct(String),
    Conditional {
        router: Router,
        routes: HashMap<String, String>,
    },
}

#[derive(Default)]
pub struct StateGraph {
    nodes: BTreeMap<String, Box<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
    duplicate: Option<String>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Box<dyn Node>) -> &mut Self {
        let name = node.name().to_string();
        if self.nodes.insert(name.clone(), node).is_some() {
            self.duplicate.get_or_insert(name);
        }
        self
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> &mut Self {
        self.edges.insert(from.to_string(), Edge::Direct(to.to_string()));
        self
    }

    /// `routes` maps each key the router can return to a node name or [`END`].
    pub fn add_conditional_edges(
        &mut self,
        from: &str,
        router: Router,
        routes: &[(&str, &str)],
    ) -> &mut Self {
        let routes = routes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.edges
            .insert(from.to_string(), Edge::Conditional { router, routes });
        self
    }

    pub fn set_entry_point(&mut self, node: &str) -> &mut Self {
        self.entry = Some(node.to_string());
        self
    }

    pub fn compile(self) -> Result<CompiledGraph, GraphError> {
        if let Some(name) = self.duplicate {
            return Err(GraphError::DuplicateNode(name));
        }
        let entry = self.entry.ok_or(GraphError::NoEntryPoint)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::UnknownNode(entry));
        }
        let known = |name: &str| name == END || self.nodes.contains_key(name);
        for (from, edge) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            let targets: Vec<&String> = match edge {
                Edge::Direct(to) => vec![to],
                Edge::Conditional { routes, .. } => routes.values().collect(),
            };
            for to in targets {
                if !known(to) {
                    return Err(GraphError::DanglingEdge {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }
        if let Some(name) = self.nodes.keys().find(|n| !self.edges.contains_key(*n)) {
            return Err(GraphError::NoOutgoingEdge(name.clone()));
        }
        Ok(CompiledGraph {
            nodes: self.nodes,
            edges: self.edges,
            entry,
        })
    }
}

/// Result of one [`CompiledGraph::step`].
#[derive(Debug, Clone)]
pub struct StepResult {
    pub update: StateUpdate,
    pub next: String,
    /// Set when the node failed and its system-error update was applied instead.
    pub system_error: Option<String>,
}

pub struct CompiledGraph {
    nodes: BTreeMap<String, Box<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: String,
}

impl CompiledGraph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Runs `node` against `state`, merges its update, and resolves the
    /// successor. A node error is converted into that node's system-error
    /// update; the state is only changed when the merge succeeds.
    pub fn step(&mut self, node: &str, state: &mut ExperimentState) -> Result<StepResult, GraphError> {
        let runner = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| GraphError::UnknownNode(node.to_string()))?;
        let (update, system_error) = match runner.run(state) {
            Ok(update) => (update, None),
            Err(e) => {
                warn!(node, error = %format!("{:#}", e), "node failed");
                (runner.system_error(state, &e), Some(format!("{:#}", e)))
            }
        };
        if update.audit_trail.is_empty() {
            return Err(GraphError::MissingAudit(node.to_string()));
        }
        state
            .apply(update.clone())
            .map_err(|source| GraphError::Merge {
                node: node.to_string(),
                source,
            })?;
        let next = self.next_after(node, state)?;
        debug!(node, next = %next, fields = update.fields().len(), "step applied");
        Ok(StepResult {
            update,
            next,
            system_error,
        })
    }

    pub fn next_after(&self, node: &str, state: &ExperimentState) -> Result<String, GraphError> {
        match self.edges.get(node) {
            Some(Edge::Direct(to)) => Ok(to.clone()),
            Some(Edge::Conditional { router, routes }) => {
                let key = router(state);
                routes
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| GraphError::UnmappedRoute {
                        node: node.to_string(),
                        key,
                    })
            }
            None => Err(GraphError::NoOutgoingEdge(node.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use serde_json::json;

    struct Counter {
        name: &'static str,
        fail: bool,
        audit: bool,
    }

    impl Node for Counter {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run(&mut self, state: &ExperimentState) -> Result<StateUpdate> {
            if self.fail {
                return Err(anyhow!("boom"));
            }
            let mut update = if self.audit {
                StateUpdate::audited(self.name, "counted", json!({}))
            } else {
                StateUpdate::new()
            };
            update.iteration_count = Some(state.iteration_count + 1);
            Ok(update)
        }
    }

    fn counter(name: &'static str) -> Box<dyn Node> {
        Box::new(Counter {
            name,
            fail: false,
            audit: true,
        })
    }

    fn looping_graph() -> CompiledGraph {
        let mut graph = StateGraph::new();
        graph
            .add_node(counter("a"))
            .add_node(counter("b"))
            .set_entry_point("a")
            .add_edge("a", "b")
            .add_conditional_edges(
                "b",
                Box::new(|s: &ExperimentState| {
                    let key = if s.has_iteration_budget() { "again" } else { "done" };
                    key.to_string()
                }),
                &[("again", "a"), ("done", END)],
            );
        graph.compile().expect("compile")
    }

    #[test]
    fn steps_until_end_with_conditional_loop() {
        let mut graph = looping_graph();
        let mut state = ExperimentState::new("t", 4, 1);
        let mut node = graph.entry().to_string();
        let mut visited = Vec::new();
        while node != END {
            let step = graph.step(&node, &mut state).expect("step");
            visited.push(node);
            node = step.next;
        }
        assert_eq!(visited, vec!["a", "b", "a", "b"]);
        assert_eq!(state.iteration_count, 4);
        assert_eq!(state.audit_trail.len(), 4);
    }

    #[test]
    fn compile_rejects_dangling_and_missing_edges() {
        let mut graph = StateGraph::new();
        graph.add_node(counter("a")).set_entry_point("a").add_edge("a", "ghost");
        assert!(matches!(graph.compile(), Err(GraphError::DanglingEdge { .. })));

        let mut graph = StateGraph::new();
        graph.add_node(counter("a")).add_node(counter("b")).set_entry_point("a").add_edge("a", "b");
        assert!(matches!(graph.compile(), Err(GraphError::NoOutgoingEdge(n)) if n == "b"));

        let mut graph = StateGraph::new();
        graph.add_node(counter("a"));
        assert!(matches!(graph.compile(), Err(GraphError::NoEntryPoint)));

        let mut graph = StateGraph::new();
        graph.add_node(counter("a")).add_node(counter("a"));
        assert!(matches!(graph.compile(), Err(GraphError::DuplicateNode(_))));
    }

    #[test]
    fn failing_node_records_system_error() {
        let mut graph = StateGraph::new();
        graph
            .add_node(Box::new(Counter {
                name: "a",
                fail: true,
                audit: true,
            }))
            .set_entry_point("a")
            .add_edge("a", END);
        let mut graph = graph.compile().expect("compile");
        let mut state = ExperimentState::new("t", 2, 1);
        let step = graph.step("a", &mut state).expect("step");
        assert_eq!(step.next, END);
        assert_eq!(step.system_error.as_deref(), Some("boom"));
        assert_eq!(state.last_error(), Some("SystemError: boom"));
        assert_eq!(state.audit_trail[0].action, "system_error");
    }

    #[test]
    fn unaudited_and_invalid_updates_leave_state_untouched() {
        let mut graph = StateGraph::new();
        graph
            .add_node(Box::new(Counter {
                name: "a",
                fail: false,
                audit: false,
            }))
            .set_entry_point("a")
            .add_edge("a", END);
        let mut graph = graph.compile().expect("compile");
        let mut state = ExperimentState::new("t", 2, 1);
        assert!(matches!(graph.step("a", &mut state), Err(GraphError::MissingAudit(_))));
        assert_eq!(state.iteration_count, 0);

        let mut graph = looping_graph();
        let mut state = ExperimentState::new("t", 1, 1);
        graph.step("a", &mut state).expect("first step");
        assert!(matches!(graph.step("b", &mut state), Err(GraphError::Merge { .. })));
        assert_eq!(state.iteration_count, 1);
    }

    #[test]
    fn unmapped_route_is_an_error() {
        let mut graph = StateGraph::new();
        graph
            .add_node(counter("a"))
            .set_entry_point("a")
            .add_conditional_edges("a", Box::new(|_: &ExperimentState| "nowhere".to_string()), &[("x", END)]);
        let mut graph = graph.compile().expect("compile");
        let mut state = ExperimentState::new("t", 2, 1);
        assert!(matches!(
            graph.step("a", &mut state),
            Err(GraphError::UnmappedRoute { key, .. }) if key == "nowhere"
        ));
    }
}
