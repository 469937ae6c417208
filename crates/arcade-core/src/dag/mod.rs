//! In-memory DAG engine (C2): build a dependency graph, detect cycles, and
//! compute the schedulable set given a frontier of completed nodes.
//!
//! Nodes are kept in a flat arena (`Vec<Node>`) addressed by [`NodeIndex`]
//! rather than linked via `Rc`/`RefCell`, so the whole graph stays `Send`
//! and cheap to clone for snapshotting.

use std::collections::{HashMap, HashSet};
use std::fmt;

use thiserror::Error;

/// Index into [`Dag`]'s node arena. Not valid across different [`Dag`]
/// instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

#[derive(Debug, Clone)]
struct Node {
    name: String,
    prev: Vec<NodeIndex>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("node {0:?} is already present in the graph")]
    DuplicateNode(String),
    #[error("node {0:?} depends on unknown node {1:?}")]
    UnknownPredecessor(String, String),
    #[error("node {0:?} cannot depend on itself")]
    SelfCycle(String),
    #[error("cycle detected: {0}")]
    CycleDetected(String),
    #[error("completed set references unknown node {0:?}")]
    UnknownCompleted(String),
}

/// A directed acyclic graph of named nodes with dependency edges.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: Vec<Node>,
    index: HashMap<String, NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with the given predecessor names. Predecessors must
    /// already be present in the graph (dependencies are declared
    /// bottom-up).
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        depends_on: &[&str],
    ) -> Result<NodeIndex, DagError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(DagError::DuplicateNode(name));
        }
        if depends_on.contains(&name.as_str()) {
            return Err(DagError::SelfCycle(name));
        }

        let mut prev = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            let dep_idx = *self
                .index
                .get(*dep)
                .ok_or_else(|| DagError::UnknownPredecessor(name.clone(), dep.to_string()))?;
            prev.push(dep_idx);
        }

        let idx = NodeIndex(self.nodes.len());
        self.nodes.push(Node {
            name: name.clone(),
            prev,
        });
        self.index.insert(name, idx);
        Ok(idx)
    }

    pub fn node_name(&self, idx: NodeIndex) -> &str {
        &self.nodes[idx.0].name
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes with no predecessors -- the initial schedulable set.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.prev.is_empty())
            .map(|(i, _)| NodeIndex(i))
            .collect()
    }

    /// Detect a cycle via DFS over predecessor edges. Returns the cycle path
    /// rendered as `"A -> B -> A"` when one exists.
    ///
    /// Since edges only ever point from a new node to an already-existing
    /// one, [`Dag::add_node`] can never itself introduce a cycle; this walk
    /// exists for graphs assembled by other means (e.g. deserialized from a
    /// pipeline definition) where that invariant cannot be assumed.
    pub fn detect_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        fn visit(
            dag: &Dag,
            idx: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<String> {
            marks[idx] = Mark::InProgress;
            path.push(idx);

            for prev in &dag.nodes[idx].prev {
                match marks[prev.0] {
                    Mark::InProgress => {
                        let cycle_start = path.iter().position(|&n| n == prev.0).unwrap();
                        let mut rendered: Vec<&str> =
                            path[cycle_start..].iter().map(|&n| dag.nodes[n].name.as_str()).collect();
                        rendered.push(dag.nodes[prev.0].name.as_str());
                        return Some(rendered.join(" -> "));
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(dag, prev.0, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            path.pop();
            marks[idx] = Mark::Done;
            None
        }

        let mut path = Vec::new();
        for start in 0..self.nodes.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = visit(self, start, &mut marks, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    /// Compute the set of nodes that are schedulable now: every predecessor
    /// is present in `completed`, and the node itself is not. By default,
    /// rejects `completed` entries that name nodes outside the graph; pass
    /// `allow_arbitrary_completed` to relax that (useful when `completed`
    /// comes from a superset DAG that this one is a slice of).
    pub fn schedulable(
        &self,
        completed: &HashSet<String>,
        allow_arbitrary_completed: bool,
    ) -> Result<Vec<&str>, DagError> {
        if !allow_arbitrary_completed {
            for name in completed {
                if !self.index.contains_key(name) {
                    return Err(DagError::UnknownCompleted(name.clone()));
                }
            }
        }

        let ready = self
            .nodes
            .iter()
            .filter(|node| {
                !completed.contains(&node.name)
                    && node
                        .prev
                        .iter()
                        .all(|p| completed.contains(&self.nodes[p.0].name))
            })
            .map(|node| node.name.as_str())
            .collect();
        Ok(ready)
    }
}

impl fmt::Display for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(
                f,
                "{} <- [{}]",
                node.name,
                node.prev
                    .iter()
                    .map(|p| self.nodes[p.0].name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn roots_have_no_predecessors() {
        let mut dag = Dag::new();
        dag.add_node("build", &[]).unwrap();
        dag.add_node("lint", &[]).unwrap();
        dag.add_node("test", &["build"]).unwrap();

        let roots: Vec<&str> = dag.roots().iter().map(|i| dag.node_name(*i)).collect();
        assert_eq!(roots.len(), 2);
        assert!(roots.contains(&"build"));
        assert!(roots.contains(&"lint"));
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut dag = Dag::new();
        dag.add_node("build", &[]).unwrap();
        assert_eq!(
            dag.add_node("build", &[]),
            Err(DagError::DuplicateNode("build".to_string()))
        );
    }

    #[test]
    fn unknown_predecessor_rejected() {
        let mut dag = Dag::new();
        assert_eq!(
            dag.add_node("test", &["build"]),
            Err(DagError::UnknownPredecessor("test".to_string(), "build".to_string()))
        );
    }

    #[test]
    fn self_dependency_rejected() {
        let mut dag = Dag::new();
        assert_eq!(
            dag.add_node("build", &["build"]),
            Err(DagError::SelfCycle("build".to_string()))
        );
    }

    #[test]
    fn schedulable_tracks_completed_frontier() {
        let mut dag = Dag::new();
        dag.add_node("build", &[]).unwrap();
        dag.add_node("test", &["build"]).unwrap();
        dag.add_node("deploy", &["test"]).unwrap();

        let ready = dag.schedulable(&set(&[]), false).unwrap();
        assert_eq!(ready, vec!["build"]);

        let ready = dag.schedulable(&set(&["build"]), false).unwrap();
        assert_eq!(ready, vec!["test"]);

        let ready = dag.schedulable(&set(&["build", "test"]), false).unwrap();
        assert_eq!(ready, vec!["deploy"]);

        let ready = dag.schedulable(&set(&["build", "test", "deploy"]), false).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn schedulable_rejects_unknown_completed_by_default() {
        let mut dag = Dag::new();
        dag.add_node("build", &[]).unwrap();

        let err = dag.schedulable(&set(&["not-a-node"]), false).unwrap_err();
        assert_eq!(err, DagError::UnknownCompleted("not-a-node".to_string()));
    }

    #[test]
    fn schedulable_allows_arbitrary_completed_when_opted_in() {
        let mut dag = Dag::new();
        dag.add_node("build", &[]).unwrap();

        let ready = dag.schedulable(&set(&["not-a-node"]), true).unwrap();
        assert_eq!(ready, vec!["build"]);
    }

    #[test]
    fn diamond_dependency_schedules_once_both_branches_complete() {
        let mut dag = Dag::new();
        dag.add_node("build", &[]).unwrap();
        dag.add_node("unit_test", &["build"]).unwrap();
        dag.add_node("integration_test", &["build"]).unwrap();
        dag.add_node("deploy", &["unit_test", "integration_test"]).unwrap();

        let ready = dag.schedulable(&set(&["build", "unit_test"]), false).unwrap();
        assert!(ready.contains(&"integration_test"));
        assert!(!ready.contains(&"deploy"));

        let ready = dag
            .schedulable(&set(&["build", "unit_test", "integration_test"]), false)
            .unwrap();
        assert_eq!(ready, vec!["deploy"]);
    }

    #[test]
    fn no_cycle_in_linear_chain() {
        let mut dag = Dag::new();
        dag.add_node("a", &[]).unwrap();
        dag.add_node("b", &["a"]).unwrap();
        dag.add_node("c", &["b"]).unwrap();
        assert!(dag.detect_cycle().is_none());
    }
}
