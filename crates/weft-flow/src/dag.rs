//! Directed acyclic graph of flow nodes.
//!
//! Nodes are task invocations and fan-out barriers; edges point from a
//! dependency to its dependent. The graph is built once per flow build,
//! validated for cycles, and serves both the scheduler (in-degrees,
//! adjacency) and the export surface (adjacency JSON, DOT).
//!
//! Determinism: every query that returns multiple nodes orders them by
//! declaration (insertion) order, so exports and scheduling tie-breaks are
//! reproducible run to run.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::json;

use crate::build::NodeId;
use crate::error::{Error, Result};
use crate::value::TaskValue;

/// Whether a graph node is a task invocation or a fan-out barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphNodeKind {
    /// A task invocation.
    Task,
    /// A fan-out barrier collecting dynamic children.
    FanOut,
}

impl GraphNodeKind {
    /// Stable string used in exports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::FanOut => "fanout",
        }
    }
}

#[derive(Debug, Clone)]
struct GraphNodeData {
    id: NodeId,
    kind: GraphNodeKind,
    label: String,
}

/// The dependency graph of one flow build.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    graph: DiGraph<GraphNodeData, ()>,
    index: HashMap<NodeId, NodeIndex>,
    insertion_order: Vec<NodeIndex>,
}

impl FlowGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// True when `id` is a node of this graph.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Adds a node. Re-adding an existing id is a no-op.
    pub(crate) fn add_node(&mut self, id: NodeId, kind: GraphNodeKind, label: String) -> NodeIndex {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(GraphNodeData {
            id: id.clone(),
            kind,
            label,
        });
        self.index.insert(id, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Adds a dependency edge `from -> to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Build`] when either endpoint is unknown.
    pub(crate) fn add_edge(&mut self, from: &NodeId, to: &NodeId) -> Result<()> {
        let &from_idx = self
            .index
            .get(from)
            .ok_or_else(|| Error::build(format!("edge references unknown node '{from}'")))?;
        let &to_idx = self
            .index
            .get(to)
            .ok_or_else(|| Error::build(format!("edge references unknown node '{to}'")))?;
        self.graph.add_edge(from_idx, to_idx, ());
        Ok(())
    }

    /// Node ids in declaration order.
    #[must_use]
    pub fn nodes_in_order(&self) -> Vec<NodeId> {
        self.insertion_order
            .iter()
            .filter_map(|&idx| self.graph.node_weight(idx))
            .map(|n| n.id.clone())
            .collect()
    }

    /// The kind of a node, if present.
    #[must_use]
    pub fn kind_of(&self, id: &NodeId) -> Option<GraphNodeKind> {
        let &idx = self.index.get(id)?;
        self.graph.node_weight(idx).map(|n| n.kind)
    }

    /// Direct dependencies of `id`, in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors_sorted(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, in declaration order.
    #[must_use]
    pub fn dependents_of(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors_sorted(id, Direction::Outgoing)
    }

    fn neighbors_sorted(&self, id: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort_by_key(|n| self.position_of(*n));
        neighbors.dedup();
        neighbors
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n))
            .map(|n| n.id.clone())
            .collect()
    }

    fn position_of(&self, idx: NodeIndex) -> usize {
        self.insertion_order
            .iter()
            .position(|&i| i == idx)
            .unwrap_or(usize::MAX)
    }

    /// All edges as `(from, to)` pairs, ordered by the endpoints'
    /// declaration positions.
    #[must_use]
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        let mut edges: Vec<(usize, usize, NodeId, NodeId)> = self
            .graph
            .edge_references()
            .filter_map(|e| {
                let from = self.graph.node_weight(e.source())?;
                let to = self.graph.node_weight(e.target())?;
                Some((
                    self.position_of(e.source()),
                    self.position_of(e.target()),
                    from.id.clone(),
                    to.id.clone(),
                ))
            })
            .collect();
        edges.sort_by_key(|(f, t, _, _)| (*f, *t));
        edges.dedup_by(|a, b| a.2 == b.2 && a.3 == b.3);
        edges.into_iter().map(|(_, _, f, t)| (f, t)).collect()
    }

    /// Returns a topologically sorted list of node ids.
    ///
    /// Kahn's algorithm with deterministic tie-breaking: nodes that become
    /// available together are processed in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Build`] when the graph contains a cycle.
    pub fn toposort(&self) -> Result<Vec<NodeId>> {
        let node_count = self.graph.node_count();
        if node_count == 0 {
            return Ok(Vec::new());
        }

        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::with_capacity(node_count);
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: std::collections::VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut result = Vec::with_capacity(node_count);
        while let Some(idx) = queue.pop_front() {
            let node = self
                .graph
                .node_weight(idx)
                .ok_or_else(|| Error::build(format!("missing graph node at index {}", idx.index())))?;
            result.push(node.id.clone());

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| self.position_of(*n));
            neighbors.dedup();

            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != node_count {
            let cycle = self
                .find_cycle()
                .map(|path| path.iter().map(ToString::to_string).collect())
                .unwrap_or_default();
            return Err(Error::Build {
                message: "cycle detected in flow graph".to_string(),
                cycle,
            });
        }

        Ok(result)
    }

    /// Finds a cycle by three-color depth-first search, returning its path
    /// (first node repeated at the end) or `None` for an acyclic graph.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<NodeIndex, Color> =
            self.graph.node_indices().map(|i| (i, Color::White)).collect();

        for &start in &self.insertion_order {
            if color.get(&start) != Some(&Color::White) {
                continue;
            }
            // Iterative DFS; each stack frame tracks its unvisited neighbors.
            let mut path: Vec<NodeIndex> = Vec::new();
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();

            color.insert(start, Color::Gray);
            path.push(start);
            stack.push((start, self.sorted_out_neighbors(start)));

            while let Some((_, neighbors)) = stack.last_mut() {
                if let Some(next) = neighbors.pop() {
                    match color.get(&next) {
                        Some(Color::Gray) => {
                            // Back edge: the cycle runs from `next` through
                            // the current gray path.
                            let from = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle: Vec<NodeId> = path[from..]
                                .iter()
                                .filter_map(|&i| self.graph.node_weight(i))
                                .map(|n| n.id.clone())
                                .collect();
                            if let Some(first) = cycle.first().cloned() {
                                cycle.push(first);
                            }
                            return Some(cycle);
                        }
                        Some(Color::White) => {
                            color.insert(next, Color::Gray);
                            path.push(next);
                            stack.push((next, self.sorted_out_neighbors(next)));
                        }
                        _ => {}
                    }
                } else {
                    let (done, _) = stack.pop().expect("stack entry present");
                    color.insert(done, Color::Black);
                    path.pop();
                }
            }
        }
        None
    }

    fn sorted_out_neighbors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        // Reverse declaration order: the DFS pops from the back.
        neighbors.sort_by_key(|n| std::cmp::Reverse(self.position_of(*n)));
        neighbors.dedup();
        neighbors
    }

    /// Stable adjacency JSON:
    /// `{"flow", "nodes": [{id, label, kind}], "edges": [{from, to}], "count"}`.
    #[must_use]
    pub fn describe(&self, flow: &str) -> TaskValue {
        let nodes: Vec<TaskValue> = self
            .insertion_order
            .iter()
            .filter_map(|&idx| self.graph.node_weight(idx))
            .map(|n| {
                json!({
                    "id": n.id.as_str(),
                    "label": n.label,
                    "kind": n.kind.as_str(),
                })
            })
            .collect();
        let edges: Vec<TaskValue> = self
            .edges()
            .into_iter()
            .map(|(from, to)| json!({ "from": from.as_str(), "to": to.as_str() }))
            .collect();
        json!({
            "flow": flow,
            "nodes": nodes,
            "edges": edges,
            "count": self.node_count(),
        })
    }

    /// Renders the graph in DOT. Fan-out barriers are diamonds labelled
    /// `fan_out(<task>)`; task nodes keep the default shape.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut lines = vec!["digraph G {".to_string()];
        for &idx in &self.insertion_order {
            let Some(node) = self.graph.node_weight(idx) else {
                continue;
            };
            match node.kind {
                GraphNodeKind::Task => lines.push(format!("  \"{}\";", node.id)),
                GraphNodeKind::FanOut => lines.push(format!(
                    "  \"{}\" [shape=diamond label=\"{}\"];",
                    node.id, node.label
                )),
            }
        }
        for (from, to) in self.edges() {
            lines.push(format!("  \"{from}\" -> \"{to}\";"));
        }
        lines.push("}".to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_id(name: &str, n: usize) -> NodeId {
        NodeId::task(name, n)
    }

    fn graph_of(edges: &[(&NodeId, &NodeId)], nodes: &[&NodeId]) -> FlowGraph {
        let mut g = FlowGraph::new();
        for id in nodes {
            g.add_node((*id).clone(), GraphNodeKind::Task, "t".to_string());
        }
        for (from, to) in edges {
            g.add_edge(from, to).unwrap();
        }
        g
    }

    #[test]
    fn empty_graph_has_no_nodes() {
        let g = FlowGraph::new();
        assert_eq!(g.node_count(), 0);
        assert!(g.toposort().unwrap().is_empty());
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn linear_graph_sorts_in_order() {
        let a = task_id("a", 1);
        let b = task_id("b", 1);
        let c = task_id("c", 1);
        let g = graph_of(&[(&a, &b), (&b, &c)], &[&a, &b, &c]);

        assert_eq!(g.toposort().unwrap(), vec![a, b, c]);
    }

    #[test]
    fn toposort_breaks_ties_by_declaration_order() {
        let a = task_id("a", 1);
        let b = task_id("b", 1);
        let c = task_id("c", 1);
        let d = task_id("d", 1);
        // a and b are independent roots; c and d each depend on one of them.
        let g = graph_of(&[(&a, &c), (&b, &d)], &[&a, &b, &c, &d]);

        let sorted = g.toposort().unwrap();
        assert_eq!(sorted, vec![a, b, c, d]);
        assert_eq!(g.toposort().unwrap(), sorted);
    }

    #[test]
    fn cycle_is_detected_and_named() {
        let a = task_id("a", 1);
        let b = task_id("b", 1);
        let mut g = graph_of(&[(&a, &b)], &[&a, &b]);
        g.add_edge(&b, &a).unwrap();

        let cycle = g.find_cycle().expect("cycle expected");
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.len() >= 3);

        let err = g.toposort().unwrap_err();
        assert!(matches!(err, Error::Build { ref cycle, .. } if !cycle.is_empty()));
    }

    #[test]
    fn duplicate_edges_do_not_duplicate_exports() {
        let a = task_id("a", 1);
        let b = task_id("b", 1);
        let mut g = graph_of(&[(&a, &b)], &[&a, &b]);
        g.add_edge(&a, &b).unwrap();

        assert_eq!(g.edges(), vec![(a.clone(), b.clone())]);
        assert_eq!(g.dependencies_of(&b), vec![a]);
    }

    #[test]
    fn describe_is_format_stable() {
        let a = task_id("numbers", 1);
        let f = NodeId::fanout(1);
        let mut g = FlowGraph::new();
        g.add_node(a.clone(), GraphNodeKind::Task, "numbers".to_string());
        g.add_node(f.clone(), GraphNodeKind::FanOut, "fan_out(square)".to_string());
        g.add_edge(&a, &f).unwrap();

        let described = g.describe("pipeline");
        assert_eq!(described["flow"], "pipeline");
        assert_eq!(described["count"], 2);
        assert_eq!(described["nodes"][0]["id"], "numbers:1");
        assert_eq!(described["nodes"][1]["kind"], "fanout");
        assert_eq!(described["edges"][0]["from"], "numbers:1");
        assert_eq!(described["edges"][0]["to"], "fanout:1");
    }

    #[test]
    fn dot_renders_fanout_as_diamond() {
        let a = task_id("numbers", 1);
        let f = NodeId::fanout(1);
        let mut g = FlowGraph::new();
        g.add_node(a.clone(), GraphNodeKind::Task, "numbers".to_string());
        g.add_node(f.clone(), GraphNodeKind::FanOut, "fan_out(square)".to_string());
        g.add_edge(&a, &f).unwrap();

        let dot = g.to_dot();
        assert!(dot.starts_with("digraph G {"));
        assert!(dot.contains("\"fanout:1\" [shape=diamond label=\"fan_out(square)\"];"));
        assert!(dot.contains("\"numbers:1\" -> \"fanout:1\";"));
    }
}
