//! Build-time flow structures: argument bindings, invocations, and the
//! flow builder.
//!
//! Calling a task inside a flow body does not execute it; it registers an
//! [`Invocation`], a placeholder standing in for the eventual result. An
//! argument is a tagged [`ArgBinding`]: a literal value, a reference to
//! another invocation or fan-out barrier, or a collection of bindings.
//! Dependency edges fall out of the bindings; nothing else wires the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::dag::{FlowGraph, GraphNodeKind};
use crate::error::{Error, Result};
use crate::task::TaskDefinition;
use crate::value::TaskValue;

/// Stable identifier of a node within one flow build.
///
/// Task invocations are `<task_name>:<n>` with `n` counting from 1 per task
/// name; fan-out barriers are `fanout:<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub(crate) fn task(task_name: &str, n: usize) -> Self {
        Self(format!("{task_name}:{n}"))
    }

    pub(crate) fn fanout(n: usize) -> Self {
        Self(format!("fanout:{n}"))
    }

    pub(crate) fn synthetic(name: &str) -> Self {
        Self(name.to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bound argument position: either a concrete value or a reference that
/// the scheduler substitutes with an upstream result before dispatch.
#[derive(Debug, Clone)]
pub enum ArgBinding {
    /// A concrete value known at build time.
    Literal(TaskValue),
    /// The future result of another invocation.
    Node(NodeId),
    /// The ordered child results of a fan-out barrier.
    FanOut(NodeId),
    /// A list whose elements may themselves be bindings.
    List(Vec<ArgBinding>),
    /// A string-keyed map whose values may themselves be bindings.
    Map(BTreeMap<String, ArgBinding>),
}

/// Shorthand for a literal binding.
#[must_use]
pub fn lit(value: impl Into<TaskValue>) -> ArgBinding {
    ArgBinding::Literal(value.into())
}

impl From<TaskValue> for ArgBinding {
    fn from(value: TaskValue) -> Self {
        Self::Literal(value)
    }
}

impl From<&Invocation> for ArgBinding {
    fn from(invocation: &Invocation) -> Self {
        Self::Node(invocation.id.clone())
    }
}

impl From<Invocation> for ArgBinding {
    fn from(invocation: Invocation) -> Self {
        Self::Node(invocation.id)
    }
}

impl From<Vec<ArgBinding>> for ArgBinding {
    fn from(items: Vec<ArgBinding>) -> Self {
        Self::List(items)
    }
}

/// Build-time handle for a pending task call. Cheap to clone; immutable.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub(crate) id: NodeId,
    pub(crate) task_name: String,
}

impl Invocation {
    /// The node identifier assigned to this invocation.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Name of the task definition being invoked.
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }
}

/// Payload of a registered node.
#[derive(Clone)]
#[derive(Debug)]
pub(crate) enum BuildNodeKind {
    Task {
        task: TaskDefinition,
        args: Vec<ArgBinding>,
        named: BTreeMap<String, ArgBinding>,
    },
    FanOut {
        source: NodeId,
        child_task: TaskDefinition,
        /// Advisory only; recorded but not enforced by the scheduler.
        #[allow(dead_code)]
        max_concurrency: Option<usize>,
    },
}

pub(crate) struct BuildNode {
    pub(crate) id: NodeId,
    pub(crate) seq: usize,
    pub(crate) deps: BTreeSet<NodeId>,
    pub(crate) kind: BuildNodeKind,
}

/// Collects invocations while a flow body runs.
///
/// One builder exists per build; node identifiers are stable within it.
pub struct FlowBuilder {
    pub(crate) nodes: Vec<BuildNode>,
    index: HashMap<NodeId, usize>,
    counters: HashMap<String, usize>,
    pub(crate) fanout_counter: usize,
    params: BTreeMap<String, TaskValue>,
}

impl FlowBuilder {
    pub(crate) fn new(params: BTreeMap<String, TaskValue>) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            counters: HashMap::new(),
            fanout_counter: 0,
            params,
        }
    }

    /// Parameters supplied to this build (the same map tasks later see on
    /// the run context).
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, TaskValue> {
        &self.params
    }

    /// Looks up a single build parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&TaskValue> {
        self.params.get(key)
    }

    pub(crate) fn register(
        &mut self,
        task: &TaskDefinition,
        args: Vec<ArgBinding>,
        named: BTreeMap<String, ArgBinding>,
    ) -> Invocation {
        let counter = self.counters.entry(task.name().to_string()).or_insert(0);
        *counter += 1;
        let id = NodeId::task(task.name(), *counter);

        let mut deps = BTreeSet::new();
        for binding in args.iter().chain(named.values()) {
            scan_binding(binding, &mut deps);
        }

        let node = BuildNode {
            id: id.clone(),
            seq: self.nodes.len(),
            deps,
            kind: BuildNodeKind::Task {
                task: task.clone(),
                args,
                named,
            },
        };
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(node);

        Invocation {
            id,
            task_name: task.name().to_string(),
        }
    }

    pub(crate) fn register_fanout(
        &mut self,
        source: NodeId,
        child_task: &TaskDefinition,
        max_concurrency: Option<usize>,
    ) -> NodeId {
        self.fanout_counter += 1;
        let id = NodeId::fanout(self.fanout_counter);
        let node = BuildNode {
            id: id.clone(),
            seq: self.nodes.len(),
            deps: BTreeSet::from([source.clone()]),
            kind: BuildNodeKind::FanOut {
                source,
                child_task: child_task.clone(),
                max_concurrency,
            },
        };
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Finalizes the build into an executable plan.
    ///
    /// Performs tree-shaking (nodes unreachable from the output are
    /// dropped), validates every referenced dependency, and runs cycle
    /// detection.
    pub(crate) fn finish(self, flow: &str, output: ArgBinding) -> Result<FlowPlan> {
        // Reachability walk from the output binding.
        let mut roots = BTreeSet::new();
        scan_binding(&output, &mut roots);

        let mut reachable: BTreeSet<NodeId> = BTreeSet::new();
        let mut stack: Vec<NodeId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(&slot) = self.index.get(&id) else {
                return Err(Error::build(format!(
                    "node '{id}' is referenced but was not registered in this flow build"
                )));
            };
            if !reachable.insert(id) {
                continue;
            }
            for dep in &self.nodes[slot].deps {
                if !self.index.contains_key(dep) {
                    return Err(Error::build(format!(
                        "node '{dep}' is referenced but was not registered in this flow build"
                    )));
                }
                stack.push(dep.clone());
            }
        }

        // Graph construction in declaration order.
        let mut graph = FlowGraph::new();
        for node in self.nodes.iter().filter(|n| reachable.contains(&n.id)) {
            let (kind, label) = match &node.kind {
                BuildNodeKind::Task { task, .. } => (GraphNodeKind::Task, task.name().to_string()),
                BuildNodeKind::FanOut { child_task, .. } => (
                    GraphNodeKind::FanOut,
                    format!("fan_out({})", child_task.name()),
                ),
            };
            graph.add_node(node.id.clone(), kind, label);
        }
        for node in self.nodes.iter().filter(|n| reachable.contains(&n.id)) {
            for dep in &node.deps {
                graph.add_edge(dep, &node.id)?;
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            return Err(Error::Build {
                message: format!("cycle detected: {}", path.join(" -> ")),
                cycle: path,
            });
        }

        let next_seq = self.nodes.len();
        let mut plan_nodes = HashMap::new();
        for node in self.nodes.into_iter().filter(|n| reachable.contains(&n.id)) {
            let priority = match &node.kind {
                BuildNodeKind::Task { task, .. } => task.priority(),
                BuildNodeKind::FanOut { child_task, .. } => child_task.priority(),
            };
            plan_nodes.insert(
                node.id.clone(),
                PlanNode {
                    seq: node.seq,
                    priority,
                    kind: node.kind,
                },
            );
        }

        let order: Vec<NodeId> = graph.nodes_in_order();

        Ok(FlowPlan {
            flow: flow.to_string(),
            graph,
            nodes: plan_nodes,
            order,
            output,
            counters: self.counters,
            next_seq,
        })
    }
}

/// A validated, executable build artifact: the graph plus per-node payloads
/// and the output binding the run resolves at the end.
#[derive(Debug)]
pub(crate) struct FlowPlan {
    pub(crate) flow: String,
    pub(crate) graph: FlowGraph,
    pub(crate) nodes: HashMap<NodeId, PlanNode>,
    pub(crate) order: Vec<NodeId>,
    pub(crate) output: ArgBinding,
    /// Per-task-name counters, continued by dynamic expansion so runtime
    /// children get ids that cannot collide with build-time ones.
    pub(crate) counters: HashMap<String, usize>,
    pub(crate) next_seq: usize,
}

#[derive(Debug)]
pub(crate) struct PlanNode {
    pub(crate) seq: usize,
    pub(crate) priority: i32,
    pub(crate) kind: BuildNodeKind,
}

fn scan_binding(binding: &ArgBinding, deps: &mut BTreeSet<NodeId>) {
    match binding {
        ArgBinding::Literal(_) => {}
        ArgBinding::Node(id) | ArgBinding::FanOut(id) => {
            deps.insert(id.clone());
        }
        ArgBinding::List(items) => {
            for item in items {
                scan_binding(item, deps);
            }
        }
        ArgBinding::Map(entries) => {
            for value in entries.values() {
                scan_binding(value, deps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDefinition;
    use serde_json::json;

    fn noop_task(name: &str) -> TaskDefinition {
        TaskDefinition::builder(name).build_blocking(|_| Ok(TaskValue::Null))
    }

    #[test]
    fn node_ids_count_per_task_name() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let square = noop_task("square");
        let total = noop_task("total");

        let a = square.invoke(&mut fb, [lit(1)]);
        let b = square.invoke(&mut fb, [lit(2)]);
        let c = total.invoke(&mut fb, [ArgBinding::List(vec![(&a).into(), (&b).into()])]);

        assert_eq!(a.id().as_str(), "square:1");
        assert_eq!(b.id().as_str(), "square:2");
        assert_eq!(c.id().as_str(), "total:1");
    }

    #[test]
    fn dependencies_are_derived_from_bindings() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let produce = noop_task("produce");
        let consume = noop_task("consume");

        let p = produce.invoke(&mut fb, []);
        let nested = ArgBinding::Map(BTreeMap::from([(
            "inner".to_string(),
            ArgBinding::List(vec![(&p).into(), lit("x")]),
        )]));
        let c = consume.invoke(&mut fb, [nested]);

        let plan = fb.finish("f", (&c).into()).unwrap();
        let deps = plan.graph.dependencies_of(c.id());
        assert_eq!(deps, vec![p.id().clone()]);
    }

    #[test]
    fn unreferenced_invocations_are_tree_shaken() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let work = noop_task("work");
        let orphan = noop_task("orphan");

        let kept = work.invoke(&mut fb, []);
        let _dropped = orphan.invoke(&mut fb, []);

        let plan = fb.finish("f", (&kept).into()).unwrap();
        assert_eq!(plan.graph.node_count(), 1);
        assert!(plan.nodes.contains_key(kept.id()));
    }

    #[test]
    fn foreign_invocations_are_rejected() {
        let work = noop_task("work");

        let mut other = FlowBuilder::new(BTreeMap::new());
        let foreign = work.invoke(&mut other, []);

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let consume = noop_task("consume");
        let c = consume.invoke(&mut fb, [(&foreign).into()]);

        let err = fb.finish("f", (&c).into()).unwrap_err();
        assert!(matches!(err, Error::Build { .. }));
    }

    #[test]
    fn params_are_visible_during_build() {
        let fb = FlowBuilder::new(BTreeMap::from([("day".to_string(), json!("2024-06-01"))]));
        assert_eq!(fb.param("day"), Some(&json!("2024-06-01")));
    }
}
