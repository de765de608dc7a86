//! Fan-out: one upstream iterable, one child task per element.
//!
//! Two shapes, chosen by what the source is at build time:
//!
//! - a concrete list of values → **static** expansion; children are plain
//!   invocations created immediately, in source order;
//! - a placeholder (an invocation, or a prior fan-out) → **dynamic**
//!   expansion; a barrier node is registered, and children are created by
//!   the scheduler after the source succeeds. Downstream consumers depend on
//!   the barrier and receive the ordered list of child results.

use crate::build::{ArgBinding, FlowBuilder, Invocation, NodeId};
use crate::task::TaskDefinition;
use crate::value::TaskValue;

/// What a fan-out iterates over.
pub enum FanOutSource {
    /// Values known at build time.
    Values(Vec<TaskValue>),
    /// Invocations known at build time (one child per invocation result).
    Invocations(Vec<Invocation>),
    /// The future result of a single invocation; must yield an array.
    Node(Invocation),
    /// The collected children of a prior dynamic fan-out.
    Barrier(NodeId),
}

impl From<Vec<TaskValue>> for FanOutSource {
    fn from(values: Vec<TaskValue>) -> Self {
        Self::Values(values)
    }
}

impl From<&Invocation> for FanOutSource {
    fn from(invocation: &Invocation) -> Self {
        Self::Node(invocation.clone())
    }
}

impl From<Invocation> for FanOutSource {
    fn from(invocation: Invocation) -> Self {
        Self::Node(invocation)
    }
}

impl From<&FanOut> for FanOutSource {
    fn from(fanout: &FanOut) -> Self {
        match fanout {
            FanOut::Static(children) => Self::Invocations(children.clone()),
            FanOut::Dynamic { barrier, .. } => Self::Barrier(barrier.clone()),
        }
    }
}

/// Result of declaring a fan-out.
pub enum FanOut {
    /// Children created at build time, in source order.
    Static(Vec<Invocation>),
    /// A barrier expanded at runtime.
    Dynamic {
        /// The barrier node standing in for the ordered child results.
        barrier: NodeId,
        /// Name of the child task, for display.
        child_task: String,
    },
}

impl FanOut {
    /// Binds this fan-out into an argument position: static children become
    /// an ordered list of references, a dynamic barrier becomes a barrier
    /// reference delivering the ordered child results at execution time.
    #[must_use]
    pub fn binding(&self) -> ArgBinding {
        match self {
            Self::Static(children) => {
                ArgBinding::List(children.iter().map(ArgBinding::from).collect())
            }
            Self::Dynamic { barrier, .. } => ArgBinding::FanOut(barrier.clone()),
        }
    }

    /// The static children, when expansion happened at build time.
    #[must_use]
    pub fn static_children(&self) -> Option<&[Invocation]> {
        match self {
            Self::Static(children) => Some(children),
            Self::Dynamic { .. } => None,
        }
    }
}

impl From<&FanOut> for ArgBinding {
    fn from(fanout: &FanOut) -> Self {
        fanout.binding()
    }
}

impl FlowBuilder {
    /// Declares a fan-out of `child_task` over `source`.
    ///
    /// `max_concurrency` is recorded as an advisory hint; the run-wide
    /// concurrency bound is what limits dispatch.
    pub fn fan_out(
        &mut self,
        child_task: &TaskDefinition,
        source: impl Into<FanOutSource>,
        max_concurrency: Option<usize>,
    ) -> FanOut {
        match source.into() {
            FanOutSource::Values(values) => {
                let children = values
                    .into_iter()
                    .map(|value| child_task.invoke(self, [ArgBinding::Literal(value)]))
                    .collect();
                FanOut::Static(children)
            }
            FanOutSource::Invocations(invocations) => {
                let children = invocations
                    .into_iter()
                    .map(|inv| child_task.invoke(self, [ArgBinding::from(inv)]))
                    .collect();
                FanOut::Static(children)
            }
            FanOutSource::Node(invocation) => {
                let barrier =
                    self.register_fanout(invocation.id().clone(), child_task, max_concurrency);
                FanOut::Dynamic {
                    barrier,
                    child_task: child_task.name().to_string(),
                }
            }
            FanOutSource::Barrier(source_barrier) => {
                let barrier = self.register_fanout(source_barrier, child_task, max_concurrency);
                FanOut::Dynamic {
                    barrier,
                    child_task: child_task.name().to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::lit;
    use crate::dag::GraphNodeKind;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn noop(name: &str) -> TaskDefinition {
        TaskDefinition::builder(name).build_blocking(|_| Ok(TaskValue::Null))
    }

    #[test]
    fn static_fan_out_creates_ordered_invocations() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let square = noop("square");

        let fanned = fb.fan_out(&square, vec![json!(1), json!(2), json!(3)], None);
        let children = fanned.static_children().unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].id().as_str(), "square:1");
        assert_eq!(children[2].id().as_str(), "square:3");
    }

    #[test]
    fn dynamic_fan_out_registers_a_barrier() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let list_urls = noop("list_urls");
        let fetch = noop("fetch");
        let agg = noop("agg");

        let urls = list_urls.invoke(&mut fb, []);
        let fanned = fb.fan_out(&fetch, &urls, None);
        let out = agg.invoke(&mut fb, [fanned.binding()]);

        let plan = fb.finish("f", (&out).into()).unwrap();
        let barrier = NodeId::fanout(1);
        assert_eq!(plan.graph.kind_of(&barrier), Some(GraphNodeKind::FanOut));

        // Consumer depends on the barrier, never directly on the source.
        let agg_deps = plan.graph.dependencies_of(out.id());
        assert_eq!(agg_deps, vec![barrier.clone()]);
        let barrier_deps = plan.graph.dependencies_of(&barrier);
        assert_eq!(barrier_deps, vec![urls.id().clone()]);
    }

    #[test]
    fn nested_dynamic_fan_out_chains_barriers() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let seed = noop("seed");
        let expand = noop("expand");
        let refine = noop("refine");
        let collect = noop("collect");

        let s = seed.invoke(&mut fb, []);
        let first = fb.fan_out(&expand, &s, None);
        let second = fb.fan_out(&refine, &first, None);
        let out = collect.invoke(&mut fb, [second.binding()]);

        let plan = fb.finish("f", (&out).into()).unwrap();
        let outer = NodeId::fanout(2);
        let inner = NodeId::fanout(1);
        assert_eq!(plan.graph.dependencies_of(&outer), vec![inner]);
    }

    #[test]
    fn fan_out_over_static_children_consumes_their_results() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let produce = noop("produce");
        let refine = noop("refine");
        let collect = noop("collect");

        let batch = fb.fan_out(&produce, vec![json!("a"), json!("b")], None);
        let refined = fb.fan_out(&refine, &batch, None);
        let children = refined.static_children().unwrap();
        assert_eq!(children.len(), 2);

        let out = collect.invoke(&mut fb, [refined.binding(), lit(0)]);
        let plan = fb.finish("f", (&out).into()).unwrap();
        // refine:1 depends on produce:1, and so on pairwise.
        assert_eq!(
            plan.graph.dependencies_of(children[0].id()),
            vec![NodeId::task("produce", 1)]
        );
        assert_eq!(
            plan.graph.dependencies_of(children[1].id()),
            vec![NodeId::task("produce", 2)]
        );
    }
}
