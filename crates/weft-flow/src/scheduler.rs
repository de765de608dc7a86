//! The single-run scheduler.
//!
//! Drives one flow plan to completion: promotes nodes whose dependencies
//! are settled into a priority-ordered ready set, dispatches them under the
//! run's concurrency bound, expands fan-out barriers when their sources
//! succeed, and applies the run's failure policy. The driver itself is a
//! single cooperative loop: it never blocks on task work, only awaits the
//! next completion.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::build::{ArgBinding, BuildNodeKind, FlowPlan, NodeId};
use crate::context::RunContext;
use crate::error::{Error, Result, TaskFailure};
use crate::pipeline;
use crate::runtime::Runtime;
use crate::task::TaskDefinition;
use crate::value::{failure_sentinel, TaskArgs, TaskValue};

/// How a run responds to a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Cancel in-flight work on the first failure and surface it.
    #[default]
    FailFast,
    /// Keep dispatching; failed dependencies are delivered as sentinel
    /// values. Failures are aggregated at run end.
    Continue,
    /// Keep independent work running, but skip dependents of failures
    /// without dispatching them. Root failures are aggregated at run end.
    Aggregate,
}

impl FailurePolicy {
    /// Stable label for logs and exports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::Continue => "continue",
            Self::Aggregate => "aggregate",
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            "aggregate" => Ok(Self::Aggregate),
            _ => Err(()),
        }
    }
}

/// Scheduler-owned state of one node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies settled; queued for dispatch.
    Ready,
    /// Dispatched; executing.
    Running,
    /// Fan-out barrier whose children are being created or awaited.
    Expanding,
    /// Terminal: completed with a value.
    Succeeded,
    /// Terminal: completed with an error.
    Failed,
    /// Terminal: stopped by cancellation before completing.
    Cancelled,
    /// Terminal: never dispatched because an upstream failed.
    Skipped,
}

impl NodeState {
    /// True for states no transition leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// Ready-set ordering key: higher priority first, declaration order as the
/// tie-break.
struct ReadyKey {
    priority: i32,
    seq: usize,
    id: NodeId,
}

impl PartialEq for ReadyKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyKey {}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum: prefer high priority, then low seq.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum EntryKind {
    Task {
        task: TaskDefinition,
        args: Vec<ArgBinding>,
        named: BTreeMap<String, ArgBinding>,
    },
    Barrier {
        source: NodeId,
        child_task: TaskDefinition,
        children: Vec<NodeId>,
    },
}

struct NodeEntry {
    seq: usize,
    priority: i32,
    state: NodeState,
    remaining: usize,
    dependents: Vec<NodeId>,
    kind: EntryKind,
}

type DispatchHandle = JoinHandle<(NodeId, Result<TaskValue>)>;

pub(crate) struct Scheduler {
    runtime: Arc<Runtime>,
    ctx: Arc<RunContext>,
    policy: FailurePolicy,
    max_concurrency: usize,
    flow: String,
    entries: HashMap<NodeId, NodeEntry>,
    ready: BinaryHeap<ReadyKey>,
    results: HashMap<NodeId, TaskValue>,
    failures: Vec<TaskFailure>,
    output: ArgBinding,
    counters: HashMap<String, usize>,
    next_seq: usize,
    dynamic_spawned: usize,
    max_dynamic: usize,
    fatal: Option<Error>,
}

impl Scheduler {
    pub(crate) fn new(
        plan: FlowPlan,
        runtime: Arc<Runtime>,
        ctx: Arc<RunContext>,
        policy: FailurePolicy,
        max_concurrency: Option<usize>,
    ) -> Self {
        let max_dynamic = runtime.config().max_dynamic_tasks;
        let mut entries = HashMap::with_capacity(plan.nodes.len());
        let mut ready = BinaryHeap::new();

        let FlowPlan {
            flow,
            graph,
            nodes,
            order,
            output,
            counters,
            next_seq,
        } = plan;

        for id in &order {
            let Some(node) = nodes.get(id) else { continue };
            let deps = graph.dependencies_of(id);
            let dependents = graph.dependents_of(id);
            let kind = match &node.kind {
                BuildNodeKind::Task { task, args, named } => EntryKind::Task {
                    task: task.clone(),
                    args: args.clone(),
                    named: named.clone(),
                },
                BuildNodeKind::FanOut {
                    source, child_task, ..
                } => EntryKind::Barrier {
                    source: source.clone(),
                    child_task: child_task.clone(),
                    children: Vec::new(),
                },
            };
            let entry = NodeEntry {
                seq: node.seq,
                priority: node.priority,
                state: NodeState::Pending,
                remaining: deps.len(),
                dependents,
                kind,
            };
            if entry.remaining == 0 {
                ready.push(ReadyKey {
                    priority: entry.priority,
                    seq: entry.seq,
                    id: id.clone(),
                });
            }
            entries.insert(id.clone(), entry);
        }

        for entry in entries.values_mut() {
            if entry.remaining == 0 {
                entry.state = NodeState::Ready;
            }
        }

        Self {
            runtime,
            ctx,
            policy,
            max_concurrency: max_concurrency.unwrap_or(usize::MAX).max(1),
            flow,
            entries,
            ready,
            results: HashMap::new(),
            failures: Vec::new(),
            output,
            counters,
            next_seq,
            dynamic_spawned: 0,
            max_dynamic,
            fatal: None,
        }
    }

    /// Drives the plan to completion and resolves the flow output.
    pub(crate) async fn run(&mut self) -> Result<TaskValue> {
        let mut running: FuturesUnordered<DispatchHandle> = FuturesUnordered::new();
        let mut in_flight = 0usize;

        loop {
            if self.ctx.is_cancelled() && self.fatal.is_none() {
                self.fatal = Some(Error::RunCancelled {
                    flow: self.flow.clone(),
                });
            }
            if self.fatal.is_some() {
                self.drain(&mut running, in_flight).await;
                self.cancel_unstarted();
                return Err(self
                    .fatal
                    .take()
                    .unwrap_or_else(|| Error::Internal {
                        message: "fatal flag set without an error".to_string(),
                    }));
            }

            // Fill free slots from the ready set. Barrier expansion is graph
            // surgery, not a dispatch; it consumes no slot.
            while in_flight < self.max_concurrency {
                let Some(key) = self.ready.pop() else { break };
                let action = {
                    let Some(entry) = self.entries.get(&key.id) else {
                        continue;
                    };
                    if entry.state != NodeState::Ready {
                        continue;
                    }
                    match &entry.kind {
                        EntryKind::Barrier { .. } => None,
                        EntryKind::Task { task, args, named } => {
                            Some((task.clone(), args.clone(), named.clone()))
                        }
                    }
                };
                match action {
                    None => self.expand_barrier(&key.id),
                    Some((task, args, named)) => match self.resolve_args(&args, &named) {
                        Ok(resolved) => {
                            if let Some(entry) = self.entries.get_mut(&key.id) {
                                entry.state = NodeState::Running;
                            }
                            debug!(node = %key.id, task = task.name(), "dispatching");
                            let handle = self.spawn_dispatch(key.id.clone(), task, resolved);
                            running.push(handle);
                            in_flight += 1;
                        }
                        Err(e) => self.node_failed(&key.id, e),
                    },
                }
                if self.fatal.is_some() {
                    break;
                }
            }

            if self.fatal.is_some() {
                continue;
            }
            if in_flight == 0 {
                break;
            }

            let Some(joined) = running.next().await else {
                break;
            };
            in_flight -= 1;
            self.handle_join(joined);
        }

        if self.entries.values().any(|e| !e.state.is_terminal()) {
            return Err(Error::Internal {
                message: "run ended with non-terminal nodes".to_string(),
            });
        }

        if self.policy != FailurePolicy::FailFast && !self.failures.is_empty() {
            let mut failures = std::mem::take(&mut self.failures);
            failures.sort_by_key(|f| f.seq);
            return Err(Error::Aggregate { failures });
        }

        let output = self.output.clone();
        self.resolve_binding(&output)
    }

    pub(crate) fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        self.entries.get(id).map(|e| e.state)
    }

    fn spawn_dispatch(
        &self,
        id: NodeId,
        task: TaskDefinition,
        args: TaskArgs,
    ) -> DispatchHandle {
        let runtime = Arc::clone(&self.runtime);
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let result = pipeline::dispatch(runtime, ctx, id.clone(), task, args).await;
            (id, result)
        })
    }

    fn handle_join(
        &mut self,
        joined: std::result::Result<(NodeId, Result<TaskValue>), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((id, Ok(value))) => self.complete_success(&id, value),
            Ok((id, Err(e))) if e.is_cancellation() => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.state = NodeState::Cancelled;
                }
            }
            Ok((id, Err(e))) => self.node_failed(&id, e),
            Err(join_error) => {
                // A panicking dispatch is a scheduler-level fault: we cannot
                // attribute it to a node, so the run dies regardless of policy.
                self.fatal = Some(Error::Internal {
                    message: format!("dispatch task panicked: {join_error}"),
                });
                self.ctx.cancel();
            }
        }
    }

    fn complete_success(&mut self, id: &NodeId, value: TaskValue) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.state = NodeState::Succeeded;
        }
        self.results.insert(id.clone(), value);
        self.promote_dependents(id);
    }

    fn node_failed(&mut self, id: &NodeId, error: Error) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.state = NodeState::Failed;
        let (task_label, seq) = (label_of(&entry.kind), entry.seq);

        match self.policy {
            FailurePolicy::FailFast => {
                self.fatal = Some(error);
                self.ctx.cancel();
            }
            FailurePolicy::Continue => {
                let sentinel = failure_sentinel(&task_label, id.as_str(), &error.to_string());
                self.results.insert(id.clone(), sentinel);
                self.failures.push(TaskFailure {
                    task: task_label,
                    node: id.to_string(),
                    seq,
                    error: Arc::new(error),
                });
                self.promote_dependents(id);
            }
            FailurePolicy::Aggregate => {
                self.failures.push(TaskFailure {
                    task: task_label,
                    node: id.to_string(),
                    seq,
                    error: Arc::new(error),
                });
                self.skip_dependents(id);
            }
        }
    }

    fn promote_dependents(&mut self, id: &NodeId) {
        let dependents = match self.entries.get(id) {
            Some(entry) => entry.dependents.clone(),
            None => return,
        };
        for dep_id in dependents {
            let mut collect = false;
            {
                let Some(entry) = self.entries.get_mut(&dep_id) else {
                    continue;
                };
                if !matches!(entry.state, NodeState::Pending | NodeState::Expanding) {
                    continue;
                }
                entry.remaining = entry.remaining.saturating_sub(1);
                if entry.remaining > 0 {
                    continue;
                }
                if entry.state == NodeState::Expanding {
                    collect = true;
                } else {
                    entry.state = NodeState::Ready;
                    self.ready.push(ReadyKey {
                        priority: entry.priority,
                        seq: entry.seq,
                        id: dep_id.clone(),
                    });
                }
            }
            if collect {
                // All children settled: the barrier completes with their
                // ordered results.
                self.collect_barrier(&dep_id);
            }
        }
    }

    fn skip_dependents(&mut self, id: &NodeId) {
        let mut stack = match self.entries.get(id) {
            Some(entry) => entry.dependents.clone(),
            None => return,
        };
        while let Some(dep_id) = stack.pop() {
            let Some(entry) = self.entries.get_mut(&dep_id) else {
                continue;
            };
            if !matches!(entry.state, NodeState::Pending | NodeState::Expanding) {
                continue;
            }
            entry.state = NodeState::Skipped;
            debug!(node = %dep_id, "skipped: upstream failed");
            stack.extend(entry.dependents.iter().cloned());
        }
    }

    /// Materializes a barrier: reads the source's iterable result, creates
    /// one child invocation per element, and re-wires the barrier to wait
    /// for them.
    fn expand_barrier(&mut self, id: &NodeId) {
        let (source, child_task) = {
            let Some(entry) = self.entries.get_mut(id) else {
                return;
            };
            entry.state = NodeState::Expanding;
            let EntryKind::Barrier {
                source, child_task, ..
            } = &entry.kind
            else {
                return;
            };
            (source.clone(), child_task.clone())
        };

        let Some(source_value) = self.results.get(&source).cloned() else {
            self.node_failed(
                id,
                Error::Internal {
                    message: format!("fan-out source '{source}' has no result"),
                },
            );
            return;
        };

        let Some(items) = source_value.as_array().cloned() else {
            self.node_failed(
                id,
                Error::DynamicExpansion {
                    node: id.to_string(),
                    reason: format!(
                        "source '{source}' must yield an array, got {}",
                        kind_name(&source_value)
                    ),
                },
            );
            return;
        };

        if self.dynamic_spawned + items.len() > self.max_dynamic {
            self.node_failed(
                id,
                Error::DynamicExpansion {
                    node: id.to_string(),
                    reason: format!(
                        "expansion of {} children exceeds max_dynamic_tasks ({})",
                        items.len(),
                        self.max_dynamic
                    ),
                },
            );
            return;
        }
        self.dynamic_spawned += items.len();

        if items.is_empty() {
            self.complete_success(id, TaskValue::Array(Vec::new()));
            return;
        }

        debug!(barrier = %id, children = items.len(), task = child_task.name(), "expanding fan-out");
        let mut children = Vec::with_capacity(items.len());
        for item in items {
            let counter = self
                .counters
                .entry(child_task.name().to_string())
                .or_insert(0);
            *counter += 1;
            let child_id = NodeId::task(child_task.name(), *counter);
            let seq = self.next_seq;
            self.next_seq += 1;

            self.entries.insert(
                child_id.clone(),
                NodeEntry {
                    seq,
                    priority: child_task.priority(),
                    state: NodeState::Ready,
                    remaining: 0,
                    dependents: vec![id.clone()],
                    kind: EntryKind::Task {
                        task: child_task.clone(),
                        args: vec![ArgBinding::Literal(item)],
                        named: BTreeMap::new(),
                    },
                },
            );
            self.ready.push(ReadyKey {
                priority: child_task.priority(),
                seq,
                id: child_id.clone(),
            });
            children.push(child_id);
        }

        if let Some(entry) = self.entries.get_mut(id) {
            entry.remaining = children.len();
            if let EntryKind::Barrier {
                children: slot, ..
            } = &mut entry.kind
            {
                *slot = children;
            }
        }
    }

    fn collect_barrier(&mut self, id: &NodeId) {
        let children = match self.entries.get(id) {
            Some(NodeEntry {
                kind: EntryKind::Barrier { children, .. },
                ..
            }) => children.clone(),
            _ => return,
        };
        let mut values = Vec::with_capacity(children.len());
        for child in &children {
            match self.results.get(child) {
                Some(value) => values.push(value.clone()),
                None => {
                    self.node_failed(
                        id,
                        Error::Internal {
                            message: format!("barrier child '{child}' completed without a result"),
                        },
                    );
                    return;
                }
            }
        }
        self.complete_success(id, TaskValue::Array(values));
    }

    /// Awaits in-flight dispatches after a fatal trigger. Async tasks
    /// observe the cancel token and return promptly; thread and process
    /// dispatches run to natural completion.
    async fn drain(
        &mut self,
        running: &mut FuturesUnordered<DispatchHandle>,
        mut in_flight: usize,
    ) {
        while in_flight > 0 {
            let Some(joined) = running.next().await else {
                break;
            };
            in_flight -= 1;
            match joined {
                Ok((id, Ok(value))) => {
                    // Completed before observing the signal; keep the value
                    // but promote nothing.
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.state = NodeState::Succeeded;
                    }
                    self.results.insert(id, value);
                }
                Ok((id, Err(_))) => {
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.state = NodeState::Cancelled;
                    }
                }
                Err(_) => {}
            }
        }
    }

    fn cancel_unstarted(&mut self) {
        for entry in self.entries.values_mut() {
            if !entry.state.is_terminal() {
                entry.state = NodeState::Cancelled;
            }
        }
    }

    fn resolve_args(
        &self,
        args: &[ArgBinding],
        named: &BTreeMap<String, ArgBinding>,
    ) -> Result<TaskArgs> {
        let positional = args
            .iter()
            .map(|b| self.resolve_binding(b))
            .collect::<Result<Vec<_>>>()?;
        let mut out = TaskArgs::from_positional(positional);
        for (key, binding) in named {
            out = out.with_named(key.clone(), self.resolve_binding(binding)?);
        }
        Ok(out)
    }

    fn resolve_binding(&self, binding: &ArgBinding) -> Result<TaskValue> {
        match binding {
            ArgBinding::Literal(value) => Ok(value.clone()),
            ArgBinding::Node(id) | ArgBinding::FanOut(id) => {
                self.results.get(id).cloned().ok_or_else(|| Error::Internal {
                    message: format!("dependency '{id}' was not resolved before use"),
                })
            }
            ArgBinding::List(items) => Ok(TaskValue::Array(
                items
                    .iter()
                    .map(|b| self.resolve_binding(b))
                    .collect::<Result<Vec<_>>>()?,
            )),
            ArgBinding::Map(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), self.resolve_binding(value)?);
                }
                Ok(TaskValue::Object(map))
            }
        }
    }
}

fn label_of(kind: &EntryKind) -> String {
    match kind {
        EntryKind::Task { task, .. } => task.name().to_string(),
        EntryKind::Barrier { child_task, .. } => format!("fan_out({})", child_task.name()),
    }
}

fn kind_name(value: &TaskValue) -> &'static str {
    match value {
        TaskValue::Null => "null",
        TaskValue::Bool(_) => "bool",
        TaskValue::Number(_) => "number",
        TaskValue::String(_) => "string",
        TaskValue::Array(_) => "array",
        TaskValue::Object(_) => "object",
    }
}

/// Executes a plan and resolves the flow's output value.
pub(crate) async fn execute(
    plan: FlowPlan,
    runtime: Arc<Runtime>,
    ctx: Arc<RunContext>,
    policy: FailurePolicy,
    max_concurrency: Option<usize>,
) -> Result<TaskValue> {
    let mut scheduler = Scheduler::new(plan, runtime, ctx, policy, max_concurrency);
    scheduler.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{lit, FlowBuilder};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use weft_core::EngineConfig;

    fn test_runtime() -> Arc<Runtime> {
        Arc::new(Runtime::with_config(EngineConfig::default()).unwrap())
    }

    fn run_ctx() -> Arc<RunContext> {
        Arc::new(RunContext::new("test", BTreeMap::new()))
    }

    fn add_task() -> TaskDefinition {
        TaskDefinition::builder("add").build_blocking(|args| {
            Ok(json!(args.decode::<i64>(0)? + args.decode::<i64>(1)?))
        })
    }

    #[tokio::test]
    async fn linear_chain_resolves_dependencies() {
        let mut fb = FlowBuilder::new(BTreeMap::new());
        let add = add_task();
        let first = add.invoke(&mut fb, [lit(1), lit(2)]);
        let second = add.invoke(&mut fb, [(&first).into(), lit(10)]);
        let plan = fb.finish("chain", (&second).into()).unwrap();

        let value = execute(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, None)
            .await
            .unwrap();
        assert_eq!(value, json!(13));
    }

    #[tokio::test]
    async fn ready_nodes_dispatch_by_priority_then_declaration() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let make = |name: &str, priority: i32| {
            let order = Arc::clone(&order);
            let name_owned = name.to_string();
            TaskDefinition::builder(name)
                .priority(priority)
                .build_async(move |_| {
                    let order = Arc::clone(&order);
                    let name = name_owned.clone();
                    async move {
                        order.lock().unwrap().push(name);
                        Ok(TaskValue::Null)
                    }
                })
        };

        let low = make("low", -1);
        let mid = make("mid", 0);
        let high = make("high", 5);

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let a = low.invoke(&mut fb, []);
        let b = mid.invoke(&mut fb, []);
        let c = high.invoke(&mut fb, []);
        let plan = fb
            .finish(
                "prio",
                ArgBinding::List(vec![(&a).into(), (&b).into(), (&c).into()]),
            )
            .unwrap();

        // Concurrency 1 serializes dispatch, exposing the ready ordering.
        execute(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, Some(1))
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn concurrency_bound_is_never_exceeded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let active_c = Arc::clone(&active);
        let peak_c = Arc::clone(&peak);
        let probe = TaskDefinition::builder("probe").build_async(move |_| {
            let active = Arc::clone(&active_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                peak.fetch_max(now, AtomicOrdering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                active.fetch_sub(1, AtomicOrdering::SeqCst);
                Ok(TaskValue::Null)
            }
        });

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let invocations: Vec<ArgBinding> = (0..6)
            .map(|_| ArgBinding::from(probe.invoke(&mut fb, [])))
            .collect();
        let plan = fb.finish("bounded", ArgBinding::List(invocations)).unwrap();

        execute(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, Some(2))
            .await
            .unwrap();
        assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn fail_fast_cancels_pending_and_running_work() {
        let slow = TaskDefinition::builder("slow").build_async(|_| async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(TaskValue::Null)
        });
        let bomb = TaskDefinition::builder("bomb").build_async(|_| async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Err("kaboom".into())
        });

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let a = slow.invoke(&mut fb, []);
        let b = bomb.invoke(&mut fb, []);
        let plan = fb
            .finish("ff", ArgBinding::List(vec![(&a).into(), (&b).into()]))
            .unwrap();

        let mut scheduler = Scheduler::new(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, Some(2));
        let started = std::time::Instant::now();
        let err = scheduler.run().await.unwrap_err();

        assert!(matches!(err, Error::TaskExecution { ref task, .. } if task == "bomb"));
        assert_eq!(scheduler.state_of(a.id()), Some(NodeState::Cancelled));
        assert_eq!(scheduler.state_of(b.id()), Some(NodeState::Failed));
        // The 5s sleeper was cancelled cooperatively, not awaited out.
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn continue_policy_delivers_sentinels_and_aggregates() {
        let boom = TaskDefinition::builder("boom").build_blocking(|_| Err("nope".into()));
        let probe = TaskDefinition::builder("probe").build_blocking(|args| {
            let got_sentinel = crate::value::is_failure_sentinel(args.get(0).unwrap_or(&TaskValue::Null));
            Ok(json!(got_sentinel))
        });

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let failed = boom.invoke(&mut fb, []);
        let after = probe.invoke(&mut fb, [(&failed).into()]);
        let plan = fb.finish("cont", (&after).into()).unwrap();

        let mut scheduler = Scheduler::new(plan, test_runtime(), run_ctx(), FailurePolicy::Continue, None);
        let err = scheduler.run().await.unwrap_err();

        // The dependent ran (and saw the sentinel), yet the run reports the failure.
        assert_eq!(scheduler.state_of(after.id()), Some(NodeState::Succeeded));
        match err {
            Error::Aggregate { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].task, "boom");
            }
            other => panic!("expected aggregate error, got {other}"),
        }
    }

    #[tokio::test]
    async fn aggregate_policy_skips_dependents_without_dispatch() {
        let dispatched = Arc::new(AtomicUsize::new(0));

        let boom = TaskDefinition::builder("boom").build_blocking(|_| Err("nope".into()));
        let dispatched_c = Arc::clone(&dispatched);
        let downstream = TaskDefinition::builder("downstream").build_blocking(move |_| {
            dispatched_c.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(TaskValue::Null)
        });
        let ok = TaskDefinition::builder("ok").build_blocking(|_| Ok(json!(1)));

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let failed = boom.invoke(&mut fb, []);
        let skipped = downstream.invoke(&mut fb, [(&failed).into()]);
        let fine = ok.invoke(&mut fb, []);
        let plan = fb
            .finish("agg", ArgBinding::List(vec![(&skipped).into(), (&fine).into()]))
            .unwrap();

        let mut scheduler = Scheduler::new(plan, test_runtime(), run_ctx(), FailurePolicy::Aggregate, None);
        let err = scheduler.run().await.unwrap_err();

        assert!(matches!(err, Error::Aggregate { ref failures } if failures.len() == 1));
        assert_eq!(scheduler.state_of(skipped.id()), Some(NodeState::Skipped));
        assert_eq!(scheduler.state_of(fine.id()), Some(NodeState::Succeeded));
        assert_eq!(dispatched.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dynamic_fan_out_expands_and_collects_in_order() {
        let list_urls = TaskDefinition::builder("list_urls")
            .build_blocking(|_| Ok(json!(["a", "bb", "ccc"])));
        let fetch = TaskDefinition::builder("fetch")
            .build_blocking(|args| Ok(json!(args.decode::<String>(0)?.len())));
        let agg = TaskDefinition::builder("agg").build_blocking(|args| {
            Ok(json!(args.decode::<Vec<i64>>(0)?.iter().sum::<i64>()))
        });

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let urls = list_urls.invoke(&mut fb, []);
        let fanned = fb.fan_out(&fetch, &urls, None);
        let total = agg.invoke(&mut fb, [fanned.binding()]);
        let plan = fb.finish("fan", (&total).into()).unwrap();

        let value = execute(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, None)
            .await
            .unwrap();
        assert_eq!(value, json!(6));
    }

    #[tokio::test]
    async fn fan_out_of_non_array_source_fails_with_expansion_error() {
        let scalar = TaskDefinition::builder("scalar").build_blocking(|_| Ok(json!(42)));
        let child = TaskDefinition::builder("child").build_blocking(|_| Ok(TaskValue::Null));

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let s = scalar.invoke(&mut fb, []);
        let fanned = fb.fan_out(&child, &s, None);
        let plan = fb.finish("bad", fanned.binding()).unwrap();

        let err = execute(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DynamicExpansion { .. }));
    }

    #[tokio::test]
    async fn guardrail_bounds_dynamic_expansion() {
        let mut config = EngineConfig::default();
        config.max_dynamic_tasks = 2;
        let runtime = Arc::new(Runtime::with_config(config).unwrap());

        let source = TaskDefinition::builder("source").build_blocking(|_| Ok(json!([1, 2, 3])));
        let child = TaskDefinition::builder("child").build_blocking(|_| Ok(TaskValue::Null));

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let s = source.invoke(&mut fb, []);
        let fanned = fb.fan_out(&child, &s, None);
        let plan = fb.finish("guard", fanned.binding()).unwrap();

        let err = execute(plan, runtime, run_ctx(), FailurePolicy::FailFast, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::DynamicExpansion { ref reason, .. } if reason.contains("max_dynamic_tasks"))
        );
    }

    #[tokio::test]
    async fn empty_fan_out_completes_with_an_empty_list() {
        let source = TaskDefinition::builder("source").build_blocking(|_| Ok(json!([])));
        let child = TaskDefinition::builder("child").build_blocking(|_| Ok(TaskValue::Null));

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let s = source.invoke(&mut fb, []);
        let fanned = fb.fan_out(&child, &s, None);
        let plan = fb.finish("empty", fanned.binding()).unwrap();

        let value = execute(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, None)
            .await
            .unwrap();
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn nested_fan_out_expands_uniformly() {
        let seed = TaskDefinition::builder("seed").build_blocking(|_| Ok(json!([1, 2])));
        let double = TaskDefinition::builder("double")
            .build_blocking(|args| Ok(json!(args.decode::<i64>(0)? * 2)));
        let add_ten = TaskDefinition::builder("add_ten")
            .build_blocking(|args| Ok(json!(args.decode::<i64>(0)? + 10)));

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let s = seed.invoke(&mut fb, []);
        let doubled = fb.fan_out(&double, &s, None);
        let shifted = fb.fan_out(&add_ten, &doubled, None);
        let plan = fb.finish("nested", shifted.binding()).unwrap();

        let value = execute(plan, test_runtime(), run_ctx(), FailurePolicy::FailFast, None)
            .await
            .unwrap();
        assert_eq!(value, json!([12, 14]));
    }

    #[tokio::test]
    async fn external_cancellation_stops_the_run() {
        let slow = TaskDefinition::builder("slow").build_async(|_| async {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Ok(TaskValue::Null)
        });

        let mut fb = FlowBuilder::new(BTreeMap::new());
        let a = slow.invoke(&mut fb, []);
        let plan = fb.finish("cancel", (&a).into()).unwrap();

        let ctx = run_ctx();
        let cancel = ctx.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = execute(plan, test_runtime(), ctx, FailurePolicy::FailFast, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunCancelled { .. }));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }
}
