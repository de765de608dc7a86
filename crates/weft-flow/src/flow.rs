//! Flows: a build function plus a name.
//!
//! A flow's build function runs against a [`FlowBuilder`] and returns the
//! output binding: the structure of placeholders and literals the run
//! resolves into the final value. Building never executes tasks; `run`
//! builds a fresh plan, hands it to the scheduler, and returns the resolved
//! output.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use crate::build::{ArgBinding, FlowBuilder, FlowPlan};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::events::names as events;
use crate::runtime::{runtime, Runtime};
use crate::scheduler::{self, FailurePolicy};
use crate::value::TaskValue;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Parameters exposed to the build and, via the run context, to tasks.
    pub params: BTreeMap<String, TaskValue>,
    /// How the run responds to task failures.
    pub failure_policy: FailurePolicy,
    /// Bound on concurrently running tasks; unbounded when `None`.
    pub max_concurrency: Option<usize>,
}

impl RunOptions {
    /// Default options: no params, fail-fast, unbounded concurrency.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: TaskValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn max_concurrency(mut self, bound: usize) -> Self {
        self.max_concurrency = Some(bound);
        self
    }
}

type BuildFn = dyn Fn(&mut FlowBuilder) -> Result<ArgBinding> + Send + Sync;

/// A named, runnable DAG of tasks.
pub struct Flow {
    name: String,
    build_fn: Arc<BuildFn>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Flow {
    /// Creates a flow from a build function.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        build_fn: impl Fn(&mut FlowBuilder) -> Result<ArgBinding> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            build_fn: Arc::new(build_fn),
        }
    }

    /// The flow's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn plan(&self, params: &BTreeMap<String, TaskValue>) -> Result<FlowPlan> {
        let mut builder = FlowBuilder::new(params.clone());
        let output = (self.build_fn)(&mut builder)?;
        builder.finish(&self.name, output)
    }

    /// Runs the flow on the process-wide runtime.
    ///
    /// # Errors
    ///
    /// Returns a build error, the first terminal failure under fail-fast,
    /// or [`Error::Aggregate`] under the other policies.
    pub async fn run(&self, options: RunOptions) -> Result<TaskValue> {
        self.run_with(runtime(), options).await
    }

    /// Runs the flow on an explicit runtime.
    ///
    /// # Errors
    ///
    /// See [`Flow::run`].
    pub async fn run_with(&self, runtime: Arc<Runtime>, options: RunOptions) -> Result<TaskValue> {
        let ctx = Arc::new(RunContext::new(&self.name, options.params.clone()));
        runtime.install_run_context(Arc::clone(&ctx));
        let result = self.run_inner(&runtime, ctx, options).await;
        runtime.clear_run_context();
        result
    }

    async fn run_inner(
        &self,
        runtime: &Arc<Runtime>,
        ctx: Arc<RunContext>,
        options: RunOptions,
    ) -> Result<TaskValue> {
        runtime.events().emit(
            events::FLOW_STARTED,
            json!({ "flow": self.name, "run_id": ctx.run_id.to_string() }),
        );
        let span = runtime.tracer().span(
            &format!("flow:{}", self.name),
            &[("run_id", ctx.run_id.to_string())],
        );

        let plan = self.plan(&options.params)?;
        let task_count = plan.graph.node_count();
        let run_id = ctx.run_id;

        let value = scheduler::execute(
            plan,
            Arc::clone(runtime),
            ctx,
            options.failure_policy,
            options.max_concurrency,
        )
        .await?;

        drop(span);
        runtime.events().emit(
            events::FLOW_COMPLETED,
            json!({ "flow": self.name, "run_id": run_id.to_string(), "tasks": task_count }),
        );
        Ok(value)
    }

    /// Synchronous wrapper around [`Flow::run`] for non-async callers.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Internal`] when invoked from inside an async
    /// context, otherwise surfaces the same errors as `run`.
    pub fn run_blocking(&self, options: RunOptions) -> Result<TaskValue> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::Internal {
                message: "run_blocking invoked inside an async context; use run()".to_string(),
            });
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Internal {
                message: format!("failed to build runtime for flow run: {e}"),
            })?;
        rt.block_on(self.run(options))
    }

    /// Builds the DAG (without executing) and returns its adjacency JSON:
    /// `{"flow", "nodes": [{id, label, kind}], "edges": [{from, to}], "count"}`.
    ///
    /// # Errors
    ///
    /// Returns build errors only.
    pub fn describe(&self) -> Result<TaskValue> {
        self.describe_with(&BTreeMap::new())
    }

    /// Like [`Flow::describe`], with build parameters.
    ///
    /// # Errors
    ///
    /// Returns build errors only.
    pub fn describe_with(&self, params: &BTreeMap<String, TaskValue>) -> Result<TaskValue> {
        Ok(self.plan(params)?.graph.describe(&self.name))
    }

    /// Adjacency JSON export; same payload as [`Flow::describe`].
    ///
    /// # Errors
    ///
    /// Returns build errors only.
    pub fn export_graph(&self) -> Result<TaskValue> {
        self.describe()
    }

    /// DOT export of the DAG, with fan-out barriers as diamond nodes.
    ///
    /// # Errors
    ///
    /// Returns build errors only.
    pub fn export_dot(&self) -> Result<String> {
        Ok(self.plan(&BTreeMap::new())?.graph.to_dot())
    }
}

/// Named collection of flows, the unit the CLI operates on.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, Arc<Flow>>,
}

impl FlowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a flow under its own name. Re-registering a name replaces
    /// the earlier flow.
    pub fn register(&mut self, flow: Flow) {
        self.flows.insert(flow.name().to_string(), Arc::new(flow));
    }

    /// Looks up a flow by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }

    /// Number of registered flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// True when no flows are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
