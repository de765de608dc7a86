//! Task definitions: a callable plus its execution policies.
//!
//! A [`TaskDefinition`] is immutable after construction and outlives any
//! single run. Inside a flow body, [`TaskDefinition::invoke`] registers a
//! placeholder instead of executing; outside a flow, [`TaskDefinition::call`]
//! runs the full execution pipeline immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde_json::json;

use weft_core::config::ExecutorKind;

use crate::build::{ArgBinding, FlowBuilder, Invocation, NodeId};
use crate::context::RunContext;
use crate::error::{Error, Result, TaskError};
use crate::events::names as events;
use crate::runtime::Runtime;
use crate::value::{TaskArgs, TaskValue};

/// Async task body.
pub type AsyncTaskFn = Arc<
    dyn Fn(TaskArgs) -> BoxFuture<'static, std::result::Result<TaskValue, TaskError>>
        + Send
        + Sync,
>;

/// Blocking task body, dispatched to the thread pool (or a worker process).
pub type BlockingTaskFn =
    Arc<dyn Fn(TaskArgs) -> std::result::Result<TaskValue, TaskError> + Send + Sync>;

/// Custom cache-key derivation: `(task name, resolved args) -> key`.
pub type CacheKeyFn = Arc<dyn Fn(&str, &TaskArgs) -> String + Send + Sync>;

/// The callable behind a task.
#[derive(Clone)]
pub enum TaskBody {
    /// Runs on the scheduler's cooperative runtime.
    Async(AsyncTaskFn),
    /// Runs on the blocking pool or in a worker process.
    Blocking(BlockingTaskFn),
}

/// Immutable descriptor of a task: the callable plus retry, timeout,
/// caching, persistence, and scheduling policies.
#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    body: TaskBody,
    run_in: Option<ExecutorKind>,
    retries: u32,
    retry_backoff: f64,
    retry_jitter: f64,
    timeout: Option<Duration>,
    cache_ttl: Option<Duration>,
    cache_key_fn: Option<CacheKeyFn>,
    persist: bool,
    priority: i32,
    tags: BTreeSet<String>,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("run_in", &self.run_in)
            .field("retries", &self.retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("retry_jitter", &self.retry_jitter)
            .field("timeout", &self.timeout)
            .field("cache_ttl", &self.cache_ttl)
            .field("persist", &self.persist)
            .field("priority", &self.priority)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl TaskDefinition {
    /// Starts building a task named `name`. Names must be unique within a
    /// deployment; they key caching, metrics, and the process-task registry.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    /// The task's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of retries after the initial attempt.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Scheduling priority; higher dispatches earlier among ready nodes.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Whether results are handed to the artifact store.
    #[must_use]
    pub fn persist(&self) -> bool {
        self.persist
    }

    /// Result cache TTL, when caching is enabled.
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Free-form tags.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub(crate) fn body(&self) -> &TaskBody {
        &self.body
    }

    /// The execution mode actually used, given the configured default.
    ///
    /// Async bodies always run in async mode; blocking bodies honour an
    /// explicit `process` request and otherwise run on the thread pool.
    #[must_use]
    pub fn effective_run_in(&self, default: ExecutorKind) -> ExecutorKind {
        match (&self.body, self.run_in) {
            (TaskBody::Async(_), _) => ExecutorKind::Async,
            (TaskBody::Blocking(_), Some(ExecutorKind::Process)) => ExecutorKind::Process,
            (TaskBody::Blocking(_), Some(_)) => ExecutorKind::Thread,
            (TaskBody::Blocking(_), None) => match default {
                ExecutorKind::Process => ExecutorKind::Process,
                ExecutorKind::Async | ExecutorKind::Thread => ExecutorKind::Thread,
            },
        }
    }

    /// Derives the cache key for a set of resolved arguments.
    ///
    /// Uses the custom key function when one is set, otherwise a stable
    /// fingerprint over `(name, args)`. Returns `None` when no key can be
    /// derived; such dispatches bypass the cache.
    #[must_use]
    pub fn cache_key(&self, args: &TaskArgs) -> Option<String> {
        if let Some(f) = &self.cache_key_fn {
            return Some(f(&self.name, args));
        }
        weft_core::fingerprint::fingerprint(&(self.name.as_str(), args))
    }

    /// Registers an invocation of this task inside a flow build.
    pub fn invoke(
        &self,
        builder: &mut FlowBuilder,
        args: impl IntoIterator<Item = ArgBinding>,
    ) -> Invocation {
        builder.register(self, args.into_iter().collect(), BTreeMap::new())
    }

    /// Registers an invocation with named arguments in addition to
    /// positional ones.
    pub fn invoke_with(
        &self,
        builder: &mut FlowBuilder,
        args: impl IntoIterator<Item = ArgBinding>,
        named: BTreeMap<String, ArgBinding>,
    ) -> Invocation {
        builder.register(self, args.into_iter().collect(), named)
    }

    /// Executes the task immediately through the full pipeline on the
    /// process-wide runtime: cache, middleware, retries, persistence all
    /// apply exactly as inside a flow run.
    ///
    /// # Errors
    ///
    /// Surfaces the same error classes as flow execution:
    /// [`Error::TaskExecution`], [`Error::Timeout`], [`Error::RetryExhausted`].
    pub async fn call(&self, args: TaskArgs) -> Result<TaskValue> {
        self.call_with(crate::runtime::runtime(), args).await
    }

    /// Like [`TaskDefinition::call`], against an explicit runtime.
    ///
    /// # Errors
    ///
    /// See [`TaskDefinition::call`].
    pub async fn call_with(&self, runtime: Arc<Runtime>, args: TaskArgs) -> Result<TaskValue> {
        let ctx = Arc::new(RunContext::neutral());
        let node = NodeId::synthetic(&format!("{}:call", self.name));
        crate::pipeline::dispatch(runtime, ctx, node, self.clone(), args).await
    }

    /// Synchronous wrapper around [`TaskDefinition::call`] for non-async
    /// callers. Builds a private single-threaded runtime for the duration of
    /// the call.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Internal`] when invoked from inside an async
    /// context (use [`TaskDefinition::call`] there), otherwise surfaces the
    /// same errors as `call`.
    pub fn call_blocking(&self, args: TaskArgs) -> Result<TaskValue> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::Internal {
                message: "call_blocking invoked inside an async context; use call()".to_string(),
            });
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Internal {
                message: format!("failed to build runtime for immediate call: {e}"),
            })?;
        rt.block_on(self.call(args))
    }

    /// Runs the attempt loop: execution per mode, timeout per attempt, and
    /// exponential backoff with additive jitter between attempts.
    pub(crate) async fn run_attempts(
        &self,
        args: TaskArgs,
        runtime: Arc<Runtime>,
        ctx: Arc<RunContext>,
        node: NodeId,
    ) -> Result<TaskValue> {
        let mut attempt: u32 = 0;
        loop {
            runtime.events().emit(
                events::TASK_STARTED,
                json!({
                    "task": self.name,
                    "node": node.as_str(),
                    "run_id": ctx.run_id.to_string(),
                    "attempt": attempt + 1,
                }),
            );
            let err = match self.invoke_once(args.clone(), &runtime, &ctx, &node).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.retries {
                if self.retries == 0 {
                    return Err(err);
                }
                return Err(Error::RetryExhausted {
                    task: self.name.clone(),
                    node: node.to_string(),
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }

            attempt += 1;
            runtime.events().emit(
                events::TASK_RETRY,
                json!({
                    "task": self.name,
                    "node": node.as_str(),
                    "attempt": attempt,
                    "max": self.retries,
                }),
            );

            let mut delay = self.retry_backoff * 2f64.powi(attempt as i32 - 1);
            if self.retry_jitter > 0.0 {
                delay += rand::rng().random_range(0.0..self.retry_jitter);
            }
            if delay > 0.0 {
                let cancel_token = ctx.cancel_token();
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        return Err(Error::Cancelled {
                            task: self.name.clone(),
                            node: node.to_string(),
                        });
                    }
                    () = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                }
            }
        }
    }

    /// One attempt: dispatch per execution mode, racing the configured
    /// timeout. Async bodies additionally observe the run's cancellation
    /// token; thread and process dispatches run to natural completion once
    /// started.
    ///
    /// An expired timeout abandons a thread dispatch rather than killing
    /// it: nothing can interrupt a running closure, so it keeps its
    /// blocking-pool thread until it returns on its own and its result is
    /// discarded. A worker process, which can be interrupted, is reaped on
    /// abandonment via `kill_on_drop`.
    async fn invoke_once(
        &self,
        args: TaskArgs,
        runtime: &Arc<Runtime>,
        ctx: &Arc<RunContext>,
        node: &NodeId,
    ) -> Result<TaskValue> {
        let mode = self.effective_run_in(runtime.config().default_executor);
        match (mode, &self.body) {
            (ExecutorKind::Async, TaskBody::Async(f)) => {
                let fut = f(args);
                let task = self.name.clone();
                let node_str = node.to_string();
                let token = ctx.cancel_token();
                self.with_timeout(node, async move {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => Err(Error::Cancelled { task, node: node_str }),
                        result = fut => result.map_err(|e| Error::TaskExecution {
                            task: task.clone(),
                            node: node_str.clone(),
                            source: Box::new(e),
                        }),
                    }
                })
                .await
            }
            (ExecutorKind::Thread, TaskBody::Blocking(f)) => {
                let f = Arc::clone(f);
                let task = self.name.clone();
                let node_str = node.to_string();
                let handle = tokio::task::spawn_blocking(move || f(args));
                self.with_timeout(node, async move {
                    match handle.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(Error::TaskExecution {
                            task: task.clone(),
                            node: node_str.clone(),
                            source: Box::new(e),
                        }),
                        Err(join) => Err(Error::TaskExecution {
                            task,
                            node: node_str,
                            source: Box::new(TaskError::new(format!("task panicked: {join}"))),
                        }),
                    }
                })
                .await
            }
            (ExecutorKind::Process, TaskBody::Blocking(_)) => {
                let runtime = Arc::clone(runtime);
                let name = self.name.clone();
                let node_str = node.to_string();
                let args = args.clone();
                self.with_timeout(node, async move {
                    crate::process::dispatch(&runtime, &name, &node_str, &args).await
                })
                .await
            }
            _ => Err(Error::Internal {
                message: format!(
                    "task '{}' resolved to an execution mode incompatible with its body",
                    self.name
                ),
            }),
        }
    }

    async fn with_timeout<F>(&self, node: &NodeId, fut: F) -> Result<TaskValue>
    where
        F: Future<Output = Result<TaskValue>>,
    {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    task: self.name.clone(),
                    node: node.to_string(),
                    timeout: limit,
                }),
            },
            None => fut.await,
        }
    }
}

/// Fluent constructor for [`TaskDefinition`].
pub struct TaskBuilder {
    name: String,
    run_in: Option<ExecutorKind>,
    retries: u32,
    retry_backoff: f64,
    retry_jitter: f64,
    timeout: Option<Duration>,
    cache_ttl: Option<Duration>,
    cache_key_fn: Option<CacheKeyFn>,
    persist: bool,
    priority: i32,
    tags: BTreeSet<String>,
}

impl TaskBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_in: None,
            retries: 0,
            retry_backoff: 0.0,
            retry_jitter: 0.0,
            timeout: None,
            cache_ttl: None,
            cache_key_fn: None,
            persist: false,
            priority: 0,
            tags: BTreeSet::new(),
        }
    }

    /// Requests an execution mode. Async bodies ignore this and always run
    /// in async mode; blocking bodies may opt into `process`.
    #[must_use]
    pub fn run_in(mut self, mode: ExecutorKind) -> Self {
        self.run_in = Some(mode);
        self
    }

    /// Number of retries after the initial attempt.
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Base backoff in seconds; the k-th retry waits `backoff * 2^(k-1)`.
    #[must_use]
    pub fn retry_backoff(mut self, seconds: f64) -> Self {
        self.retry_backoff = seconds.max(0.0);
        self
    }

    /// Additive jitter: each backoff gains `uniform[0, jitter)` seconds.
    #[must_use]
    pub fn retry_jitter(mut self, seconds: f64) -> Self {
        self.retry_jitter = seconds.max(0.0);
        self
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables result caching with the given freshness window.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Custom cache-key derivation.
    #[must_use]
    pub fn cache_key_fn(
        mut self,
        f: impl Fn(&str, &TaskArgs) -> String + Send + Sync + 'static,
    ) -> Self {
        self.cache_key_fn = Some(Arc::new(f));
        self
    }

    /// Persist results through the artifact store, returning an
    /// `ArtifactRef` in place of the value.
    #[must_use]
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Scheduling priority; higher dispatches first among ready nodes.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a free-form tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Finishes with an async body.
    pub fn build_async<F, Fut>(self, f: F) -> TaskDefinition
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TaskValue, TaskError>> + Send + 'static,
    {
        self.build(TaskBody::Async(Arc::new(move |args| f(args).boxed())))
    }

    /// Finishes with a blocking body.
    pub fn build_blocking<F>(self, f: F) -> TaskDefinition
    where
        F: Fn(TaskArgs) -> std::result::Result<TaskValue, TaskError> + Send + Sync + 'static,
    {
        self.build(TaskBody::Blocking(Arc::new(f)))
    }

    fn build(self, body: TaskBody) -> TaskDefinition {
        TaskDefinition {
            name: self.name,
            body,
            run_in: self.run_in,
            retries: self.retries,
            retry_backoff: self.retry_backoff,
            retry_jitter: self.retry_jitter,
            timeout: self.timeout,
            cache_ttl: self.cache_ttl,
            cache_key_fn: self.cache_key_fn,
            persist: self.persist,
            priority: self.priority,
            tags: self.tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn async_bodies_always_run_async() {
        let task = TaskDefinition::builder("t")
            .run_in(ExecutorKind::Process)
            .build_async(|_| async { Ok(TaskValue::Null) });
        assert_eq!(task.effective_run_in(ExecutorKind::Async), ExecutorKind::Async);
        assert_eq!(task.effective_run_in(ExecutorKind::Process), ExecutorKind::Async);
    }

    #[test]
    fn blocking_bodies_default_to_the_thread_pool() {
        let task = TaskDefinition::builder("t").build_blocking(|_| Ok(TaskValue::Null));
        assert_eq!(task.effective_run_in(ExecutorKind::Async), ExecutorKind::Thread);
        assert_eq!(task.effective_run_in(ExecutorKind::Thread), ExecutorKind::Thread);
        // The configured default can promote them to process mode.
        assert_eq!(task.effective_run_in(ExecutorKind::Process), ExecutorKind::Process);
    }

    #[test]
    fn explicit_process_mode_is_honoured() {
        let task = TaskDefinition::builder("t")
            .run_in(ExecutorKind::Process)
            .build_blocking(|_| Ok(TaskValue::Null));
        assert_eq!(task.effective_run_in(ExecutorKind::Async), ExecutorKind::Process);
    }

    #[test]
    fn default_cache_keys_are_stable_and_argument_sensitive() {
        let task = TaskDefinition::builder("expensive").build_blocking(|_| Ok(TaskValue::Null));
        let a1 = task.cache_key(&TaskArgs::from_positional(vec![json!(5)])).unwrap();
        let a2 = task.cache_key(&TaskArgs::from_positional(vec![json!(5)])).unwrap();
        let b = task.cache_key(&TaskArgs::from_positional(vec![json!(6)])).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn cache_keys_include_the_task_name() {
        let a = TaskDefinition::builder("one").build_blocking(|_| Ok(TaskValue::Null));
        let b = TaskDefinition::builder("two").build_blocking(|_| Ok(TaskValue::Null));
        let args = TaskArgs::from_positional(vec![json!(1)]);
        assert_ne!(a.cache_key(&args), b.cache_key(&args));
    }

    #[test]
    fn custom_cache_key_fn_wins() {
        let task = TaskDefinition::builder("t")
            .cache_key_fn(|name, _| format!("{name}-fixed"))
            .build_blocking(|_| Ok(TaskValue::Null));
        assert_eq!(task.cache_key(&TaskArgs::new()).as_deref(), Some("t-fixed"));
    }

    #[test]
    fn builder_clamps_negative_backoff() {
        let task = TaskDefinition::builder("t")
            .retry_backoff(-1.0)
            .retry_jitter(-0.5)
            .build_blocking(|_| Ok(TaskValue::Null));
        assert_eq!(task.retry_backoff, 0.0);
        assert_eq!(task.retry_jitter, 0.0);
    }
}
