//! The per-dispatch execution pipeline.
//!
//! One call to [`dispatch`] takes a task invocation from resolved arguments
//! to a terminal outcome: cache lookup and single-flight join, the
//! middleware chain wrapped around the retrying core, span and lifecycle
//! events, artifact persistence, and the final cache store.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::json;
use tracing::warn;

use crate::build::NodeId;
use crate::cache::{await_flight, FlightClaim, FlightGuard};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::events::names as events;
use crate::metrics::names as metric;
use crate::middleware::{compose, TaskMeta};
use crate::runtime::Runtime;
use crate::task::TaskDefinition;
use crate::value::{TaskArgs, TaskValue};

/// Executes one dispatch of `task` with already-resolved arguments.
pub(crate) async fn dispatch(
    runtime: Arc<Runtime>,
    ctx: Arc<RunContext>,
    node: NodeId,
    task: TaskDefinition,
    args: TaskArgs,
) -> Result<TaskValue> {
    let ttl = task.cache_ttl();
    let cache_key = if ttl.is_some() { task.cache_key(&args) } else { None };

    let mut flight: Option<FlightGuard> = None;
    if let (Some(ttl), Some(key)) = (ttl, cache_key.as_deref()) {
        match runtime.cache().get(key, ttl) {
            Ok(Some(value)) => {
                runtime.metrics().inc(metric::CACHE_HITS, 1);
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                // A faulty backend must not take the task down; execute.
                warn!(task = task.name(), error = %e, "result cache read failed");
            }
        }

        match runtime.inflight().claim(key) {
            FlightClaim::Leader(guard) => flight = Some(guard),
            FlightClaim::Follower(rx) => {
                runtime.metrics().inc(metric::DEDUP_JOINS, 1);
                return match await_flight(rx).await {
                    Ok(value) => Ok(value),
                    Err(message) => Err(Error::TaskExecution {
                        task: task.name().to_string(),
                        node: node.to_string(),
                        source: message.into(),
                    }),
                };
            }
        }
    }

    let span = runtime.tracer().span(
        &format!("task:{}", task.name()),
        &[("node", node.to_string())],
    );
    let started = Instant::now();

    let core = {
        let task = task.clone();
        let runtime = Arc::clone(&runtime);
        let ctx = Arc::clone(&ctx);
        let node = node.clone();
        let args = args.clone();
        async move { task.run_attempts(args, runtime, ctx, node).await }.boxed()
    };
    let meta = TaskMeta {
        task: task.name().to_string(),
        node: node.to_string(),
        args,
    };
    let mut outcome = compose(runtime.middleware_snapshot(), meta, core).await;

    if task.persist() {
        outcome = match outcome {
            Ok(value) => runtime.artifacts().put(&value).map(|r| r.to_value()),
            err => err,
        };
    }

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    drop(span);

    match outcome {
        Ok(value) => {
            if let Some(key) = cache_key.as_deref() {
                match runtime.cache().set(key, &value) {
                    Ok(()) => runtime.metrics().inc(metric::CACHE_SETS, 1),
                    Err(e) => warn!(task = task.name(), error = %e, "result cache write failed"),
                }
            }
            if let Some(guard) = flight.take() {
                guard.complete(Ok(value.clone()));
            }
            runtime.metrics().inc(metric::TASKS_SUCCEEDED, 1);
            runtime.metrics().observe(metric::TASK_DURATION_MS, elapsed_ms);
            runtime.events().emit(
                events::TASK_SUCCEEDED,
                json!({
                    "task": task.name(),
                    "node": node.as_str(),
                    "duration_ms": elapsed_ms,
                }),
            );
            Ok(value)
        }
        Err(e) if e.is_cancellation() => {
            if let Some(guard) = flight.take() {
                guard.complete(Err("execution cancelled".to_string()));
            }
            // Cancelled work is discarded, not failed: no event, no metric.
            Err(e)
        }
        Err(e) => {
            if let Some(guard) = flight.take() {
                guard.complete(Err(e.to_string()));
            }
            runtime.metrics().inc(metric::TASKS_FAILED, 1);
            runtime.events().emit(
                events::TASK_FAILED,
                json!({
                    "task": task.name(),
                    "node": node.as_str(),
                    "error": e.to_string(),
                }),
            );
            Err(e)
        }
    }
}
