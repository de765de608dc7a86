//! Onion-style task middleware.
//!
//! Middleware wraps every task dispatch, composed outermost-first in
//! registration order. Each layer receives the task's identity and resolved
//! arguments plus a [`Next`] continuation it must invoke exactly once to
//! proceed. Consuming `Next` makes "at most once" structural; skipping it
//! short-circuits the dispatch, which a well-behaved layer only does when
//! substituting a result of its own. Failures from inner layers must be
//! propagated, not swallowed.
//!
//! Registration is runtime-wide. Registering during a run is allowed; the
//! chain is snapshotted per dispatch, so the change applies to dispatches
//! begun afterwards.

use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::Result;
use crate::value::{TaskArgs, TaskValue};

/// Identity and inputs of the dispatch being wrapped.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    /// Name of the task definition.
    pub task: String,
    /// Node identifier of this invocation.
    pub node: String,
    /// Resolved arguments.
    pub args: TaskArgs,
}

/// Continuation to the next layer (or the task core).
pub struct Next {
    inner: Box<dyn FnOnce() -> BoxFuture<'static, Result<TaskValue>> + Send>,
}

impl Next {
    /// Invokes the remainder of the chain.
    pub async fn run(self) -> Result<TaskValue> {
        (self.inner)().await
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Next(..)")
    }
}

/// A single middleware layer.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Wraps one dispatch. Implementations may transform the result or wrap
    /// errors, but must not silently swallow a failure from `next`.
    async fn handle(&self, meta: &TaskMeta, next: Next) -> Result<TaskValue>;
}

/// Composes the registered layers around `core`, outermost first.
pub(crate) fn compose(
    layers: Vec<std::sync::Arc<dyn Middleware>>,
    meta: TaskMeta,
    core: BoxFuture<'static, Result<TaskValue>>,
) -> BoxFuture<'static, Result<TaskValue>> {
    let mut next = Next {
        inner: Box::new(move || core),
    };
    for layer in layers.into_iter().rev() {
        let meta = meta.clone();
        let inner = next;
        next = Next {
            inner: Box::new(move || {
                async move { layer.handle(&meta, inner).await }.boxed()
            }),
        };
    }
    async move { next.run().await }.boxed()
}

/// Structured logging for every dispatch: start, outcome, duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, meta: &TaskMeta, next: Next) -> Result<TaskValue> {
        let started = Instant::now();
        info!(task = %meta.task, node = %meta.node, "task starting");
        let result = next.run().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => info!(task = %meta.task, node = %meta.node, elapsed_ms, "task finished"),
            Err(e) if e.is_cancellation() => {
                info!(task = %meta.task, node = %meta.node, elapsed_ms, "task cancelled");
            }
            Err(e) => warn!(task = %meta.task, node = %meta.node, elapsed_ms, error = %e, "task failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TaskError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn meta() -> TaskMeta {
        TaskMeta {
            task: "t".into(),
            node: "t:1".into(),
            args: TaskArgs::new(),
        }
    }

    struct Recording {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn handle(&self, _meta: &TaskMeta, next: Next) -> Result<TaskValue> {
            self.log.lock().unwrap().push(format!("{}:enter", self.tag));
            let result = next.run().await;
            self.log.lock().unwrap().push(format!("{}:exit", self.tag));
            result
        }
    }

    #[tokio::test]
    async fn layers_run_outer_to_inner_and_unwind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layers: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recording { tag: "outer", log: Arc::clone(&log) }),
            Arc::new(Recording { tag: "inner", log: Arc::clone(&log) }),
        ];
        let inner_log = Arc::clone(&log);
        let core = async move {
            inner_log.lock().unwrap().push("core".to_string());
            Ok(json!(1))
        }
        .boxed();

        let value = compose(layers, meta(), core).await.unwrap();
        assert_eq!(value, json!(1));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:enter", "inner:enter", "core", "inner:exit", "outer:exit"]
        );
    }

    #[tokio::test]
    async fn errors_propagate_through_layers() {
        let count = Arc::new(AtomicUsize::new(0));

        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl Middleware for Counting {
            async fn handle(&self, _meta: &TaskMeta, next: Next) -> Result<TaskValue> {
                self.0.fetch_add(1, Ordering::SeqCst);
                next.run().await
            }
        }

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(Counting(Arc::clone(&count)))];
        let core = async { Err(Error::task_execution("t", "t:1", TaskError::new("boom"))) }.boxed();

        let err = compose(layers, meta(), core).await.unwrap_err();
        assert!(matches!(err, Error::TaskExecution { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_chain_runs_the_core_directly() {
        let core = async { Ok(json!("plain")) }.boxed();
        let value = compose(Vec::new(), meta(), core).await.unwrap();
        assert_eq!(value, json!("plain"));
    }
}
