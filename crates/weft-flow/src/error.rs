//! Error types for the workflow engine.

use std::sync::Arc;
use std::time::Duration;

/// The result type used throughout weft-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used for wrapped causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lightweight error returned by user task bodies.
///
/// Task bodies are user code; they report failures with a message (and an
/// optional cause) rather than constructing engine errors directly. The
/// pipeline wraps a `TaskError` into [`Error::TaskExecution`] together with
/// the task and node identity.
#[derive(Debug)]
pub struct TaskError {
    message: String,
    source: Option<BoxError>,
}

impl TaskError {
    /// Creates a new task error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a task error wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source("value conversion failed", e)
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        Self::with_source("io error", e)
    }
}

/// A single terminal task failure, as collected under the `continue` and
/// `aggregate` failure policies.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Name of the failed task definition.
    pub task: String,
    /// Node identifier of the failed invocation.
    pub node: String,
    /// Declaration-order sequence number, used to keep aggregate reports
    /// in a stable order.
    pub seq: usize,
    /// The terminal error.
    pub error: Arc<Error>,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.task, self.node, self.error)
    }
}

/// Errors that can occur while building or executing a flow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DAG construction failed: a cycle, an unknown dependency, or a
    /// malformed fan-out declaration.
    #[error("flow build failed: {message}")]
    Build {
        /// Description of the failure.
        message: String,
        /// The offending cycle path, when a cycle was detected.
        cycle: Vec<String>,
    },

    /// A task body raised, panicked, or returned an invalid value.
    #[error("task '{task}' failed (node {node}): {source}")]
    TaskExecution {
        /// Name of the task definition.
        task: String,
        /// Node identifier of the failing invocation.
        node: String,
        /// The underlying cause.
        #[source]
        source: BoxError,
    },

    /// A task exceeded its configured timeout.
    #[error("task '{task}' timed out after {timeout:?} (node {node})")]
    Timeout {
        /// Name of the task definition.
        task: String,
        /// Node identifier of the timed-out invocation.
        node: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The final retry attempt failed.
    #[error("task '{task}' exhausted {attempts} attempts (node {node}): {source}")]
    RetryExhausted {
        /// Name of the task definition.
        task: String,
        /// Node identifier of the failing invocation.
        node: String,
        /// Total attempts made (initial attempt plus retries).
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<Error>,
    },

    /// One or more tasks failed under the `continue` or `aggregate` policy.
    #[error("{} task(s) failed: {}", failures.len(), summarize(failures))]
    Aggregate {
        /// Terminal failures in declaration order.
        failures: Vec<TaskFailure>,
    },

    /// A dynamic fan-out could not be expanded: the source did not yield an
    /// array, or expansion exceeded the `max_dynamic_tasks` guardrail.
    #[error("fan-out expansion failed (node {node}): {reason}")]
    DynamicExpansion {
        /// The barrier node that failed to expand.
        node: String,
        /// Why expansion was rejected.
        reason: String,
    },

    /// A result cache backend fault. Never retried automatically.
    #[error("cache error: {message}")]
    Cache {
        /// Description of the fault.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// An artifact store backend fault. Never retried automatically.
    #[error("artifact error: {message}")]
    Artifact {
        /// Description of the fault.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A value could not cross a serialization boundary (process dispatch,
    /// persisted cache entry). Not retryable.
    #[error("serialization failed for task '{task}': {message}")]
    Serialization {
        /// Name of the task whose value failed to serialize.
        task: String,
        /// Description of the failure.
        message: String,
    },

    /// A task observed the run's cancellation signal and stopped.
    #[error("task '{task}' cancelled (node {node})")]
    Cancelled {
        /// Name of the task definition.
        task: String,
        /// Node identifier of the cancelled invocation.
        node: String,
    },

    /// The whole run was cancelled before completion.
    #[error("run of flow '{flow}' cancelled")]
    RunCancelled {
        /// Name of the flow.
        flow: String,
    },

    /// A scheduler invariant was violated. Fatal; never aggregated.
    #[error("internal scheduler error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl Error {
    /// Creates a build error without a cycle path.
    #[must_use]
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
            cycle: Vec::new(),
        }
    }

    /// Creates a task-execution error from a user task failure.
    #[must_use]
    pub fn task_execution(task: impl Into<String>, node: impl Into<String>, source: TaskError) -> Self {
        Self::TaskExecution {
            task: task.into(),
            node: node.into(),
            source: Box::new(source),
        }
    }

    /// Creates a cache backend error.
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a cache backend error with a source.
    #[must_use]
    pub fn cache_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an artifact store error.
    #[must_use]
    pub fn artifact(message: impl Into<String>) -> Self {
        Self::Artifact {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an artifact store error with a source.
    #[must_use]
    pub fn artifact_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Artifact {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true when this error represents cooperative cancellation
    /// rather than a task failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::RunCancelled { .. })
    }

    /// Returns true when a retry attempt is permitted for this error class.
    ///
    /// Only task-body failures and timeouts are retryable; serialization
    /// faults, backend faults, and cancellations are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TaskExecution { .. } | Self::Timeout { .. })
    }
}

/// Compact failure listing for the aggregate error display; mirrors the
/// five-entry cap used for log lines elsewhere.
fn summarize(failures: &[TaskFailure]) -> String {
    let head: Vec<String> = failures.iter().take(5).map(ToString::to_string).collect();
    let mut out = head.join("; ");
    if failures.len() > 5 {
        out.push_str(&format!(" (+{} more)", failures.len() - 5));
    }
    out
}
