//! Per-run execution context.
//!
//! One `RunContext` exists per `Flow::run`; it is installed on the runtime
//! for the duration of the run and torn down on return. Task bodies reach it
//! through `get_context()` to read parameters or observe cancellation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use weft_core::RunId;

use crate::value::TaskValue;

/// Context visible to tasks during a flow run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique identifier of this run.
    pub run_id: RunId,
    /// Name of the flow being run.
    pub flow: String,
    /// Parameters supplied to `Flow::run`.
    pub params: BTreeMap<String, TaskValue>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RunContext {
    /// Creates a fresh context for a run of `flow`.
    #[must_use]
    pub fn new(flow: impl Into<String>, params: BTreeMap<String, TaskValue>) -> Self {
        Self {
            run_id: RunId::new(),
            flow: flow.into(),
            params,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// A neutral context, returned by `get_context()` outside a run.
    ///
    /// Its cancellation token never fires and its parameter map is empty.
    #[must_use]
    pub fn neutral() -> Self {
        Self::new("", BTreeMap::new())
    }

    /// Looks up a run parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&TaskValue> {
        self.params.get(key)
    }

    /// The run's cancellation token. One-shot: once cancelled it stays
    /// cancelled for the remainder of the run.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cooperative cancellation of the run. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_are_readable() {
        let ctx = RunContext::new("etl", BTreeMap::from([("day".to_string(), json!("2024-06-01"))]));
        assert_eq!(ctx.param("day"), Some(&json!("2024-06-01")));
        assert_eq!(ctx.param("missing"), None);
        assert_eq!(ctx.flow, "etl");
    }

    #[test]
    fn cancellation_is_idempotent() {
        let ctx = RunContext::new("etl", BTreeMap::new());
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn neutral_context_is_inert() {
        let ctx = RunContext::neutral();
        assert!(ctx.flow.is_empty());
        assert!(ctx.params.is_empty());
        assert!(!ctx.is_cancelled());
    }
}
