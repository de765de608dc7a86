//! The engine's value model.
//!
//! Task inputs and outputs are JSON values (`serde_json::Value`). This keeps
//! every value serializable by construction, which the result cache, the
//! artifact store, and process-mode dispatch all rely on. Typed access is
//! provided through [`TaskArgs::decode`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::TaskError;

/// The value type that flows between tasks.
pub type TaskValue = serde_json::Value;

/// Resolved arguments delivered to a task body: positional values plus an
/// optional named map. Bindings are resolved by the scheduler before
/// dispatch; by the time a body sees `TaskArgs`, every placeholder has been
/// substituted with its upstream result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskArgs {
    positional: Vec<TaskValue>,
    named: BTreeMap<String, TaskValue>,
}

impl TaskArgs {
    /// Creates an empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an argument set from positional values.
    #[must_use]
    pub fn from_positional(positional: Vec<TaskValue>) -> Self {
        Self {
            positional,
            named: BTreeMap::new(),
        }
    }

    /// Adds a named argument.
    #[must_use]
    pub fn with_named(mut self, key: impl Into<String>, value: TaskValue) -> Self {
        self.named.insert(key.into(), value);
        self
    }

    /// Number of positional arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// True when there are no positional or named arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Positional argument by index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TaskValue> {
        self.positional.get(index)
    }

    /// Named argument by key.
    #[must_use]
    pub fn named(&self, key: &str) -> Option<&TaskValue> {
        self.named.get(key)
    }

    /// All positional arguments.
    #[must_use]
    pub fn positional(&self) -> &[TaskValue] {
        &self.positional
    }

    /// All named arguments.
    #[must_use]
    pub fn named_map(&self) -> &BTreeMap<String, TaskValue> {
        &self.named
    }

    /// Decodes the positional argument at `index` into a typed value.
    ///
    /// # Errors
    ///
    /// Fails when the argument is missing or does not deserialize into `T`
    /// (including when it is a failure sentinel delivered under the
    /// `continue` policy).
    pub fn decode<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self
            .positional
            .get(index)
            .ok_or_else(|| TaskError::new(format!("missing positional argument {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::with_source(format!("argument {index} has the wrong shape"), e))
    }

    /// Decodes the named argument `key` into a typed value.
    ///
    /// # Errors
    ///
    /// Fails when the argument is missing or does not deserialize into `T`.
    pub fn decode_named<T: DeserializeOwned>(&self, key: &str) -> Result<T, TaskError> {
        let value = self
            .named
            .get(key)
            .ok_or_else(|| TaskError::new(format!("missing named argument '{key}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::with_source(format!("argument '{key}' has the wrong shape"), e))
    }
}

/// Key marking a failure sentinel object.
///
/// Under the `continue` failure policy a failed dependency's argument
/// position receives a sentinel value rather than being excluded; dependents
/// can inspect it with [`failure_details`] or simply fail when decoding.
pub const FAILURE_SENTINEL_KEY: &str = "$weft_failed";

/// Details carried by a failure sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    /// Name of the failed task definition.
    pub task: String,
    /// Node identifier of the failed invocation.
    pub node: String,
    /// Rendered error message.
    pub error: String,
}

/// Builds the sentinel value standing in for a failed dependency.
#[must_use]
pub fn failure_sentinel(task: &str, node: &str, error: &str) -> TaskValue {
    json!({ FAILURE_SENTINEL_KEY: { "task": task, "node": node, "error": error } })
}

/// Returns true when `value` is a failure sentinel.
#[must_use]
pub fn is_failure_sentinel(value: &TaskValue) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.contains_key(FAILURE_SENTINEL_KEY))
}

/// Extracts the details from a failure sentinel, if `value` is one.
#[must_use]
pub fn failure_details(value: &TaskValue) -> Option<FailureDetails> {
    let inner = value.as_object()?.get(FAILURE_SENTINEL_KEY)?;
    serde_json::from_value(inner.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_typed_positional_arguments() {
        let args = TaskArgs::from_positional(vec![json!(2), json!("a"), json!([1, 2])]);
        assert_eq!(args.decode::<i64>(0).unwrap(), 2);
        assert_eq!(args.decode::<String>(1).unwrap(), "a");
        assert_eq!(args.decode::<Vec<i64>>(2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn decode_missing_argument_fails() {
        let args = TaskArgs::new();
        assert!(args.decode::<i64>(0).is_err());
    }

    #[test]
    fn decode_wrong_shape_fails() {
        let args = TaskArgs::from_positional(vec![json!("not a number")]);
        assert!(args.decode::<i64>(0).is_err());
    }

    #[test]
    fn named_arguments_roundtrip() {
        let args = TaskArgs::new().with_named("limit", json!(10));
        assert_eq!(args.decode_named::<u32>("limit").unwrap(), 10);
        assert!(args.decode_named::<u32>("offset").is_err());
    }

    #[test]
    fn sentinel_detection() {
        let s = failure_sentinel("fetch", "fetch:1", "boom");
        assert!(is_failure_sentinel(&s));
        assert!(!is_failure_sentinel(&json!({"ok": true})));

        let details = failure_details(&s).unwrap();
        assert_eq!(details.task, "fetch");
        assert_eq!(details.node, "fetch:1");
        assert_eq!(details.error, "boom");
    }

    #[test]
    fn decoding_a_sentinel_as_data_fails() {
        // A dependent expecting an integer fails cleanly on a sentinel.
        let args = TaskArgs::from_positional(vec![failure_sentinel("f", "f:1", "x")]);
        assert!(args.decode::<i64>(0).is_err());
    }

    #[test]
    fn task_args_serde_roundtrip() {
        let args = TaskArgs::from_positional(vec![json!(1)]).with_named("k", json!("v"));
        let text = serde_json::to_string(&args).unwrap();
        let back: TaskArgs = serde_json::from_str(&text).unwrap();
        assert_eq!(back.get(0), Some(&json!(1)));
        assert_eq!(back.named("k"), Some(&json!("v")));
    }
}
