//! Lightweight event bus.
//!
//! The scheduler and pipeline emit lifecycle events that user code can
//! observe with [`EventBus::subscribe`]. Handlers are best-effort: a handler
//! that panics is logged once at debug level and never disturbs the run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::value::TaskValue;

/// Well-known event names.
pub mod names {
    /// A flow run started.
    pub const FLOW_STARTED: &str = "flow_started";
    /// A flow run finished (successfully or not).
    pub const FLOW_COMPLETED: &str = "flow_completed";
    /// A task dispatch began executing.
    pub const TASK_STARTED: &str = "task_started";
    /// A task attempt failed and a retry was scheduled.
    pub const TASK_RETRY: &str = "task_retry";
    /// A task reached a terminal failure.
    pub const TASK_FAILED: &str = "task_failed";
    /// A task completed successfully.
    pub const TASK_SUCCEEDED: &str = "task_succeeded";
}

type Handler = Arc<dyn Fn(&TaskValue) + Send + Sync>;

/// A per-runtime registry of event subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `event`. Multiple handlers per event are
    /// invoked in subscription order.
    pub fn subscribe(&self, event: impl Into<String>, handler: impl Fn(&TaskValue) + Send + Sync + 'static) {
        let mut subs = self.subscribers.write().expect("event bus lock poisoned");
        subs.entry(event.into()).or_default().push(Arc::new(handler));
    }

    /// Emits `event` with `payload` to every subscriber.
    ///
    /// Handler panics are swallowed with a single diagnostic log line; core
    /// execution never observes them.
    pub fn emit(&self, event: &str, payload: TaskValue) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.read().expect("event bus lock poisoned");
            match subs.get(event) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&payload))).is_err() {
                debug!(event, "event handler panicked; ignoring");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subs = self.subscribers.read().expect("event bus lock poisoned");
        let counts: HashMap<&str, usize> = subs.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_receive_payloads_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let log = Arc::clone(&log);
            bus.subscribe(names::TASK_STARTED, move |payload| {
                log.lock().unwrap().push((tag, payload.clone()));
            });
        }

        bus.emit(names::TASK_STARTED, json!({"task": "t"}));

        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "first");
        assert_eq!(seen[1].0, "second");
    }

    #[test]
    fn panicking_handler_does_not_break_emission() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe("boom", |_| panic!("handler bug"));
        {
            let count = Arc::clone(&count);
            bus.subscribe("boom", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit("boom", json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit("nobody_listening", json!({}));
    }
}
