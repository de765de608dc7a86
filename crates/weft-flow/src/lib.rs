//! # weft-flow
//!
//! An in-process workflow engine: declare **tasks** (typed units of work
//! with retry, timeout, caching, and persistence policies), compose them
//! into a **flow** (a DAG of invocations and fan-out barriers), and let the
//! embedded **scheduler** drive the graph to completion with bounded
//! concurrency, priority ordering, dynamic runtime expansion, and a
//! configurable failure policy.
//!
//! ## Core concepts
//!
//! - **TaskDefinition**: immutable callable + policies; building one never
//!   runs it
//! - **Invocation**: build-time placeholder standing in for a task's future
//!   result; passing it into another task's arguments wires a dependency
//! - **Fan-out**: one upstream iterable, one child task per element, with a
//!   barrier collecting ordered results
//! - **Runtime**: one value owning the caches, stores, middleware, and
//!   observability hooks; a process-wide default keeps the common path
//!   ergonomic
//!
//! ## Example
//!
//! ```rust
//! use weft_flow::prelude::*;
//! use serde_json::json;
//!
//! # fn main() -> weft_flow::Result<()> {
//! let square = TaskDefinition::builder("square")
//!     .build_blocking(|args| Ok(json!(args.decode::<i64>(0)? * args.decode::<i64>(0)?)));
//! let total = TaskDefinition::builder("total")
//!     .build_blocking(|args| Ok(json!(args.decode::<Vec<i64>>(0)?.iter().sum::<i64>())));
//!
//! let flow = Flow::new("sum_of_squares", move |fb| {
//!     let fanned = fb.fan_out(&square, vec![json!(1), json!(2), json!(3)], None);
//!     let out = total.invoke(fb, [fanned.binding()]);
//!     Ok((&out).into())
//! });
//!
//! assert_eq!(flow.run_blocking(RunOptions::new())?, json!(14));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod artifacts;
pub mod build;
pub mod cache;
pub mod context;
pub mod dag;
pub mod error;
pub mod events;
pub mod fanout;
pub mod flow;
pub mod metrics;
pub mod middleware;
mod pipeline;
pub mod process;
pub mod runtime;
pub mod scheduler;
pub mod secrets;
pub mod task;
pub mod trace;
pub mod value;

pub use error::{Error, Result, TaskError};
pub use runtime::{
    get_context, register_middleware, runtime, secret, set_metrics_provider,
    set_secrets_provider, set_tracer, subscribe,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::artifacts::{ArtifactRef, ArtifactStore};
    pub use crate::build::{lit, ArgBinding, FlowBuilder, Invocation, NodeId};
    pub use crate::context::RunContext;
    pub use crate::error::{Error, Result, TaskError};
    pub use crate::events::names as event_names;
    pub use crate::fanout::{FanOut, FanOutSource};
    pub use crate::flow::{Flow, FlowRegistry, RunOptions};
    pub use crate::metrics::{InMemoryMetrics, MetricsProvider};
    pub use crate::middleware::{LoggingMiddleware, Middleware};
    pub use crate::runtime::{get_context, runtime, subscribe, Runtime};
    pub use crate::scheduler::{FailurePolicy, NodeState};
    pub use crate::task::{TaskBuilder, TaskDefinition};
    pub use crate::value::{TaskArgs, TaskValue};
}
