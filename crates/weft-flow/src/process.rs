//! Process-mode execution.
//!
//! A task with `run_in = process` executes in a worker subprocess: the
//! engine re-spawns the current executable with `WEFT_PROCESS_WORKER=1`,
//! writes a JSON request to its stdin, and reads a JSON response from its
//! stdout. Arguments and results therefore must round-trip through the
//! value model; a value that cannot be encoded fails the dispatch without
//! retry.
//!
//! Host binaries opt in by calling [`run_worker_if_requested`] first thing
//! in `main`, after constructing their tasks: the worker looks the task up
//! by name in the runtime's registry, so the child process must register
//! the same tasks the parent did. Concurrent workers are bounded by
//! `process_pool_max_workers`; `kill_on_drop` reaps a worker whose dispatch
//! future is abandoned (timeout), so no orphan processes outlive a run.

use std::io::Read;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::task::TaskBody;
use crate::value::{TaskArgs, TaskValue};

/// Environment variable marking a worker invocation.
pub const WORKER_ENV: &str = "WEFT_PROCESS_WORKER";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WorkerRequest {
    pub(crate) task: String,
    pub(crate) args: TaskArgs,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum WorkerResponse {
    Ok(TaskValue),
    Err(String),
}

/// Runs one task in a worker subprocess and returns its result.
pub(crate) async fn dispatch(
    runtime: &Arc<Runtime>,
    task: &str,
    node: &str,
    args: &TaskArgs,
) -> Result<TaskValue> {
    let request = serde_json::to_vec(&WorkerRequest {
        task: task.to_string(),
        args: args.clone(),
    })
    .map_err(|e| Error::Serialization {
        task: task.to_string(),
        message: format!("arguments are not encodable for process dispatch: {e}"),
    })?;

    let _permit = runtime
        .process_slots()
        .acquire_owned()
        .await
        .map_err(|_| Error::Internal {
            message: "process slot semaphore closed".to_string(),
        })?;

    let exe = std::env::current_exe().map_err(|e| Error::Internal {
        message: format!("cannot locate current executable for worker spawn: {e}"),
    })?;

    debug!(task, node, "spawning process worker");
    let mut child = Command::new(exe)
        .env(WORKER_ENV, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::TaskExecution {
            task: task.to_string(),
            node: node.to_string(),
            source: Box::new(e),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&request)
            .await
            .map_err(|e| Error::TaskExecution {
                task: task.to_string(),
                node: node.to_string(),
                source: Box::new(e),
            })?;
        // Dropping stdin closes the pipe so the worker sees EOF.
    }

    let mut output = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout
            .read_to_end(&mut output)
            .await
            .map_err(|e| Error::TaskExecution {
                task: task.to_string(),
                node: node.to_string(),
                source: Box::new(e),
            })?;
    }

    let status = child.wait().await.map_err(|e| Error::TaskExecution {
        task: task.to_string(),
        node: node.to_string(),
        source: Box::new(e),
    })?;

    match serde_json::from_slice::<WorkerResponse>(&output) {
        Ok(WorkerResponse::Ok(value)) => Ok(value),
        Ok(WorkerResponse::Err(message)) => Err(Error::TaskExecution {
            task: task.to_string(),
            node: node.to_string(),
            source: message.into(),
        }),
        Err(_) if !status.success() => Err(Error::TaskExecution {
            task: task.to_string(),
            node: node.to_string(),
            source: format!("worker exited with {status} before producing a response").into(),
        }),
        Err(e) => Err(Error::TaskExecution {
            task: task.to_string(),
            node: node.to_string(),
            source: Box::new(Error::Serialization {
                task: task.to_string(),
                message: format!("malformed worker response: {e}"),
            }),
        }),
    }
}

/// Worker entry hook. Call first thing in `main`, after tasks are
/// registered on the runtime. Returns `true` when this process was spawned
/// as a worker and has finished serving its request; the caller should exit
/// immediately in that case.
pub fn run_worker_if_requested(runtime: &Runtime) -> bool {
    if std::env::var(WORKER_ENV).is_err() {
        return false;
    }
    let response = serve_one(runtime);
    if serde_json::to_writer(std::io::stdout().lock(), &response).is_err() {
        std::process::exit(1);
    }
    true
}

fn serve_one(runtime: &Runtime) -> WorkerResponse {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().lock().read_to_string(&mut input) {
        return WorkerResponse::Err(format!("failed to read worker request: {e}"));
    }
    let request: WorkerRequest = match serde_json::from_str(&input) {
        Ok(r) => r,
        Err(e) => return WorkerResponse::Err(format!("malformed worker request: {e}")),
    };
    let Some(task) = runtime.task(&request.task) else {
        return WorkerResponse::Err(format!(
            "task '{}' is not registered in the worker process",
            request.task
        ));
    };
    execute_body(&task, request.args)
}

fn execute_body(task: &crate::task::TaskDefinition, args: TaskArgs) -> WorkerResponse {
    match task.body() {
        TaskBody::Blocking(f) => match f(args) {
            Ok(value) => WorkerResponse::Ok(value),
            Err(e) => WorkerResponse::Err(e.to_string()),
        },
        // Process dispatch targets blocking bodies, but a registry can hold
        // async tasks under the same hook; serve them on a local runtime.
        TaskBody::Async(f) => {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => return WorkerResponse::Err(format!("worker runtime failed: {e}")),
            };
            match rt.block_on(f(args)) {
                Ok(value) => WorkerResponse::Ok(value),
                Err(e) => WorkerResponse::Err(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDefinition;
    use serde_json::json;
    use weft_core::EngineConfig;

    #[test]
    fn request_and_response_codecs_roundtrip() {
        let request = WorkerRequest {
            task: "fetch".to_string(),
            args: TaskArgs::from_positional(vec![json!("https://example.com")]),
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        let back: WorkerRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.task, "fetch");
        assert_eq!(back.args.get(0), Some(&json!("https://example.com")));

        let ok = serde_json::to_string(&WorkerResponse::Ok(json!(3))).unwrap();
        assert_eq!(ok, r#"{"ok":3}"#);
        let err = serde_json::to_string(&WorkerResponse::Err("boom".to_string())).unwrap();
        assert_eq!(err, r#"{"err":"boom"}"#);
    }

    #[test]
    fn serve_rejects_unregistered_tasks() {
        let runtime = Runtime::with_config(EngineConfig::default()).unwrap();
        let response = execute_lookup(&runtime, "missing");
        assert!(matches!(response, WorkerResponse::Err(ref m) if m.contains("not registered")));
    }

    #[test]
    fn registered_blocking_task_executes_in_worker_path() {
        let runtime = Runtime::with_config(EngineConfig::default()).unwrap();
        let double = TaskDefinition::builder("double")
            .build_blocking(|args| Ok(json!(args.decode::<i64>(0)? * 2)));
        runtime.register_task(&double);

        let response = execute_body(&runtime.task("double").unwrap(), TaskArgs::from_positional(vec![json!(21)]));
        assert!(matches!(response, WorkerResponse::Ok(ref v) if *v == json!(42)));
    }

    fn execute_lookup(runtime: &Runtime, name: &str) -> WorkerResponse {
        match runtime.task(name) {
            Some(task) => execute_body(&task, TaskArgs::new()),
            None => WorkerResponse::Err(format!("task '{name}' is not registered in the worker process")),
        }
    }
}
