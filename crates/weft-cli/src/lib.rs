//! # weft-cli
//!
//! Command-line interface for the weft workflow engine.
//!
//! ## Commands
//!
//! - `weft run <flow>` - run a registered flow
//! - `weft describe <flow>` - print a flow's DAG without executing it
//! - `weft list` - list registered flows with their node counts
//!
//! Flows are compiled into the host binary and registered by name in a
//! [`FlowRegistry`]; the shipped `weft` binary registers a small set of demo
//! flows. Exit codes: `0` success, `1` task or flow failure, `2` usage
//! error (unknown flow, invalid option, malformed params).

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

use std::collections::BTreeMap;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use weft_flow::prelude::*;

/// Exit code for a successful invocation.
pub const EXIT_OK: i32 = 0;
/// Exit code when a task or flow failed.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for usage errors: unknown flow, bad option, malformed params.
pub const EXIT_USAGE: i32 = 2;

/// weft - workflow engine command-line interface.
#[derive(Debug, Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a registered flow.
    Run(RunArgs),
    /// Print a flow's DAG without executing it.
    Describe(DescribeArgs),
    /// List registered flows with their node counts.
    List,
}

/// Arguments for `weft run`.
#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Name of the registered flow.
    pub flow: String,

    /// How the run responds to task failures.
    #[arg(long, value_enum, default_value = "fail_fast")]
    pub failure_policy: PolicyArg,

    /// Bound on concurrently running tasks.
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Run parameters as a JSON object.
    #[arg(long)]
    pub params: Option<String>,
}

/// Arguments for `weft describe`.
#[derive(Debug, clap::Args)]
pub struct DescribeArgs {
    /// Name of the registered flow.
    pub flow: String,

    /// Emit DOT instead of adjacency JSON.
    #[arg(long)]
    pub dot: bool,
}

/// Failure policy as a CLI option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Cancel in-flight work on the first failure.
    #[value(name = "fail_fast", alias = "fail-fast")]
    FailFast,
    /// Keep going; deliver failure sentinels downstream.
    #[value(name = "continue")]
    Continue,
    /// Keep going; skip dependents of failures.
    #[value(name = "aggregate")]
    Aggregate,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FailFast => Self::FailFast,
            PolicyArg::Continue => Self::Continue,
            PolicyArg::Aggregate => Self::Aggregate,
        }
    }
}

/// Executes a parsed CLI invocation against a registry; returns the exit
/// code.
#[must_use]
pub fn execute(cli: Cli, registry: &FlowRegistry) -> i32 {
    match cli.command {
        Commands::Run(args) => run_flow(&args, registry),
        Commands::Describe(args) => describe_flow(&args, registry),
        Commands::List => list_flows(registry),
    }
}

fn run_flow(args: &RunArgs, registry: &FlowRegistry) -> i32 {
    let Some(flow) = registry.get(&args.flow) else {
        eprintln!("error: unknown flow '{}'", args.flow);
        return EXIT_USAGE;
    };
    if args.max_concurrency == Some(0) {
        eprintln!("error: --max-concurrency must be a positive integer");
        return EXIT_USAGE;
    }
    let params = match parse_params(args.params.as_deref()) {
        Ok(params) => params,
        Err(message) => {
            eprintln!("error: {message}");
            return EXIT_USAGE;
        }
    };

    let mut options = RunOptions::new().failure_policy(args.failure_policy.into());
    options.params = params;
    options.max_concurrency = args.max_concurrency;

    match flow.run_blocking(options) {
        Ok(value) => {
            println!("{value}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("flow '{}' failed: {e}", args.flow);
            EXIT_FAILURE
        }
    }
}

fn describe_flow(args: &DescribeArgs, registry: &FlowRegistry) -> i32 {
    let Some(flow) = registry.get(&args.flow) else {
        eprintln!("error: unknown flow '{}'", args.flow);
        return EXIT_USAGE;
    };
    let rendered: std::result::Result<String, String> = if args.dot {
        flow.export_dot().map_err(|e| e.to_string())
    } else {
        match flow.describe() {
            Ok(described) => serde_json::to_string_pretty(&described).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    };
    match rendered {
        Ok(text) => {
            println!("{text}");
            EXIT_OK
        }
        Err(message) => {
            eprintln!("failed to describe '{}': {message}", args.flow);
            EXIT_FAILURE
        }
    }
}

fn list_flows(registry: &FlowRegistry) -> i32 {
    let mut listing = serde_json::Map::new();
    for name in registry.names() {
        let count = registry
            .get(name)
            .and_then(|flow| flow.describe().ok())
            .and_then(|d| d["count"].as_u64())
            .unwrap_or(0);
        listing.insert(name.to_string(), json!(count));
    }
    match serde_json::to_string_pretty(&listing) {
        Ok(text) => {
            println!("{text}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("failed to render listing: {e}");
            EXIT_FAILURE
        }
    }
}

fn parse_params(raw: Option<&str>) -> std::result::Result<BTreeMap<String, TaskValue>, String> {
    let Some(raw) = raw else {
        return Ok(BTreeMap::new());
    };
    let value: TaskValue =
        serde_json::from_str(raw).map_err(|e| format!("--params is not valid JSON: {e}"))?;
    let TaskValue::Object(map) = value else {
        return Err("--params must be a JSON object".to_string());
    };
    Ok(map.into_iter().collect())
}
