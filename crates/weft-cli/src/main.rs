//! The `weft` binary: demo flows behind the standard CLI.

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft_cli::{execute, Cli};
use weft_core::config::ExecutorKind;
use weft_core::EngineConfig;
use weft_flow::prelude::*;

fn main() -> Result<()> {
    let config = EngineConfig::global();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let registry = demo_registry();

    // Worker hook: when spawned as a process-mode worker, serve the one
    // request and exit before doing anything else.
    if weft_flow::process::run_worker_if_requested(&weft_flow::runtime()) {
        return Ok(());
    }

    let cli = Cli::parse();
    std::process::exit(execute(cli, &registry));
}

/// Flows shipped with the demo binary. Hosts embedding the engine build
/// their own registry the same way.
fn demo_registry() -> FlowRegistry {
    let runtime = weft_flow::runtime();
    let mut registry = FlowRegistry::new();

    // Sum of squares over a fixed input set.
    let square = TaskDefinition::builder("square")
        .build_blocking(|args| Ok(json!(args.decode::<i64>(0)? * args.decode::<i64>(0)?)));
    let total = TaskDefinition::builder("total")
        .build_blocking(|args| Ok(json!(args.decode::<Vec<i64>>(0)?.iter().sum::<i64>())));
    {
        let square = square.clone();
        let total = total.clone();
        registry.register(Flow::new("sum_of_squares", move |fb| {
            let fanned = fb.fan_out(&square, vec![json!(1), json!(2), json!(3), json!(4)], None);
            let out = total.invoke(fb, [fanned.binding()]);
            Ok((&out).into())
        }));
    }

    // Dynamic fan-out: the word list is only known once `list_words` ran.
    let list_words = TaskDefinition::builder("list_words")
        .build_blocking(|_| Ok(json!(["alpha", "beta", "gamma"])));
    let measure = TaskDefinition::builder("measure")
        .run_in(ExecutorKind::Process)
        .build_blocking(|args| Ok(json!(args.decode::<String>(0)?.len())));
    {
        let list_words = list_words.clone();
        let measure = measure.clone();
        let total = total.clone();
        registry.register(Flow::new("word_lengths", move |fb| {
            let words = list_words.invoke(fb, []);
            let lengths = fb.fan_out(&measure, &words, None);
            let out = total.invoke(fb, [lengths.binding()]);
            Ok((&out).into())
        }));
    }

    // Process-mode tasks must be discoverable by name in worker processes.
    for task in [&square, &total, &list_words, &measure] {
        runtime.register_task(task);
    }

    registry
}
