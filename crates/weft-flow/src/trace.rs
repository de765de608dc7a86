//! Pluggable tracing.
//!
//! The core wraps every flow run and every task dispatch in a span acquired
//! from the active [`Tracer`]. Spans are scoped: dropping the guard ends the
//! span. The default tracer is a no-op; [`LogTracer`] emits `tracing` debug
//! records with the span's elapsed time, and hosts can install an
//! OpenTelemetry-backed implementation via `set_tracer`.

use std::time::Instant;

use tracing::debug;

/// A live span. Ends when dropped.
pub trait Span: Send {}

/// Produces spans for flows and tasks.
pub trait Tracer: Send + Sync {
    /// Opens a span named `name` with the given attributes.
    fn span(&self, name: &str, attrs: &[(&str, String)]) -> Box<dyn Span>;
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl Span for NoopSpan {}

impl Tracer for NoopTracer {
    fn span(&self, _name: &str, _attrs: &[(&str, String)]) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

/// Tracer that logs span open/close with elapsed time at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

struct LogSpan {
    name: String,
    started: Instant,
}

impl Span for LogSpan {}

impl Drop for LogSpan {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        debug!(span = %self.name, elapsed_ms, "span closed");
    }
}

impl Tracer for LogTracer {
    fn span(&self, name: &str, attrs: &[(&str, String)]) -> Box<dyn Span> {
        debug!(span = %name, ?attrs, "span opened");
        Box::new(LogSpan {
            name: name.to_string(),
            started: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_spans_are_droppable() {
        let tracer = NoopTracer;
        let span = tracer.span("task:example", &[("node", "example:1".to_string())]);
        drop(span);
    }

    #[test]
    fn log_tracer_spans_measure_time() {
        let tracer = LogTracer;
        let span = tracer.span("flow:test", &[]);
        std::thread::sleep(std::time::Duration::from_millis(1));
        drop(span);
    }
}
