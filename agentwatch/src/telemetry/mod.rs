//! Instrumentation and export engine.
//!
//! Producers (the span recorder, workflow tracker and error capture scopes)
//! only ever enqueue into the shared [`TelemetryBuffer`]; the [`Exporter`]
//! task is the sole consumer and the only component that talks to a sink.

pub mod buffer;
pub mod context;
pub mod errors;
pub mod evaluation;
pub mod exporter;
pub mod recorder;
pub mod sink;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod scenario_tests;

// Re-export key types for convenience
pub use buffer::TelemetryBuffer;
pub use context::{current_link, SpanLink};
pub use errors::{ErrorGrouper, ErrorTracker};
pub use evaluation::{EvaluationEngine, Judge, Verdict};
pub use exporter::{ExportStatsSnapshot, Exporter, RetryPolicy};
pub use recorder::{SpanOutcome, SpanRecorder, TraceContext, Traced};
pub use sink::{classify_response, BackendSink, HttpSink, SinkResponse};
pub use workflow::{WorkflowOutcome, WorkflowTracker, UNTERMINATED_REASON};
