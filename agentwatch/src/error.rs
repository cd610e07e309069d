//! Internal failure taxonomy and diagnostic counters.
//!
//! Nothing here is ever raised into instrumented code: bookkeeping failures
//! are logged, counted, and at most returned from the tracker's own API.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use agentwatch_types::CapturedError;

/// Longest error message kept on a captured error.
const MAX_MESSAGE_CHARS: usize = 2048;

/// Categories of internal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ErrorKind {
    /// A trace context was finalized more than once
    DoubleFinalize,
    /// A workflow id was not (or no longer) registered
    UnknownWorkflow,
    /// A caller-supplied workflow id is already active
    DuplicateWorkflow,
    /// A run was still active when its registry shut down or was dropped
    UnterminatedWorkflow,
    /// A matcher or judge failed while evaluating an output
    EvaluationFailure,
    /// The sink failed in a way worth retrying
    ExportTransientFailure,
    /// The sink refused a batch outright
    ExportRejected,
    /// The buffer was full and evicted its oldest event, or was already closed
    BufferOverflow,
    /// The host dropped an in-flight call
    Cancelled,
}

/// An internal telemetry failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TelemetryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_workflow(workflow_id: &str) -> Self {
        Self::new(
            ErrorKind::UnknownWorkflow,
            format!("workflow '{}' is not active", workflow_id),
        )
    }
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for TelemetryError {}

/// Counters for internal failures that never reach user code.
#[derive(Debug, Default)]
pub struct Diagnostics {
    double_finalize: AtomicU64,
    unknown_workflow: AtomicU64,
    duplicate_workflow: AtomicU64,
    unterminated_workflows: AtomicU64,
    evaluation_failures: AtomicU64,
    export_transient_failures: AtomicU64,
    export_rejections: AtomicU64,
    buffer_overflows: AtomicU64,
    cancelled_spans: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of an internal failure.
    pub fn record(&self, kind: ErrorKind) {
        self.record_many(kind, 1);
    }

    pub fn record_many(&self, kind: ErrorKind, n: u64) {
        self.counter(kind).fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    fn counter(&self, kind: ErrorKind) -> &AtomicU64 {
        match kind {
            ErrorKind::DoubleFinalize => &self.double_finalize,
            ErrorKind::UnknownWorkflow => &self.unknown_workflow,
            ErrorKind::DuplicateWorkflow => &self.duplicate_workflow,
            ErrorKind::UnterminatedWorkflow => &self.unterminated_workflows,
            ErrorKind::EvaluationFailure => &self.evaluation_failures,
            ErrorKind::ExportTransientFailure => &self.export_transient_failures,
            ErrorKind::ExportRejected => &self.export_rejections,
            ErrorKind::BufferOverflow => &self.buffer_overflows,
            ErrorKind::Cancelled => &self.cancelled_spans,
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            double_finalize: self.count(ErrorKind::DoubleFinalize),
            unknown_workflow: self.count(ErrorKind::UnknownWorkflow),
            duplicate_workflow: self.count(ErrorKind::DuplicateWorkflow),
            unterminated_workflows: self.count(ErrorKind::UnterminatedWorkflow),
            evaluation_failures: self.count(ErrorKind::EvaluationFailure),
            export_transient_failures: self.count(ErrorKind::ExportTransientFailure),
            export_rejections: self.count(ErrorKind::ExportRejected),
            buffer_overflows: self.count(ErrorKind::BufferOverflow),
            cancelled_spans: self.count(ErrorKind::Cancelled),
        }
    }
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub double_finalize: u64,
    pub unknown_workflow: u64,
    pub duplicate_workflow: u64,
    pub unterminated_workflows: u64,
    pub evaluation_failures: u64,
    /// Sink submissions that failed and were retried or dropped
    pub export_transient_failures: u64,
    /// Batches the sink refused outright
    pub export_rejections: u64,
    /// Events evicted by a full buffer or refused by a closed one
    pub buffer_overflows: u64,
    pub cancelled_spans: u64,
}

// ─── Captured error construction ───────────────────────────────────

/// Describe a user error by its type and rendered message.
pub(crate) fn captured_from_display<E: fmt::Display>(err: &E) -> CapturedError {
    CapturedError::new(short_type_name::<E>(), truncate(&err.to_string()))
}

/// Describe a `std::error::Error`, summarizing its source chain.
pub(crate) fn captured_from_std(err: &(dyn std::error::Error + 'static)) -> CapturedError {
    let mut captured = CapturedError::new("error", truncate(&err.to_string()));

    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(truncate(&cause.to_string()));
        source = cause.source();
    }
    if !chain.is_empty() {
        captured = captured.with_stack_summary(chain.join(" <- "));
    }
    captured
}

/// Describe a panic payload caught by `catch_unwind`.
pub(crate) fn captured_from_panic(payload: &(dyn Any + Send)) -> CapturedError {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    CapturedError::new("panic", truncate(&message))
}

/// Last path segment of a type name, keeping generic arguments readable.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    match full.find('<') {
        Some(idx) => format!("{}{}", short, &full[idx..]),
        None => short.to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
    out.push('…');
    out
}
