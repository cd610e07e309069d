//! Shared wire types for agentwatch telemetry and the backend sinks that ingest it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =====================================================
// Spans
// =====================================================

/// The kind of operation a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// A whole agent workflow
    Workflow,
    /// An LLM generation call
    Llm,
    /// A generic unit of work
    #[default]
    Task,
    /// An agent step (planning, routing, delegation)
    Agent,
    /// A tool execution
    Tool,
}

/// The completion status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Success,
    Error,
}

impl SpanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SpanStatus::Running)
    }
}

/// A scalar span attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

/// Error details captured from a failed or cancelled call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedError {
    /// Error type or category (e.g. the Rust type name, "panic", "Cancelled")
    pub kind: String,
    /// Rendered error message
    pub message: String,
    /// Source chain summary, never raw frames or locals
    pub stack_summary: Option<String>,
}

impl CapturedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack_summary: None,
        }
    }

    pub fn with_stack_summary(mut self, summary: impl Into<String>) -> Self {
        self.stack_summary = Some(summary.into());
        self
    }

    /// The error recorded when the host drops an in-flight call.
    pub fn cancelled() -> Self {
        Self::new("Cancelled", "call was cancelled before completion")
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == "Cancelled"
    }
}

/// A finalized span, handed to the exporter once its call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub node_name: String,
    pub kind: SpanKind,
    /// The workflow this span ran under, if any
    pub workflow_id: Option<String>,
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub error: Option<CapturedError>,
    pub evaluation: Option<EvaluationResult>,
}

// =====================================================
// Errors
// =====================================================

/// An error observed by an error capture scope or a failed span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub node_name: Option<String>,
    pub workflow_id: Option<String>,
    pub error: CapturedError,
    /// Stable hash grouping errors that differ only in ids and numbers
    pub fingerprint: String,
    /// How many times this fingerprint has been seen in this process
    pub occurrences: u64,
    pub captured_at: DateTime<Utc>,
}

// =====================================================
// Evaluation
// =====================================================

/// Outcome of a single expected-behavior rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    /// Human-readable label of the rule
    pub descriptor: String,
    pub passed: bool,
    pub confidence: f64,
    /// Why the rule failed, or why it could not run
    pub reason: Option<String>,
}

/// The evaluation of one node output against its configured rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub node_name: String,
    pub rule_set_version: Option<String>,
    pub span_id: Option<String>,
    pub rules: Vec<RuleOutcome>,
    pub passed: bool,
    pub confidence: f64,
    pub output_snapshot: String,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn rules_evaluated(&self) -> usize {
        self.rules.len()
    }

    pub fn failed_rules(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.rules.iter().filter(|r| !r.passed)
    }
}

// =====================================================
// Workflows
// =====================================================

/// The lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Active,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Active)
    }
}

/// A node execution registered under a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub span_id: String,
    pub node_name: String,
    pub status: SpanStatus,
    pub duration_ms: u64,
}

/// A tool invocation made by an agent inside a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// Summary emitted when a workflow run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub name: String,
    pub state: WorkflowState,
    pub node_count: usize,
    pub error_count: usize,
    pub nodes: Vec<NodeExecution>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Why the run failed, if it did
    pub reason: Option<String>,
}

// =====================================================
// Events
// =====================================================

/// A unit of telemetry delivered to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    SpanClosed(SpanRecord),
    ErrorCaptured(ErrorRecord),
    EvaluationResult(EvaluationResult),
    WorkflowClosed(WorkflowSummary),
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::SpanClosed(_) => "span_closed",
            TelemetryEvent::ErrorCaptured(_) => "error_captured",
            TelemetryEvent::EvaluationResult(_) => "evaluation_result",
            TelemetryEvent::WorkflowClosed(_) => "workflow_closed",
        }
    }
}

/// An event stamped with its process-wide sequence number at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    pub event: TelemetryEvent,
}
