//! The `AgentWatch` client: wires the engine together and owns the exporter.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agentwatch_types::{AttributeValue, EvaluationResult, SpanKind, SpanRecord, TelemetryEvent};

use crate::config::AgentWatchConfig;
use crate::error::{Diagnostics, DiagnosticsSnapshot};
use crate::telemetry::{
    BackendSink, ErrorTracker, EvaluationEngine, ExportStatsSnapshot, Exporter, HttpSink, Judge, SpanOutcome,
    SpanRecorder, TelemetryBuffer, TraceContext, Traced, WorkflowOutcome, WorkflowTracker,
};

static GLOBAL: OnceCell<AgentWatch> = OnceCell::new();

/// Point-in-time view of the client's internal health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub diagnostics: DiagnosticsSnapshot,
    pub export: ExportStatsSnapshot,
    /// Events waiting in the buffer
    pub buffered: usize,
    /// Events evicted from a full buffer
    pub dropped_events: u64,
    /// Events produced after shutdown, which are never exported
    pub refused_events: u64,
    pub active_workflows: usize,
    pub open_spans: usize,
}

/// In-process observability client.
///
/// Must be started from within a Tokio runtime; the exporter runs as a
/// background task until [`shutdown`](Self::shutdown).
pub struct AgentWatch {
    config: AgentWatchConfig,
    buffer: Arc<TelemetryBuffer>,
    diagnostics: Arc<Diagnostics>,
    evaluator: Arc<EvaluationEngine>,
    workflows: Arc<WorkflowTracker>,
    errors: Arc<ErrorTracker>,
    recorder: Arc<SpanRecorder>,
    exporter: Exporter,
    shut_down: AtomicBool,
}

impl AgentWatch {
    pub fn start(config: AgentWatchConfig, sink: Arc<dyn BackendSink>) -> Self {
        Self::start_with_judge(config, sink, None)
    }

    /// Start with a judge for natural-language expected behaviors.
    pub fn start_with_judge(
        config: AgentWatchConfig,
        sink: Arc<dyn BackendSink>,
        judge: Option<Arc<dyn Judge>>,
    ) -> Self {
        let exporter_config = &config.exporter;
        let diagnostics = Arc::new(Diagnostics::new());
        let buffer = Arc::new(
            TelemetryBuffer::new(exporter_config.buffer_capacity, exporter_config.batch_size)
                .with_diagnostics(Arc::clone(&diagnostics)),
        );
        let evaluator = Arc::new(EvaluationEngine::new(&config.nodes, judge, Arc::clone(&diagnostics)));
        let workflows = Arc::new(WorkflowTracker::new(Arc::clone(&buffer), Arc::clone(&diagnostics)));
        let errors = Arc::new(ErrorTracker::new(Arc::clone(&buffer)));
        let recorder = Arc::new(SpanRecorder::new(
            Arc::clone(&buffer),
            Arc::clone(&evaluator),
            Arc::clone(&workflows),
            Arc::clone(&errors),
            Arc::clone(&diagnostics),
        ));
        let exporter = Exporter::start(exporter_config, Arc::clone(&buffer), sink, Arc::clone(&diagnostics));

        log::info!(
            "[AGENTWATCH] Started for '{}' ({}) with {} configured nodes",
            config.app_name,
            config.environment,
            config.nodes.len()
        );

        Self {
            config,
            buffer,
            diagnostics,
            evaluator,
            workflows,
            errors,
            recorder,
            exporter,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start against the HTTP intake named in the backend configuration.
    pub fn start_http(config: AgentWatchConfig) -> Result<Self, String> {
        if config.backend.api_key.is_empty() {
            log::warn!("[AGENTWATCH] No backend API key configured; batches will likely be rejected");
        }
        let sink = HttpSink::new(&config.backend, &config.app_name, &config.environment)?;
        Ok(Self::start(config, Arc::new(sink)))
    }

    pub fn config(&self) -> &AgentWatchConfig {
        &self.config
    }

    // =====================================================
    // Spans
    // =====================================================

    pub async fn trace<F, T, E>(&self, node_name: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        self.recorder.trace(node_name, fut).await
    }

    pub async fn trace_kind<F, T, E>(&self, node_name: &str, kind: SpanKind, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        self.recorder.trace_kind(node_name, kind, fut).await
    }

    pub async fn trace_with<C, F, T, E>(&self, node_name: &str, kind: SpanKind, call: C) -> Result<T, E>
    where
        C: FnOnce(TraceContext) -> F,
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        self.recorder.trace_with(node_name, kind, call).await
    }

    pub fn trace_sync<T, E>(&self, node_name: &str, call: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        T: Serialize,
        E: Display,
    {
        self.recorder.trace_sync(node_name, call)
    }

    pub fn wrap<F>(&self, node_name: &str, f: F) -> Traced<F> {
        self.recorder.wrap(node_name, f)
    }

    pub fn begin(&self, node_name: &str, parent: Option<&TraceContext>) -> TraceContext {
        self.recorder.begin(node_name, parent)
    }

    pub fn end(&self, ctx: &TraceContext, outcome: SpanOutcome) -> Option<SpanRecord> {
        self.recorder.end(ctx, outcome)
    }

    pub fn annotate(&self, ctx: &TraceContext, key: &str, value: impl Into<AttributeValue>) {
        self.recorder.annotate(ctx, key, value)
    }

    pub fn recorder(&self) -> &Arc<SpanRecorder> {
        &self.recorder
    }

    // =====================================================
    // Errors, workflows and evaluation
    // =====================================================

    pub fn error_tracker(&self) -> &ErrorTracker {
        &self.errors
    }

    pub fn agent_monitor(&self) -> &WorkflowTracker {
        &self.workflows
    }

    /// Evaluate an output by hand and export the result.
    pub fn evaluate<T: Serialize + ?Sized>(&self, node_name: &str, output: &T) -> EvaluationResult {
        let result = self.evaluator.evaluate(node_name, output);
        self.buffer.enqueue(TelemetryEvent::EvaluationResult(result.clone()));
        result
    }

    /// Run `fut` as a complete workflow: start, scope, and end it.
    ///
    /// An `Err` result fails the run with the error's message. If the future
    /// is dropped or panics, the run is failed as cancelled.
    pub async fn run_workflow<F, T, E>(&self, name: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let workflow_id = self.workflows.start_workflow(name);
        let mut guard = WorkflowGuard {
            workflows: &self.workflows,
            workflow_id: Some(workflow_id.clone()),
        };

        let result = self.workflows.scope(&workflow_id, fut).await;
        guard.disarm();

        let outcome = match &result {
            Ok(_) => None,
            Err(err) => Some(WorkflowOutcome::Failure(err.to_string())),
        };
        let _ = self.workflows.end_workflow(&workflow_id, outcome);
        result
    }

    // =====================================================
    // Health and lifecycle
    // =====================================================

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn export_stats(&self) -> ExportStatsSnapshot {
        self.exporter.stats()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            diagnostics: self.diagnostics.snapshot(),
            export: self.exporter.stats(),
            buffered: self.buffer.len(),
            dropped_events: self.buffer.dropped_events(),
            refused_events: self.buffer.refused_events(),
            active_workflows: self.workflows.active_count(),
            open_spans: self.recorder.open_spans(),
        }
    }

    /// Ask the exporter to flush now rather than at the next interval.
    pub fn flush(&self) {
        self.buffer.request_flush();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Fail unterminated workflows, then run the final bounded flush.
    ///
    /// Anything instrumented after this point is counted in
    /// `refused_events` instead of being buffered. Safe to call more than
    /// once; later calls just report health.
    pub async fn shutdown(&self) -> HealthReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return self.health();
        }

        let unterminated = self.workflows.shutdown();
        if !unterminated.is_empty() {
            log::warn!("[AGENTWATCH] {} workflows were still active at shutdown", unterminated.len());
        }
        self.buffer.close();
        self.exporter.shutdown().await;

        let report = self.health();
        log::info!(
            "[AGENTWATCH] Shut down: {} events exported, {} dropped in export, {} evicted, {} lost at shutdown",
            report.export.exported_events,
            report.export.dropped_events,
            report.dropped_events,
            report.export.shutdown_dropped
        );
        report
    }
}

/// Fails the run if `run_workflow` never reached its own end call.
struct WorkflowGuard<'a> {
    workflows: &'a WorkflowTracker,
    workflow_id: Option<String>,
}

impl WorkflowGuard<'_> {
    fn disarm(&mut self) {
        self.workflow_id = None;
    }
}

impl Drop for WorkflowGuard<'_> {
    fn drop(&mut self) {
        if let Some(workflow_id) = self.workflow_id.take() {
            let outcome = WorkflowOutcome::Failure("cancelled".to_string());
            let _ = self.workflows.end_workflow(&workflow_id, Some(outcome));
        }
    }
}

// =====================================================
// Process-wide client
// =====================================================

/// Install the process-wide client. A second call keeps the first client.
pub fn init(config: AgentWatchConfig, sink: Arc<dyn BackendSink>) -> &'static AgentWatch {
    if let Some(existing) = GLOBAL.get() {
        log::warn!("[AGENTWATCH] Already initialized; ignoring new configuration");
        return existing;
    }
    GLOBAL.get_or_init(|| AgentWatch::start(config, sink))
}

/// The process-wide client, if [`init`] has run.
pub fn global() -> Option<&'static AgentWatch> {
    GLOBAL.get()
}

pub fn is_initialized() -> bool {
    GLOBAL.get().is_some()
}
