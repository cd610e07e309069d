//! Workflow run registry.
//!
//! Each run moves `active -> completed` or `active -> failed` exactly once.
//! Terminal runs leave the registry, so their ids can be reused and any
//! further calls against them report `UnknownWorkflow`.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use agentwatch_types::{NodeExecution, SpanRecord, SpanStatus, TelemetryEvent, ToolCallRecord, WorkflowState, WorkflowSummary};

use super::buffer::TelemetryBuffer;
use super::context::{with_link, SpanLink};
use crate::error::{Diagnostics, ErrorKind, TelemetryError};

/// Reason recorded for runs still active when the tracker shuts down.
pub const UNTERMINATED_REASON: &str = "unterminated";

/// How the caller says a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Success,
    Failure(String),
}

#[derive(Debug)]
struct WorkflowRun {
    name: String,
    nodes: Vec<NodeExecution>,
    tool_calls: Vec<ToolCallRecord>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl WorkflowRun {
    fn new(name: String) -> Self {
        Self {
            name,
            nodes: Vec::new(),
            tool_calls: Vec::new(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn error_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status == SpanStatus::Error).count()
    }

    fn close(self, workflow_id: String, outcome: Option<WorkflowOutcome>) -> WorkflowSummary {
        let error_count = self.error_count();
        let (state, reason) = match outcome {
            Some(WorkflowOutcome::Failure(reason)) => (WorkflowState::Failed, Some(reason)),
            _ if error_count > 0 => (
                WorkflowState::Failed,
                Some(format!("{} of {} nodes failed", error_count, self.nodes.len())),
            ),
            _ => (WorkflowState::Completed, None),
        };

        WorkflowSummary {
            workflow_id,
            name: self.name,
            state,
            node_count: self.nodes.len(),
            error_count,
            nodes: self.nodes,
            tool_calls: self.tool_calls,
            started_at: self.started_at,
            ended_at: Utc::now().max(self.started_at),
            duration_ms: self.started.elapsed().as_millis() as u64,
            reason,
        }
    }
}

/// Tracks active workflow runs and emits a summary when each one closes.
pub struct WorkflowTracker {
    runs: DashMap<String, WorkflowRun>,
    buffer: Arc<TelemetryBuffer>,
    diagnostics: Arc<Diagnostics>,
}

impl WorkflowTracker {
    pub fn new(buffer: Arc<TelemetryBuffer>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            runs: DashMap::new(),
            buffer,
            diagnostics,
        }
    }

    /// Start a run under a freshly generated id.
    pub fn start_workflow(&self, name: &str) -> String {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        self.runs.insert(workflow_id.clone(), WorkflowRun::new(name.to_string()));
        log::info!("[WORKFLOW] Started '{}' ({})", name, workflow_id);
        workflow_id
    }

    /// Start a run under a caller-supplied id, which must not be active.
    pub fn start_workflow_with_id(&self, workflow_id: &str, name: &str) -> Result<String, TelemetryError> {
        match self.runs.entry(workflow_id.to_string()) {
            Entry::Occupied(_) => {
                self.diagnostics.record(ErrorKind::DuplicateWorkflow);
                log::warn!("[WORKFLOW] Workflow id '{}' is already active", workflow_id);
                Err(TelemetryError::new(
                    ErrorKind::DuplicateWorkflow,
                    format!("workflow '{}' is already active", workflow_id),
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(WorkflowRun::new(name.to_string()));
                log::info!("[WORKFLOW] Started '{}' ({})", name, workflow_id);
                Ok(workflow_id.to_string())
            }
        }
    }

    /// Append a finished span to a run's node executions.
    ///
    /// An unknown id is logged and counted; the span itself is still exported
    /// by the recorder.
    pub fn record_node(&self, workflow_id: &str, span: &SpanRecord) -> Result<(), TelemetryError> {
        let Some(mut run) = self.runs.get_mut(workflow_id) else {
            return Err(self.unknown(workflow_id, "record_node"));
        };
        run.nodes.push(NodeExecution {
            span_id: span.span_id.clone(),
            node_name: span.node_name.clone(),
            status: span.status,
            duration_ms: span.duration_ms,
        });
        log::debug!(
            "[WORKFLOW] {} node #{}: {} ({:?})",
            workflow_id,
            run.nodes.len(),
            span.node_name,
            span.status
        );
        Ok(())
    }

    /// Record a tool invocation made inside a run.
    pub fn record_tool_call(
        &self,
        workflow_id: &str,
        tool_name: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<(), TelemetryError> {
        let Some(mut run) = self.runs.get_mut(workflow_id) else {
            return Err(self.unknown(workflow_id, "record_tool_call"));
        };
        run.tool_calls.push(ToolCallRecord {
            tool_name: tool_name.to_string(),
            success,
            duration_ms,
        });
        Ok(())
    }

    /// Finalize a run and emit its workflow_closed event.
    ///
    /// The run fails if `outcome` says so or any of its nodes errored.
    pub fn end_workflow(
        &self,
        workflow_id: &str,
        outcome: Option<WorkflowOutcome>,
    ) -> Result<WorkflowSummary, TelemetryError> {
        let Some((id, run)) = self.runs.remove(workflow_id) else {
            return Err(self.unknown(workflow_id, "end_workflow"));
        };
        Ok(self.emit(run.close(id, outcome)))
    }

    /// Run a future with this workflow as its ambient context.
    ///
    /// Spans opened directly inside the scope are recorded as the run's nodes.
    pub async fn scope<F: Future>(&self, workflow_id: &str, fut: F) -> F::Output {
        with_link(SpanLink::for_workflow(workflow_id), fut).await
    }

    pub fn is_active(&self, workflow_id: &str) -> bool {
        self.runs.contains_key(workflow_id)
    }

    pub fn active_count(&self) -> usize {
        self.runs.len()
    }

    /// Nodes recorded so far for an active run.
    pub fn node_count(&self, workflow_id: &str) -> Option<usize> {
        self.runs.get(workflow_id).map(|run| run.nodes.len())
    }

    /// Fail every run that is still active, emitting a summary for each.
    pub fn shutdown(&self) -> Vec<WorkflowSummary> {
        self.fail_unterminated("shutdown")
    }

    fn fail_unterminated(&self, during: &str) -> Vec<WorkflowSummary> {
        let ids: Vec<String> = self.runs.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = Vec::with_capacity(ids.len());

        for workflow_id in ids {
            // A concurrent end_workflow may have won the race
            if let Some((id, run)) = self.runs.remove(&workflow_id) {
                self.diagnostics.record(ErrorKind::UnterminatedWorkflow);
                log::warn!("[WORKFLOW] '{}' ({}) still active at {}", run.name, id, during);
                let outcome = WorkflowOutcome::Failure(UNTERMINATED_REASON.to_string());
                closed.push(self.emit(run.close(id, Some(outcome))));
            }
        }
        closed
    }

    fn emit(&self, summary: WorkflowSummary) -> WorkflowSummary {
        log::info!(
            "[WORKFLOW] Closed '{}' ({}) as {:?}: {} nodes, {} errors, {}ms",
            summary.name,
            summary.workflow_id,
            summary.state,
            summary.node_count,
            summary.error_count,
            summary.duration_ms
        );
        self.buffer.enqueue(TelemetryEvent::WorkflowClosed(summary.clone()));
        summary
    }

    fn unknown(&self, workflow_id: &str, operation: &str) -> TelemetryError {
        self.diagnostics.record(ErrorKind::UnknownWorkflow);
        log::warn!("[WORKFLOW] {} on unknown workflow '{}'", operation, workflow_id);
        TelemetryError::unknown_workflow(workflow_id)
    }
}

impl Drop for WorkflowTracker {
    fn drop(&mut self) {
        self.fail_unterminated("teardown");
    }
}
