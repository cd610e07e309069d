//! Span recorder: opens a trace context per instrumented call and finalizes
//! it exactly once.
//!
//! For a single call, events are enqueued in causal order: error_captured,
//! then evaluation_result, then span_closed.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use agentwatch_types::{
    AttributeValue, CapturedError, EvaluationResult, SpanKind, SpanRecord, SpanStatus, TelemetryEvent,
};

use super::buffer::TelemetryBuffer;
use super::context::{current_link, with_link, with_sync_link, SpanLink};
use super::errors::ErrorTracker;
use super::evaluation::EvaluationEngine;
use super::workflow::WorkflowTracker;
use crate::error::{captured_from_display, captured_from_panic, Diagnostics, ErrorKind};

#[derive(Debug)]
struct ContextInner {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    node_name: String,
    kind: SpanKind,
    workflow_id: Option<String>,
    /// Opened directly inside a workflow scope
    workflow_node: bool,
    started_at: DateTime<Utc>,
    started: Instant,
    finalized: AtomicBool,
    attributes: Mutex<BTreeMap<String, AttributeValue>>,
}

/// Handle to one in-flight span. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct TraceContext {
    inner: Arc<ContextInner>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.inner.span_id
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.inner.parent_span_id.as_deref()
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    pub fn kind(&self) -> SpanKind {
        self.inner.kind
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.inner.workflow_id.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    /// The link children of this span inherit.
    pub fn link(&self) -> SpanLink {
        SpanLink {
            trace_id: self.inner.trace_id.clone(),
            span_id: Some(self.inner.span_id.clone()),
            node_name: Some(self.inner.node_name.clone()),
            workflow_id: self.inner.workflow_id.clone(),
        }
    }

    /// Attach a scalar attribute. Returns false once the span is closed.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) -> bool {
        if self.is_finalized() {
            return false;
        }
        self.inner.attributes.lock().insert(key.into(), value.into());
        true
    }
}

/// How an instrumented call finished.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanOutcome {
    Success,
    Error(CapturedError),
}

/// Opens and finalizes spans, routing their events into the buffer.
pub struct SpanRecorder {
    buffer: Arc<TelemetryBuffer>,
    evaluator: Arc<EvaluationEngine>,
    workflows: Arc<WorkflowTracker>,
    errors: Arc<ErrorTracker>,
    diagnostics: Arc<Diagnostics>,
    open: AtomicUsize,
}

impl SpanRecorder {
    pub fn new(
        buffer: Arc<TelemetryBuffer>,
        evaluator: Arc<EvaluationEngine>,
        workflows: Arc<WorkflowTracker>,
        errors: Arc<ErrorTracker>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            buffer,
            evaluator,
            workflows,
            errors,
            diagnostics,
            open: AtomicUsize::new(0),
        }
    }

    /// Open a task span under `parent`, or under the ambient span if none is given.
    pub fn begin(&self, node_name: &str, parent: Option<&TraceContext>) -> TraceContext {
        self.begin_kind(node_name, SpanKind::Task, parent)
    }

    pub fn begin_kind(&self, node_name: &str, kind: SpanKind, parent: Option<&TraceContext>) -> TraceContext {
        let link = parent.map(TraceContext::link).or_else(current_link);
        let (trace_id, parent_span_id, workflow_id) = match link {
            Some(link) => (link.trace_id, link.span_id, link.workflow_id),
            None => (uuid::Uuid::new_v4().simple().to_string(), None, None),
        };
        let workflow_node = workflow_id.is_some() && parent_span_id.is_none();

        self.open.fetch_add(1, Ordering::SeqCst);
        let ctx = TraceContext {
            inner: Arc::new(ContextInner {
                trace_id,
                span_id: uuid::Uuid::new_v4().to_string(),
                parent_span_id,
                node_name: node_name.to_string(),
                kind,
                workflow_id,
                workflow_node,
                started_at: Utc::now(),
                started: Instant::now(),
                finalized: AtomicBool::new(false),
                attributes: Mutex::new(BTreeMap::new()),
            }),
        };
        log::debug!("[SPAN] Begin {} '{}' ({:?})", ctx.span_id(), node_name, kind);
        ctx
    }

    /// Finalize a span and enqueue its span_closed event.
    ///
    /// A second call on the same context is counted as `DoubleFinalize` and
    /// returns `None` without emitting anything.
    pub fn end(&self, ctx: &TraceContext, outcome: SpanOutcome) -> Option<SpanRecord> {
        self.finalize(ctx, outcome, None)
    }

    /// Attach an attribute to an open span; closed spans ignore it.
    pub fn annotate(&self, ctx: &TraceContext, key: &str, value: impl Into<AttributeValue>) {
        if !ctx.set_attribute(key, value) {
            log::debug!("[SPAN] Ignoring attribute '{}' on closed span {}", key, ctx.span_id());
        }
    }

    /// Contexts begun and not yet finalized.
    pub fn open_spans(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Instrument an async call as a task span.
    pub async fn trace<F, T, E>(&self, node_name: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        self.trace_kind(node_name, SpanKind::Task, fut).await
    }

    pub async fn trace_kind<F, T, E>(&self, node_name: &str, kind: SpanKind, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        self.trace_with(node_name, kind, |_| fut).await
    }

    /// Like [`trace_kind`](Self::trace_kind), handing the span to the call so it can annotate itself.
    pub async fn trace_with<C, F, T, E>(&self, node_name: &str, kind: SpanKind, call: C) -> Result<T, E>
    where
        C: FnOnce(TraceContext) -> F,
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        let ctx = self.begin_kind(node_name, kind, None);
        let mut guard = CancelGuard::new(self, ctx.clone());
        let fut = call(ctx.clone());
        let outcome = AssertUnwindSafe(with_link(ctx.link(), fut)).catch_unwind().await;
        guard.disarm();

        match outcome {
            Ok(result) => self.settle(&ctx, result),
            Err(payload) => {
                self.fail(&ctx, captured_from_panic(payload.as_ref()));
                resume_unwind(payload)
            }
        }
    }

    /// Instrument a synchronous call.
    pub fn trace_sync<T, E>(&self, node_name: &str, call: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        T: Serialize,
        E: Display,
    {
        let ctx = self.begin(node_name, None);
        let link = ctx.link();
        match catch_unwind(AssertUnwindSafe(|| with_sync_link(link, call))) {
            Ok(result) => self.settle(&ctx, result),
            Err(payload) => {
                self.fail(&ctx, captured_from_panic(payload.as_ref()));
                resume_unwind(payload)
            }
        }
    }

    /// Wrap an async function so every call through the wrapper is traced.
    pub fn wrap<F>(self: &Arc<Self>, node_name: &str, f: F) -> Traced<F> {
        Traced {
            recorder: Arc::clone(self),
            node_name: node_name.to_string(),
            kind: SpanKind::Task,
            f,
        }
    }

    fn settle<T: Serialize, E: Display>(&self, ctx: &TraceContext, result: Result<T, E>) -> Result<T, E> {
        match result {
            Ok(value) => {
                self.succeed(ctx, &value);
                Ok(value)
            }
            Err(err) => {
                self.fail(ctx, captured_from_display(&err));
                Err(err)
            }
        }
    }

    fn succeed<T: Serialize>(&self, ctx: &TraceContext, output: &T) {
        let evaluation = if self.evaluator.has_rules(ctx.node_name()) && !ctx.is_finalized() {
            let mut result = self.evaluator.evaluate(ctx.node_name(), output);
            result.span_id = Some(ctx.span_id().to_string());
            if !result.passed {
                log::info!(
                    "[SPAN] '{}' output failed evaluation ({} of {} rules, confidence {:.2})",
                    ctx.node_name(),
                    result.failed_rules().count(),
                    result.rules_evaluated(),
                    result.confidence
                );
            }
            self.buffer.enqueue(TelemetryEvent::EvaluationResult(result.clone()));
            Some(result)
        } else {
            None
        };
        self.finalize(ctx, SpanOutcome::Success, evaluation);
    }

    fn fail(&self, ctx: &TraceContext, error: CapturedError) {
        if !ctx.is_finalized() {
            self.errors.record(Some(&ctx.link()), error.clone());
        }
        self.finalize(ctx, SpanOutcome::Error(error), None);
    }

    fn finalize(
        &self,
        ctx: &TraceContext,
        outcome: SpanOutcome,
        evaluation: Option<EvaluationResult>,
    ) -> Option<SpanRecord> {
        let inner = &ctx.inner;
        if inner.finalized.swap(true, Ordering::SeqCst) {
            self.diagnostics.record(ErrorKind::DoubleFinalize);
            log::warn!(
                "[SPAN] Span {} ('{}') finalized more than once; ignoring",
                inner.span_id,
                inner.node_name
            );
            return None;
        }
        self.open.fetch_sub(1, Ordering::SeqCst);

        let (status, error) = match outcome {
            SpanOutcome::Success => (SpanStatus::Success, None),
            SpanOutcome::Error(error) => {
                if error.is_cancellation() {
                    self.diagnostics.record(ErrorKind::Cancelled);
                }
                (SpanStatus::Error, Some(error))
            }
        };

        let record = SpanRecord {
            trace_id: inner.trace_id.clone(),
            span_id: inner.span_id.clone(),
            parent_span_id: inner.parent_span_id.clone(),
            node_name: inner.node_name.clone(),
            kind: inner.kind,
            workflow_id: inner.workflow_id.clone(),
            status,
            started_at: inner.started_at,
            ended_at: Utc::now().max(inner.started_at),
            duration_ms: inner.started.elapsed().as_millis() as u64,
            attributes: inner.attributes.lock().clone(),
            error,
            evaluation,
        };

        if let (true, Some(workflow_id)) = (inner.workflow_node, record.workflow_id.as_deref()) {
            // Unknown ids are logged and counted by the tracker
            let _ = self.workflows.record_node(workflow_id, &record);
        }

        log::debug!(
            "[SPAN] End {} '{}' {:?} in {}ms",
            record.span_id,
            record.node_name,
            record.status,
            record.duration_ms
        );
        self.buffer.enqueue(TelemetryEvent::SpanClosed(record.clone()));
        Some(record)
    }
}

/// Finalizes the span as cancelled if the traced future is dropped mid-flight.
struct CancelGuard<'a> {
    recorder: &'a SpanRecorder,
    ctx: Option<TraceContext>,
}

impl<'a> CancelGuard<'a> {
    fn new(recorder: &'a SpanRecorder, ctx: TraceContext) -> Self {
        Self {
            recorder,
            ctx: Some(ctx),
        }
    }

    fn disarm(&mut self) {
        self.ctx = None;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            log::debug!("[SPAN] '{}' dropped before completion", ctx.node_name());
            self.recorder
                .finalize(&ctx, SpanOutcome::Error(CapturedError::cancelled()), None);
        }
    }
}

/// An async function whose calls are each recorded as a span.
#[derive(Clone)]
pub struct Traced<F> {
    recorder: Arc<SpanRecorder>,
    node_name: String,
    kind: SpanKind,
    f: F,
}

impl<F> Traced<F> {
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Call the wrapped function with the same argument and result it takes.
    pub async fn call<A, Fut, T, E>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        self.recorder
            .trace_kind(&self.node_name, self.kind, (self.f)(arg))
            .await
    }
}
