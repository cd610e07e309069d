//! Test fixtures: scripted sinks and event builders.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::time::Instant;

use agentwatch_types::{CapturedError, ErrorRecord, EventEnvelope, TelemetryEvent};

use super::sink::{BackendSink, SinkResponse};

/// A minimal error event, handy for buffer and exporter tests.
pub fn error_event(message: &str) -> TelemetryEvent {
    TelemetryEvent::ErrorCaptured(ErrorRecord {
        trace_id: None,
        span_id: None,
        node_name: None,
        workflow_id: None,
        error: CapturedError::new("test", message),
        fingerprint: message.to_string(),
        occurrences: 1,
        captured_at: Utc::now(),
    })
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Sink that answers from a script, then falls back to a default response.
pub struct ScriptedSink {
    script: Mutex<VecDeque<SinkResponse>>,
    fallback: SinkResponse,
    panic_first: Mutex<bool>,
    submitted: Mutex<Vec<Vec<EventEnvelope>>>,
    delivered: Mutex<Vec<EventEnvelope>>,
    attempt_times: Mutex<Vec<Instant>>,
}

impl ScriptedSink {
    pub fn with_script(script: Vec<SinkResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: SinkResponse::Accepted,
            panic_first: Mutex::new(false),
            submitted: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            attempt_times: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::with_script(Vec::new())
    }

    pub fn always(response: SinkResponse) -> Self {
        let mut sink = Self::with_script(Vec::new());
        sink.fallback = response;
        sink
    }

    pub fn panicking_first() -> Self {
        let sink = Self::accepting();
        *sink.panic_first.lock() = true;
        sink
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().len()
    }

    /// Sequence numbers of every submission, accepted or not.
    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.submitted
            .lock()
            .iter()
            .map(|b| b.iter().map(|e| e.sequence).collect())
            .collect()
    }

    /// Sequence numbers the sink accepted, in delivery order.
    pub fn delivered_sequences(&self) -> Vec<u64> {
        self.delivered.lock().iter().map(|e| e.sequence).collect()
    }

    pub fn delivered(&self) -> Vec<EventEnvelope> {
        self.delivered.lock().clone()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().clone()
    }
}

#[async_trait]
impl BackendSink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, batch: &[EventEnvelope]) -> SinkResponse {
        let should_panic = std::mem::replace(&mut *self.panic_first.lock(), false);
        self.attempt_times.lock().push(Instant::now());
        self.submitted.lock().push(batch.to_vec());
        if should_panic {
            panic!("scripted sink failure");
        }

        let response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match &response {
            SinkResponse::Accepted => self.delivered.lock().extend(batch.iter().cloned()),
            SinkResponse::Partial { failed_indices } => self.delivered.lock().extend(
                batch
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !failed_indices.contains(i))
                    .map(|(_, e)| e.clone()),
            ),
            _ => {}
        }
        response
    }
}
