//! Error capture scopes.
//!
//! A scope observes failures and never suppresses them: `Err` values come
//! back to the caller unchanged, panics are resumed after being recorded,
//! and a scope dropped mid-flight records a cancellation.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use agentwatch_types::{CapturedError, ErrorRecord, TelemetryEvent};

use super::buffer::TelemetryBuffer;
use super::context::{current_link, SpanLink};
use crate::error::{captured_from_display, captured_from_panic, captured_from_std};

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-?[0-9a-f]{4}-?[0-9a-f]{4}-?[0-9a-f]{4}-?[0-9a-f]{12}\b").unwrap()
});
static HEX_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:0x)?[0-9a-f]*[0-9][0-9a-f]*[a-f][0-9a-f]*\b").unwrap());
static NUMBER_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Groups errors that differ only in ids and numbers.
#[derive(Debug, Default)]
pub struct ErrorGrouper {
    occurrences: DashMap<String, u64>,
}

impl ErrorGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable fingerprint of an error's kind and normalized message.
    pub fn fingerprint(error: &CapturedError) -> String {
        let message = UUID_PATTERN.replace_all(&error.message, "<id>");
        let message = HEX_PATTERN.replace_all(&message, "<hex>");
        let message = NUMBER_PATTERN.replace_all(&message, "<n>");

        let mut hasher = Sha256::new();
        hasher.update(error.kind.as_bytes());
        hasher.update(b"\n");
        hasher.update(message.as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    /// Count one occurrence, returning the fingerprint and its running total.
    pub fn observe(&self, error: &CapturedError) -> (String, u64) {
        let fingerprint = Self::fingerprint(error);
        let mut count = self.occurrences.entry(fingerprint.clone()).or_insert(0);
        *count += 1;
        let total = *count;
        drop(count);
        (fingerprint, total)
    }

    pub fn occurrences(&self, fingerprint: &str) -> u64 {
        self.occurrences.get(fingerprint).map(|c| *c).unwrap_or(0)
    }

    /// Number of distinct fingerprints seen so far.
    pub fn distinct(&self) -> usize {
        self.occurrences.len()
    }
}

/// Routes captured failures into the telemetry buffer.
pub struct ErrorTracker {
    buffer: Arc<TelemetryBuffer>,
    grouper: ErrorGrouper,
}

impl ErrorTracker {
    pub fn new(buffer: Arc<TelemetryBuffer>) -> Self {
        Self {
            buffer,
            grouper: ErrorGrouper::new(),
        }
    }

    pub fn grouper(&self) -> &ErrorGrouper {
        &self.grouper
    }

    /// Enqueue an error_captured event attributed to `link`.
    pub(crate) fn record(&self, link: Option<&SpanLink>, error: CapturedError) -> ErrorRecord {
        let (fingerprint, occurrences) = self.grouper.observe(&error);
        let record = ErrorRecord {
            trace_id: link.map(|l| l.trace_id.clone()),
            span_id: link.and_then(|l| l.span_id.clone()),
            node_name: link.and_then(|l| l.node_name.clone()),
            workflow_id: link.and_then(|l| l.workflow_id.clone()),
            error,
            fingerprint,
            occurrences,
            captured_at: Utc::now(),
        };

        if occurrences == 1 {
            log::info!(
                "[ERRORS] New error group {} in {}: [{}] {}",
                record.fingerprint,
                record.node_name.as_deref().unwrap_or("<no node>"),
                record.error.kind,
                record.error.message
            );
        } else {
            log::debug!("[ERRORS] Error group {} seen {} times", record.fingerprint, occurrences);
        }

        self.buffer.enqueue(TelemetryEvent::ErrorCaptured(record.clone()));
        record
    }

    /// Capture an error by hand, attributing it to the ambient span if any.
    pub fn capture_error(&self, err: &(dyn std::error::Error + 'static)) -> ErrorRecord {
        self.record(current_link().as_ref(), captured_from_std(err))
    }

    /// Observe an async block of work; its result is returned unchanged.
    pub async fn capture<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut guard = CaptureGuard::new(self);
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        let link = guard.disarm();

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.record(link.as_ref(), captured_from_display(&err));
                Err(err)
            }
            Err(payload) => {
                self.record(link.as_ref(), captured_from_panic(payload.as_ref()));
                resume_unwind(payload)
            }
        }
    }

    /// Observe a synchronous block of work; its result is returned unchanged.
    pub fn capture_sync<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: Display,
    {
        let link = current_link();
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.record(link.as_ref(), captured_from_display(&err));
                Err(err)
            }
            Err(payload) => {
                self.record(link.as_ref(), captured_from_panic(payload.as_ref()));
                resume_unwind(payload)
            }
        }
    }
}

/// Records a cancellation if the scope is dropped before its work resolves.
struct CaptureGuard<'a> {
    tracker: &'a ErrorTracker,
    link: Option<SpanLink>,
    armed: bool,
}

impl<'a> CaptureGuard<'a> {
    fn new(tracker: &'a ErrorTracker) -> Self {
        Self {
            tracker,
            link: current_link(),
            armed: true,
        }
    }

    fn disarm(&mut self) -> Option<SpanLink> {
        self.armed = false;
        self.link.take()
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.record(self.link.as_ref(), CapturedError::cancelled());
        }
    }
}
