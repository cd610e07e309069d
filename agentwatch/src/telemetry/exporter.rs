//! Background flush loop: batches buffered events and delivers them to the
//! backend sink with retry and exponential backoff.
//!
//! The loop runs on its own Tokio task; producers only ever touch the
//! buffer. A batch that exhausts its retries is dropped and counted so the
//! next batch is never held behind it.

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use agentwatch_types::EventEnvelope;

use super::buffer::TelemetryBuffer;
use super::sink::{BackendSink, SinkResponse};
use crate::config::ExporterConfig;
use crate::error::{Diagnostics, ErrorKind};

/// Retry schedule for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-attempts after the first submission
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt_idx` (0-based): `base * 2^idx`, capped.
    pub fn delay_for_attempt(&self, attempt_idx: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_idx).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Delivery counters kept by the exporter.
#[derive(Debug, Default)]
pub struct ExportStats {
    exported_events: AtomicU64,
    exported_batches: AtomicU64,
    retries: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_events: AtomicU64,
    rejected_batches: AtomicU64,
    rejection_warnings: AtomicU64,
    shutdown_dropped: AtomicU64,
}

impl ExportStats {
    pub fn snapshot(&self) -> ExportStatsSnapshot {
        ExportStatsSnapshot {
            exported_events: self.exported_events.load(Ordering::Relaxed),
            exported_batches: self.exported_batches.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            rejected_batches: self.rejected_batches.load(Ordering::Relaxed),
            rejection_warnings: self.rejection_warnings.load(Ordering::Relaxed),
            shutdown_dropped: self.shutdown_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ExportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStatsSnapshot {
    pub exported_events: u64,
    pub exported_batches: u64,
    /// Re-submissions of a batch (or of its failed remainder)
    pub retries: u64,
    /// Batches given up on after exhausting retries
    pub dropped_batches: u64,
    /// Events lost to exhausted retries or rejection
    pub dropped_events: u64,
    pub rejected_batches: u64,
    pub rejection_warnings: u64,
    /// Events still buffered or in flight when shutdown gave up
    pub shutdown_dropped: u64,
}

/// Logs at most one rejection warning per window.
#[derive(Debug)]
struct RejectionWarner {
    window: Duration,
    last_warned: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl RejectionWarner {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_warned: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns true if a warning was logged.
    fn warn(&self, sink: &str, reason: &str, events: usize) -> bool {
        let mut last = self.last_warned.lock();
        let due = last.map(|t| t.elapsed() >= self.window).unwrap_or(true);
        if !due {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        *last = Some(Instant::now());
        let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
        log::warn!(
            "[EXPORTER] Sink '{}' rejected a batch of {} events: {} ({} similar rejections suppressed)",
            sink,
            events,
            reason,
            suppressed
        );
        true
    }
}

/// State shared between the exporter handle and its flush task.
struct ExportWorker {
    buffer: Arc<TelemetryBuffer>,
    sink: Arc<dyn BackendSink>,
    policy: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    stats: Arc<ExportStats>,
    warner: RejectionWarner,
    diagnostics: Arc<Diagnostics>,
    /// Events taken from the buffer but not yet resolved
    in_flight: AtomicUsize,
}

impl ExportWorker {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.buffer.ready() => {}
            }
            self.flush_all().await;
        }

        // Final drain; the caller bounds how long this may take
        self.flush_all().await;
        log::debug!("[EXPORTER] Flush loop stopped");
    }

    async fn flush_all(&self) {
        loop {
            let batch = self.buffer.drain_batch(self.batch_size);
            if batch.is_empty() {
                break;
            }
            self.in_flight.store(batch.len(), Ordering::SeqCst);
            self.deliver(batch).await;
            self.in_flight.store(0, Ordering::SeqCst);
        }
    }

    /// Submit one batch until it is accepted, rejected, or out of retries.
    async fn deliver(&self, batch: Vec<EventEnvelope>) {
        let mut pending = batch;
        let mut attempt: u32 = 0;

        loop {
            let response = match AssertUnwindSafe(self.sink.submit(&pending)).catch_unwind().await {
                Ok(response) => response,
                Err(_) => SinkResponse::Transient {
                    reason: "sink panicked during submit".to_string(),
                },
            };

            let mut min_delay = Duration::ZERO;
            match response {
                SinkResponse::Accepted => {
                    self.record_exported(pending.len());
                    self.stats.exported_batches.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                SinkResponse::Partial { failed_indices } => {
                    let before = pending.len();
                    pending = pending
                        .into_iter()
                        .enumerate()
                        .filter(|(i, _)| failed_indices.contains(i))
                        .map(|(_, e)| e)
                        .collect();
                    self.record_exported(before - pending.len());
                    if pending.is_empty() {
                        self.stats.exported_batches.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    self.in_flight.store(pending.len(), Ordering::SeqCst);
                    log::debug!(
                        "[EXPORTER] {} of {} events failed, resubmitting remainder",
                        pending.len(),
                        before
                    );
                }
                SinkResponse::Throttled { retry_after } => {
                    min_delay = retry_after.unwrap_or_default();
                    log::debug!("[EXPORTER] Sink '{}' throttled (retry after {:?})", self.sink.name(), retry_after);
                }
                SinkResponse::Transient { reason } => {
                    self.diagnostics.record(ErrorKind::ExportTransientFailure);
                    log::debug!("[EXPORTER] Transient failure from '{}': {}", self.sink.name(), reason);
                }
                SinkResponse::Rejected { reason } => {
                    self.diagnostics.record(ErrorKind::ExportRejected);
                    self.stats.rejected_batches.fetch_add(1, Ordering::Relaxed);
                    self.stats.dropped_events.fetch_add(pending.len() as u64, Ordering::Relaxed);
                    if self.warner.warn(self.sink.name(), &reason, pending.len()) {
                        self.stats.rejection_warnings.fetch_add(1, Ordering::Relaxed);
                    }
                    return;
                }
            }

            if attempt >= self.policy.max_retries {
                self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.stats.dropped_events.fetch_add(pending.len() as u64, Ordering::Relaxed);
                log::warn!(
                    "[EXPORTER] Dropping batch of {} events (seq {}..={}) after {} retries",
                    pending.len(),
                    pending.first().map(|e| e.sequence).unwrap_or_default(),
                    pending.last().map(|e| e.sequence).unwrap_or_default(),
                    attempt
                );
                return;
            }

            let delay = self.policy.delay_for_attempt(attempt).max(min_delay);
            attempt += 1;
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "[EXPORTER] Retrying batch of {} events in {:?} (attempt {}/{})",
                pending.len(),
                delay,
                attempt,
                self.policy.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn record_exported(&self, events: usize) {
        self.stats.exported_events.fetch_add(events as u64, Ordering::Relaxed);
    }
}

/// Owns the background flush task for its whole lifetime.
///
/// Must be started from within a Tokio runtime.
pub struct Exporter {
    worker: Arc<ExportWorker>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Exporter {
    pub fn start(
        config: &ExporterConfig,
        buffer: Arc<TelemetryBuffer>,
        sink: Arc<dyn BackendSink>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let worker = Arc::new(ExportWorker {
            batch_size: buffer.batch_size(),
            buffer,
            sink,
            policy: config.retry_policy(),
            flush_interval: config.flush_interval(),
            stats: Arc::new(ExportStats::default()),
            warner: RejectionWarner::new(config.rejection_warn_window()),
            diagnostics,
            in_flight: AtomicUsize::new(0),
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&worker).run(cancel.clone()));

        log::info!(
            "[EXPORTER] Started (sink '{}', batch {}, every {:?})",
            worker.sink.name(),
            worker.batch_size,
            worker.flush_interval
        );

        Self {
            worker,
            cancel,
            handle: Mutex::new(Some(handle)),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn stats(&self) -> ExportStatsSnapshot {
        self.worker.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop the flush loop after a final flush bounded by the shutdown timeout.
    ///
    /// Events that could not be delivered in time are counted as dropped.
    /// Calling this again is a no-op that returns the final stats.
    pub async fn shutdown(&self) -> ExportStatsSnapshot {
        self.cancel.cancel();
        let handle = self.handle.lock().take();

        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.shutdown_timeout, &mut handle).await.is_err() {
                handle.abort();
                log::warn!("[EXPORTER] Final flush did not finish within {:?}", self.shutdown_timeout);
            }

            let lost = self.worker.in_flight.swap(0, Ordering::SeqCst) + self.worker.buffer.clear();
            if lost > 0 {
                self.worker.stats.shutdown_dropped.fetch_add(lost as u64, Ordering::Relaxed);
                log::warn!("[EXPORTER] {} events undelivered at shutdown", lost);
            }
            log::info!("[EXPORTER] Shut down: {:?}", self.worker.stats.snapshot());
        }

        self.worker.stats.snapshot()
    }
}

impl Drop for Exporter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::testing::{error_event, ScriptedSink};

    fn config(batch_size: usize, max_retries: u32) -> ExporterConfig {
        ExporterConfig {
            buffer_capacity: 1_000,
            batch_size,
            flush_interval_ms: 50,
            max_retries,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 10_000,
            shutdown_timeout_ms: 1_000,
            rejection_warn_window_secs: 60,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush_delivers_in_order() {
        let config = config(100, 3);
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::accepting());
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::new(Diagnostics::new()));

        for i in 0..5 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(sink.delivered_sequences(), vec![1, 2, 3, 4, 5]);
        let stats = exporter.shutdown().await;
        assert_eq!(stats.exported_events, 5);
        assert_eq!(stats.shutdown_dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_threshold_triggers_flush_before_interval() {
        let mut config = config(4, 3);
        config.flush_interval_ms = 60_000;
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::accepting());
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::new(Diagnostics::new()));

        for i in 0..4 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.submissions(), 1);
        assert_eq!(sink.delivered_sequences(), vec![1, 2, 3, 4]);
        exporter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_batch_without_blocking_next() {
        let config = config(2, 2);
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::with_script(vec![
            SinkResponse::Transient { reason: "503".to_string() },
            SinkResponse::Transient { reason: "503".to_string() },
            SinkResponse::Transient { reason: "503".to_string() },
        ]));
        let diagnostics = Arc::new(Diagnostics::new());
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::clone(&diagnostics));

        for i in 0..4 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = exporter.shutdown().await;
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.dropped_events, 2);
        assert_eq!(stats.retries, 2);
        assert_eq!(sink.delivered_sequences(), vec![3, 4]);
        assert_eq!(diagnostics.count(ErrorKind::ExportTransientFailure), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_resubmits_only_failed_events() {
        let config = config(3, 3);
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::with_script(vec![SinkResponse::Partial {
            failed_indices: vec![1],
        }]));
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::new(Diagnostics::new()));

        for i in 0..3 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1], vec![2]);
        let stats = exporter.shutdown().await;
        assert_eq!(stats.exported_events, 3);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.dropped_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_drop_immediately_and_warn_once_per_window() {
        let config = config(1, 5);
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::with_script(vec![
            SinkResponse::Rejected { reason: "bad key".to_string() },
            SinkResponse::Rejected { reason: "bad key".to_string() },
            SinkResponse::Rejected { reason: "bad key".to_string() },
        ]));
        let diagnostics = Arc::new(Diagnostics::new());
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::clone(&diagnostics));

        for i in 0..3 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = exporter.shutdown().await;
        assert_eq!(sink.submissions(), 3);
        assert_eq!(stats.rejected_batches, 3);
        assert_eq!(stats.dropped_events, 3);
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.rejection_warnings, 1);
        assert_eq!(diagnostics.count(ErrorKind::ExportRejected), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_remaining_events() {
        let mut config = config(100, 3);
        config.flush_interval_ms = 60_000;
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::accepting());
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::new(Diagnostics::new()));

        for i in 0..7 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }
        let stats = exporter.shutdown().await;

        assert_eq!(stats.exported_events, 7);
        assert_eq!(stats.shutdown_dropped, 0);
        assert!(!exporter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_counts_undelivered_events() {
        let mut config = config(2, 10);
        config.flush_interval_ms = 60_000;
        config.shutdown_timeout_ms = 500;
        config.base_retry_delay_ms = 1_000;
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::always(SinkResponse::Transient {
            reason: "down".to_string(),
        }));
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::new(Diagnostics::new()));
        tokio::task::yield_now().await;

        buffer.enqueue(error_event("a"));
        buffer.enqueue(error_event("b"));
        buffer.enqueue(error_event("c"));
        let stats = exporter.shutdown().await;

        assert_eq!(stats.exported_events, 0);
        assert_eq!(stats.shutdown_dropped, 3);
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_panic_is_treated_as_transient() {
        let config = config(1, 1);
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity, config.batch_size));
        let sink = Arc::new(ScriptedSink::panicking_first());
        let exporter = Exporter::start(&config, Arc::clone(&buffer), sink.clone(), Arc::new(Diagnostics::new()));

        buffer.enqueue(error_event("a"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = exporter.shutdown().await;
        assert_eq!(stats.exported_events, 1);
        assert_eq!(stats.retries, 1);
    }
}
