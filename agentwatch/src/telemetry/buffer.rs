//! Bounded, ordered telemetry queue shared by every producer and the exporter.
//!
//! Sequence numbers are assigned under the same lock that appends, so queue
//! order and sequence order always agree. A full queue evicts its oldest
//! event; producers never wait on the consumer. Once closed, the queue
//! refuses new events and counts them as dropped.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use agentwatch_types::{EventEnvelope, TelemetryEvent};

use crate::error::{Diagnostics, ErrorKind};

#[derive(Debug)]
struct BufferState {
    queue: VecDeque<EventEnvelope>,
    next_sequence: u64,
}

/// Bounded drop-oldest queue of sequenced events.
#[derive(Debug)]
pub struct TelemetryBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    /// Queue length at which the exporter is woken early
    batch_size: usize,
    dropped: AtomicU64,
    /// Events refused after close
    refused: AtomicU64,
    closed: AtomicBool,
    ready: Notify,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::with_capacity(capacity.min(4096)),
                next_sequence: 1,
            }),
            capacity,
            batch_size: batch_size.clamp(1, capacity),
            dropped: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
            diagnostics: None,
        }
    }

    /// Report evictions and refusals as `BufferOverflow` diagnostics.
    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Append an event, returning the sequence number it was assigned.
    ///
    /// Returns `None` once the buffer is closed; the event is counted as dropped.
    pub fn enqueue(&self, event: TelemetryEvent) -> Option<u64> {
        let (sequence, len, evicted) = {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::Acquire) {
                drop(state);
                self.refuse(&event);
                return None;
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let evicted = if state.queue.len() >= self.capacity {
                state.queue.pop_front()
            } else {
                None
            };

            state.queue.push_back(EventEnvelope {
                sequence,
                enqueued_at: Utc::now(),
                event,
            });
            (sequence, state.queue.len(), evicted)
        };

        if let Some(old) = evicted {
            self.count_overflow();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 1000 == 0 {
                log::warn!(
                    "[BUFFER] Buffer full ({} events), dropped oldest event #{} ({} dropped so far)",
                    self.capacity,
                    old.sequence,
                    total
                );
            } else {
                log::debug!("[BUFFER] Dropped event #{} ({})", old.sequence, old.event.kind());
            }
        }

        if len >= self.batch_size {
            self.ready.notify_one();
        }
        Some(sequence)
    }

    fn refuse(&self, event: &TelemetryEvent) {
        self.count_overflow();
        let total = self.refused.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 {
            log::warn!("[BUFFER] Buffer is closed, dropping {} event and any that follow", event.kind());
        } else {
            log::debug!("[BUFFER] Buffer is closed, dropped {} event", event.kind());
        }
    }

    fn count_overflow(&self) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record(ErrorKind::BufferOverflow);
        }
    }

    /// Refuse every later enqueue. Events already queued stay drainable.
    pub fn close(&self) {
        let _state = self.state.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove up to `max` events from the front, in sequence order.
    pub fn drain_batch(&self, max: usize) -> Vec<EventEnvelope> {
        let mut state = self.state.lock();
        let n = max.min(state.queue.len());
        state.queue.drain(..n).collect()
    }

    /// Discard everything still buffered, returning how many events that was.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.queue.len();
        state.queue.clear();
        n
    }

    /// Wake the exporter regardless of the batch threshold.
    pub fn request_flush(&self) {
        self.ready.notify_one();
    }

    /// Resolves when a full batch is waiting or a flush was requested.
    pub(crate) fn ready(&self) -> Notified<'_> {
        self.ready.notified()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Events evicted because the buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events refused because the buffer was already closed.
    pub fn refused_events(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    /// Sequence numbers currently buffered, front to back.
    pub fn sequences(&self) -> Vec<u64> {
        self.state.lock().queue.iter().map(|e| e.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::testing::error_event;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = TelemetryBuffer::new(100, 10);

        for i in 0..1000 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }

        assert_eq!(buffer.dropped_events(), 900);
        assert_eq!(buffer.len(), 100);
        let expected: Vec<u64> = (901..=1000).collect();
        assert_eq!(buffer.sequences(), expected);
    }

    #[test]
    fn test_enqueue_past_capacity_stays_fast() {
        let buffer = TelemetryBuffer::new(10, 5);
        for i in 0..10 {
            buffer.enqueue(error_event(&format!("fill{}", i)));
        }

        let mut previous = buffer.dropped_events();
        for i in 0..100 {
            let started = Instant::now();
            buffer.enqueue(error_event(&format!("over{}", i)));
            assert!(started.elapsed() < Duration::from_millis(50));
            let now = buffer.dropped_events();
            assert!(now > previous);
            previous = now;
        }
    }

    #[test]
    fn test_drain_batch_preserves_order() {
        let buffer = TelemetryBuffer::new(50, 10);
        for i in 0..25 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }

        let first = buffer.drain_batch(10);
        let second = buffer.drain_batch(10);
        let third = buffer.drain_batch(10);

        assert_eq!(first.len(), 10);
        assert_eq!(third.len(), 5);
        assert_eq!(first.last().unwrap().sequence + 1, second[0].sequence);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_concurrent_sequences_strictly_increase() {
        let buffer = Arc::new(TelemetryBuffer::new(100_000, 100));
        let mut handles = Vec::new();
        for t in 0..8 {
            let buffer = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    buffer.enqueue(error_event(&format!("t{}-{}", t, i)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let sequences = buffer.sequences();
        assert_eq!(sequences.len(), 8000);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(buffer.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_full_batch_wakes_waiter() {
        let buffer = Arc::new(TelemetryBuffer::new(100, 3));
        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.ready().await })
        };

        for i in 0..3 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }

    #[test]
    fn test_overflow_is_reported_to_diagnostics() {
        let diagnostics = Arc::new(Diagnostics::new());
        let buffer = TelemetryBuffer::new(5, 5).with_diagnostics(Arc::clone(&diagnostics));
        for i in 0..8 {
            buffer.enqueue(error_event(&format!("e{}", i)));
        }
        assert_eq!(buffer.dropped_events(), 3);
        assert_eq!(diagnostics.count(ErrorKind::BufferOverflow), 3);
    }

    #[test]
    fn test_closed_buffer_refuses_and_counts() {
        let diagnostics = Arc::new(Diagnostics::new());
        let buffer = TelemetryBuffer::new(10, 5).with_diagnostics(Arc::clone(&diagnostics));
        assert_eq!(buffer.enqueue(error_event("before")), Some(1));

        buffer.close();
        assert!(buffer.is_closed());
        assert_eq!(buffer.enqueue(error_event("after-1")), None);
        assert_eq!(buffer.enqueue(error_event("after-2")), None);

        assert_eq!(buffer.refused_events(), 2);
        assert_eq!(buffer.dropped_events(), 0);
        assert_eq!(diagnostics.count(ErrorKind::BufferOverflow), 2);
        // Already-queued events are still drainable
        assert_eq!(buffer.sequences(), vec![1]);
    }

    #[test]
    fn test_clear_reports_discarded_events() {
        let buffer = TelemetryBuffer::new(10, 5);
        buffer.enqueue(error_event("a"));
        buffer.enqueue(error_event("b"));
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
    }
}
