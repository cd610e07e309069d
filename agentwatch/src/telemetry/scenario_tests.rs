//! End-to-end scenarios through a full client and a scripted sink.

use std::sync::Arc;
use std::time::Duration;

use agentwatch_types::{SpanStatus, TelemetryEvent, WorkflowState};

use super::recorder::SpanOutcome;
use super::sink::SinkResponse;
use super::testing::{init_logging, ScriptedSink};
use crate::client::AgentWatch;
use crate::config::{AgentWatchConfig, ExporterConfig};

fn client(sink: Arc<ScriptedSink>, exporter: ExporterConfig) -> AgentWatch {
    init_logging();
    AgentWatch::start(AgentWatchConfig::new("scenarios").with_exporter(exporter), sink)
}

fn exporter(batch_size: usize) -> ExporterConfig {
    ExporterConfig {
        buffer_capacity: 10_000,
        batch_size,
        flush_interval_ms: 100,
        max_retries: 5,
        base_retry_delay_ms: 100,
        max_retry_delay_ms: 10_000,
        shutdown_timeout_ms: 30_000,
        rejection_warn_window_secs: 60,
    }
}

#[tokio::test(start_paused = true)]
async fn test_doc_review_workflow_fails_when_second_node_errors() {
    let sink = Arc::new(ScriptedSink::accepting());
    let watch = client(sink.clone(), exporter(100));
    let monitor = watch.agent_monitor();
    let id = monitor.start_workflow("doc-review");

    monitor
        .scope(&id, async {
            let _: Result<(), String> = watch.trace("extract", async { Ok(()) }).await;
            let _: Result<(), String> = watch.trace("classify", async { Err("unsupported layout".to_string()) }).await;
            let _: Result<(), String> = watch.trace("summarize", async { Ok(()) }).await;
        })
        .await;

    let summary = monitor.end_workflow(&id, None).unwrap();
    assert_eq!(summary.state, WorkflowState::Failed);
    assert_eq!(summary.node_count, 3);
    assert_eq!(summary.nodes[1].status, SpanStatus::Error);

    watch.shutdown().await;
    let closed: Vec<_> = sink
        .delivered()
        .into_iter()
        .filter(|e| matches!(e.event, TelemetryEvent::WorkflowClosed(_)))
        .collect();
    assert_eq!(closed.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_three_times_then_delivered_without_loss() {
    let sink = Arc::new(ScriptedSink::with_script(vec![
        SinkResponse::Throttled { retry_after: None },
        SinkResponse::Throttled { retry_after: None },
        SinkResponse::Throttled { retry_after: None },
    ]));
    let watch = client(sink.clone(), exporter(100));

    for i in 0..5 {
        let _: Result<u32, String> = watch.trace(&format!("step-{}", i), async move { Ok(i) }).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let batches = sink.batches();
    assert_eq!(batches.len(), 4);
    assert!(batches.iter().all(|b| b == &batches[0]));

    let times = sink.attempt_times();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps.len(), 3);
    assert!(gaps.windows(2).all(|g| g[1] > g[0]));

    let stats = watch.shutdown().await.export;
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.exported_events, 5);
    assert_eq!(stats.dropped_events, 0);
    assert_eq!(sink.delivered_sequences(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_stretches_backoff() {
    let sink = Arc::new(ScriptedSink::with_script(vec![SinkResponse::Throttled {
        retry_after: Some(Duration::from_secs(3)),
    }]));
    let watch = client(sink.clone(), exporter(100));

    let _: Result<(), String> = watch.trace("step", async { Ok(()) }).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let times = sink.attempt_times();
    assert_eq!(times.len(), 2);
    assert!(times[1] - times[0] >= Duration::from_secs(3));
    watch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_double_end_reaches_exporter_once() {
    let sink = Arc::new(ScriptedSink::accepting());
    let watch = client(sink.clone(), exporter(100));

    let ctx = watch.begin("plan", None);
    watch.end(&ctx, SpanOutcome::Success);
    watch.end(&ctx, SpanOutcome::Success);

    let report = watch.shutdown().await;
    assert_eq!(report.diagnostics.double_finalize, 1);
    assert_eq!(sink.delivered().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_begin_end_never_leaks() {
    let sink = Arc::new(ScriptedSink::accepting());
    let watch = Arc::new(client(sink.clone(), exporter(50)));

    let mut handles = Vec::new();
    for t in 0..8 {
        let watch = Arc::clone(&watch);
        handles.push(tokio::spawn(async move {
            for i in 0..100 {
                let ctx = watch.begin(&format!("worker-{}", t), None);
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
                watch.end(&ctx, SpanOutcome::Success);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let report = watch.shutdown().await;
    assert_eq!(report.open_spans, 0);
    assert_eq!(report.diagnostics.double_finalize, 0);
    assert_eq!(report.export.exported_events, 800);

    let mut sequences = sink.delivered_sequences();
    sequences.sort_unstable();
    sequences.dedup();
    assert_eq!(sequences.len(), 800);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_workflow_call_is_closed_and_counted() {
    let sink = Arc::new(ScriptedSink::accepting());
    let watch = client(sink.clone(), exporter(100));

    let run = watch.run_workflow("slow-agent", async {
        watch
            .trace("think", async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok::<(), String>(())
            })
            .await
    });
    assert!(tokio::time::timeout(Duration::from_secs(1), run).await.is_err());

    let report = watch.shutdown().await;
    assert_eq!(report.open_spans, 0);
    assert_eq!(report.active_workflows, 0);
    assert_eq!(report.diagnostics.cancelled_spans, 1);

    let delivered = sink.delivered();
    let span = delivered
        .iter()
        .find_map(|e| match &e.event {
            TelemetryEvent::SpanClosed(span) => Some(span.clone()),
            _ => None,
        })
        .unwrap();
    assert!(span.error.unwrap().is_cancellation());
    let summary = delivered
        .iter()
        .find_map(|e| match &e.event {
            TelemetryEvent::WorkflowClosed(summary) => Some(summary.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(summary.state, WorkflowState::Failed);
    assert_eq!(summary.reason.as_deref(), Some("cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_failing_sink_never_reaches_caller() {
    let sink = Arc::new(ScriptedSink::always(SinkResponse::Transient {
        reason: "connection reset".to_string(),
    }));
    let mut config = exporter(10);
    config.max_retries = 1;
    let watch = client(sink.clone(), config);

    for i in 0..20 {
        let result: Result<u32, String> = watch.trace("call", async move { Ok(i) }).await;
        assert_eq!(result, Ok(i));
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let stats = watch.shutdown().await.export;
    assert_eq!(stats.exported_events, 0);
    assert_eq!(stats.dropped_batches, 2);
    assert_eq!(stats.dropped_events, 20);
}
