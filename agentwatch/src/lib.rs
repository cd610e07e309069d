//! In-process observability for LLM applications and agent workflows.
//!
//! Instrumented calls open spans, workflow runs group those spans into
//! nodes, node outputs are scored against configured expected behaviors,
//! and everything is exported in ordered batches by a background task that
//! never blocks or fails the host application.
//!
//! ```no_run
//! use agentwatch::{AgentWatch, AgentWatchConfig};
//!
//! # async fn run() -> Result<(), String> {
//! let watch = AgentWatch::start_http(AgentWatchConfig::new("contract-review").with_env_overrides())?;
//!
//! let summary: Result<String, String> = watch
//!     .run_workflow("doc-review", async {
//!         let text = watch.trace("extract", async { Ok::<_, String>("...".to_string()) }).await?;
//!         watch.trace("summarize", async move { Ok(format!("Summary: {}", text)) }).await
//!     })
//!     .await;
//!
//! watch.shutdown().await;
//! # let _ = summary;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod telemetry;

pub use agentwatch_types as types;

pub use client::{global, init, is_initialized, AgentWatch, HealthReport};
pub use config::{AgentWatchConfig, BackendConfig, BehaviorCheck, BehaviorDescriptor, ExporterConfig, NodeConfig};
pub use error::{Diagnostics, DiagnosticsSnapshot, ErrorKind, TelemetryError};
pub use telemetry::{
    BackendSink, ExportStatsSnapshot, HttpSink, Judge, SinkResponse, SpanOutcome, TraceContext, Verdict,
    WorkflowOutcome,
};
