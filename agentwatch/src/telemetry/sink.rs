//! Backend sink seam and the HTTP intake implementation.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use agentwatch_types::EventEnvelope;

use crate::config::BackendConfig;

/// Header carrying the backend API key.
const API_KEY_HEADER: &str = "DD-API-KEY";

/// How the backend answered one batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkResponse {
    /// Every event was ingested
    Accepted,
    /// Only the events at these batch indices failed
    Partial { failed_indices: Vec<usize> },
    /// The backend asked the client to slow down
    Throttled { retry_after: Option<Duration> },
    /// The batch will never be accepted (malformed payload, bad credentials)
    Rejected { reason: String },
    /// Network or server failure worth retrying
    Transient { reason: String },
}

impl SinkResponse {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SinkResponse::Partial { .. } | SinkResponse::Throttled { .. } | SinkResponse::Transient { .. }
        )
    }
}

/// Destination for batches of telemetry events.
#[async_trait]
pub trait BackendSink: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str {
        "backend"
    }

    /// Submit one batch, ordered by sequence number.
    async fn submit(&self, batch: &[EventEnvelope]) -> SinkResponse;
}

/// Posts JSON batches to an HTTP intake endpoint.
pub struct HttpSink {
    client: Client,
    endpoint: String,
    api_key: String,
    app_name: String,
    environment: String,
}

impl HttpSink {
    pub fn new(backend: &BackendConfig, app_name: &str, environment: &str) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(backend.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            endpoint: backend.endpoint.clone(),
            api_key: backend.api_key.clone(),
            app_name: app_name.to_string(),
            environment: environment.to_string(),
        })
    }
}

#[async_trait]
impl BackendSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, batch: &[EventEnvelope]) -> SinkResponse {
        let body = json!({
            "app": self.app_name,
            "env": self.environment,
            "events": batch,
        });

        let response = match self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return SinkResponse::Transient {
                    reason: format!("Request failed: {}", e),
                };
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let text = response.text().await.unwrap_or_default();

        classify_response(status, retry_after.as_deref(), &text)
    }
}

#[derive(Deserialize)]
struct PartialBody {
    failed_indices: Vec<usize>,
}

/// Map an intake HTTP response onto a [`SinkResponse`].
pub fn classify_response(status: StatusCode, retry_after: Option<&str>, body: &str) -> SinkResponse {
    if status == StatusCode::MULTI_STATUS {
        return match serde_json::from_str::<PartialBody>(body) {
            Ok(partial) if partial.failed_indices.is_empty() => SinkResponse::Accepted,
            Ok(partial) => SinkResponse::Partial {
                failed_indices: partial.failed_indices,
            },
            // Without the failed indices the whole batch has to go again
            Err(_) => SinkResponse::Transient {
                reason: "207 response without failed_indices".to_string(),
            },
        };
    }

    if status.is_success() {
        return SinkResponse::Accepted;
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return SinkResponse::Throttled {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        };
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return SinkResponse::Transient {
            reason: format!("HTTP {}: {}", status.as_u16(), snippet(body)),
        };
    }

    SinkResponse::Rejected {
        reason: format!("HTTP {}: {}", status.as_u16(), snippet(body)),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
