//! Client configuration.
//!
//! The configuration arrives fully parsed (the host owns file loading and
//! validation); the core only reads it, once, at client start.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::telemetry::exporter::RetryPolicy;

/// Top-level configuration for an [`AgentWatch`](crate::AgentWatch) client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentWatchConfig {
    /// Application name reported with every batch
    pub app_name: String,
    /// Deployment environment (e.g. "development", "production")
    pub environment: String,
    pub backend: BackendConfig,
    /// Expected-behavior rules keyed by node name
    pub nodes: HashMap<String, NodeConfig>,
    pub exporter: ExporterConfig,
}

impl Default for AgentWatchConfig {
    fn default() -> Self {
        Self {
            app_name: "agentwatch-app".to_string(),
            environment: "development".to_string(),
            backend: BackendConfig::default(),
            nodes: HashMap::new(),
            exporter: ExporterConfig::default(),
        }
    }
}

impl AgentWatchConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Register the expected behaviors for a node.
    pub fn with_node(mut self, node_name: impl Into<String>, node: NodeConfig) -> Self {
        self.nodes.insert(node_name.into(), node);
        self
    }

    pub fn with_exporter(mut self, exporter: ExporterConfig) -> Self {
        self.exporter = exporter;
        self
    }

    /// Overlay backend credentials from the environment.
    ///
    /// Reads `AGENTWATCH_API_KEY`, `AGENTWATCH_ENDPOINT` and `AGENTWATCH_ENV`;
    /// unset or empty variables leave the configured value untouched.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(key) = non_empty_var("AGENTWATCH_API_KEY") {
            self.backend.api_key = key;
        }
        if let Some(endpoint) = non_empty_var("AGENTWATCH_ENDPOINT") {
            self.backend.endpoint = endpoint;
        }
        if let Some(environment) = non_empty_var("AGENTWATCH_ENV") {
            self.environment = environment;
        }
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Where and how to reach the telemetry backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Batch intake URL
    pub endpoint: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://http-intake.logs.datadoghq.com/api/v2/llm-obs".to_string(),
            api_key: String::new(),
            request_timeout_secs: 10,
        }
    }
}

/// Expected behaviors declared for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Rule-set version, carried into every evaluation result
    pub version: Option<String>,
    pub description: Option<String>,
    pub expected_behaviors: Vec<BehaviorDescriptor>,
}

impl NodeConfig {
    pub fn new(expected_behaviors: Vec<BehaviorDescriptor>) -> Self {
        Self {
            expected_behaviors,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// An expected-behavior descriptor as written in configuration.
///
/// Plain strings are natural-language expectations handed to the judge;
/// tables select one of the deterministic checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BehaviorDescriptor {
    Natural(String),
    Check(BehaviorCheck),
}

impl BehaviorDescriptor {
    pub fn natural(text: impl Into<String>) -> Self {
        BehaviorDescriptor::Natural(text.into())
    }

    /// Normalize into the check form.
    pub fn to_check(&self) -> BehaviorCheck {
        match self {
            BehaviorDescriptor::Natural(text) => BehaviorCheck::Judge {
                description: text.clone(),
            },
            BehaviorDescriptor::Check(check) => check.clone(),
        }
    }
}

impl From<BehaviorCheck> for BehaviorDescriptor {
    fn from(check: BehaviorCheck) -> Self {
        BehaviorDescriptor::Check(check)
    }
}

/// The closed set of checks a node output can be held to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum BehaviorCheck {
    /// Output text equals the value (surrounding whitespace ignored)
    Exact { value: String },
    /// Output text contains the value
    Contains { value: String },
    /// Output text does not contain the value
    NotContains { value: String },
    /// Output text matches the regular expression
    Regex { pattern: String },
    /// Output is a JSON object carrying every listed field (dot paths allowed)
    Schema { required_fields: Vec<String> },
    /// Output text is at most this many characters
    MaxLength { chars: usize },
    /// Output text carries no email addresses, phone numbers, SSNs or card numbers
    PiiFree,
    /// Natural-language expectation scored by the installed judge
    Judge { description: String },
}

/// Buffering, batching and retry settings for the exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Maximum buffered events before the oldest are dropped
    pub buffer_capacity: usize,
    /// Maximum events per submitted batch; reaching it also triggers a flush
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Re-attempts of one batch after its first submission
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Bound on the final flush at shutdown
    pub shutdown_timeout_ms: u64,
    /// At most one rejection warning is logged per window
    pub rejection_warn_window_secs: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 5_000,
            max_retries: 5,
            base_retry_delay_ms: 500,
            max_retry_delay_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            rejection_warn_window_secs: 60,
        }
    }
}

impl ExporterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn rejection_warn_window(&self) -> Duration {
        Duration::from_secs(self.rejection_warn_window_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_deserialize_from_strings_and_tables() {
        let node: NodeConfig = serde_json::from_value(serde_json::json!({
            "version": "v2",
            "expected_behaviors": [
                "Must cite the clause it relies on",
                { "check": "contains", "value": "Summary:" },
                { "check": "schema", "required_fields": ["entities", "meta.source"] },
                { "check": "pii_free" }
            ]
        }))
        .unwrap();

        assert_eq!(node.version.as_deref(), Some("v2"));
        assert_eq!(node.expected_behaviors.len(), 4);
        assert_eq!(
            node.expected_behaviors[0].to_check(),
            BehaviorCheck::Judge {
                description: "Must cite the clause it relies on".to_string()
            }
        );
        assert_eq!(
            node.expected_behaviors[1].to_check(),
            BehaviorCheck::Contains {
                value: "Summary:".to_string()
            }
        );
        assert_eq!(node.expected_behaviors[3].to_check(), BehaviorCheck::PiiFree);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AgentWatchConfig = serde_json::from_value(serde_json::json!({
            "app_name": "legal-analyzer",
            "exporter": { "batch_size": 10 }
        }))
        .unwrap();

        assert_eq!(config.app_name, "legal-analyzer");
        assert_eq!(config.exporter.batch_size, 10);
        assert_eq!(config.exporter.buffer_capacity, 10_000);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_retry_policy_from_exporter_config() {
        let exporter = ExporterConfig {
            max_retries: 3,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 1_000,
            ..ExporterConfig::default()
        };
        let policy = exporter.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
    }
}
