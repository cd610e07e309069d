//! Scores node outputs against their configured expected behaviors.
//!
//! Overall pass is the AND of every rule; overall confidence is the minimum
//! rule confidence. Nothing in here may fail the instrumented call: a rule
//! that cannot be evaluated (matcher error, judge panic, no judge installed)
//! becomes a failed rule with confidence 0.0.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use agentwatch_types::{EvaluationResult, RuleOutcome};

use crate::config::{BehaviorCheck, NodeConfig};
use crate::error::{Diagnostics, ErrorKind};

/// Longest output snapshot stored on a result.
const SNAPSHOT_CHARS: usize = 1000;

static PII_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("email", Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()),
        ("ssn", Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
        ("phone", Regex::new(r"\(?\b\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}\b").unwrap()),
        ("card", Regex::new(r"\b(?:\d[ -]?){13,16}\b").unwrap()),
    ]
});

/// A judge's verdict on one natural-language expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub confidence: f64,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn new(passed: bool, confidence: f64) -> Self {
        Self {
            passed,
            confidence,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn certain(passed: bool) -> Self {
        Self::new(passed, 1.0)
    }
}

/// Delegated scorer for natural-language expectations (typically an LLM).
pub trait Judge: Send + Sync {
    fn judge(&self, node_name: &str, description: &str, output: &Value) -> Result<Verdict, String>;
}

/// A compiled expected-behavior rule.
#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Contains(String),
    NotContains(String),
    Pattern(Regex),
    Schema(Vec<String>),
    MaxLength(usize),
    PiiFree,
    Judge(String),
    /// A rule that failed to compile; always fails with this reason
    Invalid(String),
}

impl Matcher {
    fn compile(check: &BehaviorCheck) -> Self {
        match check {
            BehaviorCheck::Exact { value } => Matcher::Exact(value.clone()),
            BehaviorCheck::Contains { value } => Matcher::Contains(value.clone()),
            BehaviorCheck::NotContains { value } => Matcher::NotContains(value.clone()),
            BehaviorCheck::Regex { pattern } => match Regex::new(pattern) {
                Ok(re) => Matcher::Pattern(re),
                Err(e) => Matcher::Invalid(format!("invalid pattern '{}': {}", pattern, e)),
            },
            BehaviorCheck::Schema { required_fields } => Matcher::Schema(required_fields.clone()),
            BehaviorCheck::MaxLength { chars } => Matcher::MaxLength(*chars),
            BehaviorCheck::PiiFree => Matcher::PiiFree,
            BehaviorCheck::Judge { description } => Matcher::Judge(description.clone()),
        }
    }

    fn label(&self) -> String {
        match self {
            Matcher::Exact(v) => format!("exact: {}", v),
            Matcher::Contains(v) => format!("contains: {}", v),
            Matcher::NotContains(v) => format!("not_contains: {}", v),
            Matcher::Pattern(re) => format!("regex: {}", re.as_str()),
            Matcher::Schema(fields) => format!("schema: {}", fields.join(", ")),
            Matcher::MaxLength(n) => format!("max_length: {}", n),
            Matcher::PiiFree => "pii_free".to_string(),
            Matcher::Judge(description) => description.clone(),
            Matcher::Invalid(reason) => format!("invalid: {}", reason),
        }
    }

    /// `Err` means the rule could not be evaluated at all.
    fn check(&self, node_name: &str, output: &Value, judge: Option<&dyn Judge>) -> Result<Verdict, String> {
        let text = output_text(output);
        let verdict = match self {
            Matcher::Exact(expected) => Verdict::certain(text.trim() == expected.trim()),
            Matcher::Contains(needle) => Verdict::certain(text.contains(needle.as_str())),
            Matcher::NotContains(needle) => Verdict::certain(!text.contains(needle.as_str())),
            Matcher::Pattern(re) => Verdict::certain(re.is_match(&text)),
            Matcher::Schema(fields) => {
                let object = structured(output)?;
                let missing: Vec<&str> = fields
                    .iter()
                    .filter(|f| lookup(&object, f).is_none())
                    .map(|f| f.as_str())
                    .collect();
                if missing.is_empty() {
                    Verdict::certain(true)
                } else {
                    Verdict::certain(false).with_reason(format!("missing fields: {}", missing.join(", ")))
                }
            }
            Matcher::MaxLength(max) => Verdict::certain(text.chars().count() <= *max),
            Matcher::PiiFree => {
                let found: Vec<&str> = PII_PATTERNS
                    .iter()
                    .filter(|(_, re)| re.is_match(&text))
                    .map(|(name, _)| *name)
                    .collect();
                if !found.is_empty() {
                    log::debug!("[EVAL] Output of '{}' contains PII: {}", node_name, found.join(", "));
                }
                Verdict::certain(found.is_empty())
            }
            Matcher::Judge(description) => match judge {
                Some(judge) => {
                    let verdict = judge.judge(node_name, description, output)?;
                    if !verdict.confidence.is_finite() {
                        return Err("judge returned a non-finite confidence".to_string());
                    }
                    Verdict {
                        confidence: verdict.confidence.clamp(0.0, 1.0),
                        ..verdict
                    }
                }
                None => return Err("no judge installed".to_string()),
            },
            Matcher::Invalid(reason) => return Err(reason.clone()),
        };
        Ok(verdict)
    }
}

/// Text form of an output: strings as-is, everything else as compact JSON.
fn output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The output as a JSON object, parsing string outputs that hold JSON.
fn structured(output: &Value) -> Result<Value, String> {
    let value = match output {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map_err(|e| format!("output is not valid JSON: {}", e))?,
        other => other.clone(),
    };
    if !value.is_object() {
        return Err("output is not a JSON object".to_string());
    }
    Ok(value)
}

/// Resolve a dot-separated path such as `meta.source`.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| current.get(key))
}

fn snapshot(output: &Value) -> String {
    let text = output_text(output);
    if text.chars().count() <= SNAPSHOT_CHARS {
        return text;
    }
    let mut out: String = text.chars().take(SNAPSHOT_CHARS).collect();
    out.push('…');
    out
}

#[derive(Debug)]
struct RuleSet {
    version: Option<String>,
    matchers: Vec<Matcher>,
}

/// Evaluates node outputs against the rules loaded from configuration.
pub struct EvaluationEngine {
    rules: HashMap<String, RuleSet>,
    judge: Option<Arc<dyn Judge>>,
    diagnostics: Arc<Diagnostics>,
}

impl EvaluationEngine {
    pub fn new(
        nodes: &HashMap<String, NodeConfig>,
        judge: Option<Arc<dyn Judge>>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let rules = nodes
            .iter()
            .map(|(name, node)| {
                let matchers: Vec<Matcher> = node
                    .expected_behaviors
                    .iter()
                    .map(|d| Matcher::compile(&d.to_check()))
                    .collect();
                for matcher in &matchers {
                    if let Matcher::Invalid(reason) = matcher {
                        log::warn!("[EVAL] Node '{}' has an unusable rule: {}", name, reason);
                    }
                }
                (
                    name.clone(),
                    RuleSet {
                        version: node.version.clone(),
                        matchers,
                    },
                )
            })
            .collect();

        Self {
            rules,
            judge,
            diagnostics,
        }
    }

    /// Whether any rules are configured for this node.
    pub fn has_rules(&self, node_name: &str) -> bool {
        self.rules
            .get(node_name)
            .map(|set| !set.matchers.is_empty())
            .unwrap_or(false)
    }

    /// Evaluate any serializable output. Serialization failure fails every rule.
    pub fn evaluate<T: Serialize + ?Sized>(&self, node_name: &str, output: &T) -> EvaluationResult {
        match serde_json::to_value(output) {
            Ok(value) => self.evaluate_value(node_name, &value),
            Err(e) => self.unreadable_output(node_name, &format!("output could not be serialized: {}", e)),
        }
    }

    pub fn evaluate_value(&self, node_name: &str, output: &Value) -> EvaluationResult {
        let Some(set) = self.rules.get(node_name) else {
            return pass_through(node_name, output);
        };
        if set.matchers.is_empty() {
            return pass_through(node_name, output);
        }

        let judge = self.judge.as_deref();
        let outcomes: Vec<RuleOutcome> = set
            .matchers
            .iter()
            .map(|matcher| {
                let descriptor = matcher.label();
                let checked = catch_unwind(AssertUnwindSafe(|| matcher.check(node_name, output, judge)));
                match checked {
                    Ok(Ok(verdict)) => RuleOutcome {
                        descriptor,
                        passed: verdict.passed,
                        confidence: verdict.confidence,
                        reason: verdict.reason,
                    },
                    Ok(Err(reason)) => self.rule_failure(node_name, descriptor, reason),
                    Err(_) => self.rule_failure(node_name, descriptor, "matcher panicked".to_string()),
                }
            })
            .collect();

        aggregate(node_name, set.version.clone(), outcomes, snapshot(output))
    }

    fn rule_failure(&self, node_name: &str, descriptor: String, reason: String) -> RuleOutcome {
        self.diagnostics.record(ErrorKind::EvaluationFailure);
        log::warn!("[EVAL] Rule '{}' on node '{}' failed to run: {}", descriptor, node_name, reason);
        RuleOutcome {
            descriptor,
            passed: false,
            confidence: 0.0,
            reason: Some(reason),
        }
    }

    fn unreadable_output(&self, node_name: &str, reason: &str) -> EvaluationResult {
        let Some(set) = self.rules.get(node_name).filter(|s| !s.matchers.is_empty()) else {
            return pass_through(node_name, &Value::Null);
        };
        let outcomes = set
            .matchers
            .iter()
            .map(|m| self.rule_failure(node_name, m.label(), reason.to_string()))
            .collect();
        aggregate(node_name, set.version.clone(), outcomes, String::new())
    }
}

fn pass_through(node_name: &str, output: &Value) -> EvaluationResult {
    EvaluationResult {
        node_name: node_name.to_string(),
        rule_set_version: None,
        span_id: None,
        rules: Vec::new(),
        passed: true,
        confidence: 1.0,
        output_snapshot: snapshot(output),
        evaluated_at: Utc::now(),
    }
}

fn aggregate(
    node_name: &str,
    version: Option<String>,
    rules: Vec<RuleOutcome>,
    output_snapshot: String,
) -> EvaluationResult {
    let passed = rules.iter().all(|r| r.passed);
    let confidence = rules.iter().map(|r| r.confidence).fold(1.0_f64, f64::min);

    EvaluationResult {
        node_name: node_name.to_string(),
        rule_set_version: version,
        span_id: None,
        rules,
        passed,
        confidence,
        output_snapshot,
        evaluated_at: Utc::now(),
    }
}
