//! Domain data model shared by the detection engines, dispatcher, and
//! repository contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single event pulled off the stream. Immutable once dispatched;
/// `event_id` is the dedupe identity under at-least-once redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub entity_id: String,
    pub entity_type: String,
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Comparison operator of a [`SignatureRule`]. Operators unknown to this
/// build deserialize into `Other` and are skipped (and logged) at
/// evaluation time rather than rejected at catalog load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    Contains,
    Regex,
    GreaterThan,
    LessThan,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRule {
    pub field: String,
    pub operator: RuleOperator,
    pub value: Value,
    pub weight: f64,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub negated: bool,
}

fn default_true() -> bool {
    true
}

/// A named, weighted rule set describing a known attack pattern.
///
/// `enabled` is deliberately tri-state: `None` means the flag was never
/// set and the signature runs, which is distinguishable from an explicit
/// `Some(false)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatSignature {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub risk_score: f64,
    pub confidence_threshold: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub enabled: Option<bool>,
    pub rules: Vec<SignatureRule>,
    pub created_at: DateTime<Utc>,
}

impl ThreatSignature {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Produced by the signature engine, one per (event, firing signature).
/// Never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub signature_id: String,
    pub signature_name: String,
    pub severity: Severity,
    pub matched_field: String,
    pub matched_value: String,
    pub confidence: f64,
    pub risk_score: f64,
    pub matched_at: DateTime<Utc>,
}

/// Snapshot form of per-(entity, metric) baseline state, exchanged with
/// the repository. Single-writer per key; updated online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineStatistics {
    pub entity_id: String,
    pub entity_type: String,
    pub metric_name: String,
    pub mean: f64,
    pub variance: f64,
    pub sample_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Statistical,
    Categorical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub anomaly_type: AnomalyType,
    pub metric_name: String,
    /// Squashed into [0, 1]; comparable across metrics.
    pub score: f64,
    pub observed_value: Value,
    pub baseline: BaselineStatistics,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub feedback: Option<AnomalyFeedback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackVerdict {
    TruePositive,
    FalsePositive,
}

/// Append-only analyst verdict; triggers a sensitivity adjustment,
/// never deletes the anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFeedback {
    pub anomaly_id: String,
    pub verdict: FeedbackVerdict,
    pub recorded_at: DateTime<Utc>,
}

/// Terminal status every dispatched event must reach for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Matched,
    NoMatch,
    AnalysisFailed,
    AnalysisTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub event_id: String,
    pub status: AnalysisStatus,
    pub matches: Vec<SignatureMatch>,
    pub anomalies: Vec<Anomaly>,
}

impl AnalysisOutcome {
    pub fn terminal(event_id: impl Into<String>, status: AnalysisStatus) -> Self {
        Self {
            event_id: event_id.into(),
            status,
            matches: Vec::new(),
            anomalies: Vec::new(),
        }
    }
}

/// Catalog query filter. Every field is optional so "no filter" and
/// "only disabled signatures" are both expressible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureFilter {
    pub severity: Option<Severity>,
    pub enabled: Option<bool>,
    pub name_contains: Option<String>,
}

impl SignatureFilter {
    pub fn matches(&self, sig: &ThreatSignature) -> bool {
        if let Some(sev) = self.severity {
            if sig.severity != sev {
                return false;
            }
        }
        if let Some(enabled) = self.enabled {
            if sig.is_enabled() != enabled {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !sig.name.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub model_version: String,
    pub precision: f64,
    pub recall: f64,
    pub evaluated_at: DateTime<Utc>,
}
