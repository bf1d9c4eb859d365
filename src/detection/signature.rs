//! Signature matching engine: an atomically swappable catalog of compiled
//! signatures plus a deterministic, side-effect-free evaluator.

use crate::error::{DetectionError, Result};
use crate::models::{Event, RuleOperator, SignatureMatch, SignatureRule, ThreatSignature};
use chrono::Utc;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// An immutable, validated, priority-ordered view of the signature
/// catalog. Regex rules are compiled once at build time.
pub struct CatalogSnapshot {
    signatures: Vec<ThreatSignature>,
    compiled: Vec<Vec<Option<Regex>>>,
}

impl CatalogSnapshot {
    /// Validates structure (fail fast) and orders signatures by descending
    /// `priority`, ties broken by ascending `created_at`.
    pub fn build(mut signatures: Vec<ThreatSignature>) -> Result<Self> {
        for sig in &signatures {
            if sig.id.trim().is_empty() {
                return Err(DetectionError::Configuration(
                    "signature with empty id".into(),
                ));
            }
            if !(0.0..=1.0).contains(&sig.confidence_threshold) {
                return Err(DetectionError::Configuration(format!(
                    "signature {}: confidence_threshold {} outside [0, 1]",
                    sig.id, sig.confidence_threshold
                )));
            }
            for rule in &sig.rules {
                if rule.weight < 0.0 || !rule.weight.is_finite() {
                    return Err(DetectionError::Configuration(format!(
                        "signature {}: rule on {:?} has invalid weight {}",
                        sig.id, rule.field, rule.weight
                    )));
                }
            }
        }
        signatures.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let mut compiled = Vec::with_capacity(signatures.len());
        for sig in &signatures {
            let mut per_sig = Vec::with_capacity(sig.rules.len());
            for rule in &sig.rules {
                if rule.operator == RuleOperator::Regex {
                    let re = RegexBuilder::new(&value_text(&rule.value))
                        .case_insensitive(!rule.case_sensitive)
                        .build()
                        .map_err(|e| {
                            DetectionError::Configuration(format!(
                                "signature {}: bad regex on field {}: {e}",
                                sig.id, rule.field
                            ))
                        })?;
                    per_sig.push(Some(re));
                } else {
                    per_sig.push(None);
                }
            }
            compiled.push(per_sig);
        }
        Ok(Self {
            signatures,
            compiled,
        })
    }

    pub fn signatures(&self) -> &[ThreatSignature] {
        &self.signatures
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Shared catalog handle. Readers take an `Arc` snapshot; refreshes swap
/// the whole snapshot atomically, so an evaluation pass sees either the
/// old or the new catalog, never a partial one.
pub struct SignatureCatalog {
    inner: RwLock<Arc<CatalogSnapshot>>,
}

impl SignatureCatalog {
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Arc::new(CatalogSnapshot {
                signatures: Vec::new(),
                compiled: Vec::new(),
            })),
        }
    }

    pub fn new(signatures: Vec<ThreatSignature>) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(Arc::new(CatalogSnapshot::build(signatures)?)),
        })
    }

    pub fn swap(&self, signatures: Vec<ThreatSignature>) -> Result<()> {
        let snapshot = Arc::new(CatalogSnapshot::build(signatures)?);
        *self.inner.write() = snapshot;
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.inner.read().clone()
    }
}

/// Evaluates `event` against every enabled signature in the snapshot.
///
/// Pure function of (event, snapshot): matches come back in the snapshot's
/// priority order, so identical inputs give identical output. Confidence is
/// satisfied weight over evaluable weight; rules with an unknown operator
/// are excluded from both sides of that ratio and logged as a
/// configuration warning. Signatures with zero evaluable weight never
/// match. A signature also never fires on zero satisfied weight.
pub fn evaluate(event: &Event, catalog: &CatalogSnapshot) -> Vec<SignatureMatch> {
    let mut matches = Vec::new();
    for (si, sig) in catalog.signatures.iter().enumerate() {
        if !sig.is_enabled() {
            continue;
        }
        let mut total_weight = 0.0;
        let mut satisfied_weight = 0.0;
        let mut first_hit: Option<&SignatureRule> = None;
        for (ri, rule) in sig.rules.iter().enumerate() {
            let regex = catalog.compiled[si][ri].as_ref();
            match eval_rule(event, rule, regex) {
                None => {
                    warn!(
                        signature = %sig.id,
                        field = %rule.field,
                        operator = ?rule.operator,
                        "unknown rule operator, rule skipped"
                    );
                }
                Some(satisfied) => {
                    total_weight += rule.weight;
                    if satisfied {
                        satisfied_weight += rule.weight;
                        first_hit.get_or_insert(rule);
                    }
                }
            }
        }
        if total_weight <= 0.0 || satisfied_weight <= 0.0 {
            continue;
        }
        let confidence = satisfied_weight / total_weight;
        if confidence >= sig.confidence_threshold {
            let hit = first_hit.unwrap_or(&sig.rules[0]);
            let matched_value = event
                .payload
                .get(&hit.field)
                .map(value_text)
                .unwrap_or_default();
            matches.push(SignatureMatch {
                signature_id: sig.id.clone(),
                signature_name: sig.name.clone(),
                severity: sig.severity,
                matched_field: hit.field.clone(),
                matched_value,
                confidence,
                risk_score: sig.risk_score * confidence,
                matched_at: Utc::now(),
            });
        }
    }
    matches
}

/// Returns `None` for an unknown operator (the rule is not evaluable),
/// otherwise whether the rule is satisfied. Negation applies to the
/// comparison outcome; a missing payload field never satisfies a rule.
fn eval_rule(event: &Event, rule: &SignatureRule, regex: Option<&Regex>) -> Option<bool> {
    if let RuleOperator::Other(_) = rule.operator {
        return None;
    }
    let Some(actual) = event.payload.get(&rule.field) else {
        return Some(false);
    };
    let raw = match &rule.operator {
        RuleOperator::Equals => {
            let a = value_text(actual);
            let b = value_text(&rule.value);
            if rule.case_sensitive {
                a == b
            } else {
                a.eq_ignore_ascii_case(&b)
            }
        }
        RuleOperator::Contains => {
            let a = value_text(actual);
            let b = value_text(&rule.value);
            if rule.case_sensitive {
                a.contains(&b)
            } else {
                a.to_lowercase().contains(&b.to_lowercase())
            }
        }
        RuleOperator::Regex => regex
            .map(|re| re.is_match(&value_text(actual)))
            .unwrap_or(false),
        RuleOperator::GreaterThan => match (numeric(actual), numeric(&rule.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        RuleOperator::LessThan => match (numeric(actual), numeric(&rule.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        RuleOperator::Other(_) => unreachable!("handled above"),
    };
    Some(raw != rule.negated)
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn numeric(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}
