//! DetectionService: ties the two engines to the repository and the alert
//! publisher, and exposes the entry points the control-plane API calls.

use crate::config::AnomalyConfig;
use crate::detection::{evaluate, AnomalyEngine, SignatureCatalog};
use crate::error::{DetectionError, Result};
use crate::models::{
    AnalysisOutcome, AnalysisStatus, Anomaly, AnomalyFeedback, Event, SignatureFilter,
    SignatureMatch,
};
use crate::repository::ThreatRepository;
use crate::resilience::{retry_async, RetryConfig};
use crate::stream::AlertPublisher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-event analysis seam between the dispatcher and the engines. The
/// dispatcher supervises implementations of this trait, so faults in any
/// of them stay isolated to the event that triggered them.
#[async_trait]
pub trait EventAnalyzer: Send + Sync {
    async fn analyze(&self, event: &Event) -> Result<AnalysisOutcome>;
}

pub struct DetectionService {
    catalog: Arc<SignatureCatalog>,
    anomaly: AnomalyEngine,
    repository: Arc<dyn ThreatRepository>,
    publisher: Arc<dyn AlertPublisher>,
    retry: RetryConfig,
}

impl DetectionService {
    pub fn new(
        catalog: Arc<SignatureCatalog>,
        anomaly_cfg: AnomalyConfig,
        repository: Arc<dyn ThreatRepository>,
        publisher: Arc<dyn AlertPublisher>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            catalog,
            anomaly: AnomalyEngine::new(anomaly_cfg),
            repository,
            publisher,
            retry,
        }
    }

    /// Reloads the signature catalog from the repository. The swap is
    /// atomic: an in-flight evaluation keeps its old snapshot.
    pub async fn refresh_catalog(&self) -> Result<()> {
        let signatures = self
            .repository
            .get_threat_signatures(&SignatureFilter::default())
            .await?;
        let count = signatures.len();
        self.catalog.swap(signatures)?;
        info!(target: "threat-detection", signatures = count, "signature catalog refreshed");
        Ok(())
    }

    /// Pulls persisted baselines and geography history for an entity into
    /// the anomaly engine.
    pub async fn hydrate_baselines(&self, entity_id: &str, entity_type: &str) -> Result<()> {
        for stats in self
            .repository
            .get_baseline_statistics(entity_id, entity_type)
            .await?
        {
            self.anomaly.hydrate_statistics(&stats);
        }
        let countries = self
            .repository
            .get_historical_countries(entity_id, entity_type)
            .await?;
        if !countries.is_empty() {
            self.anomaly
                .hydrate_countries(entity_id, entity_type, &countries);
        }
        Ok(())
    }

    /// Persists every live baseline snapshot back to the repository.
    pub async fn flush_baselines(&self) -> Result<()> {
        for key in self.anomaly.baseline_keys() {
            let Some(stats) = self.anomaly.baseline_snapshot(&key) else {
                continue;
            };
            retry_async(&self.retry, |_| {
                let repository = Arc::clone(&self.repository);
                let stats = stats.clone();
                async move { repository.store_baseline_statistics(stats).await }
            })
            .await?;
        }
        Ok(())
    }

    pub fn evaluate_signatures(&self, event: &Event) -> Result<Vec<SignatureMatch>> {
        validate_event(event)?;
        Ok(evaluate(event, &self.catalog.snapshot()))
    }

    pub fn detect_anomalies(&self, event: &Event) -> Result<Vec<Anomaly>> {
        validate_event(event)?;
        Ok(self.anomaly.detect_anomalies(event))
    }

    /// Persists the verdict, then tunes the engine's sensitivity for the
    /// affected (entity, metric) pair.
    pub async fn record_feedback(&self, feedback: AnomalyFeedback) -> Result<()> {
        retry_async(&self.retry, |_| {
            let repository = Arc::clone(&self.repository);
            let feedback = feedback.clone();
            async move { repository.update_anomaly_feedback(feedback).await }
        })
        .await?;
        self.anomaly.record_feedback(&feedback)
    }

    /// Full per-event pass: both engines, persistence with bounded retry,
    /// then best-effort alerting. A transient store failure propagates so
    /// the dispatcher can leave the batch uncommitted.
    pub async fn analyze(&self, event: &Event) -> Result<AnalysisOutcome> {
        validate_event(event)?;
        let matches = evaluate(event, &self.catalog.snapshot());
        let anomalies = self.anomaly.detect_anomalies(event);

        for threat in &matches {
            retry_async(&self.retry, |_| {
                let repository = Arc::clone(&self.repository);
                let threat = threat.clone();
                async move { repository.save_threat(threat).await }
            })
            .await?;
        }
        for anomaly in &anomalies {
            retry_async(&self.retry, |_| {
                let repository = Arc::clone(&self.repository);
                let anomaly = anomaly.clone();
                async move { repository.save_anomaly(anomaly).await }
            })
            .await?;
        }

        for threat in &matches {
            if let Err(e) = self.publisher.publish_match(threat).await {
                warn!(signature = %threat.signature_id, error = %e, "alert publish failed");
            }
        }
        for anomaly in &anomalies {
            if let Err(e) = self.publisher.publish_anomaly(anomaly).await {
                warn!(anomaly = %anomaly.id, error = %e, "alert publish failed");
            }
        }

        let status = if matches.is_empty() && anomalies.is_empty() {
            AnalysisStatus::NoMatch
        } else {
            AnalysisStatus::Matched
        };
        Ok(AnalysisOutcome {
            event_id: event.event_id.clone(),
            status,
            matches,
            anomalies,
        })
    }
}

#[async_trait]
impl EventAnalyzer for DetectionService {
    async fn analyze(&self, event: &Event) -> Result<AnalysisOutcome> {
        DetectionService::analyze(self, event).await
    }
}

fn validate_event(event: &Event) -> Result<()> {
    if event.event_id.trim().is_empty() {
        return Err(DetectionError::Validation("event without event_id".into()));
    }
    if event.entity_id.trim().is_empty() || event.entity_type.trim().is_empty() {
        return Err(DetectionError::Validation(format!(
            "event {} missing entity identity",
            event.event_id
        )));
    }
    Ok(())
}
