//! Repository contract consumed by the detection core, plus the in-memory
//! reference implementation used by tests and by the binary when no
//! production store is wired. No storage detail leaks into engine logic.

use crate::error::{DetectionError, Result};
use crate::models::{
    Anomaly, AnomalyFeedback, BaselineStatistics, ModelPerformance, SignatureFilter,
    SignatureMatch, ThreatSignature,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[async_trait]
pub trait ThreatRepository: Send + Sync {
    async fn get_threat_signatures(
        &self,
        filter: &SignatureFilter,
    ) -> Result<Vec<ThreatSignature>>;
    async fn create_threat_signature(&self, signature: ThreatSignature) -> Result<()>;
    async fn update_threat_signature(&self, id: &str, signature: ThreatSignature) -> Result<()>;
    async fn delete_threat_signature(&self, id: &str) -> Result<()>;

    async fn save_threat(&self, threat: SignatureMatch) -> Result<()>;
    async fn save_anomaly(&self, anomaly: Anomaly) -> Result<()>;
    async fn get_recent_anomalies(
        &self,
        entity_id: &str,
        entity_type: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>>;
    async fn update_anomaly_feedback(&self, feedback: AnomalyFeedback) -> Result<()>;

    async fn get_baseline_statistics(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<BaselineStatistics>>;
    async fn store_baseline_statistics(&self, stats: BaselineStatistics) -> Result<()>;
    async fn get_baseline_request_count(&self, entity_id: &str, entity_type: &str)
        -> Result<u64>;
    async fn get_baseline_response_time(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<f64>;
    async fn get_historical_countries(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<String>>;

    async fn get_model_performance(
        &self,
        model_version: &str,
    ) -> Result<Option<ModelPerformance>>;
}

type BaselineMapKey = (String, String, String);

/// Map-backed reference store. Write methods can be told to fail a number
/// of times with a transient error, which the retry tests lean on.
#[derive(Default)]
pub struct MemoryRepository {
    signatures: RwLock<HashMap<String, ThreatSignature>>,
    threats: RwLock<Vec<SignatureMatch>>,
    anomalies: RwLock<Vec<Anomaly>>,
    baselines: RwLock<HashMap<BaselineMapKey, BaselineStatistics>>,
    countries: RwLock<HashMap<(String, String), Vec<String>>>,
    model_performance: RwLock<HashMap<String, ModelPerformance>>,
    fail_writes: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` write calls fail with a transient store error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn set_historical_countries(
        &self,
        entity_id: &str,
        entity_type: &str,
        countries: Vec<String>,
    ) {
        self.countries
            .write()
            .insert((entity_id.to_string(), entity_type.to_string()), countries);
    }

    pub fn threats(&self) -> Vec<SignatureMatch> {
        self.threats.read().clone()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.read().clone()
    }

    fn check_write(&self) -> Result<()> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(DetectionError::TransientStore(
                "induced write failure".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ThreatRepository for MemoryRepository {
    async fn get_threat_signatures(
        &self,
        filter: &SignatureFilter,
    ) -> Result<Vec<ThreatSignature>> {
        Ok(self
            .signatures
            .read()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn create_threat_signature(&self, signature: ThreatSignature) -> Result<()> {
        self.check_write()?;
        self.signatures
            .write()
            .insert(signature.id.clone(), signature);
        Ok(())
    }

    async fn update_threat_signature(&self, id: &str, signature: ThreatSignature) -> Result<()> {
        self.check_write()?;
        let mut signatures = self.signatures.write();
        if !signatures.contains_key(id) {
            return Err(DetectionError::Validation(format!(
                "unknown signature id {id}"
            )));
        }
        signatures.insert(id.to_string(), signature);
        Ok(())
    }

    async fn delete_threat_signature(&self, id: &str) -> Result<()> {
        self.check_write()?;
        self.signatures.write().remove(id);
        Ok(())
    }

    async fn save_threat(&self, threat: SignatureMatch) -> Result<()> {
        self.check_write()?;
        self.threats.write().push(threat);
        Ok(())
    }

    // Upsert by id: a redelivered event persists the same anomaly again.
    async fn save_anomaly(&self, anomaly: Anomaly) -> Result<()> {
        self.check_write()?;
        let mut anomalies = self.anomalies.write();
        if let Some(existing) = anomalies.iter_mut().find(|a| a.id == anomaly.id) {
            *existing = anomaly;
        } else {
            anomalies.push(anomaly);
        }
        Ok(())
    }

    async fn get_recent_anomalies(
        &self,
        entity_id: &str,
        entity_type: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>> {
        Ok(self
            .anomalies
            .read()
            .iter()
            .filter(|a| {
                a.entity_id == entity_id
                    && a.entity_type == entity_type
                    && a.detected_at >= since
            })
            .cloned()
            .collect())
    }

    async fn update_anomaly_feedback(&self, feedback: AnomalyFeedback) -> Result<()> {
        self.check_write()?;
        let mut anomalies = self.anomalies.write();
        let Some(anomaly) = anomalies.iter_mut().find(|a| a.id == feedback.anomaly_id) else {
            return Err(DetectionError::Validation(format!(
                "unknown anomaly id {}",
                feedback.anomaly_id
            )));
        };
        anomaly.feedback = Some(feedback);
        Ok(())
    }

    async fn get_baseline_statistics(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<BaselineStatistics>> {
        Ok(self
            .baselines
            .read()
            .values()
            .filter(|b| b.entity_id == entity_id && b.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn store_baseline_statistics(&self, stats: BaselineStatistics) -> Result<()> {
        self.check_write()?;
        let key = (
            stats.entity_id.clone(),
            stats.entity_type.clone(),
            stats.metric_name.clone(),
        );
        self.baselines.write().insert(key, stats);
        Ok(())
    }

    async fn get_baseline_request_count(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<u64> {
        Ok(self
            .baselines
            .read()
            .get(&(
                entity_id.to_string(),
                entity_type.to_string(),
                "request_count".to_string(),
            ))
            .map(|b| b.mean.round().max(0.0) as u64)
            .unwrap_or(0))
    }

    async fn get_baseline_response_time(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<f64> {
        Ok(self
            .baselines
            .read()
            .get(&(
                entity_id.to_string(),
                entity_type.to_string(),
                "response_time".to_string(),
            ))
            .map(|b| b.mean)
            .unwrap_or(0.0))
    }

    async fn get_historical_countries(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .countries
            .read()
            .get(&(entity_id.to_string(), entity_type.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_model_performance(
        &self,
        model_version: &str,
    ) -> Result<Option<ModelPerformance>> {
        Ok(self.model_performance.read().get(model_version).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn signature(id: &str, severity: Severity, enabled: Option<bool>) -> ThreatSignature {
        ThreatSignature {
            id: id.into(),
            name: format!("sig {id}"),
            severity,
            risk_score: 5.0,
            confidence_threshold: 0.5,
            priority: 0,
            enabled,
            rules: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn signature_crud_and_filtering() {
        let repo = MemoryRepository::new();
        repo.create_threat_signature(signature("a", Severity::High, None))
            .await
            .unwrap();
        repo.create_threat_signature(signature("b", Severity::Low, Some(false)))
            .await
            .unwrap();

        let all = repo
            .get_threat_signatures(&SignatureFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let disabled_only = repo
            .get_threat_signatures(&SignatureFilter {
                enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(disabled_only.len(), 1);
        assert_eq!(disabled_only[0].id, "b");

        repo.update_threat_signature("a", signature("a", Severity::Critical, None))
            .await
            .unwrap();
        assert!(repo
            .update_threat_signature("missing", signature("missing", Severity::Low, None))
            .await
            .is_err());

        repo.delete_threat_signature("b").await.unwrap();
        let left = repo
            .get_threat_signatures(&SignatureFilter::default())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn baseline_getters_read_stored_metrics() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        repo.store_baseline_statistics(BaselineStatistics {
            entity_id: "c1".into(),
            entity_type: "api_consumer".into(),
            metric_name: "request_count".into(),
            mean: 42.4,
            variance: 4.0,
            sample_count: 20,
            window_start: now,
            window_end: now,
            last_updated: now,
        })
        .await
        .unwrap();
        repo.store_baseline_statistics(BaselineStatistics {
            entity_id: "c1".into(),
            entity_type: "api_consumer".into(),
            metric_name: "response_time".into(),
            mean: 120.5,
            variance: 9.0,
            sample_count: 20,
            window_start: now,
            window_end: now,
            last_updated: now,
        })
        .await
        .unwrap();

        assert_eq!(
            repo.get_baseline_request_count("c1", "api_consumer")
                .await
                .unwrap(),
            42
        );
        assert_eq!(
            repo.get_baseline_response_time("c1", "api_consumer")
                .await
                .unwrap(),
            120.5
        );
        assert_eq!(
            repo.get_baseline_statistics("c1", "api_consumer")
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            repo.get_model_performance("v1").await.unwrap().is_none(),
            true
        );
    }

    #[tokio::test]
    async fn recent_anomalies_filter_by_entity_and_time() {
        use crate::models::AnomalyType;
        let repo = MemoryRepository::new();
        let now = Utc::now();
        for (id, entity, age_mins) in [("a1", "c1", 5i64), ("a2", "c1", 120), ("a3", "c2", 5)] {
            repo.save_anomaly(Anomaly {
                id: id.into(),
                entity_id: entity.into(),
                entity_type: "api_consumer".into(),
                anomaly_type: AnomalyType::Statistical,
                metric_name: "latency".into(),
                score: 0.9,
                observed_value: serde_json::json!(1.0),
                baseline: BaselineStatistics {
                    entity_id: entity.into(),
                    entity_type: "api_consumer".into(),
                    metric_name: "latency".into(),
                    mean: 0.0,
                    variance: 0.0,
                    sample_count: 0,
                    window_start: now,
                    window_end: now,
                    last_updated: now,
                },
                detected_at: now - chrono::Duration::minutes(age_mins),
                feedback: None,
            })
            .await
            .unwrap();
        }
        let recent = repo
            .get_recent_anomalies("c1", "api_consumer", now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "a1");
    }

    #[tokio::test]
    async fn induced_write_failures_are_transient() {
        let repo = MemoryRepository::new();
        repo.fail_next_writes(1);
        let sig = signature("a", Severity::Low, None);
        assert!(matches!(
            repo.create_threat_signature(sig.clone()).await,
            Err(DetectionError::TransientStore(_))
        ));
        repo.create_threat_signature(sig).await.unwrap();
    }
}
