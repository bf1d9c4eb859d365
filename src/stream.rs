//! Stream input and downstream alert seams. The concrete bus client lives
//! outside the core; the dispatcher only sees these traits. In-memory
//! implementations model at-least-once delivery for tests and local runs.

use crate::error::{DetectionError, Result};
use crate::models::{Anomaly, Event, SignatureMatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

pub const TOPIC_API_TRAFFIC: &str = "api_traffic";
pub const TOPIC_SECURITY_EVENTS: &str = "security_events";

#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Batched consumer over the event topics. `commit` acknowledges every
/// message handed out by `fetch` since the previous commit; uncommitted
/// messages are redelivered by the upstream bus.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn fetch(&self, max: usize) -> Result<Vec<StreamMessage>>;
    async fn commit(&self) -> Result<()>;
}

/// Best-effort downstream alerting; never transactional with persistence.
#[async_trait]
pub trait AlertPublisher: Send + Sync {
    async fn publish_match(&self, threat: &SignatureMatch) -> Result<()>;
    async fn publish_anomaly(&self, anomaly: &Anomaly) -> Result<()>;
}

pub fn decode_event(msg: &StreamMessage) -> Result<Event> {
    let event: Event = serde_json::from_slice(&msg.value).map_err(|e| {
        DetectionError::Validation(format!("undecodable {} message: {e}", msg.topic))
    })?;
    if event.event_id.trim().is_empty() {
        return Err(DetectionError::Validation("event without event_id".into()));
    }
    Ok(event)
}

#[derive(Default)]
struct MemoryStreamInner {
    messages: Vec<StreamMessage>,
    cursor: usize,
    committed: usize,
}

/// Vec-backed stream. Fetch hands out messages past the cursor; commit
/// moves the committed offset up to the cursor. `redeliver_uncommitted`
/// models the upstream redelivery that follows a consumer restart.
#[derive(Default)]
pub struct MemoryStream {
    inner: Mutex<MemoryStreamInner>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: StreamMessage) {
        self.inner.lock().messages.push(msg);
    }

    pub fn push_event(&self, topic: &str, event: &Event) {
        let value = serde_json::to_vec(event).unwrap_or_default();
        self.push(StreamMessage {
            topic: topic.to_string(),
            key: event.entity_id.clone(),
            value,
            timestamp: event.timestamp,
        });
    }

    pub fn committed(&self) -> usize {
        self.inner.lock().committed
    }

    pub fn redeliver_uncommitted(&self) {
        let mut inner = self.inner.lock();
        inner.cursor = inner.committed;
    }
}

#[async_trait]
impl EventStream for MemoryStream {
    async fn fetch(&self, max: usize) -> Result<Vec<StreamMessage>> {
        let mut inner = self.inner.lock();
        let end = (inner.cursor + max).min(inner.messages.len());
        let batch = inner.messages[inner.cursor..end].to_vec();
        inner.cursor = end;
        Ok(batch)
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.committed = inner.cursor;
        Ok(())
    }
}

/// Records published alerts; can be flipped to fail so tests can assert
/// that publishing stays best-effort.
#[derive(Default)]
pub struct MemoryPublisher {
    matches: Mutex<Vec<SignatureMatch>>,
    anomalies: Mutex<Vec<Anomaly>>,
    fail: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn matches(&self) -> Vec<SignatureMatch> {
        self.matches.lock().clone()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.lock().clone()
    }
}

#[async_trait]
impl AlertPublisher for MemoryPublisher {
    async fn publish_match(&self, threat: &SignatureMatch) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DetectionError::TransientStore("publisher down".into()));
        }
        self.matches.lock().push(threat.clone());
        Ok(())
    }

    async fn publish_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DetectionError::TransientStore("publisher down".into()));
        }
        self.anomalies.lock().push(anomaly.clone());
        Ok(())
    }
}

/// Stand-in downstream: surfaces alerts through the log the way the
/// surrounding services expect until a real publisher is wired.
#[derive(Default)]
pub struct LogPublisher;

#[async_trait]
impl AlertPublisher for LogPublisher {
    async fn publish_match(&self, threat: &SignatureMatch) -> Result<()> {
        warn!(
            target: "threat-detection",
            signature = %threat.signature_id,
            severity = ?threat.severity,
            confidence = threat.confidence,
            risk_score = threat.risk_score,
            "threat detected"
        );
        Ok(())
    }

    async fn publish_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        warn!(
            target: "threat-detection",
            entity = %anomaly.entity_id,
            metric = %anomaly.metric_name,
            kind = ?anomaly.anomaly_type,
            score = anomaly.score,
            "anomaly detected"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(value: &[u8]) -> StreamMessage {
        StreamMessage {
            topic: TOPIC_API_TRAFFIC.into(),
            key: "k".into(),
            value: value.to_vec(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fetch_commit_and_redelivery() {
        let stream = MemoryStream::new();
        for i in 0..5 {
            stream.push(message(format!("{{\"n\":{i}}}").as_bytes()));
        }
        let batch = stream.fetch(3).await.unwrap();
        assert_eq!(batch.len(), 3);
        // nothing committed: a restart redelivers the same three
        stream.redeliver_uncommitted();
        let again = stream.fetch(3).await.unwrap();
        assert_eq!(again.len(), 3);
        stream.commit().await.unwrap();
        assert_eq!(stream.committed(), 3);
        assert_eq!(stream.fetch(10).await.unwrap().len(), 2);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        let err = decode_event(&message(b"not json")).unwrap_err();
        assert!(matches!(err, DetectionError::Validation(_)));

        let err = decode_event(&message(
            br#"{"event_id":"","entity_id":"e","entity_type":"t","timestamp":"2026-01-01T00:00:00Z"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, DetectionError::Validation(_)));
    }
}
