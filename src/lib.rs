//! Real-time detection core of an API security platform.
//!
//! Events pulled off the `api_traffic` / `security_events` topics flow
//! through a supervised worker pool into two engines: a deterministic
//! signature matcher over a weighted rule catalog, and a per-entity
//! statistical baseline engine with an analyst feedback loop. Results are
//! persisted through the repository contract and republished as alerts.

pub mod config;
pub mod detection;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod repository;
pub mod resilience;
pub mod service;
pub mod stream;

pub use config::{AnomalyConfig, DetectionConfig, DispatcherConfig};
pub use detection::{AnomalyEngine, BaselineArena, BaselineKey, SignatureCatalog};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use error::{DetectionError, Result};
pub use models::{
    AnalysisOutcome, AnalysisStatus, Anomaly, AnomalyFeedback, AnomalyType, BaselineStatistics,
    Event, FeedbackVerdict, ModelPerformance, RuleOperator, Severity, SignatureFilter,
    SignatureMatch, SignatureRule, ThreatSignature,
};
pub use repository::{MemoryRepository, ThreatRepository};
pub use resilience::{retry_async, RetryConfig};
pub use service::{DetectionService, EventAnalyzer};
pub use stream::{
    decode_event, AlertPublisher, EventStream, LogPublisher, MemoryPublisher, MemoryStream,
    StreamMessage, TOPIC_API_TRAFFIC, TOPIC_SECURITY_EVENTS,
};
