//! Error taxonomy for the detection core. Each variant maps to a distinct
//! handling policy in the dispatcher (drop, retry, isolate, fail fast).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    /// Malformed event or signature: drop, log, never retry.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Repository timeout or unavailability: retried with bounded backoff;
    /// on exhaustion the event's offset stays uncommitted for redelivery.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Panic or unexpected fault inside an engine call, converted by the
    /// dispatcher's supervision boundary.
    #[error("detector fault: {0}")]
    DetectorFault(String),

    /// Per-event analysis deadline expired.
    #[error("analysis deadline exceeded")]
    Timeout,

    /// Structural catalog/config error. Fails fast at startup; per-rule
    /// operator problems are logged and skipped at evaluation instead.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DetectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DetectionError::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, DetectionError>;
