//! Bounded retry with jittered exponential backoff, used for repository
//! calls that fail transiently. Non-retryable errors return immediately.

use crate::error::Result;
use rand::{thread_rng, Rng};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter fraction in [0.0, 1.0] applied to each delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 1500,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: usize) -> Duration {
        let exp = Duration::from_millis(self.base_delay_ms).mul_f64(2f64.powi(attempt as i32));
        let mut delay = exp.min(Duration::from_millis(self.max_delay_ms));
        if self.jitter > 0.0 {
            let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
            if jitter_ms > 0 {
                let offset = thread_rng().gen_range(-jitter_ms..=jitter_ms);
                delay = Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64);
            }
        }
        delay
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is exhausted. The closure receives the attempt index.
pub async fn retry_async<F, Fut, T>(cfg: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() || attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let delay = cfg.backoff(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
