//! Layered service configuration: compiled defaults, then an optional
//! config file (`DETECT_CONFIG_FILE`), then `DETECT__`-prefixed
//! environment overrides (e.g. `DETECT__DISPATCHER__WORKER_COUNT=8`).

use crate::error::{DetectionError, Result};
use crate::resilience::RetryConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub dispatcher: DispatcherConfig,
    pub anomaly: AnomalyConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub event_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            worker_count: 4,
            queue_capacity: 256,
            event_timeout_ms: 2000,
            shutdown_grace_ms: 5000,
            poll_interval_ms: 250,
        }
    }
}

impl DispatcherConfig {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Deviation threshold against `|z| * sensitivity`.
    pub z_threshold: f64,
    /// Scale of the score squashing `1 - exp(-|z| / k)`.
    pub score_scale_k: f64,
    /// Minimum samples before a baseline may fire.
    pub min_samples: u64,
    /// Multiplicative sensitivity step applied on feedback.
    pub feedback_step: f64,
    pub sensitivity_min: f64,
    pub sensitivity_max: f64,
    /// Half-life of the decay pulling sensitivity back toward 1.0.
    /// Zero disables decay.
    pub feedback_decay_half_life_secs: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            score_scale_k: 2.0,
            min_samples: 10,
            feedback_step: 0.15,
            sensitivity_min: 0.25,
            sensitivity_max: 4.0,
            feedback_decay_half_life_secs: 86_400,
        }
    }
}

impl DetectionConfig {
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(file) = std::env::var("DETECT_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("DETECT").separator("__"));
        let cfg = builder
            .build()
            .map_err(|e| DetectionError::Configuration(e.to_string()))?;
        let cfg: DetectionConfig = cfg
            .try_deserialize()
            .map_err(|e| DetectionError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation; fails fast at startup.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.batch_size == 0
            || self.dispatcher.worker_count == 0
            || self.dispatcher.queue_capacity == 0
        {
            return Err(DetectionError::Configuration(
                "dispatcher batch_size, worker_count and queue_capacity must be positive".into(),
            ));
        }
        if self.anomaly.z_threshold <= 0.0 || self.anomaly.score_scale_k <= 0.0 {
            return Err(DetectionError::Configuration(
                "anomaly z_threshold and score_scale_k must be positive".into(),
            ));
        }
        if self.anomaly.feedback_step < 0.0 {
            return Err(DetectionError::Configuration(
                "anomaly feedback_step must not be negative".into(),
            ));
        }
        if !(self.anomaly.sensitivity_min <= 1.0 && 1.0 <= self.anomaly.sensitivity_max) {
            return Err(DetectionError::Configuration(
                "sensitivity clamp must bracket the neutral multiplier 1.0".into(),
            ));
        }
        Ok(())
    }
}
