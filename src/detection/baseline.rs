//! Per-(entity, metric) baseline state behind a keyed-lock arena.
//!
//! The outer map lock covers only slot lookup; every slot owns its state
//! exclusively, so concurrent mutation of one key serializes while
//! distinct keys never contend.

use crate::models::BaselineStatistics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaselineKey {
    pub entity_id: String,
    pub entity_type: String,
    pub metric_name: String,
}

/// Online mean/variance via Welford's algorithm, plus the categorical
/// history set and the feedback-tuned sensitivity multiplier.
#[derive(Debug)]
pub struct BaselineState {
    count: u64,
    mean: f64,
    m2: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub seen_categories: HashSet<String>,
    pub sensitivity: f64,
    pub adjusted_at: DateTime<Utc>,
    /// Observations withheld from the baseline because they fired an
    /// anomaly, keyed by anomaly id, pending feedback.
    pub deferred: HashMap<String, f64>,
}

impl BaselineState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            window_start: now,
            window_end: now,
            seen_categories: HashSet::new(),
            sensitivity: 1.0,
            adjusted_at: now,
            deferred: HashMap::new(),
        }
    }

    pub fn update(&mut self, value: f64, at: DateTime<Utc>) {
        if self.count == 0 {
            self.window_start = at;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
        self.window_end = at;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count as f64 - 1.0)
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn sample_count(&self) -> u64 {
        self.count
    }

    /// Records a categorical observation. Bumps the sample counter so the
    /// snapshot reflects how much history backs the set (the Welford
    /// accumulators stay untouched for categorical keys).
    pub fn admit_category(&mut self, value: &str, at: DateTime<Utc>) {
        if self.count == 0 {
            self.window_start = at;
        }
        self.seen_categories.insert(value.to_string());
        self.count += 1;
        self.window_end = at;
    }

    /// Applies exponential decay of the sensitivity multiplier toward 1.0
    /// and returns the decayed value. Decay composes, so calling this on
    /// every access keeps the trajectory continuous.
    pub fn effective_sensitivity(&mut self, now: DateTime<Utc>, half_life_secs: u64) -> f64 {
        if half_life_secs > 0 {
            let elapsed = (now - self.adjusted_at).num_seconds();
            if elapsed > 0 {
                let factor = 0.5f64.powf(elapsed as f64 / half_life_secs as f64);
                self.sensitivity = 1.0 + (self.sensitivity - 1.0) * factor;
                self.adjusted_at = now;
            }
        }
        self.sensitivity
    }

    pub fn take_deferred(&mut self, anomaly_id: &str) -> Option<f64> {
        self.deferred.remove(anomaly_id)
    }

    pub fn snapshot(&self, key: &BaselineKey) -> BaselineStatistics {
        BaselineStatistics {
            entity_id: key.entity_id.clone(),
            entity_type: key.entity_type.clone(),
            metric_name: key.metric_name.clone(),
            mean: self.mean,
            variance: self.variance(),
            sample_count: self.count,
            window_start: self.window_start,
            window_end: self.window_end,
            last_updated: Utc::now(),
        }
    }

    /// Restores Welford accumulators from a persisted snapshot. Never used
    /// mid-window; only on explicit hydration.
    pub fn restore(&mut self, stats: &BaselineStatistics) {
        self.count = stats.sample_count;
        self.mean = stats.mean;
        self.m2 = stats.variance * stats.sample_count.saturating_sub(1) as f64;
        self.window_start = stats.window_start;
        self.window_end = stats.window_end;
    }
}

#[derive(Default)]
pub struct BaselineArena {
    slots: Mutex<HashMap<BaselineKey, Arc<Mutex<BaselineState>>>>,
}

impl BaselineArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the exclusive slot for `key`, creating it on first access.
    pub fn entry(&self, key: &BaselineKey) -> Arc<Mutex<BaselineState>> {
        let mut slots = self.slots.lock();
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BaselineState::new())))
            .clone()
    }

    pub fn keys(&self) -> Vec<BaselineKey> {
        self.slots.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self, key: &BaselineKey) -> Option<BaselineStatistics> {
        let slot = {
            let slots = self.slots.lock();
            slots.get(key).cloned()
        }?;
        let state = slot.lock();
        Some(state.snapshot(key))
    }

    pub fn hydrate(&self, stats: &BaselineStatistics) {
        let key = BaselineKey {
            entity_id: stats.entity_id.clone(),
            entity_type: stats.entity_type.clone(),
            metric_name: stats.metric_name.clone(),
        };
        let slot = self.entry(&key);
        slot.lock().restore(stats);
    }
}
