//! Anomaly/baseline engine: statistical z-score detection over per-key
//! Welford baselines, a categorical "never seen before" rule, and the
//! feedback loop that tunes per-key sensitivity.

use crate::config::AnomalyConfig;
use crate::detection::baseline::{BaselineArena, BaselineKey};
use crate::error::Result;
use crate::models::{
    Anomaly, AnomalyFeedback, AnomalyType, BaselineStatistics, Event, FeedbackVerdict,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// Floor for the standard deviation in the z-score denominator.
const STDDEV_EPSILON: f64 = 1e-9;

/// Payload field treated as the categorical metric (the entity's
/// geography history).
pub const COUNTRY_FIELD: &str = "country";

/// Capacity of the redelivery replay window.
const RECENT_EVENTS_CAP: usize = 4096;

/// Capacity of the open-anomaly feedback window. Most anomalies never
/// receive a verdict; the oldest unresolved entry is evicted and its
/// withheld value dropped, as if it had been confirmed a true positive.
const FEEDBACK_WINDOW_CAP: usize = 4096;

pub struct AnomalyEngine {
    arena: BaselineArena,
    cfg: AnomalyConfig,
    /// Maps an open anomaly id back to its baseline key so feedback can
    /// find the state to adjust. Entries leave when feedback lands or the
    /// window evicts them.
    feedback_index: Mutex<FeedbackIndex>,
    recent_events: Mutex<RecentEvents>,
}

impl AnomalyEngine {
    pub fn new(cfg: AnomalyConfig) -> Self {
        Self {
            arena: BaselineArena::new(),
            cfg,
            feedback_index: Mutex::new(FeedbackIndex::new(FEEDBACK_WINDOW_CAP)),
            recent_events: Mutex::new(RecentEvents::new(RECENT_EVENTS_CAP)),
        }
    }

    /// Runs every metric extractable from the event through the baselines.
    /// Every top-level numeric payload field is a statistical metric; the
    /// `country` field is the categorical one. A redelivered event id
    /// replays the anomalies computed on first delivery instead of
    /// mutating the baselines again, so a persist that failed after
    /// detection can be retried without the detection disappearing.
    pub fn detect_anomalies(&self, event: &Event) -> Vec<Anomaly> {
        if let Some(prior) = self.recent_events.lock().replay(&event.event_id) {
            debug!(
                event = %event.event_id,
                anomalies = prior.len(),
                "redelivered event, replaying first result"
            );
            return prior;
        }
        let mut out = Vec::new();
        for (field, value) in &event.payload {
            if field == COUNTRY_FIELD {
                if let Some(country) = value.as_str() {
                    out.extend(self.observe_category(
                        &event.entity_id,
                        &event.entity_type,
                        COUNTRY_FIELD,
                        country,
                        event.timestamp,
                    ));
                }
                continue;
            }
            if let Some(num) = value.as_f64() {
                out.extend(self.observe(
                    &event.entity_id,
                    &event.entity_type,
                    field,
                    num,
                    event.timestamp,
                ));
            }
        }
        self.recent_events.lock().record(&event.event_id, out.clone());
        out
    }

    /// One statistical observation. Fires when `|z| * sensitivity` exceeds
    /// the threshold (given enough samples); a firing observation is
    /// withheld from the running statistics so the spike being flagged
    /// cannot poison its own baseline, and is parked pending feedback.
    pub fn observe(
        &self,
        entity_id: &str,
        entity_type: &str,
        metric_name: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> Option<Anomaly> {
        let key = BaselineKey {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            metric_name: metric_name.to_string(),
        };
        let slot = self.arena.entry(&key);
        let mut state = slot.lock();
        let sensitivity =
            state.effective_sensitivity(at, self.cfg.feedback_decay_half_life_secs);

        let z = if state.sample_count() >= self.cfg.min_samples {
            (value - state.mean()) / state.stddev().max(STDDEV_EPSILON)
        } else {
            0.0
        };

        if state.sample_count() >= self.cfg.min_samples
            && z.abs() * sensitivity > self.cfg.z_threshold
        {
            let anomaly = Anomaly {
                id: Uuid::new_v4().to_string(),
                entity_id: key.entity_id.clone(),
                entity_type: key.entity_type.clone(),
                anomaly_type: AnomalyType::Statistical,
                metric_name: key.metric_name.clone(),
                score: squash(z.abs(), self.cfg.score_scale_k),
                observed_value: Value::from(value),
                baseline: state.snapshot(&key),
                detected_at: at,
                feedback: None,
            };
            state.deferred.insert(anomaly.id.clone(), value);
            drop(state);
            self.index_anomaly(&anomaly.id, key);
            Some(anomaly)
        } else {
            state.update(value, at);
            None
        }
    }

    /// Categorical rule: a value the entity has never shown before fires
    /// regardless of any numeric threshold. The first observation only
    /// seeds the history; each novel value alerts once and is then
    /// admitted to the set.
    pub fn observe_category(
        &self,
        entity_id: &str,
        entity_type: &str,
        metric_name: &str,
        value: &str,
        at: DateTime<Utc>,
    ) -> Option<Anomaly> {
        let key = BaselineKey {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            metric_name: metric_name.to_string(),
        };
        let slot = self.arena.entry(&key);
        let mut state = slot.lock();
        let novel = !state.seen_categories.is_empty() && !state.seen_categories.contains(value);
        let anomaly = novel.then(|| Anomaly {
            id: Uuid::new_v4().to_string(),
            entity_id: key.entity_id.clone(),
            entity_type: key.entity_type.clone(),
            anomaly_type: AnomalyType::Categorical,
            metric_name: key.metric_name.clone(),
            score: 1.0,
            observed_value: Value::from(value),
            baseline: state.snapshot(&key),
            detected_at: at,
            feedback: None,
        });
        state.admit_category(value, at);
        drop(state);
        if let Some(a) = &anomaly {
            self.index_anomaly(&a.id, key);
        }
        anomaly
    }

    /// Registers an open anomaly for feedback. When the window is full
    /// the oldest unresolved entry is evicted and its withheld value
    /// dropped. The slot lock must not be held by the caller: eviction
    /// may land on the same key.
    fn index_anomaly(&self, anomaly_id: &str, key: BaselineKey) {
        let evicted = self.feedback_index.lock().insert(anomaly_id, key);
        if let Some((old_id, old_key)) = evicted {
            self.arena.entry(&old_key).lock().take_deferred(&old_id);
            debug!(anomaly = %old_id, "unresolved anomaly evicted from the feedback window");
        }
    }

    /// Absorbs an analyst verdict. A false positive lowers sensitivity
    /// (raising the effective threshold) and retroactively folds the
    /// withheld observation into the baseline; a true positive applies a
    /// bounded step the other way. The stored multiplier decays toward 1.0
    /// before each adjustment, and the result is clamped.
    pub fn record_feedback(&self, feedback: &AnomalyFeedback) -> Result<()> {
        let key = self.feedback_index.lock().remove(&feedback.anomaly_id);
        let Some(key) = key else {
            warn!(
                anomaly = %feedback.anomaly_id,
                "feedback for unknown anomaly, sensitivity unchanged"
            );
            return Ok(());
        };
        let slot = self.arena.entry(&key);
        let mut state = slot.lock();
        let mut sensitivity = state
            .effective_sensitivity(feedback.recorded_at, self.cfg.feedback_decay_half_life_secs);
        let deferred = state.take_deferred(&feedback.anomaly_id);
        match feedback.verdict {
            FeedbackVerdict::FalsePositive => {
                sensitivity /= 1.0 + self.cfg.feedback_step;
                if let Some(value) = deferred {
                    state.update(value, feedback.recorded_at);
                }
            }
            FeedbackVerdict::TruePositive => {
                sensitivity *= 1.0 + self.cfg.feedback_step / 2.0;
            }
        }
        state.sensitivity = sensitivity.clamp(self.cfg.sensitivity_min, self.cfg.sensitivity_max);
        state.adjusted_at = feedback.recorded_at;
        debug!(
            entity = %key.entity_id,
            metric = %key.metric_name,
            sensitivity = state.sensitivity,
            verdict = ?feedback.verdict,
            "sensitivity adjusted"
        );
        Ok(())
    }

    pub fn hydrate_statistics(&self, stats: &BaselineStatistics) {
        self.arena.hydrate(stats);
    }

    pub fn hydrate_countries(&self, entity_id: &str, entity_type: &str, countries: &[String]) {
        let key = BaselineKey {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            metric_name: COUNTRY_FIELD.to_string(),
        };
        let slot = self.arena.entry(&key);
        let mut state = slot.lock();
        for c in countries {
            state.admit_category(c, Utc::now());
        }
    }

    pub fn baseline_keys(&self) -> Vec<BaselineKey> {
        self.arena.keys()
    }

    pub fn baseline_snapshot(&self, key: &BaselineKey) -> Option<BaselineStatistics> {
        self.arena.snapshot(key)
    }
}

/// Bounded squashing of `|z|` into [0, 1) so scores are comparable
/// across metrics.
fn squash(z_abs: f64, k: f64) -> f64 {
    1.0 - (-z_abs / k).exp()
}

/// Capped cache of recently analyzed event ids and the anomalies each
/// produced, evicted oldest-first.
struct RecentEvents {
    outcomes: HashMap<String, Vec<Anomaly>>,
    order: VecDeque<String>,
    cap: usize,
}

impl RecentEvents {
    fn new(cap: usize) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn replay(&self, id: &str) -> Option<Vec<Anomaly>> {
        self.outcomes.get(id).cloned()
    }

    fn record(&mut self, id: &str, anomalies: Vec<Anomaly>) {
        if self.outcomes.contains_key(id) {
            return;
        }
        if self.order.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.outcomes.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.outcomes.insert(id.to_string(), anomalies);
    }
}

/// Capped index of open anomalies awaiting feedback. `insert` returns
/// the entry evicted to stay within capacity; ids resolved by feedback
/// leave stale order slots that eviction skips over.
struct FeedbackIndex {
    map: HashMap<String, BaselineKey>,
    order: VecDeque<String>,
    cap: usize,
}

impl FeedbackIndex {
    fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, id: &str, key: BaselineKey) -> Option<(String, BaselineKey)> {
        self.map.insert(id.to_string(), key);
        self.order.push_back(id.to_string());
        while self.map.len() > self.cap {
            let old = self.order.pop_front()?;
            if let Some(old_key) = self.map.remove(&old) {
                return Some((old, old_key));
            }
        }
        None
    }

    fn remove(&mut self, id: &str) -> Option<BaselineKey> {
        self.map.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> AnomalyEngine {
        AnomalyEngine::new(AnomalyConfig::default())
    }

    /// mean 100, stddev 10, 50 samples
    fn seeded(engine: &AnomalyEngine, metric: &str) {
        engine.hydrate_statistics(&BaselineStatistics {
            entity_id: "client-1".into(),
            entity_type: "api_consumer".into(),
            metric_name: metric.into(),
            mean: 100.0,
            variance: 100.0,
            sample_count: 50,
            window_start: Utc::now() - Duration::hours(1),
            window_end: Utc::now(),
            last_updated: Utc::now(),
        });
    }

    #[test]
    fn z_score_above_threshold_fires() {
        let eng = engine();
        seeded(&eng, "response_time");
        // z = (140 - 100) / 10 = 4 > 3
        let anomaly = eng
            .observe("client-1", "api_consumer", "response_time", 140.0, Utc::now())
            .expect("z=4 must fire");
        assert_eq!(anomaly.anomaly_type, AnomalyType::Statistical);
        assert!(anomaly.score > 0.0 && anomaly.score < 1.0);
        // within threshold stays quiet
        assert!(eng
            .observe("client-1", "api_consumer", "response_time", 110.0, Utc::now())
            .is_none());
    }

    #[test]
    fn score_is_squashed_and_monotone_in_z() {
        let eng = engine();
        seeded(&eng, "m");
        let a = eng
            .observe("client-1", "api_consumer", "m", 140.0, Utc::now())
            .unwrap();
        let b = eng
            .observe("client-1", "api_consumer", "m", 200.0, Utc::now())
            .unwrap();
        assert!(b.score > a.score);
        assert!(b.score < 1.0);
    }

    #[test]
    fn too_few_samples_never_fires() {
        let eng = engine();
        for v in [1.0, 2.0, 1.5] {
            assert!(eng
                .observe("client-1", "api_consumer", "m", v, Utc::now())
                .is_none());
        }
        // even a wild value stays quiet below min_samples
        assert!(eng
            .observe("client-1", "api_consumer", "m", 1e6, Utc::now())
            .is_none());
    }

    #[test]
    fn novel_country_fires_regardless_of_numbers() {
        let eng = engine();
        eng.hydrate_countries(
            "client-1",
            "api_consumer",
            &["US".to_string(), "CA".to_string()],
        );
        assert!(eng
            .observe_category("client-1", "api_consumer", COUNTRY_FIELD, "US", Utc::now())
            .is_none());
        let anomaly = eng
            .observe_category("client-1", "api_consumer", COUNTRY_FIELD, "FR", Utc::now())
            .expect("novel country must fire");
        assert_eq!(anomaly.anomaly_type, AnomalyType::Categorical);
        assert_eq!(anomaly.score, 1.0);
        // one alert per novel value
        assert!(eng
            .observe_category("client-1", "api_consumer", COUNTRY_FIELD, "FR", Utc::now())
            .is_none());
    }

    #[test]
    fn first_category_only_seeds_history() {
        let eng = engine();
        assert!(eng
            .observe_category("c", "api_consumer", COUNTRY_FIELD, "US", Utc::now())
            .is_none());
        assert!(eng
            .observe_category("c", "api_consumer", COUNTRY_FIELD, "FR", Utc::now())
            .is_some());
    }

    #[test]
    fn firing_observation_does_not_poison_baseline() {
        let eng = engine();
        seeded(&eng, "m");
        let before = eng
            .baseline_snapshot(&BaselineKey {
                entity_id: "client-1".into(),
                entity_type: "api_consumer".into(),
                metric_name: "m".into(),
            })
            .unwrap();
        let anomaly = eng
            .observe("client-1", "api_consumer", "m", 500.0, Utc::now())
            .unwrap();
        let after = eng
            .baseline_snapshot(&BaselineKey {
                entity_id: "client-1".into(),
                entity_type: "api_consumer".into(),
                metric_name: "m".into(),
            })
            .unwrap();
        assert_eq!(after.sample_count, before.sample_count);
        assert_eq!(after.mean, before.mean);

        // false-positive feedback folds the withheld value back in
        eng.record_feedback(&AnomalyFeedback {
            anomaly_id: anomaly.id,
            verdict: FeedbackVerdict::FalsePositive,
            recorded_at: Utc::now(),
        })
        .unwrap();
        let folded = eng
            .baseline_snapshot(&BaselineKey {
                entity_id: "client-1".into(),
                entity_type: "api_consumer".into(),
                metric_name: "m".into(),
            })
            .unwrap();
        assert_eq!(folded.sample_count, before.sample_count + 1);
        assert!(folded.mean > before.mean);
    }

    #[test]
    fn false_positive_feedback_raises_effective_threshold() {
        let cfg = AnomalyConfig {
            feedback_decay_half_life_secs: 0,
            ..AnomalyConfig::default()
        };
        let eng = AnomalyEngine::new(cfg);
        seeded(&eng, "m");
        // z = 3.2: fires at neutral sensitivity
        let anomaly = eng
            .observe("client-1", "api_consumer", "m", 132.0, Utc::now())
            .expect("z=3.2 fires at sensitivity 1.0");
        eng.record_feedback(&AnomalyFeedback {
            anomaly_id: anomaly.id,
            verdict: FeedbackVerdict::FalsePositive,
            recorded_at: Utc::now(),
        })
        .unwrap();
        // identical deviation no longer fires: 3.2 / 1.15 < 3.0
        // (the folded value barely moves a 50-sample baseline)
        assert!(eng
            .observe("client-1", "api_consumer", "m", 132.0, Utc::now())
            .is_none());
    }

    #[test]
    fn sensitivity_is_clamped() {
        let cfg = AnomalyConfig {
            feedback_decay_half_life_secs: 0,
            sensitivity_min: 0.5,
            ..AnomalyConfig::default()
        };
        let eng = AnomalyEngine::new(cfg.clone());
        seeded(&eng, "m");
        for _ in 0..50 {
            let Some(anomaly) =
                eng.observe("client-1", "api_consumer", "m", 1000.0, Utc::now())
            else {
                break;
            };
            eng.record_feedback(&AnomalyFeedback {
                anomaly_id: anomaly.id,
                verdict: FeedbackVerdict::FalsePositive,
                recorded_at: Utc::now(),
            })
            .unwrap();
        }
        let key = BaselineKey {
            entity_id: "client-1".into(),
            entity_type: "api_consumer".into(),
            metric_name: "m".into(),
        };
        let slot = eng.arena.entry(&key);
        assert!(slot.lock().sensitivity >= cfg.sensitivity_min);
    }

    fn numeric_event(id: &str, metric: &str, value: f64) -> Event {
        let mut payload = std::collections::BTreeMap::new();
        payload.insert(metric.to_string(), Value::from(value));
        Event {
            event_id: id.into(),
            entity_id: "client-1".into(),
            entity_type: "api_consumer".into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn redelivery_does_not_remutate_baselines() {
        let eng = engine();
        let event = numeric_event("ev-dup", "request_count", 10.0);
        eng.detect_anomalies(&event);
        eng.detect_anomalies(&event);
        let snap = eng
            .baseline_snapshot(&BaselineKey {
                entity_id: "client-1".into(),
                entity_type: "api_consumer".into(),
                metric_name: "request_count".into(),
            })
            .unwrap();
        assert_eq!(snap.sample_count, 1);
    }

    #[test]
    fn redelivered_event_replays_its_anomalies() {
        let eng = engine();
        seeded(&eng, "request_count");
        let event = numeric_event("ev-spike", "request_count", 500.0);
        let first = eng.detect_anomalies(&event);
        assert_eq!(first.len(), 1);
        let again = eng.detect_anomalies(&event);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
        // the replay neither mutates the baseline nor double-parks the value
        let key = BaselineKey {
            entity_id: "client-1".into(),
            entity_type: "api_consumer".into(),
            metric_name: "request_count".into(),
        };
        assert_eq!(eng.baseline_snapshot(&key).unwrap().sample_count, 50);
        assert_eq!(eng.arena.entry(&key).lock().deferred.len(), 1);
    }

    #[test]
    fn open_anomaly_window_is_bounded() {
        let eng = engine();
        seeded(&eng, "m");
        for _ in 0..FEEDBACK_WINDOW_CAP + 32 {
            eng.observe("client-1", "api_consumer", "m", 1000.0, Utc::now())
                .expect("every spike fires");
        }
        assert!(eng.feedback_index.lock().map.len() <= FEEDBACK_WINDOW_CAP);
        let key = BaselineKey {
            entity_id: "client-1".into(),
            entity_type: "api_consumer".into(),
            metric_name: "m".into(),
        };
        // evicted entries dropped their withheld values with them
        assert!(eng.arena.entry(&key).lock().deferred.len() <= FEEDBACK_WINDOW_CAP);
    }

    #[test]
    fn feedback_for_unknown_anomaly_is_harmless() {
        let eng = engine();
        eng.record_feedback(&AnomalyFeedback {
            anomaly_id: "no-such-anomaly".into(),
            verdict: FeedbackVerdict::TruePositive,
            recorded_at: Utc::now(),
        })
        .unwrap();
    }
}
