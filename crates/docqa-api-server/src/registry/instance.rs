use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// EWMA smoothing factor for latency samples.
const EWMA_ALPHA: f64 = 0.3;

/// Successes in a row required to leave Unhealthy.
const RECOVERY_SUCCESSES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Probes inconclusive (model still loading, no successful probe yet).
    /// Selectable only when no Healthy instance exists.
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug)]
struct InstanceStats {
    state: HealthState,
    ever_succeeded: bool,
    consecutive_failures: u32,
    successes_in_row: u32,
    /// EWMA latency per model, millis.
    ewma_latency_ms: HashMap<String, f64>,
    last_probe: Option<DateTime<Utc>>,
}

/// One model-serving endpoint. Stats are single-writer (health monitor
/// and outcome recorder) behind a mutex; the in-flight counter is an
/// atomic updated around every downstream call.
#[derive(Debug)]
pub struct ModelInstance {
    pub name: String,
    pub url: String,
    models: RwLock<HashSet<String>>,
    in_flight: AtomicU32,
    stats: Mutex<InstanceStats>,
}

impl ModelInstance {
    pub fn new(name: String, url: String, models: Vec<String>) -> Self {
        Self {
            name,
            url,
            models: RwLock::new(models.into_iter().collect()),
            in_flight: AtomicU32::new(0),
            stats: Mutex::new(InstanceStats {
                state: HealthState::Degraded,
                ever_succeeded: false,
                consecutive_failures: 0,
                successes_in_row: 0,
                ewma_latency_ms: HashMap::new(),
                last_probe: None,
            }),
        }
    }

    pub fn hosts_model(&self, model_id: &str) -> bool {
        self.models.read().contains(model_id)
    }

    pub fn hosts_any(&self, model_ids: &[String]) -> bool {
        let models = self.models.read();
        model_ids.iter().any(|m| models.contains(m))
    }

    /// Replace the live model set from a successful /api/tags probe.
    pub fn set_models(&self, models: Vec<String>) {
        *self.models.write() = models.into_iter().collect();
    }

    pub fn state(&self) -> HealthState {
        self.stats.lock().state
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// EWMA latency for one model; instances without a sample yet read
    /// as 0 so new capacity gets traffic.
    pub fn ewma_latency_for(&self, model_id: &str) -> f64 {
        self.stats
            .lock()
            .ewma_latency_ms
            .get(model_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// RAII in-flight marker around a downstream call.
    pub fn begin_call(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            instance: Arc::clone(self),
        }
    }

    /// Record a completed downstream call or probe. Cancellations are
    /// neither success nor failure and must not reach this method.
    pub fn record_outcome(
        &self,
        model_id: Option<&str>,
        latency_ms: Option<f64>,
        ok: bool,
        failure_threshold: u32,
    ) {
        let mut stats = self.stats.lock();

        if let (Some(model), Some(latency)) = (model_id, latency_ms) {
            let entry = stats.ewma_latency_ms.entry(model.to_string()).or_insert(latency);
            *entry = EWMA_ALPHA * latency + (1.0 - EWMA_ALPHA) * *entry;
        }

        if ok {
            stats.consecutive_failures = 0;
            stats.successes_in_row += 1;

            let promote = if !stats.ever_succeeded {
                stats.ever_succeeded = true;
                true
            } else {
                stats.state == HealthState::Unhealthy
                    && stats.successes_in_row >= RECOVERY_SUCCESSES
            };

            if promote && stats.state != HealthState::Healthy {
                info!(instance = %self.name, "instance promoted to healthy");
                stats.state = HealthState::Healthy;
            }
        } else {
            stats.successes_in_row = 0;
            stats.consecutive_failures += 1;

            if stats.consecutive_failures >= failure_threshold
                && stats.state != HealthState::Unhealthy
            {
                warn!(
                    instance = %self.name,
                    failures = stats.consecutive_failures,
                    "instance demoted to unhealthy"
                );
                stats.state = HealthState::Unhealthy;
            }
        }
    }

    /// Immediate demotion on an internal-consistency failure
    /// (wrong embedding dimension).
    pub fn demote(&self, reason: &str) {
        let mut stats = self.stats.lock();
        if stats.state != HealthState::Unhealthy {
            warn!(instance = %self.name, reason, "instance demoted to unhealthy");
            stats.state = HealthState::Unhealthy;
            stats.successes_in_row = 0;
        }
    }

    pub fn mark_probed(&self) {
        self.stats.lock().last_probe = Some(Utc::now());
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let stats = self.stats.lock();
        let mut models: Vec<String> = self.models.read().iter().cloned().collect();
        models.sort();

        let ewma = if stats.ewma_latency_ms.is_empty() {
            0.0
        } else {
            stats.ewma_latency_ms.values().sum::<f64>() / stats.ewma_latency_ms.len() as f64
        };

        InstanceSnapshot {
            name: self.name.clone(),
            url: self.url.clone(),
            models,
            status: stats.state,
            ewma_latency_ms: ewma,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            consecutive_failures: stats.consecutive_failures,
            last_probe: stats.last_probe,
        }
    }
}

pub struct InFlightGuard {
    instance: Arc<ModelInstance>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.instance.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub url: String,
    pub models: Vec<String>,
    pub status: HealthState,
    pub ewma_latency_ms: f64,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub last_probe: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Arc<ModelInstance> {
        Arc::new(ModelInstance::new(
            "a".to_string(),
            "http://localhost:11434".to_string(),
            vec!["llama3.1:8b".to_string()],
        ))
    }

    #[test]
    fn test_initial_state_is_degraded() {
        assert_eq!(instance().state(), HealthState::Degraded);
    }

    #[test]
    fn test_first_success_promotes() {
        let inst = instance();
        inst.record_outcome(Some("llama3.1:8b"), Some(20.0), true, 3);
        assert_eq!(inst.state(), HealthState::Healthy);
    }

    #[test]
    fn test_demotion_requires_threshold_failures() {
        let inst = instance();
        inst.record_outcome(None, None, true, 3);
        inst.record_outcome(None, None, false, 3);
        inst.record_outcome(None, None, false, 3);
        assert_eq!(inst.state(), HealthState::Healthy);
        inst.record_outcome(None, None, false, 3);
        assert_eq!(inst.state(), HealthState::Unhealthy);
    }

    #[test]
    fn test_recovery_requires_two_successes() {
        let inst = instance();
        inst.record_outcome(None, None, true, 3);
        for _ in 0..3 {
            inst.record_outcome(None, None, false, 3);
        }
        assert_eq!(inst.state(), HealthState::Unhealthy);

        inst.record_outcome(None, None, true, 3);
        assert_eq!(inst.state(), HealthState::Unhealthy);
        inst.record_outcome(None, None, true, 3);
        assert_eq!(inst.state(), HealthState::Healthy);
    }

    #[test]
    fn test_failure_resets_recovery_streak() {
        let inst = instance();
        inst.record_outcome(None, None, true, 3);
        for _ in 0..3 {
            inst.record_outcome(None, None, false, 3);
        }
        inst.record_outcome(None, None, true, 3);
        inst.record_outcome(None, None, false, 3);
        inst.record_outcome(None, None, true, 3);
        // Streak broken, still one success in a row
        assert_eq!(inst.state(), HealthState::Unhealthy);
    }

    #[test]
    fn test_in_flight_guard() {
        let inst = instance();
        assert_eq!(inst.in_flight(), 0);
        {
            let _guard = inst.begin_call();
            let _guard2 = inst.begin_call();
            assert_eq!(inst.in_flight(), 2);
        }
        assert_eq!(inst.in_flight(), 0);
    }

    #[test]
    fn test_ewma_moves_toward_samples() {
        let inst = instance();
        inst.record_outcome(Some("m"), Some(100.0), true, 3);
        inst.record_outcome(Some("m"), Some(200.0), true, 3);
        let ewma = inst.ewma_latency_for("m");
        assert!(ewma > 100.0 && ewma < 200.0);
    }

    #[test]
    fn test_immediate_demote() {
        let inst = instance();
        inst.record_outcome(None, None, true, 3);
        inst.demote("dimension mismatch");
        assert_eq!(inst.state(), HealthState::Unhealthy);
    }
}
