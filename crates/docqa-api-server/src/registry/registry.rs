use super::instance::{HealthState, InstanceSnapshot, ModelInstance};
use crate::config::InstanceConfig;
use crate::utils::error::ApiError;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    LeastLatency,
    LeastLoaded,
    RoundRobin,
    StickyByConversation,
}

/// Pool of model-serving instances with health-aware selection.
pub struct InstanceRegistry {
    instances: RwLock<Vec<Arc<ModelInstance>>>,
    rr_cursor: AtomicUsize,
    failure_threshold: u32,
    pick_wait: Duration,
}

impl InstanceRegistry {
    pub fn new(failure_threshold: u32, pick_wait_ms: u64) -> Self {
        Self {
            instances: RwLock::new(Vec::new()),
            rr_cursor: AtomicUsize::new(0),
            failure_threshold,
            pick_wait: Duration::from_millis(pick_wait_ms),
        }
    }

    pub fn from_config(configs: &[InstanceConfig], failure_threshold: u32, pick_wait_ms: u64) -> Self {
        let registry = Self::new(failure_threshold, pick_wait_ms);
        for cfg in configs {
            registry.register(ModelInstance::new(
                cfg.name.clone(),
                cfg.url.clone(),
                cfg.models.clone(),
            ));
        }
        registry
    }

    /// Add an instance; it starts Degraded until the first successful probe.
    pub fn register(&self, instance: ModelInstance) {
        self.instances.write().push(Arc::new(instance));
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn all(&self) -> Vec<Arc<ModelInstance>> {
        self.instances.read().clone()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Instances currently hosting any of the given models, regardless
    /// of health. Used to size the generation semaphore.
    pub fn count_hosting_any(&self, model_ids: &[String]) -> usize {
        self.instances
            .read()
            .iter()
            .filter(|i| i.hosts_any(model_ids))
            .count()
    }

    pub fn record_outcome(
        &self,
        instance: &ModelInstance,
        model_id: &str,
        latency_ms: f64,
        ok: bool,
    ) {
        instance.record_outcome(Some(model_id), Some(latency_ms), ok, self.failure_threshold);
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        self.instances.read().iter().map(|i| i.snapshot()).collect()
    }

    pub fn has_healthy(&self) -> bool {
        self.instances
            .read()
            .iter()
            .any(|i| i.state() == HealthState::Healthy)
    }

    /// Select an instance hosting `model_id`. Prefers Healthy; falls back
    /// to Degraded when no Healthy instance hosts the model. Waits up to
    /// `pick_wait` for one to appear, then fails with NoAvailableInstance.
    pub async fn pick(
        &self,
        model_id: &str,
        strategy: SelectionStrategy,
        conversation_id: Option<&str>,
    ) -> Result<Arc<ModelInstance>, ApiError> {
        let deadline = Instant::now() + self.pick_wait;

        loop {
            if let Some(instance) = self.try_pick(model_id, strategy, conversation_id) {
                debug!(
                    model = model_id,
                    instance = %instance.name,
                    "picked instance"
                );
                return Ok(instance);
            }

            if Instant::now() >= deadline {
                return Err(ApiError::NoAvailableInstance(format!(
                    "no healthy instance hosts model {}",
                    model_id
                )));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Same selection without waiting; used to probe fallback chains.
    pub fn try_pick(
        &self,
        model_id: &str,
        strategy: SelectionStrategy,
        conversation_id: Option<&str>,
    ) -> Option<Arc<ModelInstance>> {
        let instances = self.instances.read();

        let healthy: Vec<Arc<ModelInstance>> = instances
            .iter()
            .filter(|i| i.hosts_model(model_id) && i.state() == HealthState::Healthy)
            .cloned()
            .collect();

        let eligible = if !healthy.is_empty() {
            healthy
        } else {
            // Degraded is selectable only when nothing Healthy hosts the model
            instances
                .iter()
                .filter(|i| i.hosts_model(model_id) && i.state() == HealthState::Degraded)
                .cloned()
                .collect()
        };
        drop(instances);

        if eligible.is_empty() {
            return None;
        }

        let chosen = match strategy {
            SelectionStrategy::LeastLatency => self.select_least_latency(&eligible, model_id),
            SelectionStrategy::LeastLoaded => self.select_least_loaded(&eligible, model_id),
            SelectionStrategy::RoundRobin => self.select_round_robin(&eligible),
            SelectionStrategy::StickyByConversation => match conversation_id {
                Some(conv) => {
                    let mut hasher = DefaultHasher::new();
                    conv.hash(&mut hasher);
                    let idx = (hasher.finish() as usize) % eligible.len();
                    eligible[idx].clone()
                }
                // Without a conversation there is nothing to stick to
                None => self.select_least_latency(&eligible, model_id),
            },
        };

        Some(chosen)
    }

    fn select_least_latency(
        &self,
        eligible: &[Arc<ModelInstance>],
        model_id: &str,
    ) -> Arc<ModelInstance> {
        let mut best = eligible[0].clone();
        let mut best_key = (best.ewma_latency_for(model_id), best.in_flight());

        for candidate in &eligible[1..] {
            let key = (candidate.ewma_latency_for(model_id), candidate.in_flight());
            if key.0 < best_key.0 || (key.0 == best_key.0 && key.1 < best_key.1) {
                best = candidate.clone();
                best_key = key;
            }
        }

        best
    }

    fn select_least_loaded(
        &self,
        eligible: &[Arc<ModelInstance>],
        model_id: &str,
    ) -> Arc<ModelInstance> {
        let mut best = eligible[0].clone();
        let mut best_key = (best.in_flight(), best.ewma_latency_for(model_id));

        for candidate in &eligible[1..] {
            let key = (candidate.in_flight(), candidate.ewma_latency_for(model_id));
            if key.0 < best_key.0
                || (key.0 == best_key.0 && key.1 < best_key.1)
            {
                best = candidate.clone();
                best_key = key;
            }
        }

        best
    }

    fn select_round_robin(&self, eligible: &[Arc<ModelInstance>]) -> Arc<ModelInstance> {
        let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        eligible[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(names: &[&str]) -> InstanceRegistry {
        let registry = InstanceRegistry::new(3, 50);
        for name in names {
            registry.register(ModelInstance::new(
                name.to_string(),
                format!("http://{}:11434", name),
                vec!["llama3.1:8b".to_string()],
            ));
        }
        registry
    }

    fn promote(registry: &InstanceRegistry, name: &str, latency: f64) {
        for inst in registry.all() {
            if inst.name == name {
                inst.record_outcome(Some("llama3.1:8b"), Some(latency), true, 3);
            }
        }
    }

    #[tokio::test]
    async fn test_pick_fails_when_no_instance_hosts_model() {
        let registry = registry_with(&["a"]);
        promote(&registry, "a", 10.0);

        let err = registry
            .pick("unknown-model", SelectionStrategy::LeastLatency, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NoAvailableInstance(_)));
    }

    #[tokio::test]
    async fn test_pick_prefers_healthy() {
        let registry = registry_with(&["a", "b"]);
        promote(&registry, "b", 10.0);
        // "a" stays Degraded

        let picked = registry
            .pick("llama3.1:8b", SelectionStrategy::LeastLatency, None)
            .await
            .unwrap();
        assert_eq!(picked.name, "b");
    }

    #[tokio::test]
    async fn test_pick_degraded_when_nothing_healthy() {
        let registry = registry_with(&["a"]);
        // never probed, still Degraded

        let picked = registry
            .pick("llama3.1:8b", SelectionStrategy::RoundRobin, None)
            .await
            .unwrap();
        assert_eq!(picked.name, "a");
    }

    #[tokio::test]
    async fn test_least_latency_prefers_lower_ewma() {
        let registry = registry_with(&["slow", "fast"]);
        promote(&registry, "slow", 500.0);
        promote(&registry, "fast", 20.0);

        let picked = registry
            .pick("llama3.1:8b", SelectionStrategy::LeastLatency, None)
            .await
            .unwrap();
        assert_eq!(picked.name, "fast");
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let registry = registry_with(&["a", "b"]);
        promote(&registry, "a", 10.0);
        promote(&registry, "b", 10.0);

        let first = registry
            .pick("llama3.1:8b", SelectionStrategy::RoundRobin, None)
            .await
            .unwrap();
        let second = registry
            .pick("llama3.1:8b", SelectionStrategy::RoundRobin, None)
            .await
            .unwrap();
        assert_ne!(first.name, second.name);
    }

    #[tokio::test]
    async fn test_sticky_is_deterministic() {
        let registry = registry_with(&["a", "b", "c"]);
        promote(&registry, "a", 10.0);
        promote(&registry, "b", 10.0);
        promote(&registry, "c", 10.0);

        let first = registry
            .pick(
                "llama3.1:8b",
                SelectionStrategy::StickyByConversation,
                Some("conv-42"),
            )
            .await
            .unwrap();
        for _ in 0..5 {
            let again = registry
                .pick(
                    "llama3.1:8b",
                    SelectionStrategy::StickyByConversation,
                    Some("conv-42"),
                )
                .await
                .unwrap();
            assert_eq!(first.name, again.name);
        }
    }

    #[tokio::test]
    async fn test_unhealthy_excluded() {
        let registry = registry_with(&["a", "b"]);
        promote(&registry, "a", 10.0);
        promote(&registry, "b", 10.0);

        for inst in registry.all() {
            if inst.name == "a" {
                for _ in 0..3 {
                    inst.record_outcome(None, None, false, 3);
                }
            }
        }

        for _ in 0..4 {
            let picked = registry
                .pick("llama3.1:8b", SelectionStrategy::RoundRobin, None)
                .await
                .unwrap();
            assert_eq!(picked.name, "b");
        }
    }
}
