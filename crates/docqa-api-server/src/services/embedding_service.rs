use crate::config::EmbeddingConfig;
use crate::registry::{InstanceRegistry, ModelInstance, SelectionStrategy};
use crate::services::cache::{cache_key, TtlLruCache};
use crate::services::model_client::EmbeddingBackend;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_CAP_MS: u64 = 2_000;

struct EmbedJob {
    text: String,
    respond: oneshot::Sender<Result<Vec<f32>, ApiError>>,
}

/// Embedding client with a shared batch scheduler. Callers submit texts
/// individually; a background task coalesces them up to the batch size
/// or window, fans the batch out against one healthy instance and
/// distributes results back in submission order.
#[derive(Clone)]
pub struct EmbeddingService {
    tx: flume::Sender<EmbedJob>,
    model: String,
    pub dimension: usize,
    cache: Arc<TtlLruCache<Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        client: Arc<dyn EmbeddingBackend>,
        limiters: Arc<Limiters>,
        config: EmbeddingConfig,
        cache_ttl: Duration,
        cache_max_entries: usize,
    ) -> Self {
        let (tx, rx) = flume::unbounded::<EmbedJob>();

        let scheduler = BatchScheduler {
            rx,
            registry,
            client,
            limiters,
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            window: Duration::from_millis(config.batch_window_ms),
        };
        tokio::spawn(scheduler.run());

        Self {
            tx,
            model: config.model,
            dimension: config.dimension,
            cache: Arc::new(TtlLruCache::new(cache_ttl, cache_max_entries)),
        }
    }

    /// Embed a single text. Transparent cache keyed by (text, model).
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let key = cache_key(&[text, &self.model]);

        if let Some(vector) = self.cache.get(&key) {
            debug!("embedding cache hit");
            return Ok(vector);
        }

        let (respond, done) = oneshot::channel();
        self.tx
            .send(EmbedJob {
                text: text.to_string(),
                respond,
            })
            .map_err(|_| ApiError::Internal("embedding scheduler stopped".to_string()))?;

        let vector = done
            .await
            .map_err(|_| ApiError::Internal("embedding scheduler dropped job".to_string()))??;

        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    /// Embed many texts; `result[i]` always corresponds to `texts[i]`
    /// regardless of batching or retries underneath.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ApiError> {
        let mut pending = Vec::with_capacity(texts.len());

        for text in &texts {
            let key = cache_key(&[text, &self.model]);

            if let Some(vector) = self.cache.get(&key) {
                pending.push(Pending::Ready(vector));
                continue;
            }

            let (respond, done) = oneshot::channel();
            self.tx
                .send(EmbedJob {
                    text: text.clone(),
                    respond,
                })
                .map_err(|_| ApiError::Internal("embedding scheduler stopped".to_string()))?;
            pending.push(Pending::Waiting { key, done });
        }

        let mut vectors = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry {
                Pending::Ready(vector) => vectors.push(vector),
                Pending::Waiting { key, done } => {
                    let vector = done.await.map_err(|_| {
                        ApiError::Internal("embedding scheduler dropped job".to_string())
                    })??;
                    self.cache.insert(key, vector.clone());
                    vectors.push(vector);
                }
            }
        }

        Ok(vectors)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

enum Pending {
    Ready(Vec<f32>),
    Waiting {
        key: String,
        done: oneshot::Receiver<Result<Vec<f32>, ApiError>>,
    },
}

struct BatchScheduler {
    rx: flume::Receiver<EmbedJob>,
    registry: Arc<InstanceRegistry>,
    client: Arc<dyn EmbeddingBackend>,
    limiters: Arc<Limiters>,
    model: String,
    dimension: usize,
    batch_size: usize,
    window: Duration,
}

impl BatchScheduler {
    async fn run(self) {
        let scheduler = Arc::new(self);

        loop {
            // Block until the first job opens a batch window
            let first = match scheduler.rx.recv_async().await {
                Ok(job) => job,
                Err(_) => {
                    debug!("embedding scheduler channel closed, stopping");
                    return;
                }
            };

            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + scheduler.window;

            while batch.len() < scheduler.batch_size {
                match tokio::time::timeout_at(deadline, scheduler.rx.recv_async()).await {
                    Ok(Ok(job)) => batch.push(job),
                    Ok(Err(_)) => break,
                    Err(_) => break, // window elapsed
                }
            }

            // Batches run concurrently under the embedding limiter so a
            // slow instance does not stall coalescing.
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler.process_batch(batch).await;
            });
        }
    }

    async fn process_batch(&self, batch: Vec<EmbedJob>) {
        let _permit = match Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await
        {
            Ok((permit, wait)) => {
                debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");
                permit
            }
            Err(e) => {
                Self::fail_all(batch, e);
                return;
            }
        };

        let texts: Vec<String> = batch.iter().map(|j| j.text.clone()).collect();

        match self.embed_with_retry(&texts).await {
            Ok(vectors) => {
                for (job, vector) in batch.into_iter().zip(vectors) {
                    let _ = job.respond.send(Ok(vector));
                }
            }
            Err(e) => Self::fail_all(batch, e),
        }
    }

    fn fail_all(batch: Vec<EmbedJob>, error: ApiError) {
        for job in batch {
            let _ = job.respond.send(Err(error.clone()));
        }
    }

    /// Fan one batch out against a single instance, retrying the whole
    /// batch on a different instance with exponential backoff.
    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error = ApiError::EmbeddingUnavailable("no attempt made".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            let instance = match self.pick_preferring_untried(&tried).await {
                Ok(inst) => inst,
                Err(e) => return Err(e),
            };

            match self.embed_on_instance(&instance, texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    warn!(
                        instance = %instance.name,
                        attempt,
                        error = %e,
                        "embedding batch attempt failed"
                    );
                    tried.insert(instance.name.clone());
                    last_error = e;
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        Err(match last_error {
            e @ ApiError::DimensionMismatch(_) => e,
            e => ApiError::EmbeddingUnavailable(format!(
                "retries exhausted across healthy instances: {}",
                e
            )),
        })
    }

    async fn pick_preferring_untried(
        &self,
        tried: &HashSet<String>,
    ) -> Result<Arc<ModelInstance>, ApiError> {
        // Round-robin walks the healthy set, so a bounded number of
        // re-picks reaches an untried instance when one exists.
        let mut fallback = None;
        for _ in 0..self.registry.len().max(1) {
            let instance = self
                .registry
                .pick(&self.model, SelectionStrategy::RoundRobin, None)
                .await?;
            if !tried.contains(&instance.name) {
                return Ok(instance);
            }
            fallback = Some(instance);
        }
        fallback.ok_or_else(|| {
            ApiError::NoAvailableInstance(format!("no instance hosts model {}", self.model))
        })
    }

    async fn embed_on_instance(
        &self,
        instance: &Arc<ModelInstance>,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ApiError> {
        let _in_flight = instance.begin_call();
        let start = Instant::now();

        let calls = texts
            .iter()
            .map(|text| self.client.embed(&instance.url, &self.model, text));
        let results = futures::future::join_all(calls).await;

        let latency_ms = start.elapsed().as_millis() as f64 / texts.len().max(1) as f64;

        let mut vectors = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(vector) => {
                    if vector.len() != self.dimension {
                        // Wrong dimension is an internal-consistency
                        // failure; the instance is demoted immediately.
                        instance.demote("embedding dimension mismatch");
                        return Err(ApiError::DimensionMismatch(format!(
                            "expected {}, got {} from {}",
                            self.dimension,
                            vector.len(),
                            instance.name
                        )));
                    }
                    vectors.push(vector);
                }
                Err(e) => {
                    self.registry
                        .record_outcome(instance, &self.model, latency_ms, false);
                    return Err(e);
                }
            }
        }

        self.registry
            .record_outcome(instance, &self.model, latency_ms, true);
        Ok(vectors)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt);
    let capped = base.min(BACKOFF_CAP_MS);
    // ±20% jitter
    let jitter = rand::rng().random_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HealthState;
    use crate::services::model_client::MockEmbeddingBackend;

    const MODEL: &str = "nomic-embed-text:v1.5";

    #[test]
    fn test_backoff_grows_and_caps() {
        for _ in 0..20 {
            let first = backoff_delay(0).as_millis() as u64;
            let second = backoff_delay(1).as_millis() as u64;
            let late = backoff_delay(5).as_millis() as u64;

            assert!((160..=240).contains(&first), "first={}", first);
            assert!((320..=480).contains(&second), "second={}", second);
            assert!(late <= 2_400, "late={}", late);
        }
    }

    fn service_with(
        backend: MockEmbeddingBackend,
        names: &[&str],
        dimension: usize,
    ) -> (Arc<InstanceRegistry>, EmbeddingService) {
        let registry = Arc::new(InstanceRegistry::new(3, 50));
        for name in names {
            let instance = crate::registry::ModelInstance::new(
                name.to_string(),
                format!("http://{}:11434", name),
                vec![MODEL.to_string()],
            );
            instance.record_outcome(None, None, true, 3);
            registry.register(instance);
        }

        let config = EmbeddingConfig {
            model: MODEL.to_string(),
            dimension,
            batch_size: 4,
            batch_window_ms: 5,
        };

        let service = EmbeddingService::new(
            registry.clone(),
            Arc::new(backend),
            Arc::new(Limiters::new(4, 4, 4)),
            config,
            Duration::from_secs(60),
            1_000,
        );
        (registry, service)
    }

    /// Encode the text index into the vector so order survives batching.
    fn index_vector(prompt: &str, dimension: usize) -> Vec<f32> {
        let n: f32 = prompt.trim_start_matches('t').parse().unwrap_or(-1.0);
        vec![n; dimension]
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order() {
        let mut backend = MockEmbeddingBackend::new();
        backend
            .expect_embed()
            .returning(|_url, _model, prompt| Ok(index_vector(prompt, 8)));

        let (_registry, service) = service_with(backend, &["a"], 8);

        let texts: Vec<String> = (0..20).map(|i| format!("t{}", i)).collect();
        let vectors = service.embed_batch(texts).await.unwrap();

        assert_eq!(vectors.len(), 20);
        for (i, vector) in vectors.iter().enumerate() {
            assert_eq!(vector.len(), 8);
            assert_eq!(vector[0], i as f32, "vector {} out of order", i);
        }
    }

    #[tokio::test]
    async fn test_retry_moves_to_another_instance() {
        let mut backend = MockEmbeddingBackend::new();
        backend.expect_embed().returning(|url, _model, prompt| {
            if url.contains("bad") {
                Err(ApiError::EmbeddingUnavailable("connection refused".to_string()))
            } else {
                Ok(index_vector(prompt, 8))
            }
        });

        let (registry, service) = service_with(backend, &["bad", "good"], 8);

        let vector = service.embed("t7").await.unwrap();
        assert_eq!(vector[0], 7.0);

        // The failing instance took the failure outcome
        let bad = registry
            .all()
            .into_iter()
            .find(|i| i.name == "bad")
            .unwrap();
        assert!(bad.snapshot().consecutive_failures >= 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_demotes_instance() {
        let mut backend = MockEmbeddingBackend::new();
        backend.expect_embed().returning(|url, _model, prompt| {
            if url.contains("bad") {
                // Wrong dimension (512 instead of 8)
                Ok(vec![0.0; 512])
            } else {
                Ok(index_vector(prompt, 8))
            }
        });

        let (registry, service) = service_with(backend, &["bad", "good"], 8);

        // Succeeds on the second instance
        let vector = service.embed("t3").await.unwrap();
        assert_eq!(vector.len(), 8);
        assert_eq!(vector[0], 3.0);

        // The faulty instance is demoted immediately
        let bad = registry
            .all()
            .into_iter()
            .find(|i| i.name == "bad")
            .unwrap();
        assert_eq!(bad.state(), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_embedding_cache_skips_backend() {
        let mut backend = MockEmbeddingBackend::new();
        // Exactly one wire call for two identical embeds
        backend
            .expect_embed()
            .times(1)
            .returning(|_url, _model, prompt| Ok(index_vector(prompt, 8)));

        let (_registry, service) = service_with(backend, &["a"], 8);

        let first = service.embed("t5").await.unwrap();
        let second = service.embed("t5").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_unavailable() {
        let mut backend = MockEmbeddingBackend::new();
        backend
            .expect_embed()
            .returning(|_url, _model, _prompt| {
                Err(ApiError::EmbeddingUnavailable("down".to_string()))
            });

        let (_registry, service) = service_with(backend, &["a"], 8);

        let err = service.embed("t1").await.unwrap_err();
        assert!(matches!(err, ApiError::EmbeddingUnavailable(_)));
    }
}
