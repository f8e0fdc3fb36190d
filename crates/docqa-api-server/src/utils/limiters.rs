use crate::utils::error::ApiError;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-stage concurrency limiters.
/// The generation limiter is the global backpressure gate: capacity is
/// `concurrency_cap_per_instance * instances carrying generation models`.
#[derive(Clone)]
pub struct Limiters {
    pub generation: Arc<Semaphore>,
    pub embedding: Arc<Semaphore>,
    pub db_search: Arc<Semaphore>,
    pub generation_wait: Duration,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(generation_slots: usize, embedding_slots: usize, db_search_slots: usize) -> Self {
        Self {
            generation: Arc::new(Semaphore::new(generation_slots.max(1))),
            embedding: Arc::new(Semaphore::new(embedding_slots.max(1))),
            db_search: Arc::new(Semaphore::new(db_search_slots.max(1))),
            generation_wait: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }

    /// Acquire a permit, reporting time spent in the wait queue.
    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration), ApiError> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| ApiError::Overloaded(format!("limiter acquire timeout for op={}", op)))?
            .map_err(|_| ApiError::Internal(format!("limiter closed for op={}", op)))?;

        Ok((permit, start.elapsed()))
    }

    /// Acquire a generation slot. Waits up to 5 s, then fails with Overloaded
    /// rather than queueing indefinitely.
    pub async fn acquire_generation(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        let (permit, wait) = Self::acquire_timed(
            self.generation.clone(),
            self.generation_wait,
            "generation",
        )
        .await
        .map_err(|_| {
            ApiError::Overloaded("generation concurrency cap reached, retry later".to_string())
        })?;

        tracing::debug!(wait_ms = wait.as_millis() as u64, op = "generation", "wait_queue");
        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_releases_on_drop() {
        let limiters = Limiters::new(1, 1, 1);

        let permit = limiters.acquire_generation().await.unwrap();
        assert_eq!(limiters.generation.available_permits(), 0);
        drop(permit);
        assert_eq!(limiters.generation.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_limiter_fails_overloaded() {
        let mut limiters = Limiters::new(1, 1, 1);
        limiters.generation_wait = Duration::from_millis(20);

        let _held = limiters.acquire_generation().await.unwrap();
        let err = limiters.acquire_generation().await.unwrap_err();
        assert!(matches!(err, ApiError::Overloaded(_)));
    }
}
