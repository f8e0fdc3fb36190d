use anyhow::Result;
use flume::{bounded, Receiver, Sender};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::RequestLog;
use crate::config::LoggingConfig;

/// Async request logger with a bounded queue. Handlers enqueue without
/// blocking; background workers batch-insert into Postgres.
#[derive(Clone)]
pub struct RequestLogger {
    sender: Sender<RequestLog>,
}

impl RequestLogger {
    pub fn new(pool: PgPool, config: LoggingConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing RequestLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count.max(1) {
            let pool = pool.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, pool, receiver, config).await;
            });
        }

        Self { sender }
    }

    /// Enqueue a log record (non-blocking, fire-and-forget). A full
    /// queue drops the record with a warning rather than stalling the
    /// request path.
    pub fn log(&self, record: RequestLog) {
        if let Err(e) = self.sender.try_send(record) {
            warn!("Failed to enqueue request log (queue full?): {}", e);
        }
    }

    async fn worker_loop(
        worker_id: usize,
        pool: PgPool,
        receiver: Receiver<RequestLog>,
        config: LoggingConfig,
    ) {
        info!("Request-log worker {} started", worker_id);

        let mut batch: Vec<RequestLog> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(record)) => batch.push(record),
                    Ok(Err(_)) => {
                        if !batch.is_empty() {
                            Self::flush_batch(&pool, &batch, worker_id).await;
                        }
                        info!("Request-log worker {} shutting down (channel closed)", worker_id);
                        return;
                    }
                    Err(_) => break, // timeout, flush what we have
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(&pool, &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn flush_batch(pool: &PgPool, batch: &[RequestLog], worker_id: usize) {
        let start = std::time::Instant::now();

        match Self::insert_batch(pool, batch).await {
            Ok(inserted) => {
                debug!(
                    "Worker {} inserted {} request logs in {:?}",
                    worker_id,
                    inserted,
                    start.elapsed()
                );
            }
            Err(e) => {
                error!("Worker {} failed to insert request-log batch: {}", worker_id, e);
            }
        }
    }

    async fn insert_batch(pool: &PgPool, logs: &[RequestLog]) -> Result<usize> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO request_logs (
                request_id, conversation_id, endpoint, status,
                category, route, model, instance,
                cache_hit, confidence, error_kind,
                classify_ms, embed_ms, retrieve_ms, rerank_ms, synthesize_ms, total_ms,
                query_chars, created_at
            )
            "#,
        );

        query_builder.push_values(logs, |mut b, log| {
            b.push_bind(&log.request_id)
                .push_bind(&log.conversation_id)
                .push_bind(log.endpoint.as_str())
                .push_bind(log.status.as_str())
                .push_bind(&log.category)
                .push_bind(&log.route)
                .push_bind(&log.model)
                .push_bind(&log.instance)
                .push_bind(log.cache_hit)
                .push_bind(log.confidence)
                .push_bind(&log.error_kind)
                .push_bind(log.classify_ms)
                .push_bind(log.embed_ms)
                .push_bind(log.retrieve_ms)
                .push_bind(log.rerank_ms)
                .push_bind(log.synthesize_ms)
                .push_bind(log.total_ms)
                .push_bind(log.query_chars)
                .push_bind(log.created_at);
        });

        let query = query_builder.build();
        let result = query.execute(pool).await?;

        Ok(result.rows_affected() as usize)
    }

    /// Queue statistics for /health.
    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.sender.is_full()
    }
}
