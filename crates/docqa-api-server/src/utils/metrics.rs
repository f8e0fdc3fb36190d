use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide request counters, exposed via /health and the optional
/// metrics listener.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    requests_total: AtomicU64,
    chat_requests: AtomicU64,
    search_requests: AtomicU64,
    cache_hits: AtomicU64,
    route_doc: AtomicU64,
    route_web: AtomicU64,
    rerank_fallbacks: AtomicU64,
    tokens_streamed: AtomicU64,
    errors_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub chat_requests: u64,
    pub search_requests: u64,
    pub cache_hits: u64,
    pub route_doc: u64,
    pub route_web: u64,
    pub rerank_fallbacks: u64,
    pub tokens_streamed: u64,
    pub errors_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicU64::new(0),
                chat_requests: AtomicU64::new(0),
                search_requests: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                route_doc: AtomicU64::new(0),
                route_web: AtomicU64::new(0),
                rerank_fallbacks: AtomicU64::new(0),
                tokens_streamed: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn incr_requests(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_chat(&self) {
        self.inner.chat_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_search(&self) {
        self.inner.search_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_route_doc(&self) {
        self.inner.route_doc.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_route_web(&self) {
        self.inner.route_web.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rerank_fallback(&self) {
        self.inner.rerank_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tokens_streamed(&self, count: u64) {
        self.inner.tokens_streamed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.inner.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            chat_requests: self.inner.chat_requests.load(Ordering::Relaxed),
            search_requests: self.inner.search_requests.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            route_doc: self.inner.route_doc.load(Ordering::Relaxed),
            route_web: self.inner.route_web.load(Ordering::Relaxed),
            rerank_fallbacks: self.inner.rerank_fallbacks.load(Ordering::Relaxed),
            tokens_streamed: self.inner.tokens_streamed.load(Ordering::Relaxed),
            errors_total: self.inner.errors_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.incr_requests();
        metrics.incr_requests();
        metrics.incr_cache_hit();
        metrics.add_tokens_streamed(42);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.tokens_streamed, 42);
    }
}
