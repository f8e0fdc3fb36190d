use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::InstanceSnapshot;
use crate::state::AppState;
use crate::utils::metrics::MetricsSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    components: ComponentsStatus,
    config: Value,
    metrics: MetricsSnapshot,
}

#[derive(Serialize)]
pub struct ComponentsStatus {
    instances: Vec<InstanceSnapshot>,
    vector_store: String,
    reranker: String,
    web_search: String,
    answer_cache_entries: usize,
    embedding_cache_entries: usize,
    log_queue_depth: usize,
    active_conversations: usize,
}

/// GET /health - 200 always; the body reflects component state.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let vector_store_ok = tokio::time::timeout(Duration::from_secs(1), state.repository.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let reranker = if state.reranker.is_enabled() {
        "ok"
    } else {
        "disabled"
    };
    let web_search = if state.web_search.is_enabled() {
        "ok"
    } else {
        "disabled"
    };

    let status = if vector_store_ok && state.registry.has_healthy() {
        "ok"
    } else {
        "degraded"
    };

    let conversation_stats = state.conversation_manager.stats();

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            components: ComponentsStatus {
                instances: state.registry.snapshot(),
                vector_store: if vector_store_ok { "ok" } else { "err" }.to_string(),
                reranker: reranker.to_string(),
                web_search: web_search.to_string(),
                answer_cache_entries: state.rag_service.answer_cache_len(),
                embedding_cache_entries: state.embedding_service.cache_len(),
                log_queue_depth: state.request_logger.queue_len(),
                active_conversations: conversation_stats.active_conversations,
            },
            config: state.settings.effective(),
            metrics: state.metrics.snapshot(),
        }),
    )
}

/// GET /health/ready - 200 once the vector store answers.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    match tokio::time::timeout(Duration::from_secs(1), state.repository.ping()).await {
        Ok(Ok(())) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}
