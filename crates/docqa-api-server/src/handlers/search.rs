use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::logging::{Endpoint, RequestLog};
use crate::models::{Candidate, CandidateFilters, RetrievalMode};
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default)]
    pub filters: Option<CandidateFilters>,
    #[serde(default = "default_true")]
    pub rerank: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub timings: SearchTimings,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub score: f32,
    pub content: String,
    pub metadata: SearchResultMetadata,
}

#[derive(Debug, Serialize)]
pub struct SearchResultMetadata {
    pub document_id: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i32>,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bm25_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct SearchTimings {
    pub embed_ms: u64,
    pub retrieve_ms: u64,
    pub rerank_ms: u64,
    pub total_ms: u64,
}

/// POST /search - retrieval without synthesis.
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let total_start = Instant::now();

    if request.query.trim().is_empty() {
        return Err(ApiError::Validation("query cannot be empty".to_string()));
    }
    if request.top_k == 0 {
        return Err(ApiError::Validation("top_k must be positive".to_string()));
    }
    if !(0.0..=1.0).contains(&request.alpha) {
        return Err(ApiError::Validation("alpha must be in [0,1]".to_string()));
    }

    state.metrics.incr_requests();
    state.metrics.incr_search();

    info!(request_id = %request_id, mode = request.mode.as_str(), "search request");

    let rerank_active = request.rerank && state.reranker.is_enabled();
    let retrieve_k = if rerank_active {
        state.settings.retrieval.candidate_pool.max(request.top_k)
    } else {
        request.top_k
    };

    let outcome = state
        .rag_service
        .retriever()
        .retrieve(
            &request.query,
            request.mode,
            retrieve_k,
            request.alpha,
            request.filters.as_ref(),
        )
        .await;

    let retrieval = match outcome {
        Ok(result) => result,
        Err(e) => {
            state.metrics.incr_errors();
            state.request_logger.log(
                RequestLog::builder(&request_id, Endpoint::Search)
                    .query_chars(request.query.chars().count())
                    .error(e.code())
                    .total_ms(total_start.elapsed().as_millis() as u64)
                    .build(),
            );
            return Err(e);
        }
    };

    let (candidates, rerank_ms) = if rerank_active {
        let outcome = state
            .reranker
            .rerank(&request.query, retrieval.candidates, request.top_k)
            .await;
        (outcome.candidates, outcome.elapsed_ms)
    } else {
        let mut candidates = retrieval.candidates;
        candidates.truncate(request.top_k);
        (candidates, 0)
    };

    let results: Vec<SearchResult> = candidates.into_iter().map(to_search_result).collect();

    let timings = SearchTimings {
        embed_ms: retrieval.timings.embed_ms,
        retrieve_ms: retrieval.timings.retrieve_ms,
        rerank_ms,
        total_ms: total_start.elapsed().as_millis() as u64,
    };

    state.request_logger.log(
        RequestLog::builder(&request_id, Endpoint::Search)
            .query_chars(request.query.chars().count())
            .timings(
                0,
                timings.embed_ms,
                timings.retrieve_ms,
                timings.rerank_ms,
                0,
                timings.total_ms,
            )
            .build(),
    );

    Ok(Json(SearchResponse { results, timings }))
}

fn to_search_result(candidate: Candidate) -> SearchResult {
    SearchResult {
        chunk_id: candidate.chunk_id,
        score: candidate.final_score,
        content: candidate.content,
        metadata: SearchResultMetadata {
            document_id: candidate.document_id,
            source: candidate.source,
            section: candidate.section,
            page: candidate.page,
            content_type: candidate.content_type.as_str().to_string(),
            vector_score: candidate.vector_score,
            bm25_score: candidate.bm25_score,
            rerank_score: candidate.rerank_score,
        },
    }
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> usize {
    10
}

fn default_alpha() -> f32 {
    0.7
}
