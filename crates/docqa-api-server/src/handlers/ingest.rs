use axum::{
    extract::{Path, State},
    Json,
};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::database::NewChunk;
use crate::models::ContentType;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub source_file: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub chunks: Vec<IngestChunk>,
}

#[derive(Debug, Deserialize)]
pub struct IngestChunk {
    pub ordinal: i32,
    pub content: String,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub page: Option<i32>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub privacy_level: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub document_id: i64,
    pub chunks_inserted: usize,
}

/// POST /api/chunks - ingestion-worker entry point. Embeds through the
/// shared batch scheduler and inserts all-or-nothing, so every stored
/// chunk carries an embedding before it is queryable.
pub async fn ingest_chunks_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    if request.source_file.trim().is_empty() {
        return Err(ApiError::Validation("source_file cannot be empty".to_string()));
    }
    if request.chunks.is_empty() {
        return Err(ApiError::Validation("chunks cannot be empty".to_string()));
    }
    if request.chunks.iter().any(|c| c.content.trim().is_empty()) {
        return Err(ApiError::Validation("chunk content cannot be empty".to_string()));
    }

    info!(
        source = %request.source_file,
        chunks = request.chunks.len(),
        "ingest request"
    );

    let texts: Vec<String> = request.chunks.iter().map(|c| c.content.clone()).collect();
    let embeddings = state.embedding_service.embed_batch(texts).await?;

    let document_id = state
        .repository
        .insert_document(
            &request.source_file,
            request.category.as_deref(),
            request.doc_type.as_deref(),
            request.version.as_deref(),
        )
        .await
        .map_err(|e| ApiError::VectorStoreUnavailable(e.to_string()))?;

    let rows: Vec<(NewChunk, Vector)> = request
        .chunks
        .into_iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| {
            (
                NewChunk {
                    ordinal: chunk.ordinal,
                    content: chunk.content,
                    section: chunk.section,
                    page: chunk.page,
                    content_type: chunk
                        .content_type
                        .unwrap_or(ContentType::Text)
                        .as_str()
                        .to_string(),
                    category: None,
                    privacy_level: chunk.privacy_level,
                },
                Vector::from(embedding),
            )
        })
        .collect();

    let chunks_inserted = state
        .repository
        .insert_chunks(document_id, rows)
        .await
        .map_err(|e| ApiError::VectorStoreUnavailable(e.to_string()))?;

    Ok(Json(IngestResponse {
        document_id,
        chunks_inserted,
    }))
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub chunks: usize,
    pub terms: usize,
}

/// POST /api/index/refresh - the ingestion process signals that new
/// chunks landed; rebuild the lexical index and swap the snapshot.
pub async fn refresh_index_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let snapshot = state.lexical_index.rebuild().await?;

    Ok(Json(RefreshResponse {
        chunks: snapshot.len(),
        terms: snapshot.term_count(),
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteDocumentResponse {
    pub document_id: i64,
    pub chunks_deleted: u64,
}

/// DELETE /api/documents/{id} - administrative removal; chunks go with
/// the document in one transaction.
pub async fn delete_document_handler(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<i64>,
) -> Result<Json<DeleteDocumentResponse>, ApiError> {
    let chunks_deleted = state
        .repository
        .delete_document(document_id)
        .await
        .map_err(|e| ApiError::VectorStoreUnavailable(e.to_string()))?;

    info!(document_id, chunks_deleted, "document deleted");

    Ok(Json(DeleteDocumentResponse {
        document_id,
        chunks_deleted,
    }))
}
