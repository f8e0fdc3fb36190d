use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Chunk row as returned by a vector search, score already computed.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChunkHit {
    pub chunk_id: i64,
    pub document_id: i64,
    pub source_file: String,
    pub content: String,
    pub section: Option<String>,
    pub page: Option<i32>,
    pub content_type: String,
    pub category: Option<String>,
    pub privacy_level: Option<String>,
    pub score: f32,
}

/// Chunk row fetched for the lexical index build (no score).
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub chunk_id: i64,
    pub document_id: i64,
    pub source_file: String,
    pub content: String,
    pub section: Option<String>,
    pub page: Option<i32>,
    pub content_type: String,
    pub category: Option<String>,
    pub privacy_level: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversationTurnRow {
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Input chunk for the ingestion endpoint; embedding attached by C2
/// before insert.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub ordinal: i32,
    pub content: String,
    pub section: Option<String>,
    pub page: Option<i32>,
    pub content_type: String,
    pub category: Option<String>,
    pub privacy_level: Option<String>,
}
