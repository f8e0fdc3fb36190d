use super::{ChunkHit, ChunkRow, ConversationTurnRow, DbPool, NewChunk};
use anyhow::Result;
use pgvector::Vector;
use tracing::debug;

/// Vector-store access. The chunk table name comes from configuration;
/// it is interpolated (identifiers cannot be bound) and validated at
/// construction to letter/digit/underscore characters.
pub struct Repository {
    pool: DbPool,
    chunk_table: String,
}

impl Repository {
    pub fn new(pool: DbPool, chunk_table: String) -> Result<Self> {
        if chunk_table.is_empty()
            || !chunk_table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("invalid chunk table name: {}", chunk_table);
        }
        Ok(Self { pool, chunk_table })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Liveness check for /health.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.get_pool()).await?;
        Ok(())
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(sqlx::AssertSqlSafe(format!(
            "SELECT COUNT(*) FROM {}",
            self.chunk_table
        )))
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(count)
    }

    /// Cosine top-N against the pgvector index. Score is 1 - distance,
    /// clamped to [0,1] for normalized embeddings.
    pub async fn vector_search(&self, query_embedding: Vector, limit: i64) -> Result<Vec<ChunkHit>> {
        let sql = format!(
            r#"SELECT
                c.chunk_id,
                c.document_id,
                d.source_file,
                c.content,
                c.section,
                c.page,
                c.content_type,
                d.category,
                c.privacy_level,
                GREATEST(0.0, LEAST(1.0, 1.0 - (c.embedding <=> $1)))::float4 AS score
               FROM {} c
               JOIN documents d ON d.document_id = c.document_id
               ORDER BY c.embedding <=> $1
               LIMIT $2"#,
            self.chunk_table
        );

        let hits = sqlx::query_as::<_, ChunkHit>(sqlx::AssertSqlSafe(sql))
            .bind(query_embedding)
            .bind(limit)
            .fetch_all(self.pool.get_pool())
            .await?;

        debug!("Vector search returned {} chunks", hits.len());

        Ok(hits)
    }

    /// Full chunk scan feeding the lexical index build.
    pub async fn fetch_all_chunks(&self) -> Result<Vec<ChunkRow>> {
        let sql = format!(
            r#"SELECT
                c.chunk_id,
                c.document_id,
                d.source_file,
                c.content,
                c.section,
                c.page,
                c.content_type,
                d.category,
                c.privacy_level
               FROM {} c
               JOIN documents d ON d.document_id = c.document_id
               ORDER BY c.document_id, c.ordinal"#,
            self.chunk_table
        );

        let rows = sqlx::query_as::<_, ChunkRow>(sqlx::AssertSqlSafe(sql))
            .fetch_all(self.pool.get_pool())
            .await?;

        Ok(rows)
    }

    /// Register a document, returning its id. Category tags are optional.
    pub async fn insert_document(
        &self,
        source_file: &str,
        category: Option<&str>,
        doc_type: Option<&str>,
        version: Option<&str>,
    ) -> Result<i64> {
        let document_id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO documents (source_file, category, doc_type, version, created_at)
               VALUES ($1, $2, $3, $4, NOW())
               RETURNING document_id"#,
        )
        .bind(source_file)
        .bind(category)
        .bind(doc_type)
        .bind(version)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(document_id)
    }

    /// Insert chunks with their embeddings, all-or-nothing per document.
    /// Every chunk must carry an embedding before it is queryable.
    pub async fn insert_chunks(
        &self,
        document_id: i64,
        chunks: Vec<(NewChunk, Vector)>,
    ) -> Result<usize> {
        let mut transaction = self.pool.get_pool().begin().await?;
        let inserted = chunks.len();

        let sql = format!(
            r#"INSERT INTO {}
               (document_id, ordinal, content, section, page, content_type, privacy_level, embedding, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())"#,
            self.chunk_table
        );

        for (chunk, embedding) in chunks {
            sqlx::query(sqlx::AssertSqlSafe(sql.as_str()))
                .bind(document_id)
                .bind(chunk.ordinal)
                .bind(&chunk.content)
                .bind(&chunk.section)
                .bind(chunk.page)
                .bind(&chunk.content_type)
                .bind(&chunk.privacy_level)
                .bind(embedding)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;
        debug!("Inserted {} chunks for document {}", inserted, document_id);

        Ok(inserted)
    }

    /// Delete a document and its chunks transactively.
    pub async fn delete_document(&self, document_id: i64) -> Result<u64> {
        let mut transaction = self.pool.get_pool().begin().await?;

        let sql = format!("DELETE FROM {} WHERE document_id = $1", self.chunk_table);
        let chunks = sqlx::query(sqlx::AssertSqlSafe(sql))
            .bind(document_id)
            .execute(&mut *transaction)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM documents WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;

        Ok(chunks)
    }

    pub async fn append_turn(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO conversation_turns (conversation_id, role, content, created_at)
               VALUES ($1, $2, $3, NOW())"#,
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    pub async fn recent_turns(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationTurnRow>> {
        let mut turns = sqlx::query_as::<_, ConversationTurnRow>(
            r#"SELECT conversation_id, role, content, created_at
               FROM conversation_turns
               WHERE conversation_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        // Oldest first for prompt assembly
        turns.reverse();
        Ok(turns)
    }
}
