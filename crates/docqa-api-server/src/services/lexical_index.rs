use crate::database::{ChunkRow, Repository};
use crate::utils::error::ApiError;
use crate::utils::text::tokenize;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

/// Chunk copy held by the in-memory index so lexical hits need no
/// store round-trip.
#[derive(Debug, Clone)]
pub struct LexicalChunk {
    pub chunk_id: i64,
    pub document_id: i64,
    pub source: String,
    pub content: String,
    pub section: Option<String>,
    pub page: Option<i32>,
    pub content_type: String,
    pub category: Option<String>,
    pub privacy_level: Option<String>,
}

impl From<ChunkRow> for LexicalChunk {
    fn from(row: ChunkRow) -> Self {
        Self {
            chunk_id: row.chunk_id,
            document_id: row.document_id,
            source: row.source_file,
            content: row.content,
            section: row.section,
            page: row.page,
            content_type: row.content_type,
            category: row.category,
            privacy_level: row.privacy_level,
        }
    }
}

struct IndexedChunk {
    chunk: LexicalChunk,
    term_counts: HashMap<String, u32>,
    length: u32,
}

/// Immutable BM25 snapshot. Readers always see a consistent index;
/// rebuilds construct a new snapshot and swap the pointer.
pub struct IndexSnapshot {
    chunks: Vec<IndexedChunk>,
    doc_freq: HashMap<String, u32>,
    avg_length: f64,
}

impl IndexSnapshot {
    pub fn build(rows: Vec<LexicalChunk>) -> Self {
        let mut chunks = Vec::with_capacity(rows.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut total_length: u64 = 0;

        for chunk in rows {
            let tokens = tokenize(&chunk.content);
            let length = tokens.len() as u32;
            total_length += length as u64;

            let mut term_counts: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *term_counts.entry(token).or_insert(0) += 1;
            }

            for term in term_counts.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }

            chunks.push(IndexedChunk {
                chunk,
                term_counts,
                length,
            });
        }

        let avg_length = if chunks.is_empty() {
            0.0
        } else {
            total_length as f64 / chunks.len() as f64
        };

        Self {
            chunks,
            doc_freq,
            avg_length,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn term_count(&self) -> usize {
        self.doc_freq.len()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.chunks.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        // Lucene-style lower-bounded IDF
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Top `limit` chunks by BM25 (k1=1.5, b=0.75). Only chunks with a
    /// positive score are returned.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(LexicalChunk, f32)> {
        if self.chunks.is_empty() || limit == 0 {
            return Vec::new();
        }

        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = Vec::new();

        for (idx, indexed) in self.chunks.iter().enumerate() {
            let mut score = 0.0;

            for term in &query_terms {
                let tf = indexed.term_counts.get(term).copied().unwrap_or(0) as f64;
                if tf == 0.0 {
                    continue;
                }

                let norm = 1.0 - BM25_B + BM25_B * indexed.length as f64 / self.avg_length.max(1.0);
                score += self.idf(term) * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
            }

            if score > 0.0 {
                scored.push((idx, score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        scored
            .into_iter()
            .map(|(idx, score)| (self.chunks[idx].chunk.clone(), score as f32))
            .collect()
    }
}

/// Lexical index service. Built lazily from the vector store on first
/// use (so it survives process restarts) and rebuilt in the background
/// on a refresh signal from the ingestion process.
pub struct LexicalIndex {
    repository: Arc<Repository>,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
    rebuild_lock: tokio::sync::Mutex<()>,
}

impl LexicalIndex {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self {
            repository,
            snapshot: RwLock::new(None),
            rebuild_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot.read().clone()
    }

    /// Return the current snapshot, building it first if none exists.
    pub async fn ensure_built(&self) -> Result<Arc<IndexSnapshot>, ApiError> {
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        let _guard = self.rebuild_lock.lock().await;

        // Another task may have finished the build while we waited
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        self.rebuild_inner().await
    }

    /// Full rebuild then pointer swap. Readers keep the old snapshot
    /// until the new one is complete.
    pub async fn rebuild(&self) -> Result<Arc<IndexSnapshot>, ApiError> {
        let _guard = self.rebuild_lock.lock().await;
        self.rebuild_inner().await
    }

    async fn rebuild_inner(&self) -> Result<Arc<IndexSnapshot>, ApiError> {
        debug!("building lexical index from chunk store");

        let rows = self
            .repository
            .fetch_all_chunks()
            .await
            .map_err(|e| ApiError::VectorStoreUnavailable(e.to_string()))?;

        let chunks: Vec<LexicalChunk> = rows.into_iter().map(LexicalChunk::from).collect();

        let snapshot = tokio::task::spawn_blocking(move || IndexSnapshot::build(chunks))
            .await
            .map_err(|e| ApiError::Internal(format!("index build task failed: {}", e)))?;

        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = Some(snapshot.clone());

        info!(
            chunks = snapshot.len(),
            terms = snapshot.term_count(),
            "lexical index ready"
        );

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: i64, content: &str) -> LexicalChunk {
        LexicalChunk {
            chunk_id: id,
            document_id: 1,
            source: "manual.pdf".to_string(),
            content: content.to_string(),
            section: None,
            page: None,
            content_type: "text".to_string(),
            category: None,
            privacy_level: None,
        }
    }

    #[test]
    fn test_exact_term_ranks_first() {
        let snapshot = IndexSnapshot::build(vec![
            chunk(1, "RNI 4.16 requires SSL certificates for secure LDAP integration"),
            chunk(2, "The meter firmware update procedure takes ten minutes"),
            chunk(3, "Network topology diagrams are stored in the share"),
        ]);

        let results = snapshot.search("What does RNI need for LDAP?", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].0.chunk_id, 1);
    }

    #[test]
    fn test_no_match_returns_empty() {
        let snapshot = IndexSnapshot::build(vec![chunk(1, "alpha beta gamma")]);
        let results = snapshot.search("zeppelin", 10);
        assert!(results.is_empty());
    }

    #[test]
    fn test_limit_respected() {
        let snapshot = IndexSnapshot::build(
            (0..20).map(|i| chunk(i, "shared token payload")).collect(),
        );
        let results = snapshot.search("payload", 5);
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn test_empty_index() {
        let snapshot = IndexSnapshot::build(Vec::new());
        assert!(snapshot.is_empty());
        assert!(snapshot.search("anything", 10).is_empty());
    }

    #[test]
    fn test_stop_words_do_not_match() {
        let snapshot = IndexSnapshot::build(vec![chunk(1, "the and of with")]);
        let results = snapshot.search("the", 10);
        assert!(results.is_empty());
    }

    #[test]
    fn test_unique_trigram_retrieval() {
        // A unique token must surface its chunk at rank 1
        let mut chunks: Vec<LexicalChunk> = (0..50)
            .map(|i| chunk(i, "generic maintenance text about meters"))
            .collect();
        chunks.push(chunk(99, "the xqz917 sensor needs recalibration"));

        let snapshot = IndexSnapshot::build(chunks);
        let results = snapshot.search("where is xqz917 documented", 10);
        assert_eq!(results[0].0.chunk_id, 99);
    }
}
