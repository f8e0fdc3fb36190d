use crate::database::{ChunkHit, Repository};
use crate::models::{Candidate, CandidateFilters, ContentType, RetrievalMode};
use crate::services::embedding_service::EmbeddingService;
use crate::services::lexical_index::{LexicalChunk, LexicalIndex};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use pgvector::Vector;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Candidate Retriever: vector, lexical or hybrid top-K against the
/// store, with min-max normalization and weighted fusion.
pub struct Retriever {
    repository: Arc<Repository>,
    embedding_service: Arc<EmbeddingService>,
    lexical_index: Arc<LexicalIndex>,
    limiters: Arc<Limiters>,
    candidate_pool: usize,
    category_filters_enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalTimings {
    pub embed_ms: u64,
    pub retrieve_ms: u64,
}

pub struct RetrievalResult {
    pub candidates: Vec<Candidate>,
    pub timings: RetrievalTimings,
}

impl Retriever {
    pub fn new(
        repository: Arc<Repository>,
        embedding_service: Arc<EmbeddingService>,
        lexical_index: Arc<LexicalIndex>,
        limiters: Arc<Limiters>,
        candidate_pool: usize,
        category_filters_enabled: bool,
    ) -> Self {
        Self {
            repository,
            embedding_service,
            lexical_index,
            limiters,
            candidate_pool: candidate_pool.max(1),
            category_filters_enabled,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        mode: RetrievalMode,
        top_k: usize,
        alpha: f32,
        filters: Option<&CandidateFilters>,
    ) -> Result<RetrievalResult, ApiError> {
        let mut timings = RetrievalTimings::default();

        let mut candidates = match mode {
            RetrievalMode::VectorOnly => {
                let (candidates, vector_timings) = self.vector_candidates(query).await?;
                timings = vector_timings;
                candidates
            }
            RetrievalMode::LexicalOnly => {
                let start = Instant::now();
                let candidates = self.lexical_candidates(query).await?;
                timings.retrieve_ms = start.elapsed().as_millis() as u64;
                normalize_lexical(candidates)
            }
            RetrievalMode::Hybrid => {
                let start = Instant::now();
                let (vector, lexical) =
                    tokio::join!(self.vector_candidates(query), self.lexical_candidates(query));

                // A dead lexical index must not sink the whole request;
                // hybrid degrades to vector order.
                let lexical = match lexical {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("lexical side of hybrid failed: {}", e);
                        Vec::new()
                    }
                };

                let (vector, vector_timings) = vector?;
                timings.embed_ms = vector_timings.embed_ms;
                timings.retrieve_ms = start.elapsed().as_millis() as u64;
                fuse_candidates(vector, lexical, alpha)
            }
        };

        if let Some(filters) = filters {
            let mut effective = filters.clone();
            if !self.category_filters_enabled {
                effective.category = None;
            }
            candidates.retain(|c| c.matches(&effective));
        }

        candidates.truncate(top_k);

        if candidates.is_empty() {
            let total = self
                .repository
                .count_chunks()
                .await
                .map_err(|e| ApiError::VectorStoreUnavailable(e.to_string()))?;
            if total == 0 {
                return Err(ApiError::EmptyCorpus);
            }
        }

        debug!(
            mode = mode.as_str(),
            returned = candidates.len(),
            "retrieval complete"
        );

        Ok(RetrievalResult {
            candidates,
            timings,
        })
    }

    /// Vector-only candidates sorted by cosine score, pool-sized.
    async fn vector_candidates(
        &self,
        query: &str,
    ) -> Result<(Vec<Candidate>, RetrievalTimings), ApiError> {
        let mut timings = RetrievalTimings::default();

        let embed_start = Instant::now();
        let embedding = tokio::time::timeout(
            Duration::from_secs(10),
            self.embedding_service.embed(query),
        )
        .await
        .map_err(|_| ApiError::EmbeddingUnavailable("embedding timed out".to_string()))??;
        timings.embed_ms = embed_start.elapsed().as_millis() as u64;

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.db_search.clone(),
            self.limiters.acquire_timeout,
            "db_search",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "db_search", "wait_queue");

        let retrieve_start = Instant::now();
        let hits = tokio::time::timeout(
            Duration::from_secs(15),
            self.repository
                .vector_search(Vector::from(embedding), self.candidate_pool as i64),
        )
        .await
        .map_err(|_| ApiError::VectorStoreUnavailable("vector search timed out".to_string()))?
        .map_err(|e| ApiError::VectorStoreUnavailable(e.to_string()))?;
        timings.retrieve_ms = retrieve_start.elapsed().as_millis() as u64;

        let mut candidates: Vec<Candidate> = hits.into_iter().map(candidate_from_hit).collect();
        candidates.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok((candidates, timings))
    }

    /// Raw-scored lexical candidates, pool-sized. Scores are raw BM25
    /// until normalization.
    async fn lexical_candidates(&self, query: &str) -> Result<Vec<Candidate>, ApiError> {
        let snapshot = self.lexical_index.ensure_built().await?;

        let query = query.to_string();
        let pool = self.candidate_pool;
        let scored = tokio::task::spawn_blocking(move || snapshot.search(&query, pool))
            .await
            .map_err(|e| ApiError::Internal(format!("bm25 task failed: {}", e)))?;

        Ok(scored
            .into_iter()
            .map(|(chunk, score)| candidate_from_lexical(chunk, score))
            .collect())
    }
}

fn candidate_from_hit(hit: ChunkHit) -> Candidate {
    let score = hit.score.clamp(0.0, 1.0);
    Candidate {
        chunk_id: hit.chunk_id,
        document_id: hit.document_id,
        source: hit.source_file,
        content: hit.content,
        section: hit.section,
        page: hit.page,
        category: hit.category,
        privacy_level: hit.privacy_level,
        content_type: ContentType::parse(&hit.content_type).unwrap_or(ContentType::Text),
        vector_score: Some(score),
        bm25_score: None,
        rerank_score: None,
        final_score: score,
    }
}

fn candidate_from_lexical(chunk: LexicalChunk, bm25: f32) -> Candidate {
    Candidate {
        chunk_id: chunk.chunk_id,
        document_id: chunk.document_id,
        source: chunk.source,
        content: chunk.content,
        section: chunk.section,
        page: chunk.page,
        category: chunk.category,
        privacy_level: chunk.privacy_level,
        content_type: ContentType::parse(&chunk.content_type).unwrap_or(ContentType::Text),
        vector_score: None,
        bm25_score: Some(bm25),
        rerank_score: None,
        final_score: bm25,
    }
}

/// Min-max normalize BM25 scores over the returned candidates.
/// Degenerate spans (single candidate, all equal) normalize to 1.0.
fn normalize_lexical(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    let scores: Vec<f32> = candidates.iter().map(|c| c.final_score).collect();
    let normalized = min_max_normalize(&scores);

    for (candidate, norm) in candidates.iter_mut().zip(normalized) {
        candidate.final_score = norm;
        candidate.bm25_score = Some(norm);
    }

    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Hybrid fusion: normalize both score lists over their returned
/// candidates, union the sets (a chunk missing from one list scores 0
/// there) and weight `final = alpha * vec + (1 - alpha) * bm25`.
pub fn fuse_candidates(
    vector: Vec<Candidate>,
    lexical: Vec<Candidate>,
    alpha: f32,
) -> Vec<Candidate> {
    let alpha = alpha.clamp(0.0, 1.0);

    let vec_norm = min_max_normalize(&vector.iter().map(|c| c.final_score).collect::<Vec<_>>());
    let lex_norm = min_max_normalize(&lexical.iter().map(|c| c.final_score).collect::<Vec<_>>());

    let mut merged: HashMap<i64, Candidate> = HashMap::new();
    // Insertion order drives stable tie-breaks: vector order first
    let mut order: Vec<i64> = Vec::new();

    for (mut candidate, norm) in vector.into_iter().zip(vec_norm) {
        candidate.vector_score = Some(norm);
        candidate.bm25_score = None;
        candidate.final_score = alpha * norm;
        order.push(candidate.chunk_id);
        merged.insert(candidate.chunk_id, candidate);
    }

    for (mut candidate, norm) in lexical.into_iter().zip(lex_norm) {
        match merged.get_mut(&candidate.chunk_id) {
            Some(existing) => {
                existing.bm25_score = Some(norm);
                existing.final_score =
                    alpha * existing.vector_score.unwrap_or(0.0) + (1.0 - alpha) * norm;
            }
            None => {
                candidate.bm25_score = Some(norm);
                candidate.vector_score = None;
                candidate.final_score = (1.0 - alpha) * norm;
                order.push(candidate.chunk_id);
                merged.insert(candidate.chunk_id, candidate);
            }
        }
    }

    let mut fused: Vec<Candidate> = order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .collect();

    fused.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(chunk_id: i64, score: f32) -> Candidate {
        Candidate {
            chunk_id,
            document_id: 1,
            source: "manual.pdf".to_string(),
            content: format!("chunk {}", chunk_id),
            section: None,
            page: None,
            category: None,
            privacy_level: None,
            content_type: ContentType::Text,
            vector_score: None,
            bm25_score: None,
            rerank_score: None,
            final_score: score,
        }
    }

    #[test]
    fn test_min_max_normalize_bounds() {
        let normalized = min_max_normalize(&[0.2, 0.9, 0.5]);
        assert!((normalized[1] - 1.0).abs() < 1e-6);
        assert!(normalized[0].abs() < 1e-6);
        assert!(normalized.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn test_min_max_degenerate() {
        assert_eq!(min_max_normalize(&[0.4, 0.4]), vec![1.0, 1.0]);
        assert_eq!(min_max_normalize(&[]), Vec::<f32>::new());
    }

    #[test]
    fn test_fusion_scores_stay_in_unit_interval() {
        for alpha in [0.0, 0.3, 0.7, 1.0] {
            let fused = fuse_candidates(
                vec![candidate(1, 0.9), candidate(2, 0.4)],
                vec![candidate(2, 8.0), candidate(3, 2.0)],
                alpha,
            );
            assert!(fused
                .iter()
                .all(|c| (0.0..=1.0).contains(&c.final_score)));
        }
    }

    #[test]
    fn test_fusion_alpha_one_equals_vector_ranking() {
        let fused = fuse_candidates(
            vec![candidate(1, 0.9), candidate(2, 0.5), candidate(3, 0.1)],
            vec![candidate(3, 9.0), candidate(2, 5.0)],
            1.0,
        );
        let order: Vec<i64> = fused.iter().map(|c| c.chunk_id).collect();
        assert_eq!(&order[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_fusion_alpha_zero_equals_bm25_ranking() {
        let fused = fuse_candidates(
            vec![candidate(1, 0.9), candidate(2, 0.5)],
            vec![candidate(3, 9.0), candidate(2, 5.0), candidate(4, 1.0)],
            0.0,
        );
        let order: Vec<i64> = fused.iter().map(|c| c.chunk_id).collect();
        // BM25 order leads; the vector-only candidate carries no weight
        assert_eq!(&order[..2], &[3, 2]);
        assert_eq!(fused.len(), 4);
        assert_eq!(fused.iter().find(|c| c.chunk_id == 1).unwrap().final_score, 0.0);
    }

    #[test]
    fn test_fusion_union_and_missing_scores() {
        let fused = fuse_candidates(
            vec![candidate(1, 0.9)],
            vec![candidate(2, 4.0)],
            0.7,
        );
        assert_eq!(fused.len(), 2);

        let only_vector = fused.iter().find(|c| c.chunk_id == 1).unwrap();
        assert!(only_vector.bm25_score.is_none());
        assert!((only_vector.final_score - 0.7).abs() < 1e-6);

        let only_lexical = fused.iter().find(|c| c.chunk_id == 2).unwrap();
        assert!(only_lexical.vector_score.is_none());
        assert!((only_lexical.final_score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_fusion_distinct_by_chunk_id() {
        let fused = fuse_candidates(
            vec![candidate(1, 0.9), candidate(2, 0.5)],
            vec![candidate(1, 4.0), candidate(2, 2.0)],
            0.5,
        );
        assert_eq!(fused.len(), 2);
    }
}
