use crate::models::Candidate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of the rerank stage, feeding the confidence coverage term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankStatus {
    /// Reranker scored the candidates.
    Applied,
    /// Reranker failed; input order preserved, truncated to top_k.
    Fallback,
    /// Reranking disabled (no URL configured or per-request opt-out).
    Disabled,
}

impl RerankStatus {
    pub fn annotation(&self) -> Option<&'static str> {
        match self {
            Self::Applied => None,
            Self::Fallback => Some("rerank=fallback"),
            Self::Disabled => Some("rerank=disabled"),
        }
    }
}

pub struct RerankOutcome {
    pub candidates: Vec<Candidate>,
    pub status: RerankStatus,
    pub elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    passages: Vec<&'a str>,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

/// Cross-encoder reranker client. Every failure mode (HTTP error,
/// timeout, malformed payload, length mismatch) degrades to the input
/// order; this path never raises.
pub struct RerankerClient {
    client: Client,
    url: Option<String>,
    timeout: Duration,
}

impl RerankerClient {
    pub fn new(url: Option<String>, timeout_s: u64) -> Self {
        let timeout = Duration::from_secs(timeout_s);
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url,
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        top_k: usize,
    ) -> RerankOutcome {
        let start = Instant::now();

        let Some(url) = &self.url else {
            let mut candidates = candidates;
            candidates.truncate(top_k);
            return RerankOutcome {
                candidates,
                status: RerankStatus::Disabled,
                elapsed_ms: 0,
            };
        };

        if candidates.is_empty() {
            return RerankOutcome {
                candidates,
                status: RerankStatus::Applied,
                elapsed_ms: 0,
            };
        }

        match self.call(url, query, &candidates, top_k).await {
            Ok(scores) if scores.len() == candidates.len() => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                debug!(elapsed_ms, "reranker applied");
                RerankOutcome {
                    candidates: apply_scores(candidates, &scores, top_k),
                    status: RerankStatus::Applied,
                    elapsed_ms,
                }
            }
            Ok(scores) => {
                warn!(
                    expected = candidates.len(),
                    got = scores.len(),
                    "reranker returned mismatched score count, falling back to input order"
                );
                let mut candidates = candidates;
                candidates.truncate(top_k);
                RerankOutcome {
                    candidates,
                    status: RerankStatus::Fallback,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
            Err(e) => {
                warn!("reranker call failed, falling back to input order: {}", e);
                let mut candidates = candidates;
                candidates.truncate(top_k);
                RerankOutcome {
                    candidates,
                    status: RerankStatus::Fallback,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }

    async fn call(
        &self,
        url: &str,
        query: &str,
        candidates: &[Candidate],
        top_k: usize,
    ) -> anyhow::Result<Vec<f32>> {
        let endpoint = format!("{}/rerank", url.trim_end_matches('/'));

        let request = RerankRequest {
            query,
            passages: candidates.iter().map(|c| c.content.as_str()).collect(),
            top_k,
        };

        let response = tokio::time::timeout(
            self.timeout,
            self.client.post(&endpoint).json(&request).send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("reranker timed out"))??;

        if !response.status().is_success() {
            anyhow::bail!("reranker returned {}", response.status());
        }

        let body: RerankResponse = response.json().await?;
        if body.scores.is_empty() {
            anyhow::bail!("reranker returned empty score list");
        }

        Ok(body.scores)
    }
}

/// Replace final scores with normalized reranker scores and truncate.
/// Pre-rerank scores stay on the candidate for observability.
pub fn apply_scores(mut candidates: Vec<Candidate>, scores: &[f32], top_k: usize) -> Vec<Candidate> {
    let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;

    for (candidate, raw) in candidates.iter_mut().zip(scores) {
        let normalized = if span.abs() < f32::EPSILON {
            1.0
        } else {
            (raw - min) / span
        };
        candidate.rerank_score = Some(normalized);
        candidate.final_score = normalized;
    }

    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(top_k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentType;

    fn candidate(chunk_id: i64, final_score: f32) -> Candidate {
        Candidate {
            chunk_id,
            document_id: 1,
            source: "manual.pdf".to_string(),
            content: format!("passage {}", chunk_id),
            section: None,
            page: None,
            category: None,
            privacy_level: None,
            content_type: ContentType::Text,
            vector_score: Some(final_score),
            bm25_score: None,
            rerank_score: None,
            final_score,
        }
    }

    #[test]
    fn test_apply_scores_reorders_and_normalizes() {
        let candidates = vec![candidate(1, 0.9), candidate(2, 0.8), candidate(3, 0.7)];
        let ranked = apply_scores(candidates, &[0.1, 0.95, 0.5], 3);

        assert_eq!(ranked[0].chunk_id, 2);
        assert_eq!(ranked[1].chunk_id, 3);
        assert_eq!(ranked[2].chunk_id, 1);
        assert!((ranked[0].final_score - 1.0).abs() < 1e-6);
        assert!(ranked[2].final_score.abs() < 1e-6);
        // Pre-rerank score retained
        assert_eq!(ranked[0].vector_score, Some(0.8));
    }

    #[test]
    fn test_apply_scores_truncates() {
        let candidates = vec![candidate(1, 0.9), candidate(2, 0.8), candidate(3, 0.7)];
        let ranked = apply_scores(candidates, &[0.3, 0.2, 0.9], 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].chunk_id, 3);
    }

    #[tokio::test]
    async fn test_disabled_reranker_truncates_input_order() {
        let client = RerankerClient::new(None, 3);
        let outcome = client
            .rerank("q", vec![candidate(1, 0.9), candidate(2, 0.8)], 1)
            .await;
        assert_eq!(outcome.status, RerankStatus::Disabled);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].chunk_id, 1);
    }

    #[tokio::test]
    async fn test_unreachable_reranker_falls_back() {
        // Nothing listens on this port; the call errors and the input
        // order must be preserved without raising.
        let client = RerankerClient::new(Some("http://127.0.0.1:1".to_string()), 1);
        let outcome = client
            .rerank(
                "q",
                vec![candidate(1, 0.9), candidate(2, 0.8), candidate(3, 0.7)],
                2,
            )
            .await;
        assert_eq!(outcome.status, RerankStatus::Fallback);
        let order: Vec<i64> = outcome.candidates.iter().map(|c| c.chunk_id).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_fallback_annotation() {
        assert_eq!(RerankStatus::Fallback.annotation(), Some("rerank=fallback"));
        assert_eq!(RerankStatus::Applied.annotation(), None);
    }
}
