/// Confidence Scorer
/// Deterministic trust scores for retrieval sets and generated answers.
/// The scorer never requests generation itself; it only scores what it
/// is given.
use crate::models::Candidate;
use crate::services::reranker::RerankStatus;
use crate::utils::text::jaccard_overlap;

/// Uncertainty markers that penalize a generated answer.
const UNCERTAINTY_MARKERS: &[&str] = &[
    "i don't know",
    "i do not know",
    "unclear",
    "apologize",
    "not sure",
    "no information",
];

const QUERY_OVERLAP_CAP: f64 = 0.6;
const LENGTH_BONUS_MIN: usize = 200;
const LENGTH_BONUS_MAX: usize = 1500;

fn coverage_weight(status: RerankStatus) -> f64 {
    match status {
        RerankStatus::Applied => 1.0,
        RerankStatus::Fallback => 0.7,
        RerankStatus::Disabled => 0.4,
    }
}

fn top3_contents(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .take(3)
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn mean_top3_score(candidates: &[Candidate]) -> f64 {
    let top: Vec<f64> = candidates
        .iter()
        .take(3)
        .map(|c| c.final_score as f64)
        .collect();
    if top.is_empty() {
        return 0.0;
    }
    top.iter().sum::<f64>() / top.len() as f64
}

/// Pre-synthesis confidence of the retrieval step:
/// 0.5 * mean(top-3 final scores) + 0.3 * rerank coverage +
/// 0.2 * capped query/chunk token overlap, clipped to [0,1].
pub fn retrieval_confidence(
    query: &str,
    candidates: &[Candidate],
    rerank_status: RerankStatus,
) -> f64 {
    let score_term = mean_top3_score(candidates);
    let coverage = coverage_weight(rerank_status);

    let overlap = jaccard_overlap(query, &top3_contents(candidates));
    let overlap_term = overlap.min(QUERY_OVERLAP_CAP) / QUERY_OVERLAP_CAP;

    (0.5 * score_term + 0.3 * coverage + 0.2 * overlap_term).clamp(0.0, 1.0)
}

/// Post-synthesis confidence. Starts from the retrieval confidence,
/// penalizes hedging, rewards a grounded-looking length and overlap
/// with the context actually used.
pub fn answer_confidence(
    retrieval_confidence: f64,
    answer: &str,
    candidates: &[Candidate],
) -> f64 {
    let mut confidence = retrieval_confidence;

    let answer_lower = answer.to_lowercase();
    if UNCERTAINTY_MARKERS.iter().any(|m| answer_lower.contains(m)) {
        confidence -= 0.3;
    }

    confidence += length_bonus(answer.chars().count());
    confidence += 0.2 * jaccard_overlap(answer, &top3_contents(candidates));

    confidence.clamp(0.0, 1.0)
}

/// Up to +0.1 for answers between 200 and 1500 characters, linear
/// inside the band, zero outside it.
fn length_bonus(chars: usize) -> f64 {
    if chars < LENGTH_BONUS_MIN || chars > LENGTH_BONUS_MAX {
        return 0.0;
    }
    let span = (LENGTH_BONUS_MAX - LENGTH_BONUS_MIN) as f64;
    0.1 * (chars - LENGTH_BONUS_MIN) as f64 / span
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentType;

    fn candidate(score: f32, content: &str) -> Candidate {
        Candidate {
            chunk_id: 1,
            document_id: 1,
            source: "manual.pdf".to_string(),
            content: content.to_string(),
            section: None,
            page: None,
            category: None,
            privacy_level: None,
            content_type: ContentType::Text,
            vector_score: Some(score),
            bm25_score: None,
            rerank_score: None,
            final_score: score,
        }
    }

    #[test]
    fn test_retrieval_confidence_in_unit_interval() {
        let candidates = vec![
            candidate(0.95, "ssl certificates for ldap"),
            candidate(0.9, "secure ldap integration"),
            candidate(0.2, "unrelated"),
        ];
        let conf = retrieval_confidence(
            "what does ldap need",
            &candidates,
            RerankStatus::Applied,
        );
        assert!((0.0..=1.0).contains(&conf));
    }

    #[test]
    fn test_retrieval_confidence_deterministic() {
        let candidates = vec![
            candidate(0.8, "rni requires ssl certificates"),
            candidate(0.6, "ldap configuration steps"),
        ];
        let a = retrieval_confidence("rni ldap requirements", &candidates, RerankStatus::Applied);
        let b = retrieval_confidence("rni ldap requirements", &candidates, RerankStatus::Applied);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_coverage_ordering() {
        let candidates = vec![candidate(0.5, "some passage about meters")];
        let query = "meters";

        let applied = retrieval_confidence(query, &candidates, RerankStatus::Applied);
        let fallback = retrieval_confidence(query, &candidates, RerankStatus::Fallback);
        let disabled = retrieval_confidence(query, &candidates, RerankStatus::Disabled);

        assert!(applied > fallback);
        assert!(fallback > disabled);
        assert!((applied - fallback - 0.3 * 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_empty_candidates_low_confidence() {
        let conf = retrieval_confidence("anything", &[], RerankStatus::Disabled);
        // Only the coverage term contributes
        assert!((conf - 0.3 * 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_uncertainty_penalty() {
        let candidates = vec![candidate(0.9, "ssl certificates")];
        let base = retrieval_confidence("ssl", &candidates, RerankStatus::Applied);

        let confident = answer_confidence(base, "SSL certificates are required.", &candidates);
        let hedged = answer_confidence(
            base,
            "I apologize, but I'm not sure about SSL certificates.",
            &candidates,
        );
        assert!(confident > hedged);
    }

    #[test]
    fn test_length_bonus_band() {
        assert_eq!(length_bonus(100), 0.0);
        assert_eq!(length_bonus(2000), 0.0);
        assert_eq!(length_bonus(200), 0.0);
        assert!((length_bonus(1500) - 0.1).abs() < 1e-9);
        let mid = length_bonus(850);
        assert!(mid > 0.0 && mid < 0.1);
    }

    #[test]
    fn test_answer_confidence_clipped() {
        let candidates = vec![candidate(1.0, "exact overlap text")];
        let conf = answer_confidence(1.0, "exact overlap text", &candidates);
        assert!(conf <= 1.0);

        let low = answer_confidence(0.05, "i don't know", &candidates);
        assert!(low >= 0.0);
    }

    #[test]
    fn test_answer_confidence_deterministic() {
        let candidates = vec![candidate(0.7, "firewall rules for rni")];
        let a = answer_confidence(0.5, "Open ports 443 and 636 on the firewall.", &candidates);
        let b = answer_confidence(0.5, "Open ports 443 and 636 on the firewall.", &candidates);
        assert!((a - b).abs() < 1e-9);
    }
}
