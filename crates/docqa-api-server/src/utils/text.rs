/// Overlap and similarity helpers shared by the BM25 index, the
/// confidence scorer, the conversation memory lookup and the answer
/// cache key builder.
use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

/// Small fixed stop-word list. Applied by the lexical index and by
/// token-overlap scoring so both sides agree on what a "token" is.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it", "its",
    "of", "on", "or", "that", "the", "this", "to", "was", "were", "what", "which", "with",
];

/// Lowercase Unicode letter/digit runs, stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Jaccard overlap between the token sets of two texts. Returns 0.0 when
/// either side tokenizes to nothing.
pub fn jaccard_overlap(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();

    intersection as f64 / union as f64
}

/// Normalize a query for cache keying: lowercase, collapsed whitespace.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Cosine similarity over embedding vectors, used for the semantic
/// memory lookup. None when the inputs are not comparable (length
/// mismatch, empty, or a zero vector); callers skip such turns rather
/// than scoring them.
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold(
        (0.0f32, 0.0f32, 0.0f32),
        |(dot, na, nb), (x, y)| (dot + x * y, na + x * x, nb + y * y),
    );

    let denom = (norm_a * norm_b).sqrt();
    if denom == 0.0 {
        return None;
    }

    // Guard against float drift past the valid range
    Some((dot / denom).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_removes_stop_words() {
        let tokens = tokenize("What is the SSL configuration for the LDAP server?");
        assert!(tokens.contains(&"ssl".to_string()));
        assert!(tokens.contains(&"ldap".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"what".to_string()));
    }

    #[test]
    fn test_tokenize_splits_on_punctuation() {
        let tokens = tokenize("RNI-4.16 requires certificates!");
        assert!(tokens.contains(&"rni".to_string()));
        assert!(tokens.contains(&"requires".to_string()));
    }

    #[test]
    fn test_jaccard_identical() {
        let j = jaccard_overlap("ssl certificates required", "ssl certificates required");
        assert!((j - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_jaccard_disjoint() {
        let j = jaccard_overlap("alpha beta", "gamma delta");
        assert_eq!(j, 0.0);
    }

    #[test]
    fn test_jaccard_empty() {
        assert_eq!(jaccard_overlap("", "anything"), 0.0);
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("  What   Does RNI\tNeed? "),
            "what does rni need?"
        );
    }

    #[test]
    fn test_cosine_parallel_and_opposite() {
        let sim = cosine(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);

        let sim = cosine(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_incomparable_inputs() {
        assert!(cosine(&[1.0, 2.0], &[1.0, 2.0, 3.0]).is_none());
        assert!(cosine(&[], &[]).is_none());
        assert!(cosine(&[0.0, 0.0], &[1.0, 2.0]).is_none());
    }
}
