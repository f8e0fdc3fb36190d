use serde::{Deserialize, Serialize};

/// Content-type tag carried by every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Table,
    ImageCaption,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::ImageCaption => "image_caption",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "table" => Some(Self::Table),
            "image_caption" => Some(Self::ImageCaption),
            _ => None,
        }
    }
}

/// Optional post-fusion filters for /search and /chat.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CandidateFilters {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub privacy_level: Option<String>,
    #[serde(default)]
    pub min_vector_score: Option<f32>,
}

impl CandidateFilters {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.content_type.is_none()
            && self.privacy_level.is_none()
            && self.min_vector_score.is_none()
    }

    /// Stable string form for cache keying.
    pub fn cache_key_part(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.category.as_deref().unwrap_or("-"),
            self.content_type.map(|c| c.as_str()).unwrap_or("-"),
            self.privacy_level.as_deref().unwrap_or("-"),
            self.min_vector_score
                .map(|v| format!("{:.4}", v))
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

/// One retrieval candidate flowing through the pipeline. Pre-rerank
/// scores are retained for observability after the reranker replaces
/// the final score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub chunk_id: i64,
    pub document_id: i64,
    /// Source filename for corpus chunks, URL for web results.
    pub source: String,
    pub content: String,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub page: Option<i32>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub privacy_level: Option<String>,
    pub content_type: ContentType,
    #[serde(default)]
    pub vector_score: Option<f32>,
    #[serde(default)]
    pub bm25_score: Option<f32>,
    #[serde(default)]
    pub rerank_score: Option<f32>,
    pub final_score: f32,
}

impl Candidate {
    pub fn matches(&self, filters: &CandidateFilters) -> bool {
        if let Some(category) = &filters.category {
            if self.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(content_type) = filters.content_type {
            if self.content_type != content_type {
                return false;
            }
        }
        if let Some(privacy) = &filters.privacy_level {
            if self.privacy_level.as_deref() != Some(privacy.as_str()) {
                return false;
            }
        }
        if let Some(min_score) = filters.min_vector_score {
            if self.vector_score.unwrap_or(0.0) < min_score {
                return false;
            }
        }
        true
    }
}
