use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::candidate::CandidateFilters;

// ===== REQUEST MODELS =====

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: usize,
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_true")]
    pub rerank: bool,
    #[serde(default = "default_true")]
    pub web_search_enabled: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub filters: Option<CandidateFilters>,
    /// Explicit model override, bypasses the classifier choice.
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.query.trim().is_empty() {
            return Err("query cannot be empty".to_string());
        }
        if self.top_k == 0 {
            return Err("top_k must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err("alpha must be in [0,1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err("confidence_threshold must be in [0,1]".to_string());
        }
        if self.temperature < 0.0 {
            return Err("temperature must be non-negative".to_string());
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    VectorOnly,
    LexicalOnly,
    #[default]
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VectorOnly => "vector_only",
            Self::LexicalOnly => "lexical_only",
            Self::Hybrid => "hybrid",
        }
    }
}

// ===== ANSWER MODEL =====

/// Final answer origin. `Hybrid` marks the case where the doc path
/// answered but a web retry was compared against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTag {
    Doc,
    Web,
    Hybrid,
}

impl RouteTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Doc => "doc",
            Self::Web => "web",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub chunk_id: i64,
    pub score: f32,
    pub source: String,
}

/// Wall-clock millis per pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub classify_ms: u64,
    pub embed_ms: u64,
    pub retrieve_ms: u64,
    pub rerank_ms: u64,
    pub synthesize_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub confidence: f32,
    pub provenance: Vec<Provenance>,
    pub route: RouteTag,
    pub model: String,
    /// Degraded-success notes, e.g. "rerank=fallback".
    #[serde(default)]
    pub annotations: Vec<String>,
    pub timings: StageTimings,
    pub created_at: DateTime<Utc>,
}

// ===== SSE EVENT MODELS =====

#[derive(Debug, Clone, Serialize)]
pub struct MetaEvent {
    pub request_id: String,
    pub route: RouteTag,
    pub model: String,
    pub instance: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenEventPayload {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
}

/// Events produced by the chat pipeline, in emission order:
/// one Meta, zero or more Tokens, then exactly one Final or Error.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Meta(MetaEvent),
    Token(String),
    Final(Answer),
    Error(ErrorEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"query": "what does RNI need?"}"#).unwrap();
        assert_eq!(req.top_k, 10);
        assert_eq!(req.max_context_chunks, 5);
        assert_eq!(req.mode, RetrievalMode::Hybrid);
        assert!((req.alpha - 0.7).abs() < f32::EPSILON);
        assert!(req.rerank);
        assert!(req.web_search_enabled);
        assert!(req.stream);
        assert_eq!(req.max_tokens, 1024);
    }

    #[test]
    fn test_request_validation() {
        let mut req: ChatRequest = serde_json::from_str(r#"{"query": "ok"}"#).unwrap();
        assert!(req.validate().is_ok());

        req.query = "   ".to_string();
        assert!(req.validate().is_err());

        req.query = "ok".to_string();
        req.alpha = 2.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_mode_deserialization() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"query": "q", "mode": "lexical_only"}"#).unwrap();
        assert_eq!(req.mode, RetrievalMode::LexicalOnly);
    }

    #[test]
    fn test_route_serialization() {
        assert_eq!(serde_json::to_string(&RouteTag::Doc).unwrap(), "\"doc\"");
        assert_eq!(serde_json::to_string(&RouteTag::Web).unwrap(), "\"web\"");
    }
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> usize {
    10
}

fn default_max_context_chunks() -> usize {
    5
}

fn default_alpha() -> f32 {
    0.7
}

fn default_confidence_threshold() -> f32 {
    0.3
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> usize {
    1024
}
