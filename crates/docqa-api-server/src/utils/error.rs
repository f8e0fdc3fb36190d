use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the serving pipeline.
/// Services return these; only the HTTP layer maps them to status codes.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No available instance: {0}")]
    NoAvailableInstance(String),

    #[error("Vector store unavailable: {0}")]
    VectorStoreUnavailable(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Web search unavailable: {0}")]
    WebSearchUnavailable(String),

    #[error("Embedding dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Corpus is empty")]
    EmptyCorpus,

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Generation timeout: {0}")]
    GenerationTimeout(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code, used in SSE `error` events and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NoAvailableInstance(_) => "no_available_instance",
            Self::VectorStoreUnavailable(_) => "vector_store_unavailable",
            Self::EmbeddingUnavailable(_) => "embedding_unavailable",
            Self::WebSearchUnavailable(_) => "web_search_unavailable",
            Self::DimensionMismatch(_) => "dimension_mismatch",
            Self::EmptyCorpus => "empty_corpus",
            Self::Overloaded(_) => "overloaded",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::GenerationTimeout(_) => "generation_timeout",
            Self::GenerationFailed(_) => "generation_failed",
            Self::ContextOverflow(_) => "context_overflow",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NoAvailableInstance(_)
            | Self::VectorStoreUnavailable(_)
            | Self::EmbeddingUnavailable(_)
            | Self::WebSearchUnavailable(_)
            | Self::GenerationFailed(_)
            | Self::EmptyCorpus => StatusCode::SERVICE_UNAVAILABLE,
            Self::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::DeadlineExceeded(_) | Self::GenerationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::DimensionMismatch(_) | Self::ContextOverflow(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        match status {
            StatusCode::BAD_REQUEST | StatusCode::TOO_MANY_REQUESTS => {
                tracing::warn!(code = self.code(), "{}", message)
            }
            _ => tracing::error!(code = self.code(), "{}", message),
        }

        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message,
            },
        });

        let mut response = (status, body).into_response();

        if matches!(self, ApiError::Overloaded(_)) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("5"));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Overloaded("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::NoAvailableInstance("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::DeadlineExceeded("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::DimensionMismatch("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ApiError::EmptyCorpus.code(), "empty_corpus");
        assert_eq!(
            ApiError::GenerationTimeout("45s".into()).code(),
            "generation_timeout"
        );
    }
}
