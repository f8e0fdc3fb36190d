use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::services::QueryCategory;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
    pub category: QueryCategory,
    pub chosen_model: String,
    pub chosen_instance: String,
}

/// POST /classify - dry-run of the router, no side effects.
pub async fn classify_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClassifyRequest>,
) -> Result<Json<ClassifyResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::Validation("query cannot be empty".to_string()));
    }

    let decision = state.router.route(&request.query, None, None).await?;

    info!(
        category = decision.category.as_str(),
        model = %decision.model,
        "classified query"
    );

    Ok(Json(ClassifyResponse {
        category: decision.category,
        chosen_model: decision.model,
        chosen_instance: decision.instance,
    }))
}
