use axum::{extract::State, Json};
use std::sync::Arc;

use crate::registry::InstanceSnapshot;
use crate::state::AppState;

/// GET /instances - per-instance stats for operators.
pub async fn list_instances(State(state): State<Arc<AppState>>) -> Json<Vec<InstanceSnapshot>> {
    Json(state.registry.snapshot())
}
