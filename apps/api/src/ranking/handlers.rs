use axum::{extract::State, Json};

use crate::errors::AppError;
use crate::ranking::engine::{RecommendationRequest, RecommendationResult};
use crate::state::AppState;

/// POST /api/v1/recommendations
/// Runs the ranking pipeline inside the execution boundary.
pub async fn handle_recommend(
    State(state): State<AppState>,
    Json(req): Json<RecommendationRequest>,
) -> Result<Json<RecommendationResult>, AppError> {
    let result = state.boundary.recommend(req).await?;
    Ok(Json(result))
}
