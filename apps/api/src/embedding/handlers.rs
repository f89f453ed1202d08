use axum::{extract::State, Json};

use crate::embedding::processor::EmbeddingStatus;
use crate::errors::AppError;
use crate::state::AppState;

/// GET /api/v1/embeddings/status
pub async fn handle_embedding_status(
    State(state): State<AppState>,
) -> Result<Json<EmbeddingStatus>, AppError> {
    Ok(Json(state.embeddings.status().await?))
}
