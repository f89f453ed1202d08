use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::worker::BoundaryState;

/// GET /health
/// Service version, embedding processor state, and a live ping through the
/// execution boundary (skipped while a recommendation is running).
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let ping = match state.boundary.ping().await {
        Ok(latency) => json!({ "ok": true, "latency_ms": latency.as_millis() as u64 }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    let boundary = state.boundary.status();
    let status = match boundary.state {
        BoundaryState::Ready => "ok",
        _ => "degraded",
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "service": "quiver-api",
        "embedding_processor": {
            "running": state.embeddings.is_running()
        },
        "execution_boundary": boundary,
        "ping": ping,
        "fallback_scoring": state.config.enable_fallback_scoring
    }))
}
