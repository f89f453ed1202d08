use std::sync::Arc;

use crate::config::Config;
use crate::embedding::processor::EmbeddingProcessor;
use crate::library::service::LibraryService;
use crate::worker::ExecutionBoundary;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub library: Arc<LibraryService>,
    /// Background embedding processor; handlers only read its status.
    pub embeddings: Arc<EmbeddingProcessor>,
    /// Recommendation runs go through here, never straight to the engine.
    pub boundary: Arc<ExecutionBoundary>,
    pub config: Config,
}
