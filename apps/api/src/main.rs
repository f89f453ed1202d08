mod clock;
mod config;
mod db;
mod embedding;
mod errors;
mod library;
mod llm_client;
mod models;
mod ranking;
mod routes;
mod similarity;
mod state;
mod store;
mod worker;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::embedding::centroid::CentroidMaintainer;
use crate::embedding::processor::{EmbeddingProcessor, ProcessorConfig};
use crate::embedding::state_machine::EmbeddingStateMachine;
use crate::library::service::LibraryService;
use crate::llm_client::{LlmClient, ModelProvider};
use crate::ranking::batch_scorer::{BatchScorer, ScorerConfig};
use crate::ranking::cache::{AnalysisCache, MemoryAnalysisCache, RedisAnalysisCache};
use crate::ranking::engine::{EngineConfig, RecommendationEngine};
use crate::ranking::job_analyzer::JobAnalyzer;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::{memory::MemoryStore, postgres::PgStore, Store};
use crate::worker::{BoundaryConfig, ExecutionBoundary};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first; bad values abort startup with the variable name
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Quiver API v{}", env!("CARGO_PKG_VERSION"));

    // Library store: PostgreSQL when configured, otherwise in memory
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; the library is kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize model provider
    if config.openai_api_key.is_none() {
        warn!("OPENAI_API_KEY not set; remote calls will fail and ranking will use fallbacks");
    }
    let provider: Arc<dyn ModelProvider> = Arc::new(LlmClient::new(
        config.openai_api_key.clone(),
        config.openai_base_url.clone(),
    ));
    info!(
        "LLM client initialized (chat: {}, embeddings: {})",
        provider.chat_model(),
        provider.embedding_model()
    );

    // Job analysis cache: Redis when configured
    let cache: Arc<dyn AnalysisCache> = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            info!("Redis client initialized");
            Arc::new(RedisAnalysisCache::new(client))
        }
        None => Arc::new(MemoryAnalysisCache::new()),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Embedding lifecycle
    let machine = Arc::new(EmbeddingStateMachine::new(store.clone(), clock.clone()));
    let centroids = Arc::new(CentroidMaintainer::new(store.clone(), clock.clone()));
    let library = Arc::new(LibraryService::new(
        store.clone(),
        machine.clone(),
        centroids.clone(),
        clock,
    ));
    let embeddings = Arc::new(EmbeddingProcessor::new(
        machine,
        centroids,
        provider.clone(),
        ProcessorConfig::from_config(&config),
    ));

    // Ranking pipeline behind the execution boundary
    let analyzer = JobAnalyzer::new(provider.clone(), cache, config.enable_fallback_scoring);
    let scorer = BatchScorer::new(provider, ScorerConfig::from_config(&config));
    let engine = Arc::new(RecommendationEngine::new(
        store,
        analyzer,
        scorer,
        EngineConfig::from_config(&config),
    ));
    let boundary = Arc::new(ExecutionBoundary::start(
        engine,
        BoundaryConfig::from_config(&config),
    ));

    embeddings.start();

    // Build app state
    let state = AppState {
        library,
        embeddings: embeddings.clone(),
        boundary: boundary.clone(),
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight embedding writes finish before exiting
    embeddings.stop().await;
    boundary.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {e}");
    }
    info!("Shutdown signal received");
}
