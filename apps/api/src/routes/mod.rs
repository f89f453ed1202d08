pub mod health;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::embedding::handlers as embedding;
use crate::library::handlers as library;
use crate::ranking::handlers as ranking;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Library
        .route(
            "/api/v1/roles",
            get(library::handle_list_roles).post(library::handle_create_role),
        )
        .route(
            "/api/v1/roles/:id/projects",
            get(library::handle_list_projects).post(library::handle_create_project),
        )
        .route("/api/v1/bullets", post(library::handle_create_bullet))
        .route(
            "/api/v1/bullets/:id",
            patch(library::handle_edit_bullet).delete(library::handle_delete_bullet),
        )
        .route(
            "/api/v1/bullets/:id/requeue",
            post(library::handle_requeue_bullet),
        )
        // Embeddings
        .route(
            "/api/v1/embeddings/status",
            get(embedding::handle_embedding_status),
        )
        // Ranking
        .route("/api/v1/recommendations", post(ranking::handle_recommend))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::clock::{Clock, SystemClock};
    use crate::config::Config;
    use crate::embedding::centroid::CentroidMaintainer;
    use crate::embedding::processor::{EmbeddingProcessor, ProcessorConfig};
    use crate::embedding::state_machine::EmbeddingStateMachine;
    use crate::library::service::LibraryService;
    use crate::llm_client::testing::FakeProvider;
    use crate::llm_client::ModelProvider;
    use crate::ranking::batch_scorer::{BatchScorer, ScorerConfig};
    use crate::ranking::cache::MemoryAnalysisCache;
    use crate::ranking::engine::{EngineConfig, RecommendationEngine};
    use crate::ranking::job_analyzer::JobAnalyzer;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use crate::worker::{BoundaryConfig, ExecutionBoundary};

    fn test_state() -> AppState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider: Arc<dyn ModelProvider> = Arc::new(FakeProvider::new());

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
            ProcessorConfig::default(),
        ));
        let engine = Arc::new(RecommendationEngine::new(
            store,
            JobAnalyzer::new(provider.clone(), Arc::new(MemoryAnalysisCache::new()), true),
            BatchScorer::new(provider, ScorerConfig::default()),
            EngineConfig::default(),
        ));
        let boundary = Arc::new(ExecutionBoundary::start(engine, BoundaryConfig::default()));

        AppState {
            library,
            embeddings,
            boundary,
            config: Config::default(),
        }
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_boundary_state() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["execution_boundary"]["state"], "ready");
        assert_eq!(body["ping"]["ok"], true);
        assert_eq!(body["embedding_processor"]["running"], false);
    }

    #[tokio::test]
    async fn test_create_role_then_list() {
        let app = build_router(test_state());
        let created = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/roles",
                json!({"title": "Platform Engineer", "company": "Acme"}),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let listed = app
            .oneshot(Request::get("/api/v1/roles").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let roles = body_json(listed).await;
        assert_eq!(roles.as_array().unwrap().len(), 1);
        assert_eq!(roles[0]["title"], "Platform Engineer");
    }

    #[tokio::test]
    async fn test_projects_listed_per_role() {
        let app = build_router(test_state());
        let role = app
            .clone()
            .oneshot(json_request("POST", "/api/v1/roles", json!({"title": "SRE"})))
            .await
            .unwrap();
        let role_id = body_json(role).await["id"].as_str().unwrap().to_string();
        let uri = format!("/api/v1/roles/{role_id}/projects");

        let created = app
            .clone()
            .oneshot(json_request("POST", &uri, json!({"name": "Observability"})))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let listed = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let projects = body_json(listed).await;
        assert_eq!(projects.as_array().unwrap().len(), 1);
        assert_eq!(projects[0]["name"], "Observability");

        let missing = app
            .oneshot(
                Request::get(format!("/api/v1/roles/{}/projects", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bullet_for_unknown_project_is_not_found() {
        let app = build_router(test_state());
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/bullets",
                json!({"project_id": Uuid::new_v4(), "text": "Shipped things"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_recommendation_on_empty_library_is_rejected() {
        let app = build_router(test_state());
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/recommendations",
                json!({"job_title": "SRE", "job_description": "Kubernetes and Go"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }
}
