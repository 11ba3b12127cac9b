//! HTTP API

mod error;
mod middleware;
mod routes;

use anyhow::Result;
use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::buffer::InventoryBuffer;
use crate::cleanup::CleanupScheduler;
use crate::config::Config;
use crate::db::InventoryRepository;
use crate::inventory::InventoryService;
use middleware::{RequestLoggingLayer, REQUEST_ID_HEADER};

pub struct AppState {
    pub inventory: InventoryService,
    pub buffer: Option<InventoryBuffer>,
    pub repo: Arc<dyn InventoryRepository>,
    pub cleanup: Arc<CleanupScheduler>,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/v1/health", get(routes::health))
        .route("/api/v1/inventory/:entity_id", get(routes::get_inventory))
        .route("/api/v1/inventory/:entity_id/sync", post(routes::sync_inventory))
        .route("/api/v1/admin/stats", get(routes::admin_stats))
        .route("/api/v1/admin/cleanup", post(routes::admin_cleanup))
        .route("/api/v1/admin/flush", post(routes::admin_flush));

    with_layers(api).with_state(state)
}

/// Panic recovery, CORS and access logging, outermost last
fn with_layers<S>(routes: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([REQUEST_ID_HEADER])
        .max_age(Duration::from_secs(300));

    routes
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(cors)
        .layer(RequestLoggingLayer::new())
}

/// Serve until `shutdown` resolves, then let in-flight requests finish
pub async fn start_server<F>(config: &Config, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);

    let addr = config.server_address();
    info!("HTTP server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferSettings, MemoryStore};
    use crate::cleanup::CleanupSettings;
    use crate::db::memory_repo;
    use crate::inventory::RepositoryFlusher;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app_state(buffered: bool) -> Arc<AppState> {
        let repo = Arc::new(memory_repo().await);
        let buffer = if buffered {
            Some(
                InventoryBuffer::start(
                    Arc::new(MemoryStore::new()),
                    Arc::new(RepositoryFlusher::new(repo.clone())),
                    BufferSettings {
                        key_prefix: "test:web".to_string(),
                        flush_interval: Duration::from_secs(3600),
                        cleanup_interval: Duration::from_secs(3600),
                        ..BufferSettings::default()
                    },
                )
                .await
                .unwrap(),
            )
        } else {
            None
        };

        Arc::new(AppState {
            inventory: InventoryService::new(repo.clone(), repo.clone(), buffer.clone()),
            buffer,
            repo: repo.clone(),
            cleanup: Arc::new(CleanupScheduler::new(repo, CleanupSettings::default())),
            started_at: Utc::now(),
        })
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> Response {
        router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn sync_then_read_back() {
        let state = app_state(true).await;

        let response = send(&state, post("/api/v1/inventory/1234/sync", r#"{"rods":[1,2]}"#)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "synced");
        assert_eq!(body["data"]["user_id"], "1234");
        assert_eq!(body["data"]["size"], 14);

        let response = send(&state, get("/api/v1/inventory/1234")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["entity_id"], "1234");
        assert_eq!(body["data"]["inventory"]["rods"][1], 2);
        assert!(body["data"]["synced_at"].is_string());
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        let state = app_state(true).await;

        let response = send(&state, post("/api/v1/inventory/1234/sync", "{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");

        assert_eq!(state.buffer.as_ref().unwrap().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_inventory_is_not_found() {
        let state = app_state(false).await;

        let response = send(&state, get("/api/v1/inventory/nobody")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn caller_request_id_is_echoed() {
        let state = app_state(false).await;
        let request = Request::builder()
            .uri("/api/v1/health")
            .header("x-request-id", "trace-77")
            .body(Body::empty())
            .unwrap();

        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-77");
        assert_eq!(json_body(response).await["data"]["status"], "healthy");
    }

    #[tokio::test]
    async fn admin_flush_moves_buffer_to_storage() {
        let state = app_state(true).await;
        send(&state, post("/api/v1/inventory/9/sync", "[]")).await;

        let response = send(&state, post("/api/v1/admin/flush", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["status"], "flushed");
        assert_eq!(body["data"]["pending_items"], 0);

        let stored = state.repo.get("9").await.unwrap().unwrap();
        assert_eq!(stored.payload, b"[]");
    }

    #[tokio::test]
    async fn admin_flush_without_buffer_is_unavailable() {
        let state = app_state(false).await;

        let response = send(&state, post("/api/v1/admin/flush", "")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn admin_stats_reports_buffer_and_storage() {
        let state = app_state(true).await;
        send(&state, post("/api/v1/inventory/5/sync", "{}")).await;

        let body = json_body(send(&state, get("/api/v1/admin/stats")).await).await;
        assert_eq!(body["data"]["db_type"], "sqlite");
        assert_eq!(body["data"]["buffer"]["status"], "connected");
        assert_eq!(body["data"]["buffer"]["pending_items"], 1);
        assert_eq!(body["data"]["buffer"]["loop"], "running");
        assert_eq!(body["data"]["storage"]["status"], "connected");
        assert_eq!(body["data"]["cleanup"]["state"], "idle");
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        async fn explode() -> &'static str {
            panic!("inventory exploded")
        }
        let app: Router = with_layers(Router::new().route("/boom", axum::routing::get(explode)));

        let response = app.oneshot(get("/boom")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn admin_cleanup_runs_immediately() {
        let state = app_state(false).await;
        send(&state, post("/api/v1/inventory/5/sync", "{}")).await;

        let response = send(&state, post("/api/v1/admin/cleanup", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["deleted"], 0);
        assert!(state.repo.get("5").await.unwrap().is_some());
    }
}
