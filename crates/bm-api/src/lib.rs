//! Bull Monitor HTTP API
//!
//! HTTP API endpoints for:
//! - Health and version
//! - Kubernetes probes (liveness/readiness)
//! - Discovered queue inventory
//! - Prometheus metrics
//! - OpenAPI document

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bm_discovery::{EngineStatus, QueueRegistry};
use bm_metrics::{PrometheusHandle, QueueMetricsCollector};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use utoipa::OpenApi;

pub mod model;

use model::{
    JobCountsResponse, ProbeResponse, QueueListResponse, QueueResponse, SimpleHealthResponse,
    VersionResponse,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<QueueRegistry>,
    pub status: watch::Receiver<EngineStatus>,
    /// Job counts for `/queues` (optional)
    pub collector: Option<Arc<QueueMetricsCollector>>,
    /// Renders `/metrics`; without it the endpoint is empty
    pub prometheus: Option<PrometheusHandle>,
    pub version: String,
}

impl AppState {
    pub fn new(registry: Arc<QueueRegistry>, status: watch::Receiver<EngineStatus>) -> Self {
        Self {
            registry,
            status,
            collector: None,
            prometheus: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_collector(mut self, collector: Arc<QueueMetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Bull Monitor API",
        description = "Queue discovery status, probes and metrics"
    ),
    paths(
        health_handler,
        liveness_probe,
        readiness_probe,
        version_handler,
        queues_handler,
        metrics_handler,
    ),
    components(schemas(
        SimpleHealthResponse,
        ProbeResponse,
        VersionResponse,
        QueueListResponse,
        QueueResponse,
        JobCountsResponse,
    )),
    tags(
        (name = "health", description = "Health and probes"),
        (name = "queues", description = "Discovered queues"),
        (name = "monitoring", description = "Metrics"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/version", get(version_handler))
        .route("/queues", get(queues_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api-doc/openapi.json", get(openapi_handler))
        .with_state(state)
}

/// Basic health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Application is up", body = SimpleHealthResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Json<SimpleHealthResponse> {
    Json(SimpleHealthResponse {
        status: "UP".to_string(),
        version: state.version.clone(),
    })
}

/// Kubernetes liveness probe - returns 200 if the application is running
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is live", body = ProbeResponse)
    )
)]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

/// Kubernetes readiness probe - 200 once both connections are up, the
/// inventory is reconciled and notifications are subscribed
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Inventory is in sync", body = ProbeResponse),
        (status = 503, description = "Inventory is not in sync", body = ProbeResponse)
    )
)]
async fn readiness_probe(State(state): State<AppState>) -> Response {
    let status = *state.status.borrow();
    if status.is_ready() {
        (StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() })).into_response()
    } else {
        debug!(
            admin = status.admin.as_str(),
            notifications = status.notifications.as_str(),
            reconciled = status.reconciled,
            listening = status.listening,
            "Readiness probe failed"
        );
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse { status: "NOT_READY".to_string() }),
        )
            .into_response()
    }
}

#[utoipa::path(
    get,
    path = "/version",
    tag = "health",
    responses(
        (status = 200, description = "Application version", body = VersionResponse)
    )
)]
async fn version_handler(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: state.version.clone(),
    })
}

/// Discovered queues, sorted by prefix then name
#[utoipa::path(
    get,
    path = "/queues",
    tag = "queues",
    responses(
        (status = 200, description = "Queue inventory", body = QueueListResponse)
    )
)]
async fn queues_handler(State(state): State<AppState>) -> Json<QueueListResponse> {
    let queues: Vec<QueueResponse> = state
        .registry
        .sorted_keys()
        .into_iter()
        .map(|identity| {
            let counts = state.collector.as_ref().and_then(|c| c.latest(&identity));
            QueueResponse::new(identity, counts)
        })
        .collect();

    Json(QueueListResponse {
        total: queues.len(),
        queues,
    })
}

/// Prometheus metrics endpoint
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "monitoring",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain")
    )
)]
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let output = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
        .into_response()
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bm_common::QueueIdentity;
    use bm_discovery::memory::InMemoryHandleFactory;
    use bm_discovery::{ConcurrencyGuard, ConnectionState, EventPublisher};
    use std::time::Duration;
    use tower::ServiceExt;

    fn registry() -> Arc<QueueRegistry> {
        QueueRegistry::new(
            Arc::new(InMemoryHandleFactory::new()),
            ConcurrencyGuard::mutation(Duration::from_secs(1)),
            EventPublisher::default(),
        )
    }

    fn ready_status() -> EngineStatus {
        EngineStatus {
            admin: ConnectionState::Ready,
            notifications: ConnectionState::Ready,
            reconciled: true,
            listening: true,
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_liveness() {
        let (_tx, rx) = watch::channel(EngineStatus::default());
        let router = create_router(AppState::new(registry(), rx));

        let (status, body) = get(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""status":"UP""#));

        let (status, body) = get(router, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("LIVE"));
    }

    #[tokio::test]
    async fn test_readiness_follows_engine_status() {
        let (tx, rx) = watch::channel(EngineStatus::default());
        let router = create_router(AppState::new(registry(), rx));

        let (status, body) = get(router.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("NOT_READY"));

        tx.send_replace(ready_status());
        let (status, body) = get(router.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""status":"READY""#));

        // losing the subscriber connection drops readiness
        tx.send_modify(|s| {
            s.notifications = ConnectionState::Reconnecting;
            s.listening = false;
        });
        let (status, _) = get(router, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_queues_are_sorted() {
        let registry = registry();
        registry.add(&QueueIdentity::new("bull", "orders")).await.unwrap();
        registry.add(&QueueIdentity::new("bull", "emails")).await.unwrap();
        registry.add(&QueueIdentity::new("alpha", "jobs")).await.unwrap();
        let (_tx, rx) = watch::channel(ready_status());
        let router = create_router(AppState::new(registry, rx));

        let (status, body) = get(router, "/queues").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["total"], 3);
        let names: Vec<String> = json["queues"]
            .as_array()
            .unwrap()
            .iter()
            .map(|q| format!("{}:{}", q["prefix"].as_str().unwrap(), q["name"].as_str().unwrap()))
            .collect();
        assert_eq!(names, vec!["alpha:jobs", "bull:emails", "bull:orders"]);
    }

    #[tokio::test]
    async fn test_version_and_openapi() {
        let (_tx, rx) = watch::channel(EngineStatus::default());
        let router = create_router(AppState::new(registry(), rx));

        let (status, body) = get(router.clone(), "/version").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(env!("CARGO_PKG_VERSION")));

        let (status, body) = get(router, "/api-doc/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("/health/ready"));
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_empty() {
        let (_tx, rx) = watch::channel(EngineStatus::default());
        let router = create_router(AppState::new(registry(), rx));

        let (status, body) = get(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }
}
