//! Health check handlers for the farewell worker.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): ready only while the consumer is consuming
//! - Prometheus metrics (`/metrics`)

use amqp_messaging::{metrics, ConsumerRegistry, ConsumerState, Message};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;

/// Shared state for health endpoints
pub struct HealthState<M> {
    pub registry: Arc<ConsumerRegistry>,
    pub app_name: String,
    pub app_version: String,
    /// Queue the supervised consumer reads
    pub queue: String,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for HealthState<M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            queue: self.queue.clone(),
            _message: PhantomData,
        }
    }
}

impl<M: Message> HealthState<M> {
    pub fn new(
        registry: Arc<ConsumerRegistry>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            app_name: app_name.into(),
            app_version: app_version.into(),
            queue: queue.into(),
            _message: PhantomData,
        }
    }

    fn consumer_state(&self) -> Option<ConsumerState> {
        self.registry.state::<M>(Some(&self.queue))
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler<M: Message>(State(state): State<HealthState<M>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
pub async fn ready_handler<M: Message>(
    State(state): State<HealthState<M>>,
) -> (StatusCode, Json<Value>) {
    let current = state.consumer_state();
    let consumer = current
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unregistered".to_string());

    let status = match current {
        Some(ConsumerState::Consuming) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    let label = if status == StatusCode::OK { "ready" } else { "not_ready" };

    (
        status,
        Json(json!({
            "status": label,
            "checks": {
                "consumer": consumer,
                "queue": state.queue,
            }
        })),
    )
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with liveness, readiness and metrics endpoints
pub fn health_router<M: Message>(state: HealthState<M>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<M>))
        .route("/healthz", get(health_handler::<M>))
        .route("/ready", get(ready_handler::<M>))
        .route("/readyz", get(ready_handler::<M>))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_messaging::{
        handler_fn, ConnectionManager, ConsumeOptions, InMemoryBroker, TopologyCache,
    };
    use axum::body::Body;
    use axum::http::Request;
    use domain_clients::{routing_keys, Client};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(registry: Arc<ConsumerRegistry>) -> HealthState<Client> {
        HealthState::new(registry, "farewell", "0.1.0", routing_keys::CLIENT_DELETED)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_liveness_reports_app_info() {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(ConsumerRegistry::new(
            ConnectionManager::new(broker.connector()),
            Arc::new(TopologyCache::new()),
        ));

        let (status, body) = get_json(health_router(state(registry)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "farewell");
    }

    #[tokio::test]
    async fn test_readiness_follows_consumer_state() {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(ConsumerRegistry::new(
            ConnectionManager::new(broker.connector()),
            Arc::new(TopologyCache::new()),
        ));
        let router = health_router(state(Arc::clone(&registry)));

        let (status, body) = get_json(router.clone(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["consumer"], "unregistered");

        let session = registry.spawn_register::<Client, _>(
            handler_fn("noop", |_: Client| Ok(())),
            ConsumeOptions::for_queue(routing_keys::CLIENT_DELETED),
        );
        for _ in 0..200 {
            if registry.state::<Client>(Some(routing_keys::CLIENT_DELETED))
                == Some(ConsumerState::Consuming)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (status, body) = get_json(router, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["checks"]["queue"], "client_deleted");

        registry.unregister_all();
        assert!(session.await.unwrap().unwrap());
    }
}
