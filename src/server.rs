//! HTTP status surface: counter dump, metrics and health.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
use crate::metrics::ThrottleMetrics;
use crate::ratelimit::LimiterPool;

#[derive(Clone)]
struct AppState {
    limiter: Arc<LimiterPool>,
    metrics: ThrottleMetrics,
}

/// Serves `/status`, `/metrics` and `/health`.
pub struct StatusServer {
    /// Address to bind to
    addr: SocketAddr,
    limiter: Arc<LimiterPool>,
    metrics: ThrottleMetrics,
}

impl StatusServer {
    pub fn new(addr: SocketAddr, limiter: Arc<LimiterPool>, metrics: ThrottleMetrics) -> Self {
        Self {
            addr,
            limiter,
            metrics,
        }
    }

    /// Routes without a listener, for embedding or tests.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(status))
            .route("/metrics", get(metrics))
            .route("/health", get(|| async { "ok" }))
            .with_state(AppState {
                limiter: self.limiter.clone(),
                metrics: self.metrics.clone(),
            })
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting status server");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "Status server failed");
                e.into()
            })
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.limiter.status(),
    )
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::ratelimit::StaticPolicySource;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn test_server() -> StatusServer {
        let source = Arc::new(StaticPolicySource::new("key: id\ndefault_limit: 2\n"));
        let limiter = Arc::new(LimiterPool::new(source, 60, 2).unwrap());
        limiter.update().await.unwrap();
        let metrics = ThrottleMetrics::new(&MetricsConfig::default()).unwrap();
        StatusServer::new("127.0.0.1:0".parse().unwrap(), limiter, metrics)
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let server = test_server().await;
        server.limiter.allow(&json!({"id": "web", "ts": "2018-12-19T19:30:25Z"}));

        let (code, body) = get_body(server.router(), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.starts_with("#web2:\n\n"));
        assert!(body.contains("[##########__________] 1/2"));
        assert!(body.contains("limit=2 selectors={}"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let server = test_server().await;
        server.metrics.observe(&json!({}), false);

        let (code, body) = get_body(server.router(), "/metrics").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.contains(r#"floodgate_throttled_events_total{throttled="n"} 1"#));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let server = test_server().await;
        let (code, body) = get_body(server.router(), "/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let server = test_server().await;
        let (code, _) = get_body(server.router(), "/nope").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
