//! Read-only HTTP surface of the controller
//!
//! - `GET /healthz` answers `ok` while the process is up
//! - `GET /reports/{namespace}/{name}` returns the latest dispatch report

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tracing::{debug, error, info};

use aegis_common::Error;
use aegis_dispatch::{PolicyReport, ReportSink};

/// Errors answered by the report endpoint
#[derive(Debug, Error)]
pub enum ReportError {
    /// No report was written for this intent
    #[error("no report for {0}")]
    NotFound(String),

    /// Reading the report store failed
    #[error("report store: {0}")]
    Store(#[from] Error),
}

impl IntoResponse for ReportError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ReportError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ReportError::Store(e) => {
                error!(error = %e, "failed to read report");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Build the router over a report store
pub fn router(reports: Arc<dyn ReportSink>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/reports/{namespace}/{name}", get(report_handler))
        .with_state(reports)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Latest report for an intent
pub async fn report_handler(
    State(reports): State<Arc<dyn ReportSink>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<PolicyReport>, ReportError> {
    debug!(policy = %name, namespace = %namespace, "report requested");
    reports
        .read(&name, &namespace)
        .await?
        .map(Json)
        .ok_or_else(|| ReportError::NotFound(format!("{namespace}/{name}")))
}

/// Serve `router` on `addr` until `shutdown` resolves
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> aegis_common::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal_with_context("http", format!("bind {addr}: {e}")))?;
    info!(%addr, "serving health and reports");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::internal_with_context("http", e.to_string()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use aegis_dispatch::FileReportSink;

    async fn get_body(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn story_health_is_always_ok() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(Arc::new(FileReportSink::new(dir.path())));
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn story_written_report_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileReportSink::new(dir.path()));
        sink.write(&PolicyReport {
            kap_name: "web".to_string(),
            kap_namespace: "shop".to_string(),
            policy_type: "network".to_string(),
            adapter_name: "kubeaegis-cilium".to_string(),
            adapter_policies: "CiliumNetworkPolicy/cnp-web".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let (status, body) = get_body(router(sink), "/reports/shop/web").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kapName"], "web");
        assert_eq!(body["adapterPolicies"], "CiliumNetworkPolicy/cnp-web");
    }

    #[tokio::test]
    async fn story_missing_report_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_body(
            router(Arc::new(FileReportSink::new(dir.path()))),
            "/reports/shop/ghost",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no report for shop/ghost");
    }
}
