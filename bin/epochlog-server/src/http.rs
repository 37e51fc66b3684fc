//! Admin HTTP surface

use crate::admin::{AdminApi, SnapshotOutcome};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use epochlog_common::{Error, LogId, Result};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Error body of every failed admin call
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = serde_json::json!({
            "status": self.0.status_name(),
            "message": self.0.to_string(),
        });
        if let Error::Preempted { by, epoch } = &self.0 {
            body["redirect"] = serde_json::json!({ "node": by, "epoch": epoch });
        }
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for SnapshotOutcome {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Ok { .. } | Self::UpToDate { .. } => StatusCode::OK,
            Self::NodeNotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::StaleVersion { .. } => StatusCode::CONFLICT,
            Self::OperationError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotParams {
    #[serde(default)]
    pub min_version: u64,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// GET /status
async fn status(State(api): State<Arc<AdminApi>>) -> impl IntoResponse {
    Json(api.status().await)
}

/// GET /log-tree-info
async fn log_tree_info(State(api): State<Arc<AdminApi>>) -> impl IntoResponse {
    Json(api.log_tree_info())
}

/// GET /cluster-name
async fn cluster_name(State(api): State<Arc<AdminApi>>) -> impl IntoResponse {
    Json(serde_json::json!({ "name": api.cluster_name() }))
}

/// GET /config
async fn config(State(api): State<Arc<AdminApi>>) -> impl IntoResponse {
    Json(api.config().clone())
}

/// GET /replication-info
async fn replication_info(State(api): State<Arc<AdminApi>>) -> impl IntoResponse {
    Json(api.replication_info())
}

/// POST /snapshot/event-log?min_version=
async fn snapshot_event_log(
    State(api): State<Arc<AdminApi>>,
    Query(params): Query<SnapshotParams>,
) -> SnapshotOutcome {
    api.take_event_log_snapshot(params.min_version).await
}

/// POST /snapshot/maintenance-log?min_version=
async fn snapshot_maintenance_log(
    State(api): State<Arc<AdminApi>>,
    Query(params): Query<SnapshotParams>,
) -> SnapshotOutcome {
    api.take_maintenance_log_snapshot(params.min_version).await
}

async fn event_log(State(api): State<Arc<AdminApi>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(api.event_log_state().await?))
}

async fn maintenance_log(State(api): State<Arc<AdminApi>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(api.maintenance_log_state().await?))
}

/// GET /sequencers/{log_id}
async fn sequencer_state(
    State(api): State<Arc<AdminApi>>,
    Path(log_id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(api.sequencer_state(LogId::new(log_id)).await?))
}

/// POST /sequencers/{log_id}/activate
async fn activate_sequencer(
    State(api): State<Arc<AdminApi>>,
    Path(log_id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(api.activate_sequencer(LogId::new(log_id)).await?))
}

/// GET /metrics
async fn metrics(State(api): State<Arc<AdminApi>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        api.metrics(),
    )
}

pub fn router(api: Arc<AdminApi>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/log-tree-info", get(log_tree_info))
        .route("/cluster-name", get(cluster_name))
        .route("/config", get(config))
        .route("/replication-info", get(replication_info))
        .route("/snapshot/event-log", post(snapshot_event_log))
        .route("/snapshot/maintenance-log", post(snapshot_maintenance_log))
        .route("/event-log", get(event_log))
        .route("/maintenance-log", get(maintenance_log))
        .route("/sequencers/{log_id}", get(sequencer_state))
        .route("/sequencers/{log_id}/activate", post(activate_sequencer))
        .route("/metrics", get(metrics))
        .with_state(api)
}

/// Serve `router` on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    info!("Admin API listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use epochlog_common::Config;
    use tower::ServiceExt;

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let server = Server::start(Config::default()).await.unwrap();
        let router = router(server.admin());

        let (status, body) = call(&router, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ALIVE");
        assert_eq!(body["cluster"], "epochlog");
        assert_eq!(body["event_log_loaded"], true);

        let (status, body) = call(&router, "GET", "/log-tree-info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], server.config().logs.version);

        let (_, body) = call(&router, "GET", "/cluster-name").await;
        assert_eq!(body["name"], "epochlog");

        let (status, body) = call(&router, "GET", "/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sequencer"]["workers"], server.config().sequencer.workers);

        let (status, body) = call(&router, "GET", "/replication-info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["smallest_replication_factor"], 2);
        assert_eq!(body["tolerable_failure_domains"]["domain"], "node");
        assert_eq!(body["tolerable_failure_domains"]["count"], 1);

        let (status, body) = call(&router, "GET", "/sequencers/7").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "NOSEQUENCER");

        let (status, body) = call(&router, "POST", "/sequencers/7/activate").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["log"], 7);

        let (status, body) = call(&router, "GET", "/sequencers/7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node"], 0);

        let (status, _) = call(&router, "POST", "/sequencers/5000/activate").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&router, "POST", "/snapshot/event-log?min_version=999999").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "STALE_VERSION");

        let response = router
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let text = String::from_utf8(text.to_vec()).unwrap();
        assert!(text.contains("epochlog_sequencer_activations_total 1"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_warns_on_failing_shard() {
        let mut config = Config::default();
        config.storage.failing_shards = vec![0];
        let server = Server::start(config).await.unwrap();
        let (status, body) = call(&router(server.admin()), "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "WARNING");
        assert_eq!(body["failing_shards"].as_array().map(Vec::len), Some(1));
        server.shutdown().await;
    }
}
