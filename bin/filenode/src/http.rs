//! Diagnostic HTTP endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use filenode_common::{Error, Key};
use filenode_index::{CheckResult, FileIndex, GroupInfo, IndexStats, SpaceInfo};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Index error rendered as a JSON response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = serde_json::json!({
            "error": status.as_u16().to_string(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct CheckParams {
    #[serde(default)]
    fix: bool,
}

pub fn router(index: Arc<FileIndex>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stat/check/{group_id}", get(check))
        .route("/stat/group/{group_id}", get(group_info))
        .route("/stat/space/{group_id}/{space_id}", get(space_info))
        .route("/stat/index", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(index)
}

async fn health() -> &'static str {
    "OK"
}

/// GET /stat/check/{group_id}?fix=true
async fn check(
    State(index): State<Arc<FileIndex>>,
    Path(group_id): Path<String>,
    Query(params): Query<CheckParams>,
) -> Result<Json<Vec<CheckResult>>> {
    Ok(Json(index.check(&Key::group(group_id), params.fix).await?))
}

async fn group_info(
    State(index): State<Arc<FileIndex>>,
    Path(group_id): Path<String>,
) -> Result<Json<GroupInfo>> {
    Ok(Json(index.group_info(&group_id).await?))
}

async fn space_info(
    State(index): State<Arc<FileIndex>>,
    Path((group_id, space_id)): Path<(String, String)>,
) -> Result<Json<SpaceInfo>> {
    Ok(Json(index.space_info(&Key::new(group_id, space_id)).await?))
}

async fn stats(State(index): State<Arc<FileIndex>>) -> Result<Json<IndexStats>> {
    Ok(Json(index.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use filenode_common::config::IndexConfig;
    use filenode_store::{MemoryBlockStore, MemoryStore, RedbIndexStore};
    use tower::ServiceExt;

    fn test_router(dir: &tempfile::TempDir) -> Router {
        let index = FileIndex::new(
            IndexConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBlockStore::new()),
            Arc::new(RedbIndexStore::open(dir.path().join("index.redb")).unwrap()),
        );
        router(Arc::new(index))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_router(&dir)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_check_unknown_group() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(test_router(&dir), "/stat/check/nope?fix=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_space_info() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(test_router(&dir), "/stat/space/g/s").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["space_usage_bytes"], 0);
        assert_eq!(body["limit_bytes"], IndexConfig::default().default_limit);
    }

    #[test]
    fn test_error_status() {
        let response = ApiError(Error::NotEnoughSpace).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = ApiError(Error::LockNotAcquired("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
