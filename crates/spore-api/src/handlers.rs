//! REST API handlers.
//!
//! Each handler calls into the shared `Cluster` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::info;

use spore_pool::{Acquisition, PoolError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn pool_error_status(err: &PoolError) -> StatusCode {
    match err {
        PoolError::NotFound(_) => StatusCode::NOT_FOUND,
        PoolError::NotReserved(_) | PoolError::InvalidState { .. } => StatusCode::CONFLICT,
        PoolError::Provider(_) => StatusCode::BAD_GATEWAY,
        PoolError::MissingDisk(_) | PoolError::Membership { .. } | PoolError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn pool_error(err: PoolError) -> axum::response::Response {
    error_response(&err.to_string(), pool_error_status(&err)).into_response()
}

// ── Pool ───────────────────────────────────────────────────────

/// GET /api/v1/pool
pub async fn pool_stats(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.stats().await)
}

/// POST /api/v1/pool/refresh
pub async fn refresh_pool(State(state): State<ApiState>) -> impl IntoResponse {
    match state.cluster.refresh().await {
        Ok(()) => ApiResponse::ok(state.cluster.stats().await).into_response(),
        Err(e) => pool_error(e),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.instances().await)
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.cluster.find(&id).await {
        Some(instance) => ApiResponse::ok(instance.view()).into_response(),
        None => error_response("instance not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// Acquire request body.
#[derive(serde::Deserialize)]
pub struct AcquireRequest {
    pub image_id: String,
}

/// POST /api/v1/instances/acquire
pub async fn acquire_instance(
    State(state): State<ApiState>,
    Json(req): Json<AcquireRequest>,
) -> impl IntoResponse {
    match state.cluster.get_instance(&req.image_id).await {
        Acquisition::Acquired(instance) => {
            info!(instance_id = %instance.id(), image_id = %req.image_id, "instance acquired");
            ApiResponse::ok(instance.view()).into_response()
        }
        Acquisition::NoneAvailable => error_response(
            &format!("no available instance for image {}", req.image_id),
            StatusCode::NOT_FOUND,
        )
        .into_response(),
        Acquisition::Unavailable => error_response(
            "matching instance could not be reserved, retry later",
            StatusCode::CONFLICT,
        )
        .into_response(),
    }
}

/// POST /api/v1/instances/{id}/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.cluster.stop_instance(&id).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "instance_id": id,
            "status": "Stopped"
        }))
        .into_response(),
        Err(e) => pool_error(e),
    }
}
