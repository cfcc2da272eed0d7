//! HTTP binding of the upload control plane: the axum router that fronts
//! `control_plane::UploadService` for `/v1/health-data`. Token verification is
//! an external collaborator; this binding trusts the `Authorization: Bearer
//! <uuid>` header as already-authenticated and treats the token value itself as
//! the caller's `user_id`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::ControlPlaneConfig;
use crate::control_plane::queue::JobQueue;
use crate::control_plane::UploadService;
use crate::domain::Upload;
use crate::error::ControlPlaneError;
use crate::pipeline::pat::PatModel;
use crate::storage::{BlobStore, StructuredStore};

/// Everything a handler needs, held behind a flat, cheaply-`Clone`-able state
/// struct: every field is an `Arc` or a small value type.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StructuredStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub control_plane_config: ControlPlaneConfig,
    pub pat_model: Arc<PatModel>,
    pub weights_verified: bool,
    pub model_integrity_verified: bool,
}

impl AppState {
    fn upload_service(&self) -> UploadService {
        UploadService::new(
            self.store.clone(),
            self.blobs.clone(),
            self.queue.clone(),
            self.control_plane_config.clone(),
        )
    }
}

/// Uniform response envelope used by every handler in this binding.
#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// RFC 7807 Problem Details: the shape every error response takes.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: String,
    title: String,
    status: u16,
    detail: String,
    instance: String,
    trace_id: Uuid,
}

impl ProblemDetails {
    fn new(status: StatusCode, title: &str, detail: String, instance: &str) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                problem_type: format!("https://errors.clarity-pat.dev/{}", title.to_lowercase().replace(' ', "-")),
                title: title.to_string(),
                status: status.as_u16(),
                detail,
                instance: instance.to_string(),
                trace_id: Uuid::new_v4(),
            }),
        )
    }
}

fn control_plane_error_response(err: ControlPlaneError, instance: &str) -> Response {
    let (status, title) = match &err {
        ControlPlaneError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation Failed"),
        ControlPlaneError::Authorization => (StatusCode::FORBIDDEN, "Not Authorized"),
        ControlPlaneError::NotFound(_) => (StatusCode::NOT_FOUND, "Resource Not Found"),
        ControlPlaneError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
        ControlPlaneError::Pipeline(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error"),
    };
    ProblemDetails::new(status, title, err.to_string(), instance).into_response()
}

/// Extracts the caller's `user_id` from `Authorization: Bearer <uuid>`. Real
/// signature/claims verification happens upstream of this crate; this only
/// parses the already-authenticated principal out of the header.
fn authenticated_user_id(headers: &HeaderMap) -> Result<Uuid, ControlPlaneError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ControlPlaneError::validation("missing Authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ControlPlaneError::validation("Authorization header must be a Bearer token"))?;
    Uuid::parse_str(token).map_err(|_| ControlPlaneError::validation("bearer token is not a valid principal id"))
}

// -- POST /v1/health-data ----------------------------------------------------

async fn accept_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(upload): Json<Upload>,
) -> Response {
    let user_id = match authenticated_user_id(&headers) {
        Ok(id) => id,
        Err(e) => return control_plane_error_response(e, "/v1/health-data"),
    };
    match state.upload_service().accept(user_id, upload).await {
        Ok(accepted) => (StatusCode::CREATED, ApiResponse::ok(accepted)).into_response(),
        Err(e) => control_plane_error_response(e, "/v1/health-data"),
    }
}

// -- GET /v1/health-data/processing/{processing_id} --------------------------

#[derive(Serialize)]
struct JobStatusResponse {
    processing_id: Uuid,
    status: String,
    total_metrics: i64,
    processed_metrics: i64,
    progress: f64,
    error: Option<String>,
}

async fn get_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(processing_id): Path<Uuid>,
) -> Response {
    let user_id = match authenticated_user_id(&headers) {
        Ok(id) => id,
        Err(e) => return control_plane_error_response(e, "/v1/health-data/processing"),
    };
    match state.upload_service().get_job(user_id, processing_id).await {
        Ok(job) => {
            let progress = if job.total_metrics > 0 {
                job.processed_metrics as f64 / job.total_metrics as f64
            } else {
                0.0
            };
            ApiResponse::ok(JobStatusResponse {
                processing_id: job.processing_id,
                status: job.status.as_str().to_string(),
                total_metrics: job.total_metrics,
                processed_metrics: job.processed_metrics,
                progress,
                error: job.error,
            })
            .into_response()
        }
        Err(e) => control_plane_error_response(e, "/v1/health-data/processing"),
    }
}

// -- GET /v1/health-data/ -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListHealthDataQuery {
    limit: Option<i64>,
    offset: Option<usize>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

async fn list_health_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListHealthDataQuery>,
) -> Response {
    let user_id = match authenticated_user_id(&headers) {
        Ok(id) => id,
        Err(e) => return control_plane_error_response(e, "/v1/health-data"),
    };
    match state.store.query_health_data(user_id, query.start_date, query.end_date).await {
        Ok(metrics) => {
            let offset = query.offset.unwrap_or(0);
            let limit = query.limit.unwrap_or(50).max(0) as usize;
            let page: Vec<_> = metrics.into_iter().skip(offset).take(limit).collect();
            ApiResponse::ok(page).into_response()
        }
        Err(e) => control_plane_error_response(ControlPlaneError::from(e), "/v1/health-data"),
    }
}

// -- DELETE /v1/health-data/{processing_id} ----------------------------------

async fn cancel_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(processing_id): Path<Uuid>,
) -> Response {
    let user_id = match authenticated_user_id(&headers) {
        Ok(id) => id,
        Err(e) => return control_plane_error_response(e, "/v1/health-data"),
    };
    match state.upload_service().cancel(user_id, processing_id).await {
        Ok(()) => (StatusCode::OK, ApiResponse::ok(serde_json::json!({"cancelled": true}))).into_response(),
        Err(e) => control_plane_error_response(e, "/v1/health-data"),
    }
}

// -- GET /health --------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Response {
    match state.store.health_check().await {
        Ok(health) => ApiResponse::ok(serde_json::json!({
            "store": health,
            "model_loaded": true,
            "weights_verified": state.weights_verified,
            "model_integrity_verified": state.model_integrity_verified,
            "pat_variant": state.pat_model.variant.as_str(),
        }))
        .into_response(),
        Err(e) => control_plane_error_response(ControlPlaneError::from(e), "/health"),
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/health-data", post(accept_upload))
        .route("/v1/health-data/", get(list_health_data))
        .route("/v1/health-data/processing/:processing_id", get(get_job_status))
        .route("/v1/health-data/:processing_id", delete(cancel_upload))
        .layer(cors)
        .with_state(state)
}
