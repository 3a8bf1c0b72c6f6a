//! REST endpoints.
//!
//! Every request authenticates with the opaque `X-User-ID` header; handlers
//! delegate straight to the scheduler facade and translate its errors into
//! status codes. No scheduling logic lives here.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use tileflow_core::types::{Job, JobCreate, Workflow, WorkflowCreate};
use tileflow_core::{Scheduler, SchedulerError};

pub fn router(scheduler: Arc<Scheduler>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/:workflow_id/jobs", get(list_jobs))
        .route("/jobs", post(create_job))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/cancel", post(cancel_job))
        .route("/jobs/:job_id/result", get(download_result))
        .with_state(scheduler)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ── Caller identity ──

/// Opaque caller identity from the `X-User-ID` header. Missing or empty
/// header is a 400; nothing here validates who the user is.
pub struct UserId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| ApiError::bad_request("X-User-ID header is required"))
    }
}

// ── Error mapping ──

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn not_found(message: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.to_string(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        if err.is_not_found() {
            return ApiError::not_found("not found");
        }
        match err {
            SchedulerError::ShuttingDown => ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: err.to_string(),
            },
            other => {
                tracing::error!("internal scheduler error: {other}");
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// ── Workflows ──

async fn create_workflow(
    State(scheduler): State<Arc<Scheduler>>,
    UserId(user_id): UserId,
    Json(payload): Json<WorkflowCreate>,
) -> Result<Json<Workflow>, ApiError> {
    let wf = scheduler.create_workflow(&user_id, &payload.name).await?;
    Ok(Json(wf))
}

async fn list_workflows(
    State(scheduler): State<Arc<Scheduler>>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    Ok(Json(scheduler.list_workflows(&user_id).await?))
}

async fn list_jobs(
    State(scheduler): State<Arc<Scheduler>>,
    UserId(user_id): UserId,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(scheduler.list_jobs(&user_id, workflow_id).await?))
}

// ── Jobs ──

async fn create_job(
    State(scheduler): State<Arc<Scheduler>>,
    UserId(user_id): UserId,
    Json(payload): Json<JobCreate>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(scheduler.enqueue_job(&user_id, payload).await?))
}

async fn get_job(
    State(scheduler): State<Arc<Scheduler>>,
    UserId(user_id): UserId,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(scheduler.get_job(&user_id, job_id).await?))
}

async fn cancel_job(
    State(scheduler): State<Arc<Scheduler>>,
    UserId(user_id): UserId,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(scheduler.cancel_job(&user_id, job_id).await?))
}

/// Stream the result artifact. 404 until the job has one.
async fn download_result(
    State(scheduler): State<Arc<Scheduler>>,
    UserId(user_id): UserId,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = scheduler.get_job(&user_id, job_id).await?;
    let result_path = job
        .result_path
        .ok_or_else(|| ApiError::not_found("result not ready"))?;

    let file = tokio::fs::File::open(&result_path)
        .await
        .map_err(|_| ApiError::not_found("result not ready"))?;

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}
