//! CRUD handlers for scheduled jobs.
//!
//! Every write goes store-first: the handler validates, persists, then
//! publishes a mutation so the scheduler engine picks up the change. A PUT
//! whose only effective change is the `suspended` flag publishes a
//! pause/resume instead of a full update.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;
use utoipa::ToSchema;

use ecss_core::validate::{validate_create, validate_update};
use ecss_core::{Job, SchedulerError};

use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 10;

// ── Error mapping ────────────────────────────────────────────────────

/// Wrapper mapping the error taxonomy onto HTTP responses.
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = match self.0.field_errors() {
            Some(fields) => json!({ "message": "validation failed", "errors": fields }),
            None => json!({ "message": self.0.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

// ── Response shapes ──────────────────────────────────────────────────

#[derive(Debug, Serialize, ToSchema)]
pub struct JobLink {
    pub rel: &'static str,
    pub title: String,
    pub href: String,
}

fn job_link(job_id: &str) -> JobLink {
    JobLink {
        rel: "item",
        title: format!("Job for {job_id}"),
        href: format!("/jobs/{job_id}"),
    }
}

/// Body returned after a committed create/update.
#[derive(Debug, Serialize, ToSchema)]
pub struct CommittedResponse {
    pub id: String,
    pub link: JobLink,
}

fn committed(job_id: &str) -> CommittedResponse {
    CommittedResponse {
        id: job_id.to_string(),
        link: job_link(job_id),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobsPage {
    #[schema(value_type = Vec<Object>)]
    pub jobs: Vec<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub skip: Option<i64>,
    pub count: Option<i64>,
}

/// Link for an adjacent page frame, or `None` when the frame is empty.
/// Default-valued parameters are stripped from the query string.
fn page_link(skip: i64, count: i64, total: i64) -> Option<String> {
    if total <= 0 || skip + count <= 0 || skip >= total {
        return None;
    }
    let skip = skip.max(0);
    let mut params = Vec::new();
    if skip != 0 {
        params.push(format!("skip={skip}"));
    }
    if count != DEFAULT_PAGE_SIZE {
        params.push(format!("count={count}"));
    }
    if params.is_empty() {
        Some("/jobs".to_string())
    } else {
        Some(format!("/jobs?{}", params.join("&")))
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// List scheduled jobs, paginated in id order.
#[utoipa::path(
    get,
    path = "/jobs",
    tag = "jobs",
    params(
        ("skip" = Option<i64>, Query, description = "Number of jobs to skip"),
        ("count" = Option<i64>, Query, description = "Number of jobs to return"),
    ),
    responses(
        (status = 200, description = "Paginated list of scheduled jobs", body = JobsPage),
    ),
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Json<JobsPage> {
    let skip = query.skip.unwrap_or(0).max(0);
    let count = query.count.unwrap_or(DEFAULT_PAGE_SIZE).max(0);
    let page = state.store.list(skip as usize, count as usize).await;
    let total = page.total as i64;
    Json(JobsPage {
        jobs: page.items,
        next: page_link(skip + count, count, total),
        prev: page_link(skip - count, count, total),
    })
}

/// Create a new scheduled job.
#[utoipa::path(
    post,
    path = "/jobs",
    tag = "jobs",
    request_body = Object,
    responses(
        (status = 201, description = "Job created and scheduled", body = CommittedResponse),
        (status = 409, description = "Job already exists"),
        (status = 422, description = "Invalid body"),
    ),
)]
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<CommittedResponse>), ApiError> {
    let job = validate_create(&body)?;
    let created = state.store.create(job).await?;
    state.mutations.created(&created);
    Ok((StatusCode::CREATED, Json(committed(&created.id))))
}

/// Fetch a single job.
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "The job for the given id", body = Object),
        (status = 404, description = "Job not found"),
    ),
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.store.get(&id).await?;
    Ok(Json(job))
}

/// Partially update a job. Missing top-level fields keep prior values.
#[utoipa::path(
    put,
    path = "/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    request_body = Object,
    responses(
        (status = 200, description = "Job updated and rescheduled", body = CommittedResponse),
        (status = 404, description = "Job not found"),
        (status = 422, description = "Invalid body"),
    ),
)]
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<CommittedResponse>, ApiError> {
    let current = state.store.get(&id).await?;
    let patch = validate_update(&body)?;
    let suspension = patch.suspension_only(&current);
    let updated = state.store.update(&id, &patch).await?;
    match suspension {
        Some(true) => state.mutations.paused(&id),
        Some(false) => state.mutations.resumed(&id),
        None => state.mutations.updated(&updated),
    }
    Ok(Json(committed(&id)))
}

/// Delete and unschedule a job.
#[utoipa::path(
    delete,
    path = "/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 204, description = "Job deleted"),
        (status = 404, description = "Job not found"),
    ),
)]
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(&id).await?;
    state.mutations.deleted(&id);
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ────────────────────────────────────────────────────────────
