//! # Queue Administration Handlers
//!
//! Operator endpoints over the job queue manager: backlog health, per-queue
//! counters, dead-letter retry and terminal-row cleanup.

use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::{OperatorAuth, TenantHeader};
use crate::error::{ApiError, not_found};
use crate::models::job::QueueName;
use crate::queue::{QueueHealthReport, QueueMetrics};
use crate::server::AppState;

const DEFAULT_RETRY_COUNT: u64 = 100;
const DEFAULT_CLEAN_AGE_HOURS: u64 = 24;

/// Path parameter naming a queue
#[derive(Debug, Deserialize, IntoParams)]
pub struct QueuePathParam {
    /// Queue name (`webhook-processing`, `notifications`, `exports` or `sync`)
    #[param(example = "webhook-processing")]
    pub queue: String,
}

fn parse_queue(raw: &str) -> Result<QueueName, ApiError> {
    QueueName::from_str(raw).map_err(|_| not_found(&format!("queue '{raw}'")))
}

/// Counter snapshot for one queue
#[derive(Debug, Serialize, ToSchema)]
pub struct QueueMetricsResponse {
    /// Queue the snapshot describes
    pub queue: String,
    /// Point-in-time job counts by lifecycle state
    pub metrics: QueueMetrics,
}

/// Request body for the dead-letter retry endpoint
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RetryFailedRequest {
    /// Maximum number of failed jobs to requeue (default 100)
    pub count: Option<u64>,
}

/// Result of a dead-letter retry
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryFailedResponse {
    /// Queue the retry ran against
    pub queue: String,
    /// Jobs returned to `waiting` with a fresh attempt budget
    pub retried: u64,
}

/// Request body for the terminal-row cleanup endpoint
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CleanJobsRequest {
    /// Age threshold in hours (default 24)
    pub max_age_hours: Option<u64>,
}

/// Result of a cleanup pass
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CleanJobsResponse {
    /// Terminal rows deleted across all queues
    pub removed: u64,
}

/// Queue backlog health
///
/// Classifies the whole queue system from per-queue counters against the
/// backlog thresholds. `degraded` lists the offending queues in `issues`.
#[utoipa::path(
    get,
    path = "/queues/health",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Backlog classification", body = QueueHealthReport),
        (status = 401, description = "Missing or invalid operator token", body = ApiError)
    ),
    tag = "queues"
)]
pub async fn queue_health(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<QueueHealthReport>, ApiError> {
    let report = state.queues.health_check().await?;
    Ok(Json(report))
}

/// Counter snapshot for one queue
#[utoipa::path(
    get,
    path = "/queues/{queue}/metrics",
    security(("bearer_auth" = [])),
    params(TenantHeader, QueuePathParam),
    responses(
        (status = 200, description = "Job counts by state", body = QueueMetricsResponse),
        (status = 401, description = "Missing or invalid operator token", body = ApiError),
        (status = 404, description = "Unknown queue", body = ApiError)
    ),
    tag = "queues"
)]
pub async fn queue_metrics(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(params): Path<QueuePathParam>,
) -> Result<Json<QueueMetricsResponse>, ApiError> {
    let queue = parse_queue(&params.queue)?;
    let metrics = state.queues.metrics_snapshot(queue).await?;
    Ok(Json(QueueMetricsResponse {
        queue: queue.as_str().to_string(),
        metrics,
    }))
}

/// Requeue dead-lettered jobs
///
/// Moves up to `count` failed jobs back to `waiting` with a reset attempt
/// budget, oldest failure first.
#[utoipa::path(
    post,
    path = "/queues/{queue}/retry-failed",
    security(("bearer_auth" = [])),
    params(TenantHeader, QueuePathParam),
    request_body(content = RetryFailedRequest, content_type = "application/json"),
    responses(
        (status = 200, description = "Retry finished", body = RetryFailedResponse),
        (status = 401, description = "Missing or invalid operator token", body = ApiError),
        (status = 404, description = "Unknown queue", body = ApiError)
    ),
    tag = "queues"
)]
pub async fn retry_failed(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(params): Path<QueuePathParam>,
    body: Option<Json<RetryFailedRequest>>,
) -> Result<Json<RetryFailedResponse>, ApiError> {
    let queue = parse_queue(&params.queue)?;
    let count = body
        .map(|Json(inner)| inner)
        .unwrap_or_default()
        .count
        .unwrap_or(DEFAULT_RETRY_COUNT);

    let retried = state.queues.retry_failed_jobs(queue, count).await?;
    Ok(Json(RetryFailedResponse {
        queue: queue.as_str().to_string(),
        retried,
    }))
}

/// Delete old terminal jobs
///
/// Removes completed and failed rows that finished more than `max_age_hours`
/// ago, across all queues. The per-queue keep budgets already bound table
/// growth; this reclaims the remainder.
#[utoipa::path(
    post,
    path = "/queues/clean",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    request_body(content = CleanJobsRequest, content_type = "application/json"),
    responses(
        (status = 200, description = "Cleanup finished", body = CleanJobsResponse),
        (status = 401, description = "Missing or invalid operator token", body = ApiError)
    ),
    tag = "queues"
)]
pub async fn clean_jobs(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    body: Option<Json<CleanJobsRequest>>,
) -> Result<Json<CleanJobsResponse>, ApiError> {
    let hours = body
        .map(|Json(inner)| inner)
        .unwrap_or_default()
        .max_age_hours
        .unwrap_or(DEFAULT_CLEAN_AGE_HOURS);

    let removed = state
        .queues
        .clean_old_jobs(Duration::from_secs(hours * 3600))
        .await?;

    Ok(Json(CleanJobsResponse { removed }))
}
