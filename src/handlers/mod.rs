//! # API Handlers
//!
//! This module contains all the HTTP endpoint handlers for the Relay Hub API,
//! plus the service-level endpoints (root, health, metrics) that live outside
//! any resource module.

pub mod notifications;
pub mod queues;
pub mod rate_limits;
pub mod webhooks;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Json, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::crypto::GuardHealth;
use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::queue::{HealthStatus, QueueHealthReport};
use crate::server::AppState;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "service"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Component-level health report.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Overall classification: `ok` when every component passes
    pub status: String,
    /// Database connectivity: `up` or `down`
    pub database: String,
    /// Encryption round-trip result with the active key fingerprint
    pub token_guard: GuardHealth,
    /// Queue backlog classification, absent when the snapshot query fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queues: Option<QueueHealthReport>,
}

/// Liveness and component health
///
/// Pings the database, round-trips the token guard and classifies the queue
/// backlog. Always responds 200 with a component breakdown; `status` flips to
/// `degraded` when any component fails so dashboards can alert without
/// tripping restart loops.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Component health report", body = HealthResponse)
    ),
    tag = "service"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_up = crate::db::health_check(&state.db).await.is_ok();
    let token_guard = state.guard.health_check();

    let queues = match state.queues.health_check().await {
        Ok(report) => Some(report),
        Err(err) => {
            tracing::error!(error = ?err, "Queue health snapshot failed");
            None
        }
    };

    let queues_healthy = queues
        .as_ref()
        .map(|report| report.status == HealthStatus::Healthy)
        .unwrap_or(false);
    let status = if database_up && token_guard.healthy && queues_healthy {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        database: if database_up { "up" } else { "down" }.to_string(),
        token_guard,
        queues,
    })
}

/// Prometheus metrics in text exposition format
#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus text exposition", content_type = "text/plain")
    ),
    tag = "service"
)]
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let rendered = state.metrics.render();
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )
        .body(Body::from(rendered))
        .map_err(|_| crate::error::internal_error(Some("Failed to render metrics")))
}
