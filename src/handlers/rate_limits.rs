//! # Rate Limit Handlers
//!
//! Operator visibility into a tenant's sliding windows, plus a manual reset
//! for support escalations.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension, TenantHeader};
use crate::error::{ApiError, not_found};
use crate::rate_limit::EndpointUsage;
use crate::repositories::TenantRepository;
use crate::server::AppState;

/// Path parameter naming a rate-limited endpoint
#[derive(Debug, Deserialize, IntoParams)]
pub struct EndpointPathParam {
    /// Endpoint label the window is keyed on
    #[param(example = "notifications")]
    pub endpoint: String,
}

/// Active windows for a tenant
#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitsResponse {
    /// Tenant the windows belong to
    pub tenant_id: Uuid,
    /// One entry per endpoint with an active window
    pub endpoints: Vec<EndpointUsage>,
}

/// Result of a manual window reset
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResetRateLimitResponse {
    /// Endpoint whose window was addressed
    pub endpoint: String,
    /// Whether a window existed and was removed
    pub cleared: bool,
}

/// List the tenant's active rate-limit windows
#[utoipa::path(
    get,
    path = "/rate-limits",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Current window usage", body = RateLimitsResponse),
        (status = 401, description = "Missing or invalid operator token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError),
        (status = 503, description = "Coordination store unavailable", body = ApiError)
    ),
    tag = "rate-limits"
)]
pub async fn list_rate_limits(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
) -> Result<Json<RateLimitsResponse>, ApiError> {
    let tenant_id = tenant.0;

    let tenants = TenantRepository::new(state.db.clone());
    let tenant_row = tenants
        .find_by_id(tenant_id)
        .await?
        .ok_or_else(|| not_found(&format!("tenant {tenant_id}")))?;

    let endpoints = state
        .limiter
        .tenant_snapshot(tenant_id, tenant_row.plan)
        .await?;

    Ok(Json(RateLimitsResponse {
        tenant_id,
        endpoints,
    }))
}

/// Clear one endpoint's window for the tenant
///
/// The next request starts a fresh window. `cleared` is false when no window
/// was active.
#[utoipa::path(
    delete,
    path = "/rate-limits/{endpoint}",
    security(("bearer_auth" = [])),
    params(TenantHeader, EndpointPathParam),
    responses(
        (status = 200, description = "Reset outcome", body = ResetRateLimitResponse),
        (status = 401, description = "Missing or invalid operator token", body = ApiError),
        (status = 503, description = "Coordination store unavailable", body = ApiError)
    ),
    tag = "rate-limits"
)]
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(params): Path<EndpointPathParam>,
) -> Result<Json<ResetRateLimitResponse>, ApiError> {
    let cleared = state.limiter.reset(tenant.0, &params.endpoint).await?;

    Ok(Json(ResetRateLimitResponse {
        endpoint: params.endpoint,
        cleared,
    }))
}
