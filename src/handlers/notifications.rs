//! # Notification Handlers
//!
//! Operator endpoints for creating notifications and inspecting their
//! dispatch state. Creation is rate limited by the tenant's plan tier; the
//! decision's window numbers ride on the response headers either way.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::info;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension, TenantHeader};
use crate::error::{ApiError, not_found, rate_limited, validation_error};
use crate::models::job::QueueName;
use crate::models::notification::{self, NotificationKind, NotificationStatus};
use crate::queue::{AddJobOptions, NotificationJobPayload};
use crate::rate_limit::RateLimitDecision;
use crate::repositories::{NotificationRepository, TenantRepository};
use crate::server::AppState;

/// Endpoint label the notification-create window is keyed on.
const NOTIFICATIONS_ENDPOINT: &str = "notifications";

/// Request body for creating a notification
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateNotificationRequest {
    /// Transport to dispatch on
    pub kind: NotificationKind,
    /// Transport-specific payload (bot expects `chat_id` and `text`)
    pub payload: JsonValue,
}

/// Path parameter for notification lookups
#[derive(Debug, Deserialize, IntoParams)]
pub struct NotificationPathParam {
    /// Notification identifier
    #[param(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: String,
}

/// Notification state as returned by the API
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NotificationInfo {
    /// Notification identifier
    pub id: Uuid,
    /// Transport kind
    pub kind: NotificationKind,
    /// Dispatch lifecycle state
    pub status: NotificationStatus,
    /// Transport-specific payload
    pub payload: JsonValue,
    /// Dispatch attempts made so far
    pub attempts: i32,
    /// Attempt budget before dead-lettering
    pub max_attempts: i32,
    /// Most recent dispatch error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Earliest time the next dispatch attempt will run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<String>,
    /// When the notification went out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    /// Creation timestamp
    pub created_at: String,
}

impl From<notification::Model> for NotificationInfo {
    fn from(model: notification::Model) -> Self {
        Self {
            id: model.id,
            kind: model.kind,
            status: model.status,
            payload: model.payload,
            attempts: model.attempts,
            max_attempts: model.max_attempts,
            error_message: model.error_message,
            next_retry_at: model.next_retry_at.map(|ts| ts.to_rfc3339()),
            sent_at: model.sent_at.map(|ts| ts.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// Standard rate-limit headers describing the decision's window.
fn rate_limit_headers(decision: &RateLimitDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let entries = [
        ("X-RateLimit-Limit", decision.limit.to_string()),
        ("X-RateLimit-Remaining", decision.remaining.to_string()),
        ("X-RateLimit-Reset", decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Create a notification
///
/// Persists the notification and enqueues its dispatch job. The call is rate
/// limited per tenant and plan tier; window headers are present on both the
/// 201 and the 429.
#[utoipa::path(
    post,
    path = "/notifications",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    request_body = CreateNotificationRequest,
    responses(
        (status = 201, description = "Notification created", body = NotificationInfo),
        (status = 401, description = "Missing or invalid operator token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError),
        (status = 429, description = "Plan rate limit exceeded", body = ApiError)
    ),
    tag = "notifications"
)]
pub async fn create_notification(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<Response, ApiError> {
    let tenant_id = tenant.0;

    let tenants = TenantRepository::new(state.db.clone());
    let tenant_row = tenants
        .find_by_id(tenant_id)
        .await?
        .ok_or_else(|| not_found(&format!("tenant {tenant_id}")))?;

    let decision = state
        .limiter
        .check(tenant_id, NOTIFICATIONS_ENDPOINT, tenant_row.plan)
        .await;
    let headers = rate_limit_headers(&decision);

    if !decision.allowed {
        let retry_after = (decision.reset_at - Utc::now()).num_seconds().max(0) as u64;
        let mut response = rate_limited(retry_after).into_response();
        response.headers_mut().extend(headers);
        return Ok(response);
    }

    let max_attempts = state.queues.settings(QueueName::Notifications).max_attempts;
    let notifications = NotificationRepository::new(state.db.clone());
    let created = notifications
        .create(tenant_id, request.kind, request.payload, max_attempts)
        .await?;

    let job_payload = NotificationJobPayload {
        notification_id: created.id,
    };
    state
        .queues
        .add_job(
            QueueName::Notifications,
            job_payload.to_json(),
            AddJobOptions {
                job_key: Some(job_payload.job_key()),
                ..Default::default()
            },
        )
        .await?;

    info!(
        notification_id = %created.id,
        tenant_id = %tenant_id,
        kind = created.kind.as_str(),
        "Notification accepted for dispatch"
    );

    let mut response =
        (StatusCode::CREATED, Json(NotificationInfo::from(created))).into_response();
    response.headers_mut().extend(headers);
    Ok(response)
}

/// Fetch one notification
///
/// Lookup is scoped to the requesting tenant; other tenants' notifications
/// read as missing.
#[utoipa::path(
    get,
    path = "/notifications/{id}",
    security(("bearer_auth" = [])),
    params(TenantHeader, NotificationPathParam),
    responses(
        (status = 200, description = "Notification state", body = NotificationInfo),
        (status = 401, description = "Missing or invalid operator token", body = ApiError),
        (status = 404, description = "Notification not found", body = ApiError)
    ),
    tag = "notifications"
)]
pub async fn get_notification(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(params): Path<NotificationPathParam>,
) -> Result<Json<NotificationInfo>, ApiError> {
    let id = params.id.parse::<Uuid>().map_err(|_| {
        validation_error(
            "Invalid notification ID",
            json!({ "id": "Must be a valid UUID" }),
        )
    })?;

    let notifications = NotificationRepository::new(state.db.clone());
    let found = notifications
        .find_for_tenant(id, tenant.0)
        .await?
        .ok_or_else(|| not_found(&format!("notification {id}")))?;

    Ok(Json(NotificationInfo::from(found)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use tower::ServiceExt;

    use crate::config::{AppConfig, RateLimitConfig};
    use crate::models::tenant::PlanTier;
    use crate::repositories::JobRepository;
    use crate::server::{create_app, create_test_app_state};

    async fn setup_app(config: AppConfig) -> (AppState, Router) {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("Failed to connect to test database");
        Migrator::up(&db, None)
            .await
            .expect("Failed to run migrations");

        let state = create_test_app_state(config, db);
        let app = create_app(state.clone());
        (state, app)
    }

    fn operator_config() -> AppConfig {
        AppConfig {
            operator_tokens: vec!["op-token".to_string()],
            ..Default::default()
        }
    }

    async fn seed_tenant(state: &AppState, plan: PlanTier) -> Uuid {
        let tenants = TenantRepository::new(state.db.clone());
        let tenant = tenants
            .create(Some("Test Tenant".to_string()), plan)
            .await
            .expect("Failed to seed tenant");
        tenant.id
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        tenant_id: Uuid,
        body: Option<JsonValue>,
    ) -> axum::response::Response {
        let builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", "Bearer op-token")
            .header("X-Tenant-Id", tenant_id.to_string());
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> JsonValue {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_returns_created_with_window_headers() {
        let (state, app) = setup_app(operator_config()).await;
        let tenant_id = seed_tenant(&state, PlanTier::Free).await;

        let response = send(
            app,
            "POST",
            "/notifications",
            tenant_id,
            Some(json!({"kind": "bot", "payload": {"chat_id": "-100", "text": "deploy done"}})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let limit = response
            .headers()
            .get("X-RateLimit-Limit")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let remaining = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        assert_eq!(limit.as_deref(), Some("100"));
        assert_eq!(remaining.as_deref(), Some("99"));

        let body = body_json(response).await;
        assert_eq!(body["status"], json!("pending"));
        assert_eq!(body["kind"], json!("bot"));
        assert_eq!(body["attempts"], json!(0));
        assert_eq!(body["max_attempts"], json!(5));

        // The dispatch job is enqueued under the dedup key.
        let id = body["id"].as_str().unwrap();
        let jobs = JobRepository::new(state.db.clone());
        let job = jobs
            .find_by_key(QueueName::Notifications, &format!("notification-{id}"))
            .await
            .expect("Failed to query jobs")
            .expect("dispatch job exists");
        let payload = NotificationJobPayload::from_json(&job.payload).expect("payload decodes");
        assert_eq!(payload.notification_id.to_string(), id);
    }

    #[tokio::test]
    async fn create_rejects_unknown_tenant() {
        let (_state, app) = setup_app(operator_config()).await;

        let response = send(
            app,
            "POST",
            "/notifications",
            Uuid::new_v4(),
            Some(json!({"kind": "bot", "payload": {}})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], json!("NOT_FOUND"));
    }

    #[tokio::test]
    async fn breached_window_returns_429_with_headers() {
        let config = AppConfig {
            rate_limit: RateLimitConfig {
                free_max: 2,
                ..Default::default()
            },
            ..operator_config()
        };
        let (state, app) = setup_app(config).await;
        let tenant_id = seed_tenant(&state, PlanTier::Free).await;

        let request_body = json!({"kind": "bot", "payload": {"chat_id": "1", "text": "x"}});
        for _ in 0..2 {
            let response = send(
                app.clone(),
                "POST",
                "/notifications",
                tenant_id,
                Some(request_body.clone()),
            )
            .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = send(
            app,
            "POST",
            "/notifications",
            tenant_id,
            Some(request_body),
        )
        .await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("Retry-After"));
        let remaining = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        assert_eq!(remaining.as_deref(), Some("0"));

        let body = body_json(response).await;
        assert_eq!(body["code"], json!("RATE_LIMITED"));
    }

    #[tokio::test]
    async fn lookup_is_tenant_scoped() {
        let (state, app) = setup_app(operator_config()).await;
        let owner = seed_tenant(&state, PlanTier::Pro).await;
        let other = seed_tenant(&state, PlanTier::Pro).await;

        let response = send(
            app.clone(),
            "POST",
            "/notifications",
            owner,
            Some(json!({"kind": "email", "payload": {"to": "ops@example.com"}})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap().to_owned();

        let response = send(
            app.clone(),
            "GET",
            &format!("/notifications/{id}"),
            other,
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(app, "GET", &format!("/notifications/{id}"), owner, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], json!(id));
        assert_eq!(body["status"], json!("pending"));
    }

    #[tokio::test]
    async fn lookup_rejects_malformed_id() {
        let (state, app) = setup_app(operator_config()).await;
        let tenant_id = seed_tenant(&state, PlanTier::Free).await;

        let response = send(app, "GET", "/notifications/not-a-uuid", tenant_id, None).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], json!("VALIDATION_FAILED"));
    }
}
