//! # Webhook Ingestion Handlers
//!
//! Public endpoints that accept provider callbacks, plus the operator sweep
//! that re-enqueues events whose processing job never materialized.
//!
//! The ingestion contract is persist-then-acknowledge: the event row must be
//! durable before the 200 goes out, and the processing job is enqueued on a
//! detached task afterwards so a queue hiccup can never cost the payload.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{error, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantHeader};
use crate::config::AppConfig;
use crate::crypto::verify_webhook_signature;
use crate::error::{ApiError, not_found, validation_error};
use crate::models::ProviderKind;
use crate::models::job::QueueName;
use crate::queue::{AddJobOptions, WebhookJobPayload};
use crate::reconcile::derive_event_type;
use crate::repositories::WebhookEventRepository;
use crate::server::AppState;

/// Header carrying the sender's HMAC over the raw body.
const SIGNATURE_HEADER: &str = "X-Signature";

/// Largest payload we are willing to buffer.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Sweep defaults when the operator sends no body.
const DEFAULT_SWEEP_AGE_SECS: u64 = 300;
const DEFAULT_SWEEP_LIMIT: u64 = 100;

/// Path parameter for untenanted webhook routes
#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderPathParam {
    /// Provider kind (`crm`, `telephony` or `bot`)
    #[param(example = "crm")]
    pub provider: String,
}

/// Path parameters for tenant-pinned webhook routes
#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderTenantPath {
    /// Provider kind (`crm`, `telephony` or `bot`)
    #[param(example = "crm")]
    pub provider: String,
    /// Tenant the callback URL was issued for
    #[param(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub tenant_id: String,
}

/// Acknowledgement returned once the event row is durable
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    /// Always true; senders only need receipt confirmation
    pub received: bool,
}

/// Request body for the requeue sweep
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RequeueRequest {
    /// Only events received more than this many seconds ago are swept
    /// (default 300)
    pub older_than_secs: Option<u64>,
    /// Maximum number of events to requeue in one sweep (default 100)
    pub limit: Option<u64>,
}

/// Result of the requeue sweep
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RequeueResponse {
    /// Events that received a fresh processing job
    pub requeued: u64,
}

fn parse_provider(raw: &str) -> Result<ProviderKind, ApiError> {
    ProviderKind::from_str(raw).map_err(|_| not_found(&format!("provider '{raw}'")))
}

/// Enforces the signature policy for one provider.
///
/// With a secret configured the `X-Signature` header is mandatory and must
/// verify over the raw body. Without one the payload is accepted as-is; the
/// warning keeps the gap visible in logs until the secret is provisioned.
fn check_signature(
    config: &AppConfig,
    source: ProviderKind,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<String>, ApiError> {
    let presented = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let Some(secret) = config.webhook_secret(source) else {
        warn!(
            provider = %source,
            "No webhook secret configured; accepting unsigned payload"
        );
        return Ok(presented);
    };

    let Some(signature) = presented else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "INVALID_SIGNATURE",
            "Missing X-Signature header",
        ));
    };

    verify_webhook_signature(secret, body, &signature).map_err(|err| {
        warn!(provider = %source, error = %err, "Webhook signature rejected");
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "INVALID_SIGNATURE",
            "Webhook signature verification failed",
        )
    })?;

    Ok(Some(signature))
}

fn parse_payload(bytes: &[u8]) -> Result<JsonValue, ApiError> {
    if bytes.is_empty() {
        // Some providers probe endpoints with empty POSTs.
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes).map_err(|_| {
        validation_error(
            "Invalid webhook payload",
            json!({ "body": "Payload must be valid JSON" }),
        )
    })
}

/// Shared ingestion path for both public routes.
async fn ingest(
    state: AppState,
    source: ProviderKind,
    tenant_id: Option<Uuid>,
    request: Request,
) -> Result<Json<WebhookAck>, ApiError> {
    let headers = request.headers().clone();
    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| {
            validation_error(
                "Invalid webhook payload",
                json!({ "body": "Failed to read request body" }),
            )
        })?;

    let signature = check_signature(&state.config, source, &headers, &body)?;
    let payload = parse_payload(&body)?;
    let event_type = derive_event_type(source, &payload);

    let events = WebhookEventRepository::new(state.db.clone());
    let event = events
        .insert_event(source, event_type, payload, signature, tenant_id)
        .await?;

    let metric_labels = vec![("provider", source.as_str().to_string())];
    counter!("webhook_events_received_total", &metric_labels).increment(1);

    // The row is durable, so acknowledge now. The enqueue runs detached;
    // if it fails the event stays visible to the requeue sweep.
    let queues = Arc::clone(&state.queues);
    let db = state.db.clone();
    let event_id = event.id;
    tokio::spawn(async move {
        let job_payload = WebhookJobPayload { event_id };
        let enqueued = queues
            .add_job(
                QueueName::WebhookProcessing,
                job_payload.to_json(),
                AddJobOptions {
                    job_key: Some(job_payload.job_key()),
                    ..Default::default()
                },
            )
            .await;

        if let Err(err) = enqueued {
            error!(
                event_id = %event_id,
                error = ?err,
                "Failed to enqueue webhook processing job"
            );
            counter!("webhook_enqueue_failures_total").increment(1);
            let events = WebhookEventRepository::new(db);
            if let Err(record_err) = events
                .record_enqueue_failure(event_id, &format!("enqueue failed: {err}"))
                .await
            {
                error!(
                    event_id = %event_id,
                    error = ?record_err,
                    "Failed to record enqueue failure"
                );
            }
        }
    });

    Ok(Json(WebhookAck { received: true }))
}

/// Receive a provider webhook
///
/// Verifies the `X-Signature` header when a secret is configured for the
/// provider, persists the event and acknowledges. Processing happens
/// asynchronously on the webhook-processing queue.
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(ProviderPathParam),
    request_body(content = serde_json::Value, content_type = "application/json"),
    responses(
        (status = 200, description = "Event persisted", body = WebhookAck),
        (status = 400, description = "Payload is not valid JSON", body = ApiError),
        (status = 401, description = "Signature missing or invalid", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(params): Path<ProviderPathParam>,
    request: Request,
) -> Result<Json<WebhookAck>, ApiError> {
    let source = parse_provider(&params.provider)?;
    ingest(state, source, None, request).await
}

/// Receive a provider webhook on a tenant-pinned URL
///
/// Same contract as the untenanted route, but the event is attributed to the
/// tenant in the path instead of waiting for reconciliation to resolve it.
#[utoipa::path(
    post,
    path = "/webhooks/{provider}/{tenant_id}",
    params(ProviderTenantPath),
    request_body(content = serde_json::Value, content_type = "application/json"),
    responses(
        (status = 200, description = "Event persisted", body = WebhookAck),
        (status = 400, description = "Payload or tenant ID invalid", body = ApiError),
        (status = 401, description = "Signature missing or invalid", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_tenant_webhook(
    State(state): State<AppState>,
    Path(params): Path<ProviderTenantPath>,
    request: Request,
) -> Result<Json<WebhookAck>, ApiError> {
    let source = parse_provider(&params.provider)?;
    let tenant_id = params.tenant_id.parse::<Uuid>().map_err(|_| {
        validation_error(
            "Invalid tenant ID",
            json!({ "tenant_id": "Must be a valid UUID" }),
        )
    })?;
    ingest(state, source, Some(tenant_id), request).await
}

/// Re-enqueue events that never got a processing job
///
/// Safety net for enqueue failures after the durable write. Only events past
/// the age threshold with no matching job row are swept, so an event is never
/// enqueued twice.
#[utoipa::path(
    post,
    path = "/webhooks/requeue",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    request_body(content = RequeueRequest, content_type = "application/json"),
    responses(
        (status = 200, description = "Sweep finished", body = RequeueResponse),
        (status = 401, description = "Missing or invalid operator token", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn requeue_unprocessed(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    body: Option<Json<RequeueRequest>>,
) -> Result<Json<RequeueResponse>, ApiError> {
    let request = body.map(|Json(inner)| inner).unwrap_or_default();
    let older_than = Duration::from_secs(request.older_than_secs.unwrap_or(DEFAULT_SWEEP_AGE_SECS));
    let limit = request.limit.unwrap_or(DEFAULT_SWEEP_LIMIT);

    let requeued = state
        .queues
        .requeue_unprocessed_events(older_than, limit)
        .await?;

    Ok(Json(RequeueResponse { requeued }))
}
