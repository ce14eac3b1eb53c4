//! # Server Configuration
//!
//! This module contains the server setup and configuration for the Relay Hub
//! API: shared application state, the router with its middleware stack, and
//! the OpenAPI document served under `/docs`.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::crypto::{CryptoKey, TokenGuard};
use crate::handlers;
use crate::queue::JobQueue;
use crate::rate_limit::RateLimiter;
use crate::store::MemoryStore;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub queues: Arc<JobQueue>,
    pub limiter: Arc<RateLimiter>,
    pub guard: Arc<TokenGuard>,
    pub metrics: PrometheusHandle,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    // Operator surface: bearer token plus X-Tenant-Id, enforced in one place.
    let operator_routes = Router::new()
        .route("/queues/health", get(handlers::queues::queue_health))
        .route(
            "/queues/{queue}/metrics",
            get(handlers::queues::queue_metrics),
        )
        .route(
            "/queues/{queue}/retry-failed",
            post(handlers::queues::retry_failed),
        )
        .route("/queues/clean", post(handlers::queues::clean_jobs))
        .route(
            "/webhooks/requeue",
            post(handlers::webhooks::requeue_unprocessed),
        )
        .route(
            "/notifications",
            post(handlers::notifications::create_notification),
        )
        .route(
            "/notifications/{id}",
            get(handlers::notifications::get_notification),
        )
        .route("/rate-limits", get(handlers::rate_limits::list_rate_limits))
        .route(
            "/rate-limits/{endpoint}",
            delete(handlers::rate_limits::reset_rate_limit),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/webhooks/{provider}",
            post(handlers::webhooks::ingest_webhook),
        )
        .route(
            "/webhooks/{provider}/{tenant_id}",
            post(handlers::webhooks::ingest_tenant_webhook),
        )
        .merge(operator_routes)
        .route_layer(middleware::from_fn(telemetry::track_http_metrics))
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Builds an `AppState` over the given database for router tests.
///
/// Uses the in-memory coordination store and the process-wide metrics
/// recorder; the crypto key falls back to an all-zero test key when the
/// config carries none.
pub fn create_test_app_state(config: AppConfig, db: DatabaseConnection) -> AppState {
    let config = Arc::new(config);
    let key = config
        .crypto_key
        .as_ref()
        .and_then(|bytes| CryptoKey::new(bytes.clone()).ok())
        .unwrap_or_else(|| {
            CryptoKey::new(vec![0u8; 32]).expect("Failed to create test crypto key")
        });
    let metrics =
        telemetry::install_metrics_recorder().expect("Failed to install metrics recorder");

    AppState {
        queues: Arc::new(JobQueue::new(db.clone(), &config)),
        limiter: Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            config.rate_limit.clone(),
        )),
        guard: Arc::new(TokenGuard::new(key)),
        config,
        db,
        metrics,
    }
}

/// Starts the server and runs until the shutdown token fires
pub async fn run_server(
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, profile = %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Registers the bearer scheme the operator paths reference.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi
            .components
            .get_or_insert_with(utoipa::openapi::Components::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::metrics,
        crate::handlers::webhooks::ingest_webhook,
        crate::handlers::webhooks::ingest_tenant_webhook,
        crate::handlers::webhooks::requeue_unprocessed,
        crate::handlers::queues::queue_health,
        crate::handlers::queues::queue_metrics,
        crate::handlers::queues::retry_failed,
        crate::handlers::queues::clean_jobs,
        crate::handlers::notifications::create_notification,
        crate::handlers::notifications::get_notification,
        crate::handlers::rate_limits::list_rate_limits,
        crate::handlers::rate_limits::reset_rate_limit,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::notification::NotificationKind,
            crate::models::notification::NotificationStatus,
            crate::error::ApiError,
            crate::crypto::GuardHealth,
            crate::queue::HealthStatus,
            crate::queue::QueueMetrics,
            crate::queue::QueueHealthReport,
            crate::rate_limit::EndpointUsage,
            crate::handlers::HealthResponse,
            crate::handlers::webhooks::WebhookAck,
            crate::handlers::webhooks::RequeueRequest,
            crate::handlers::webhooks::RequeueResponse,
            crate::handlers::queues::QueueMetricsResponse,
            crate::handlers::queues::RetryFailedRequest,
            crate::handlers::queues::RetryFailedResponse,
            crate::handlers::queues::CleanJobsRequest,
            crate::handlers::queues::CleanJobsResponse,
            crate::handlers::notifications::CreateNotificationRequest,
            crate::handlers::notifications::NotificationInfo,
            crate::handlers::rate_limits::RateLimitsResponse,
            crate::handlers::rate_limits::ResetRateLimitResponse,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Relay Hub API",
        description = "Multi-tenant integration hub: webhook ingestion, queued processing and notification dispatch",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_covers_every_route() {
        let doc = ApiDoc::openapi();
        let routes = [
            "/",
            "/health",
            "/metrics",
            "/webhooks/{provider}",
            "/webhooks/{provider}/{tenant_id}",
            "/webhooks/requeue",
            "/queues/health",
            "/queues/{queue}/metrics",
            "/queues/{queue}/retry-failed",
            "/queues/clean",
            "/notifications",
            "/notifications/{id}",
            "/rate-limits",
            "/rate-limits/{endpoint}",
        ];
        for route in routes {
            assert!(
                doc.paths.paths.contains_key(route),
                "missing OpenAPI path {route}"
            );
        }
    }

    #[test]
    fn openapi_document_registers_bearer_scheme() {
        let doc = ApiDoc::openapi();
        let components = doc.components.expect("components present");
        assert!(components.security_schemes.contains_key("bearer_auth"));
    }
}
