//! End-to-end pipeline tests: webhook ingestion over HTTP, reconciliation
//! and notification dispatch through the worker pool, and the operator
//! surface observing the outcome.

mod test_utils;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use relay_hub::config::{AppConfig, QueueOverride};
use relay_hub::models::job::{self, JobStatus, QueueName};
use relay_hub::models::notification::{self, NotificationStatus};
use relay_hub::models::tenant::PlanTier;
use relay_hub::notify::NotificationDispatchHandler;
use relay_hub::providers::HttpBotClient;
use relay_hub::queue::worker::{HandlerRegistry, WorkerPool};
use relay_hub::reconcile::ReconcileHandler;
use relay_hub::repositories::{
    JobRepository, LeadRepository, NotificationRepository, WebhookEventRepository,
};
use relay_hub::server::{AppState, create_app, create_test_app_state};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Pipeline {
    state: AppState,
    app: Router,
    pool: WorkerPool,
}

/// Builds the app plus a worker pool wired exactly as the binary wires it,
/// with the bot transport pointed at `config.bot_api_base`.
async fn pipeline(config: AppConfig) -> Pipeline {
    let db = test_utils::setup_test_db().await.expect("test db");
    let state = create_test_app_state(config, db);

    let registry = Arc::new(
        HandlerRegistry::new()
            .register(
                QueueName::WebhookProcessing,
                Arc::new(ReconcileHandler::new(
                    state.db.clone(),
                    Arc::clone(&state.queues),
                )),
            )
            .register(
                QueueName::Notifications,
                Arc::new(NotificationDispatchHandler::new(
                    state.db.clone(),
                    Arc::clone(&state.guard),
                    Arc::new(HttpBotClient::new(state.config.bot_api_base.clone())),
                )),
            ),
    );
    let pool = WorkerPool::new(
        state.db.clone(),
        Arc::clone(&state.queues),
        registry,
        &state.config.worker,
    );

    let app = create_app(state.clone());
    Pipeline { state, app, pool }
}

async fn post_json(app: Router, uri: &str, body: JsonValue) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap().status()
}

async fn operator_request(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<JsonValue>,
) -> (StatusCode, JsonValue) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", "Bearer op-token")
        .header("X-Tenant-Id", Uuid::new_v4().to_string());
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        json!(null)
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Ingestion enqueues on a detached task; poll until the job row lands.
async fn wait_for_job(db: &DatabaseConnection, queue: QueueName, key: &str) -> job::Model {
    let jobs = JobRepository::new(db.clone());
    for _ in 0..100 {
        if let Some(job) = jobs.find_by_key(queue, key).await.expect("query jobs") {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {key} never appeared");
}

async fn latest_event(db: &DatabaseConnection) -> relay_hub::models::webhook_event::Model {
    let events = WebhookEventRepository::new(db.clone());
    let mut rows = events
        .find_unprocessed(chrono::Duration::zero(), 10)
        .await
        .expect("query events");
    rows.pop().expect("an event row exists")
}

#[tokio::test]
async fn bot_message_flows_from_webhook_to_sent_notification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot12345:token/sendMessage"))
        .and(body_json(json!({
            "chat_id": "-100",
            "text": "New message from @dana: need pricing",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let config = AppConfig {
        bot_api_base: server.uri(),
        operator_tokens: vec!["op-token".to_string()],
        ..Default::default()
    };
    let pipeline = pipeline(config).await;
    let tenant_id = test_utils::seed_tenant(&pipeline.state.db, PlanTier::Pro)
        .await
        .expect("seed tenant");
    test_utils::seed_bot_integration(
        &pipeline.state.db,
        &pipeline.state.guard,
        tenant_id,
        "12345:token",
        "-100",
    )
    .await
    .expect("seed integration");

    let status = post_json(
        pipeline.app.clone(),
        &format!("/webhooks/bot/{tenant_id}"),
        json!({"message": {"from": {"username": "dana"}, "text": "need pricing"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let event = latest_event(&pipeline.state.db).await;
    wait_for_job(
        &pipeline.state.db,
        QueueName::WebhookProcessing,
        &format!("webhook-{}", event.id),
    )
    .await;

    // First tick reconciles the event into a pending notification.
    let stats = pipeline
        .pool
        .tick_queue(QueueName::WebhookProcessing)
        .await
        .expect("tick webhook queue");
    assert_eq!(stats.completed, 1);

    let events = WebhookEventRepository::new(pipeline.state.db.clone());
    let event = events
        .find_by_id(event.id)
        .await
        .expect("query event")
        .expect("event exists");
    assert!(event.processed);
    assert!(event.error_message.is_none());

    // Second tick delivers it through the bot transport.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let stats = pipeline
        .pool
        .tick_queue(QueueName::Notifications)
        .await
        .expect("tick notifications queue");
    assert_eq!(stats.completed, 1);

    let rows = notification::Entity::find()
        .filter(notification::Column::TenantId.eq(tenant_id))
        .all(&pipeline.state.db)
        .await
        .expect("list notifications");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, NotificationStatus::Sent);
    assert!(rows[0].sent_at.is_some());
}

#[tokio::test]
async fn failing_transport_dead_letters_and_operator_retry_respects_terminal_row() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("bot exploded"))
        .expect(5)
        .mount(&server)
        .await;

    let mut queue_overrides = BTreeMap::new();
    // Exercise the full retry walk without waiting out real backoff.
    queue_overrides.insert(
        "notifications".to_string(),
        QueueOverride {
            concurrency: None,
            backoff_base_ms: Some(0),
        },
    );
    let config = AppConfig {
        bot_api_base: server.uri(),
        operator_tokens: vec!["op-token".to_string()],
        queue_overrides,
        ..Default::default()
    };
    let pipeline = pipeline(config).await;
    let tenant_id = test_utils::seed_tenant(&pipeline.state.db, PlanTier::Enterprise)
        .await
        .expect("seed tenant");
    test_utils::seed_bot_integration(
        &pipeline.state.db,
        &pipeline.state.guard,
        tenant_id,
        "12345:token",
        "-100",
    )
    .await
    .expect("seed integration");

    let request = Request::builder()
        .method("POST")
        .uri("/notifications")
        .header("Authorization", "Bearer op-token")
        .header("X-Tenant-Id", tenant_id.to_string())
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"kind": "bot", "payload": {"chat_id": "-100", "text": "release shipped"}})
                .to_string(),
        ))
        .unwrap();
    let response = pipeline.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let created: JsonValue = serde_json::from_slice(&bytes).unwrap();
    let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

    // Five ticks: attempts 1-4 reschedule, attempt 5 exhausts the budget.
    // The overridden 1ms backoff base keeps every retry delay below the
    // inter-tick sleep.
    for _ in 0..5 {
        pipeline
            .pool
            .tick_queue(QueueName::Notifications)
            .await
            .expect("tick notifications queue");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let jobs = JobRepository::new(pipeline.state.db.clone());
    let job = jobs
        .find_by_key(QueueName::Notifications, &format!("notification-{id}"))
        .await
        .expect("query jobs")
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts_made, 5);

    let (status, body) =
        operator_request(pipeline.app.clone(), "GET", &format!("/notifications/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("failed"));
    assert_eq!(body["attempts"], json!(5));
    assert!(
        body["error_message"]
            .as_str()
            .unwrap()
            .contains("bot exploded")
    );

    // Operator retry refreshes the job, but the notification row stays the
    // source of truth: the rerun observes the terminal state and completes
    // without another transport call.
    let (status, body) = operator_request(
        pipeline.app.clone(),
        "POST",
        "/queues/notifications/retry-failed",
        Some(json!({"count": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retried"], json!(1));

    let stats = pipeline
        .pool
        .tick_queue(QueueName::Notifications)
        .await
        .expect("tick notifications queue");
    assert_eq!(stats.completed, 1);

    let notifications = NotificationRepository::new(pipeline.state.db.clone());
    let row = notifications
        .find_by_id(id)
        .await
        .expect("query notification")
        .expect("notification exists");
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.attempts, 5);
}

#[tokio::test]
async fn crm_webhook_resolves_tenant_and_upserts_leads() {
    let config = AppConfig {
        operator_tokens: vec!["op-token".to_string()],
        ..Default::default()
    };
    let pipeline = pipeline(config).await;
    let tenant_id = test_utils::seed_tenant(&pipeline.state.db, PlanTier::Free)
        .await
        .expect("seed tenant");
    test_utils::seed_crm_integration(&pipeline.state.db, tenant_id, "77")
        .await
        .expect("seed integration");

    // Untenanted route: the account id in the payload must resolve the tenant.
    let status = post_json(
        pipeline.app.clone(),
        "/webhooks/crm",
        json!({
            "account": {"id": 77},
            "leads": [
                {"id": 501, "name": "Acme rollout", "status_id": 2},
                {"id": 502, "name": "Globex pilot"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let event = latest_event(&pipeline.state.db).await;
    wait_for_job(
        &pipeline.state.db,
        QueueName::WebhookProcessing,
        &format!("webhook-{}", event.id),
    )
    .await;

    let stats = pipeline
        .pool
        .tick_queue(QueueName::WebhookProcessing)
        .await
        .expect("tick webhook queue");
    assert_eq!(stats.completed, 1);

    let events = WebhookEventRepository::new(pipeline.state.db.clone());
    let event = events
        .find_by_id(event.id)
        .await
        .expect("query event")
        .expect("event exists");
    assert!(event.processed);
    assert_eq!(event.tenant_id, Some(tenant_id));

    let leads = LeadRepository::new(pipeline.state.db.clone());
    assert_eq!(
        leads.count_for_tenant(tenant_id).await.expect("count leads"),
        2
    );
}
