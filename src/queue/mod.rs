//! # Job Queue Manager
//!
//! Named queues over the shared relational store, one per workload class.
//! Each queue carries its own attempt budget, backoff policy, retention and
//! concurrency ceiling; the settings here are the defaults and
//! `RELAY_QUEUE_OVERRIDE_*` variables tune individual queues.
//!
//! Dedup rides on the unique `(queue, job_key)` index: re-adding a job with
//! an existing key returns the existing row instead of a duplicate.

pub mod worker;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{AppConfig, QueueOverride};
use crate::error::is_unique_violation;
use crate::models::ProviderKind;
use crate::models::job::{self, JobStatus, QueueName};
use crate::repositories::{JobRepository, WebhookEventRepository};

/// Backlog threshold above which the webhook queue reports degraded.
const WEBHOOK_WAITING_THRESHOLD: u64 = 100;
/// Backlog threshold for the notifications queue.
const NOTIFICATIONS_WAITING_THRESHOLD: u64 = 500;
/// Dead-letter threshold for the webhook queue.
const WEBHOOK_FAILED_THRESHOLD: u64 = 50;
/// Dead-letter threshold for the notifications queue.
const NOTIFICATIONS_FAILED_THRESHOLD: u64 = 100;

/// Delay policy applied between retries of a failing job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * 2^attempts_made`, capped per queue.
    Exponential { base: Duration },
}

/// Per-queue tuning: attempt budget, backoff, retention and concurrency.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    pub backoff_cap: Duration,
    pub keep_completed: u64,
    pub keep_failed: u64,
    pub concurrency: usize,
    pub default_priority: i16,
}

impl QueueSettings {
    /// Built-in settings per workload class.
    pub fn defaults_for(queue: QueueName) -> Self {
        match queue {
            QueueName::WebhookProcessing => Self {
                max_attempts: 3,
                backoff: BackoffPolicy::Exponential {
                    base: Duration::from_millis(1000),
                },
                backoff_cap: Duration::from_secs(60),
                keep_completed: 100,
                keep_failed: 1000,
                concurrency: 5,
                default_priority: 1,
            },
            QueueName::Notifications => Self {
                max_attempts: 5,
                backoff: BackoffPolicy::Exponential {
                    base: Duration::from_millis(2000),
                },
                backoff_cap: Duration::from_secs(60),
                keep_completed: 1000,
                keep_failed: 5000,
                concurrency: 10,
                default_priority: 3,
            },
            QueueName::Exports => Self {
                max_attempts: 2,
                backoff: BackoffPolicy::Fixed {
                    delay: Duration::from_millis(5000),
                },
                backoff_cap: Duration::from_secs(60),
                keep_completed: 50,
                keep_failed: 100,
                concurrency: 2,
                default_priority: 5,
            },
            QueueName::Sync => Self {
                max_attempts: 3,
                backoff: BackoffPolicy::Exponential {
                    base: Duration::from_secs(30),
                },
                backoff_cap: Duration::from_secs(600),
                keep_completed: 20,
                keep_failed: 100,
                concurrency: 3,
                default_priority: 2,
            },
        }
    }

    /// Applies a configuration override on top of the defaults.
    pub fn with_override(mut self, override_: &QueueOverride) -> Self {
        if let Some(concurrency) = override_.concurrency {
            self.concurrency = concurrency.max(1);
        }
        if let Some(base_ms) = override_.backoff_base_ms {
            let base = Duration::from_millis(base_ms.max(1));
            self.backoff = match self.backoff {
                BackoffPolicy::Fixed { .. } => BackoffPolicy::Fixed { delay: base },
                BackoffPolicy::Exponential { .. } => BackoffPolicy::Exponential { base },
            };
        }
        self
    }
}

/// Delay before the next run of a job that has finished `attempts_made`
/// runs: `min(base * 2^attempts_made, cap)` for exponential queues, the
/// fixed delay otherwise.
pub fn backoff_delay(settings: &QueueSettings, attempts_made: i32) -> Duration {
    let delay = match settings.backoff {
        BackoffPolicy::Fixed { delay } => delay,
        BackoffPolicy::Exponential { base } => {
            let shift = attempts_made.clamp(0, 20) as u32;
            base.saturating_mul(2u32.saturating_pow(shift))
        }
    };
    delay.min(settings.backoff_cap)
}

/// Payload of a webhook reconciliation job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookJobPayload {
    pub event_id: Uuid,
}

impl WebhookJobPayload {
    pub fn job_key(&self) -> String {
        format!("webhook-{}", self.event_id)
    }

    pub fn to_json(&self) -> JsonValue {
        json!({ "event_id": self.event_id })
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Payload of a notification dispatch job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationJobPayload {
    pub notification_id: Uuid,
}

impl NotificationJobPayload {
    pub fn job_key(&self) -> String {
        format!("notification-{}", self.notification_id)
    }

    pub fn to_json(&self) -> JsonValue {
        json!({ "notification_id": self.notification_id })
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Payload of an export job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportJobPayload {
    pub tenant_id: Uuid,
    pub kind: String,
}

impl ExportJobPayload {
    /// Export keys carry a timestamp so repeated exports are distinct jobs.
    pub fn job_key(&self, requested_at: i64) -> String {
        format!("export-{}-{}-{}", self.tenant_id, self.kind, requested_at)
    }

    pub fn to_json(&self) -> JsonValue {
        json!({ "tenant_id": self.tenant_id, "kind": self.kind })
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Payload of a CRM sync job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub tenant_id: Uuid,
}

impl SyncJobPayload {
    pub fn job_key(&self, provider: ProviderKind) -> String {
        format!("sync-{}-{}", self.tenant_id, provider.as_str())
    }

    pub fn to_json(&self) -> JsonValue {
        json!({ "tenant_id": self.tenant_id })
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Optional enqueue parameters.
#[derive(Clone, Debug, Default)]
pub struct AddJobOptions {
    /// Earliest-run delay; the job starts `delayed` when set.
    pub delay: Option<Duration>,
    /// Overrides the queue's default priority (lower runs first).
    pub priority: Option<i16>,
    /// Dedup key; at most one job row exists per key.
    pub job_key: Option<String>,
}

/// Point-in-time job counts for one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Overall queue system classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Aggregated backpressure report across all queues.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct QueueHealthReport {
    pub status: HealthStatus,
    pub queues: BTreeMap<String, QueueMetrics>,
    pub issues: Vec<String>,
}

/// Manager over the named queues.
pub struct JobQueue {
    jobs: JobRepository,
    events: WebhookEventRepository,
    settings: HashMap<QueueName, QueueSettings>,
}

impl JobQueue {
    pub fn new(db: DatabaseConnection, config: &AppConfig) -> Self {
        let mut settings = HashMap::new();
        for queue in QueueName::ALL {
            let mut s = QueueSettings::defaults_for(queue);
            if let Some(override_) = config.queue_overrides.get(queue.as_str()) {
                s = s.with_override(override_);
            }
            settings.insert(queue, s);
        }

        Self {
            jobs: JobRepository::new(db.clone()),
            events: WebhookEventRepository::new(db),
            settings,
        }
    }

    /// Effective settings for a queue.
    pub fn settings(&self, queue: QueueName) -> &QueueSettings {
        // The map is populated for every QueueName variant in new().
        &self.settings[&queue]
    }

    /// Enqueues a job. A duplicate `job_key` returns the existing job
    /// instead of inserting a second row.
    pub async fn add_job(
        &self,
        queue: QueueName,
        payload: JsonValue,
        opts: AddJobOptions,
    ) -> Result<job::Model, DbErr> {
        let settings = self.settings(queue);
        let priority = opts.priority.unwrap_or(settings.default_priority);

        let (status, next_run_at): (JobStatus, DateTimeWithTimeZone) = match opts.delay {
            Some(delay) if !delay.is_zero() => {
                let wake = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600));
                (JobStatus::Delayed, wake.into())
            }
            _ => (JobStatus::Waiting, Utc::now().into()),
        };

        match self
            .jobs
            .insert(
                queue,
                opts.job_key.clone(),
                payload,
                priority,
                settings.max_attempts,
                status,
                next_run_at,
            )
            .await
        {
            Ok(created) => {
                let metric_labels = vec![("queue", queue.as_str().to_string())];
                counter!("jobs_enqueued_total", &metric_labels).increment(1);

                info!(
                    job_id = %created.id,
                    queue = %queue,
                    job_key = created.job_key.as_deref().unwrap_or("-"),
                    priority = priority,
                    status = %created.status.as_str(),
                    "Job enqueued"
                );
                Ok(created)
            }
            Err(err) if is_unique_violation(&err) => {
                let Some(key) = opts.job_key.as_deref() else {
                    return Err(err);
                };
                match self.jobs.find_by_key(queue, key).await? {
                    Some(existing) => {
                        debug!(
                            job_id = %existing.id,
                            queue = %queue,
                            job_key = %key,
                            "Duplicate job key; returning existing job"
                        );
                        Ok(existing)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Point-in-time counts for one queue.
    pub async fn metrics_snapshot(&self, queue: QueueName) -> Result<QueueMetrics, DbErr> {
        let mut metrics = QueueMetrics::default();
        for (status, count) in self.jobs.counts_by_status(queue).await? {
            let count = count.max(0) as u64;
            match status {
                JobStatus::Waiting => metrics.waiting = count,
                JobStatus::Active => metrics.active = count,
                JobStatus::Completed => metrics.completed = count,
                JobStatus::Failed => metrics.failed = count,
                JobStatus::Delayed => metrics.delayed = count,
            }
        }
        Ok(metrics)
    }

    /// Classifies the queue system healthy or degraded from backlog and
    /// dead-letter thresholds. Surfaced to operators; ingress throttling is
    /// the rate limiter's job.
    pub async fn health_check(&self) -> Result<QueueHealthReport, DbErr> {
        let mut queues = BTreeMap::new();
        let mut issues = Vec::new();

        for queue in QueueName::ALL {
            let metrics = self.metrics_snapshot(queue).await?;

            let (waiting_threshold, failed_threshold) = match queue {
                QueueName::WebhookProcessing => {
                    (Some(WEBHOOK_WAITING_THRESHOLD), Some(WEBHOOK_FAILED_THRESHOLD))
                }
                QueueName::Notifications => (
                    Some(NOTIFICATIONS_WAITING_THRESHOLD),
                    Some(NOTIFICATIONS_FAILED_THRESHOLD),
                ),
                _ => (None, None),
            };

            if let Some(threshold) = waiting_threshold {
                if metrics.waiting > threshold {
                    issues.push(format!(
                        "{queue} has {} waiting jobs (threshold {threshold})",
                        metrics.waiting
                    ));
                }
            }
            if let Some(threshold) = failed_threshold {
                if metrics.failed > threshold {
                    issues.push(format!(
                        "{queue} has {} failed jobs (threshold {threshold})",
                        metrics.failed
                    ));
                }
            }

            queues.insert(queue.as_str().to_string(), metrics);
        }

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Ok(QueueHealthReport {
            status,
            queues,
            issues,
        })
    }

    /// Deletes terminal jobs that finished more than `max_age` ago, across
    /// all queues. Only terminal rows are targeted, so the sweep never races
    /// in-flight execution.
    pub async fn clean_old_jobs(&self, max_age: Duration) -> Result<u64, DbErr> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let removed = self.jobs.clean_finished_before(cutoff.into()).await?;

        if removed > 0 {
            info!(removed = removed, "Cleaned old terminal jobs");
        }
        Ok(removed)
    }

    /// Re-queues up to `count` dead-lettered jobs with a fresh attempt
    /// budget, oldest failures first.
    pub async fn retry_failed_jobs(&self, queue: QueueName, count: u64) -> Result<u64, DbErr> {
        let retried = self.jobs.retry_failed(queue, count).await?;

        if retried > 0 {
            info!(queue = %queue, retried = retried, "Requeued failed jobs");
        }
        Ok(retried)
    }

    /// Trims terminal rows beyond the queue's retention budgets.
    pub async fn reap_terminal(&self, queue: QueueName) -> Result<u64, DbErr> {
        let settings = self.settings(queue);
        let keep_completed = settings.keep_completed;
        let keep_failed = settings.keep_failed;

        let mut removed = self
            .jobs
            .reap_terminal(queue, JobStatus::Completed, keep_completed)
            .await?;
        removed += self
            .jobs
            .reap_terminal(queue, JobStatus::Failed, keep_failed)
            .await?;

        if removed > 0 {
            debug!(queue = %queue, removed = removed, "Reaped terminal jobs beyond retention");
        }
        Ok(removed)
    }

    /// Recovery sweep for events that were persisted but never enqueued
    /// (the defined failure mode of detached enqueue). The webhook job key
    /// dedups events whose job still exists.
    pub async fn requeue_unprocessed_events(
        &self,
        older_than: Duration,
        limit: u64,
    ) -> Result<u64, DbErr> {
        let age = chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let events = self.events.find_unprocessed(age, limit).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = events
            .iter()
            .map(|event| WebhookJobPayload { event_id: event.id }.job_key())
            .collect();
        let existing: HashSet<String> = self
            .jobs
            .find_existing_keys(QueueName::WebhookProcessing, &keys)
            .await?
            .into_iter()
            .collect();

        let mut requeued = 0u64;
        for event in events {
            let payload = WebhookJobPayload { event_id: event.id };
            let key = payload.job_key();
            if existing.contains(&key) {
                continue;
            }

            self.add_job(
                QueueName::WebhookProcessing,
                payload.to_json(),
                AddJobOptions {
                    job_key: Some(key),
                    ..Default::default()
                },
            )
            .await?;
            requeued += 1;
        }

        if requeued > 0 {
            info!(requeued = requeued, "Requeued unprocessed webhook events");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("create in-memory db");
        Migrator::up(&db, None).await.expect("apply migrations");
        db
    }

    fn queue_manager(db: DatabaseConnection) -> JobQueue {
        JobQueue::new(db, &AppConfig::default())
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let settings = QueueSettings::defaults_for(QueueName::WebhookProcessing);

        assert_eq!(backoff_delay(&settings, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&settings, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&settings, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&settings, 3), Duration::from_millis(8000));
        // 2^10 seconds exceeds the 60s cap.
        assert_eq!(backoff_delay(&settings, 10), Duration::from_secs(60));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let settings = QueueSettings::defaults_for(QueueName::Exports);

        assert_eq!(backoff_delay(&settings, 0), Duration::from_millis(5000));
        assert_eq!(backoff_delay(&settings, 5), Duration::from_millis(5000));
    }

    #[test]
    fn override_replaces_concurrency_and_base() {
        let override_ = QueueOverride {
            concurrency: Some(12),
            backoff_base_ms: Some(250),
        };
        let settings =
            QueueSettings::defaults_for(QueueName::WebhookProcessing).with_override(&override_);

        assert_eq!(settings.concurrency, 12);
        assert_eq!(
            settings.backoff,
            BackoffPolicy::Exponential {
                base: Duration::from_millis(250)
            }
        );
        // Untouched fields keep their defaults.
        assert_eq!(settings.max_attempts, 3);
    }

    #[test]
    fn job_keys_are_deterministic() {
        let id = Uuid::nil();

        assert_eq!(
            WebhookJobPayload { event_id: id }.job_key(),
            format!("webhook-{id}")
        );
        assert_eq!(
            NotificationJobPayload {
                notification_id: id
            }
            .job_key(),
            format!("notification-{id}")
        );
        assert_eq!(
            ExportJobPayload {
                tenant_id: id,
                kind: "leads".to_string()
            }
            .job_key(1_700_000_000),
            format!("export-{id}-leads-1700000000")
        );
        assert_eq!(
            SyncJobPayload { tenant_id: id }.job_key(ProviderKind::Crm),
            format!("sync-{id}-crm")
        );
    }

    #[tokio::test]
    async fn add_job_defaults_to_waiting_now() {
        let db = setup_db().await;
        let queues = queue_manager(db);

        let job = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({"event_id": Uuid::new_v4()}),
                AddJobOptions::default(),
            )
            .await
            .expect("enqueue");

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.priority, 1);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.attempts_made, 0);
    }

    #[tokio::test]
    async fn delayed_job_parks_until_wakeup() {
        let db = setup_db().await;
        let queues = queue_manager(db);

        let job = queues
            .add_job(
                QueueName::Notifications,
                json!({}),
                AddJobOptions {
                    delay: Some(Duration::from_secs(30)),
                    ..Default::default()
                },
            )
            .await
            .expect("enqueue");

        assert_eq!(job.status, JobStatus::Delayed);
        assert!(job.next_run_at > Utc::now());
    }

    #[tokio::test]
    async fn duplicate_job_key_returns_existing_row() {
        let db = setup_db().await;
        let queues = queue_manager(db);

        let opts = AddJobOptions {
            job_key: Some("webhook-dup".to_string()),
            ..Default::default()
        };

        let first = queues
            .add_job(QueueName::WebhookProcessing, json!({}), opts.clone())
            .await
            .expect("first enqueue");
        let second = queues
            .add_job(QueueName::WebhookProcessing, json!({}), opts)
            .await
            .expect("second enqueue");

        assert_eq!(first.id, second.id);

        let metrics = queues
            .metrics_snapshot(QueueName::WebhookProcessing)
            .await
            .expect("snapshot");
        assert_eq!(metrics.waiting, 1);
    }

    #[tokio::test]
    async fn same_key_on_other_queue_is_independent() {
        let db = setup_db().await;
        let queues = queue_manager(db);

        let opts = AddJobOptions {
            job_key: Some("shared-key".to_string()),
            ..Default::default()
        };

        let first = queues
            .add_job(QueueName::WebhookProcessing, json!({}), opts.clone())
            .await
            .expect("first enqueue");
        let second = queues
            .add_job(QueueName::Exports, json!({}), opts)
            .await
            .expect("second enqueue");

        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn reap_keeps_newest_terminal_rows_within_budget() {
        let db = setup_db().await;
        let queues = queue_manager(db.clone());
        let repo = JobRepository::new(db);

        // Sync retains 20 completed rows; finish 25 through the real
        // claim/complete walk so finished_at ordering is the production one.
        let mut ids = Vec::new();
        for n in 0..25 {
            let job = queues
                .add_job(
                    QueueName::Sync,
                    json!({"tenant_id": Uuid::new_v4()}),
                    AddJobOptions {
                        job_key: Some(format!("sync-reap-{n}")),
                        ..Default::default()
                    },
                )
                .await
                .expect("enqueue");
            assert!(repo.claim(job.id).await.expect("claim"));
            repo.complete(job.id).await.expect("complete");
            ids.push(job.id);
        }

        let removed = queues.reap_terminal(QueueName::Sync).await.expect("reap");
        assert_eq!(removed, 5);

        let snapshot = queues
            .metrics_snapshot(QueueName::Sync)
            .await
            .expect("snapshot");
        assert_eq!(snapshot.completed, 20);

        // The oldest finishers are the ones that went.
        for id in &ids[..5] {
            assert!(repo.find_by_id(*id).await.expect("query").is_none());
        }
        assert!(repo.find_by_id(ids[24]).await.expect("query").is_some());
    }

    #[tokio::test]
    async fn health_degrades_on_webhook_backlog() {
        let db = setup_db().await;
        let queues = queue_manager(db);

        for i in 0..=WEBHOOK_WAITING_THRESHOLD {
            queues
                .add_job(
                    QueueName::WebhookProcessing,
                    json!({"n": i}),
                    AddJobOptions::default(),
                )
                .await
                .expect("enqueue");
        }

        let report = queues.health_check().await.expect("health check");
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("webhook-processing"));
        assert_eq!(
            report.queues["webhook-processing"].waiting,
            WEBHOOK_WAITING_THRESHOLD + 1
        );
    }

    #[tokio::test]
    async fn health_is_healthy_when_empty() {
        let db = setup_db().await;
        let queues = queue_manager(db);

        let report = queues.health_check().await.expect("health check");
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.issues.is_empty());
        assert_eq!(report.queues.len(), 4);
    }
}
