//! # Worker Pool
//!
//! One tick-driven loop over all queues. Each tick promotes due delayed
//! jobs, claims runnable ones in priority order, and executes them under a
//! per-queue semaphore. Claiming is a guarded update, so any number of pool
//! instances can share a database without running a job twice.
//!
//! Handlers report typed failures: retryable errors park the job `delayed`
//! with the queue's backoff, fatal errors dead-letter it immediately, and an
//! exhausted attempt budget dead-letters regardless of classification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::crypto::CryptoError;
use crate::models::job::{self, QueueName};
use crate::providers::ProviderError;
use crate::queue::{JobQueue, QueueSettings, backoff_delay};
use crate::repositories::JobRepository;

/// Typed failure a job handler reports.
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the job retries per queue backoff.
    #[error("{0}")]
    Retryable(String),
    /// Permanent failure; the job dead-letters immediately.
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        JobError::Fatal(message.into())
    }

    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            JobError::Retryable(_) => "retryable",
            JobError::Fatal(_) => "fatal",
        }
    }
}

impl From<DbErr> for JobError {
    fn from(err: DbErr) -> Self {
        match err {
            DbErr::RecordNotFound(message) => JobError::Fatal(message),
            other => JobError::Retryable(other.to_string()),
        }
    }
}

// Tamper or key mismatch never heals on retry.
impl From<CryptoError> for JobError {
    fn from(err: CryptoError) -> Self {
        JobError::Fatal(err.to_string())
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        if err.is_transient() {
            JobError::Retryable(err.to_string())
        } else {
            JobError::Fatal(err.to_string())
        }
    }
}

// A payload that no longer parses will not parse on the next attempt either.
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Fatal(format!("malformed job payload: {err}"))
    }
}

/// Processing seam between the pool and queue-specific logic.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &job::Model) -> Result<(), JobError>;
}

/// Queue-to-handler map owned by the process lifecycle and injected into
/// the pool; never a process-wide singleton.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<QueueName, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, queue: QueueName, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(queue, handler);
        self
    }

    pub fn get(&self, queue: QueueName) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&queue)
    }
}

/// Outcome counts for one queue tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub promoted: u64,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
}

enum RunOutcome {
    Completed,
    Retried,
    Failed,
}

/// Tick-driven job executor over all named queues.
pub struct WorkerPool {
    jobs: JobRepository,
    queues: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    tick_interval: Duration,
    claim_batch: u64,
    semaphores: HashMap<QueueName, Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(
        db: DatabaseConnection,
        queues: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        let semaphores = QueueName::ALL
            .into_iter()
            .map(|queue| {
                let concurrency = queues.settings(queue).concurrency.max(1);
                (queue, Arc::new(Semaphore::new(concurrency)))
            })
            .collect();

        Self {
            jobs: JobRepository::new(db),
            queues,
            registry,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            claim_batch: config.claim_batch,
            semaphores,
        }
    }

    /// Runs the pool until the shutdown token fires. In-flight jobs finish
    /// their current tick before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            claim_batch = self.claim_batch,
            "Starting worker pool"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Worker pool shutdown requested");
                    break;
                }
                _ = sleep(self.tick_interval) => {
                    for queue in QueueName::ALL {
                        match self.tick_queue(queue).await {
                            Ok(stats) if stats.claimed > 0 => {
                                debug!(
                                    queue = %queue,
                                    claimed = stats.claimed,
                                    completed = stats.completed,
                                    retried = stats.retried,
                                    failed = stats.failed,
                                    "Queue tick completed"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => {
                                error!(error = ?err, queue = %queue, "Queue tick failed");
                            }
                        }
                    }
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// One scheduling pass over a queue: promote due delayed jobs, claim up
    /// to `claim_batch` runnable ones, execute them concurrently, and trim
    /// terminal rows beyond retention.
    pub async fn tick_queue(&self, queue: QueueName) -> Result<TickStats, DbErr> {
        let mut stats = TickStats {
            promoted: self.jobs.promote_due_delayed(queue).await?,
            ..TickStats::default()
        };

        let due = self.jobs.find_due_waiting(queue, self.claim_batch).await?;
        if due.is_empty() {
            return Ok(stats);
        }

        let semaphore = Arc::clone(&self.semaphores[&queue]);
        let settings = self.queues.settings(queue).clone();
        let mut tasks: JoinSet<Result<RunOutcome, DbErr>> = JoinSet::new();

        for candidate in due {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                warn!(queue = %queue, "Worker semaphore closed; abandoning tick");
                break;
            };

            // Guarded transition; false means another instance won the race.
            if !self.jobs.claim(candidate.id).await? {
                drop(permit);
                continue;
            }
            stats.claimed += 1;

            let jobs = self.jobs.clone();
            let registry = Arc::clone(&self.registry);
            let settings = settings.clone();
            tasks.spawn(async move {
                let _permit = permit;
                run_job(jobs, registry, settings, candidate).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(RunOutcome::Completed)) => stats.completed += 1,
                Ok(Ok(RunOutcome::Retried)) => stats.retried += 1,
                Ok(Ok(RunOutcome::Failed)) => stats.failed += 1,
                Ok(Err(err)) => {
                    error!(error = ?err, queue = %queue, "Job bookkeeping failed");
                }
                Err(join_err) => {
                    error!(error = ?join_err, queue = %queue, "Job task panicked");
                }
            }
        }

        if stats.completed > 0 || stats.failed > 0 {
            self.queues.reap_terminal(queue).await?;
        }

        Ok(stats)
    }
}

/// Executes one claimed job and records the outcome.
async fn run_job(
    jobs: JobRepository,
    registry: Arc<HandlerRegistry>,
    settings: QueueSettings,
    job: job::Model,
) -> Result<RunOutcome, DbErr> {
    let metric_labels = vec![("queue", job.queue.as_str().to_string())];

    let started = std::time::Instant::now();
    let result = match registry.get(job.queue) {
        Some(handler) => handler.handle(&job).await,
        None => Err(JobError::fatal(format!(
            "no handler registered for queue '{}'",
            job.queue
        ))),
    };
    histogram!("job_run_duration_seconds", &metric_labels)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            jobs.complete(job.id).await?;
            counter!("jobs_completed_total", &metric_labels).increment(1);
            debug!(job_id = %job.id, queue = %job.queue, "Job completed");
            Ok(RunOutcome::Completed)
        }
        Err(job_err) => {
            let attempts_after = job.attempts_made.saturating_add(1);
            let error_json = json!({
                "message": job_err.to_string(),
                "kind": job_err.kind(),
                "attempt": attempts_after,
            });

            if job_err.is_fatal() || attempts_after >= job.max_attempts {
                jobs.fail_terminal(job.id, error_json).await?;
                counter!("jobs_failed_total", &metric_labels).increment(1);
                error!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempts = attempts_after,
                    error = %job_err,
                    "Job dead-lettered"
                );
                Ok(RunOutcome::Failed)
            } else {
                let delay = backoff_delay(&settings, job.attempts_made);
                let next_run_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                jobs.retry_later(job.id, next_run_at.into(), error_json)
                    .await?;
                counter!("jobs_retried_total", &metric_labels).increment(1);
                warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = attempts_after,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %job_err,
                    "Job failed; retry scheduled"
                );
                Ok(RunOutcome::Retried)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;
    use uuid::Uuid;

    use crate::config::{AppConfig, QueueOverride};
    use crate::models::job::JobStatus;
    use crate::queue::AddJobOptions;

    struct CountingHandler {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &job::Model) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFailing {
        fatal: bool,
    }

    #[async_trait::async_trait]
    impl JobHandler for AlwaysFailing {
        async fn handle(&self, _job: &job::Model) -> Result<(), JobError> {
            if self.fatal {
                Err(JobError::fatal("unrecoverable"))
            } else {
                Err(JobError::retryable("transient glitch"))
            }
        }
    }

    struct RecordingHandler {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait::async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &job::Model) -> Result<(), JobError> {
            self.seen.lock().unwrap().push(job.id);
            Ok(())
        }
    }

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("create in-memory db");
        Migrator::up(&db, None).await.expect("apply migrations");
        db
    }

    fn fast_backoff_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.queue_overrides.insert(
            "webhook-processing".to_string(),
            QueueOverride {
                concurrency: Some(1),
                backoff_base_ms: Some(1),
            },
        );
        config
    }

    fn pool_with(
        db: DatabaseConnection,
        config: &AppConfig,
        registry: HandlerRegistry,
    ) -> (Arc<JobQueue>, WorkerPool) {
        let queues = Arc::new(JobQueue::new(db.clone(), config));
        let pool = WorkerPool::new(
            db,
            Arc::clone(&queues),
            Arc::new(registry),
            &config.worker,
        );
        (queues, pool)
    }

    #[tokio::test]
    async fn tick_runs_waiting_job_to_completion() {
        let db = setup_db().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
        });
        let registry = HandlerRegistry::new().register(
            QueueName::WebhookProcessing,
            Arc::clone(&handler) as Arc<dyn JobHandler>,
        );
        let config = AppConfig::default();
        let (queues, pool) = pool_with(db, &config, registry);

        let job = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions::default(),
            )
            .await
            .expect("enqueue");

        let stats = pool
            .tick_queue(QueueName::WebhookProcessing)
            .await
            .expect("tick");

        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let stored = pool.jobs.find_by_id(job.id).await.expect("load").unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts_made, 1);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn retryable_failure_parks_job_delayed_with_backoff() {
        let db = setup_db().await;
        let registry = HandlerRegistry::new().register(
            QueueName::WebhookProcessing,
            Arc::new(AlwaysFailing { fatal: false }),
        );
        let config = AppConfig::default();
        let (queues, pool) = pool_with(db, &config, registry);

        let job = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions::default(),
            )
            .await
            .expect("enqueue");

        let before = Utc::now();
        let stats = pool
            .tick_queue(QueueName::WebhookProcessing)
            .await
            .expect("tick");
        assert_eq!(stats.retried, 1);

        let stored = pool.jobs.find_by_id(job.id).await.expect("load").unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);
        assert_eq!(stored.attempts_made, 1);
        // First retry of the webhook queue waits base * 2^0 = 1s.
        assert!(stored.next_run_at >= before + chrono::Duration::milliseconds(900));

        let last_error = stored.last_error.expect("failure recorded");
        assert_eq!(last_error["kind"], "retryable");
        assert_eq!(last_error["attempt"], 1);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_job() {
        let db = setup_db().await;
        let registry = HandlerRegistry::new().register(
            QueueName::WebhookProcessing,
            Arc::new(AlwaysFailing { fatal: false }),
        );
        let config = fast_backoff_config();
        let (queues, pool) = pool_with(db, &config, registry);

        let job = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions::default(),
            )
            .await
            .expect("enqueue");
        assert_eq!(job.max_attempts, 3);

        // Three runs exhaust the budget; overridden backoff keeps the
        // delays in single-digit milliseconds.
        for _ in 0..3 {
            sleep(Duration::from_millis(15)).await;
            pool.tick_queue(QueueName::WebhookProcessing)
                .await
                .expect("tick");
        }

        let stored = pool.jobs.find_by_id(job.id).await.expect("load").unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts_made, 3);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn fatal_failure_short_circuits_retries() {
        let db = setup_db().await;
        let registry = HandlerRegistry::new().register(
            QueueName::WebhookProcessing,
            Arc::new(AlwaysFailing { fatal: true }),
        );
        let config = AppConfig::default();
        let (queues, pool) = pool_with(db, &config, registry);

        let job = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions::default(),
            )
            .await
            .expect("enqueue");

        let stats = pool
            .tick_queue(QueueName::WebhookProcessing)
            .await
            .expect("tick");
        assert_eq!(stats.failed, 1);

        let stored = pool.jobs.find_by_id(job.id).await.expect("load").unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts_made, 1);
        assert_eq!(stored.last_error.unwrap()["kind"], "fatal");
    }

    #[tokio::test]
    async fn missing_handler_dead_letters_job() {
        let db = setup_db().await;
        let config = AppConfig::default();
        let (queues, pool) = pool_with(db, &config, HandlerRegistry::new());

        let job = queues
            .add_job(QueueName::Exports, json!({}), AddJobOptions::default())
            .await
            .expect("enqueue");

        pool.tick_queue(QueueName::Exports).await.expect("tick");

        let stored = pool.jobs.find_by_id(job.id).await.expect("load").unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let message = stored.last_error.unwrap()["message"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(message.contains("no handler registered"));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let db = setup_db().await;
        let config = AppConfig::default();
        let (queues, pool) = pool_with(db, &config, HandlerRegistry::new());

        let job = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions::default(),
            )
            .await
            .expect("enqueue");

        assert!(pool.jobs.claim(job.id).await.expect("first claim"));
        assert!(!pool.jobs.claim(job.id).await.expect("second claim"));
    }

    #[tokio::test]
    async fn jobs_run_in_priority_then_insertion_order() {
        let db = setup_db().await;
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let registry = HandlerRegistry::new().register(
            QueueName::WebhookProcessing,
            Arc::clone(&handler) as Arc<dyn JobHandler>,
        );
        // Concurrency 1 makes execution order deterministic.
        let config = fast_backoff_config();
        let (queues, pool) = pool_with(db, &config, registry);

        let low = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions {
                    priority: Some(5),
                    ..Default::default()
                },
            )
            .await
            .expect("enqueue low");
        let high = queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions {
                    priority: Some(1),
                    ..Default::default()
                },
            )
            .await
            .expect("enqueue high");

        pool.tick_queue(QueueName::WebhookProcessing)
            .await
            .expect("tick");

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![high.id, low.id]);
    }

    #[tokio::test]
    async fn delayed_job_promotes_once_due() {
        let db = setup_db().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
        });
        let registry = HandlerRegistry::new().register(
            QueueName::WebhookProcessing,
            Arc::clone(&handler) as Arc<dyn JobHandler>,
        );
        let config = AppConfig::default();
        let (queues, pool) = pool_with(db, &config, registry);

        queues
            .add_job(
                QueueName::WebhookProcessing,
                json!({}),
                AddJobOptions {
                    delay: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
            )
            .await
            .expect("enqueue");

        // Not yet due: nothing to claim.
        let stats = pool
            .tick_queue(QueueName::WebhookProcessing)
            .await
            .expect("tick");
        assert_eq!(stats.claimed, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(30)).await;
        let stats = pool
            .tick_queue(QueueName::WebhookProcessing)
            .await
            .expect("tick");
        assert_eq!(stats.promoted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
