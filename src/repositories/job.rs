//! Job repository
//!
//! Single source of truth for job rows. Claiming is a guarded update (the
//! row must still be `waiting`) so two pool ticks can never run the same
//! job, and every attempt counter moves through a column expression so
//! concurrent writers never lose an increment. Terminal transitions guard
//! on `active` the same way.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::job::{self, Column, Entity as Job, JobStatus, QueueName};

/// Repository for job persistence
#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        queue: QueueName,
        job_key: Option<String>,
        payload: JsonValue,
        priority: i16,
        max_attempts: i32,
        status: JobStatus,
        next_run_at: DateTimeWithTimeZone,
    ) -> Result<job::Model, DbErr> {
        let now = Utc::now().into();
        let model = job::ActiveModel {
            id: Set(Uuid::new_v4()),
            queue: Set(queue),
            job_key: Set(job_key),
            payload: Set(payload),
            priority: Set(priority),
            attempts_made: Set(0),
            max_attempts: Set(max_attempts),
            status: Set(status),
            next_run_at: Set(next_run_at),
            last_error: Set(None),
            started_at: Set(None),
            finished_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        model.insert(&self.db).await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<job::Model>, DbErr> {
        Job::find_by_id(id).one(&self.db).await
    }

    pub async fn find_by_key(
        &self,
        queue: QueueName,
        job_key: &str,
    ) -> Result<Option<job::Model>, DbErr> {
        Job::find()
            .filter(Column::Queue.eq(queue))
            .filter(Column::JobKey.eq(job_key))
            .one(&self.db)
            .await
    }

    /// Counts jobs per lifecycle state within a queue.
    pub async fn counts_by_status(
        &self,
        queue: QueueName,
    ) -> Result<Vec<(JobStatus, i64)>, DbErr> {
        Job::find()
            .select_only()
            .column(Column::Status)
            .column_as(Column::Id.count(), "count")
            .filter(Column::Queue.eq(queue))
            .group_by(Column::Status)
            .into_tuple::<(JobStatus, i64)>()
            .all(&self.db)
            .await
    }

    /// Moves delayed jobs whose wake-up time has passed back to `waiting`.
    pub async fn promote_due_delayed(&self, queue: QueueName) -> Result<u64, DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let result = Job::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Waiting))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Queue.eq(queue))
            .filter(Column::Status.eq(JobStatus::Delayed))
            .filter(Column::NextRunAt.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Finds runnable jobs in dispatch order: priority ascending (lower runs
    /// first), then enqueue time.
    pub async fn find_due_waiting(
        &self,
        queue: QueueName,
        limit: u64,
    ) -> Result<Vec<job::Model>, DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        Job::find()
            .filter(Column::Queue.eq(queue))
            .filter(Column::Status.eq(JobStatus::Waiting))
            .filter(Column::NextRunAt.lte(now))
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// Claims a job for execution. Returns false when another worker won the
    /// race; the guarded filter makes the transition atomic.
    pub async fn claim(&self, id: Uuid) -> Result<bool, DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let result = Job::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Active))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(JobStatus::Waiting))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        Job::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Completed))
            .col_expr(Column::AttemptsMade, Expr::col(Column::AttemptsMade).add(1))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(JobStatus::Active))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Parks a failed job in `delayed` until its backoff expires.
    pub async fn retry_later(
        &self,
        id: Uuid,
        next_run_at: DateTimeWithTimeZone,
        error: JsonValue,
    ) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        Job::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Delayed))
            .col_expr(Column::AttemptsMade, Expr::col(Column::AttemptsMade).add(1))
            .col_expr(Column::NextRunAt, Expr::value(next_run_at))
            .col_expr(Column::LastError, Expr::value(error))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(JobStatus::Active))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Dead-letters a job whose retry budget is spent or whose failure was
    /// fatal.
    pub async fn fail_terminal(&self, id: Uuid, error: JsonValue) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        Job::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Failed))
            .col_expr(Column::AttemptsMade, Expr::col(Column::AttemptsMade).add(1))
            .col_expr(Column::LastError, Expr::value(error))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(JobStatus::Active))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Deletes terminal jobs beyond the newest `keep` rows for one status.
    pub async fn reap_terminal(
        &self,
        queue: QueueName,
        status: JobStatus,
        keep: u64,
    ) -> Result<u64, DbErr> {
        let ids: Vec<Uuid> = Job::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Queue.eq(queue))
            .filter(Column::Status.eq(status))
            .order_by_desc(Column::FinishedAt)
            .order_by_desc(Column::CreatedAt)
            .into_tuple()
            .all(&self.db)
            .await?;

        let stale: Vec<Uuid> = ids.into_iter().skip(keep as usize).collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let result = Job::delete_many()
            .filter(Column::Id.is_in(stale))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Deletes terminal jobs that finished before the cutoff, across all
    /// queues.
    pub async fn clean_finished_before(
        &self,
        cutoff: DateTimeWithTimeZone,
    ) -> Result<u64, DbErr> {
        let result = Job::delete_many()
            .filter(Column::Status.is_in([JobStatus::Completed, JobStatus::Failed]))
            .filter(Column::FinishedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Requeues dead-lettered jobs, oldest failure first, with a fresh
    /// attempt budget. The previous error is kept for the audit trail.
    pub async fn retry_failed(&self, queue: QueueName, limit: u64) -> Result<u64, DbErr> {
        let ids: Vec<Uuid> = Job::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Queue.eq(queue))
            .filter(Column::Status.eq(JobStatus::Failed))
            .order_by_asc(Column::FinishedAt)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let now: DateTimeWithTimeZone = Utc::now().into();
        let result = Job::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Waiting))
            .col_expr(Column::AttemptsMade, Expr::value(0))
            .col_expr(Column::NextRunAt, Expr::value(now))
            .col_expr(
                Column::FinishedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.is_in(ids))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Returns which of the given dedup keys already have a job row.
    pub async fn find_existing_keys(
        &self,
        queue: QueueName,
        keys: &[String],
    ) -> Result<Vec<String>, DbErr> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        Job::find()
            .select_only()
            .column(Column::JobKey)
            .filter(Column::Queue.eq(queue))
            .filter(Column::JobKey.is_in(keys.iter().map(String::as_str)))
            .into_tuple()
            .all(&self.db)
            .await
    }
}
