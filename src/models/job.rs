//! Job entity model
//!
//! One row per queued unit of work. Owned by the job queue manager; the
//! worker pool drives every status transition after enqueue.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Named queues, one per workload class.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
pub enum QueueName {
    #[sea_orm(string_value = "webhook-processing")]
    #[serde(rename = "webhook-processing")]
    WebhookProcessing,
    #[sea_orm(string_value = "notifications")]
    #[serde(rename = "notifications")]
    Notifications,
    #[sea_orm(string_value = "exports")]
    #[serde(rename = "exports")]
    Exports,
    #[sea_orm(string_value = "sync")]
    #[serde(rename = "sync")]
    Sync,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::WebhookProcessing,
        QueueName::Notifications,
        QueueName::Exports,
        QueueName::Sync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::WebhookProcessing => "webhook-processing",
            QueueName::Notifications => "notifications",
            QueueName::Exports => "exports",
            QueueName::Sync => "sync",
        }
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook-processing" => Ok(QueueName::WebhookProcessing),
            "notifications" => Ok(QueueName::Notifications),
            "exports" => Ok(QueueName::Exports),
            "sync" => Ok(QueueName::Sync),
            other => Err(format!("unknown queue '{other}'")),
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle states.
///
/// `waiting → active → {completed | failed}`; a retryable failure with
/// budget left parks the job in `delayed` until `next_run_at`, after which
/// it re-enters `waiting`.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[sea_orm(string_value = "waiting")]
    Waiting,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "delayed")]
    Delayed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
        }
    }
}

/// Job entity representing one queued unit of work
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Queue this job belongs to
    pub queue: QueueName,

    /// Explicit dedup key; at most one row per key
    pub job_key: Option<String>,

    /// Typed-per-queue payload
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Scheduling priority; lower runs first
    pub priority: i16,

    /// Number of finished runs
    pub attempts_made: i32,

    /// Attempt budget before the job dead-letters
    pub max_attempts: i32,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Earliest time the job may run
    pub next_run_at: DateTimeWithTimeZone,

    /// Structured record of the most recent failure
    #[sea_orm(column_type = "JsonBinary")]
    pub last_error: Option<JsonValue>,

    /// When the current/most recent run started
    pub started_at: Option<DateTimeWithTimeZone>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job was enqueued
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
