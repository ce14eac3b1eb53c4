//! Notification entity model
//!
//! Outbound message records. The dispatcher owns every transition after
//! creation; `sent` and `failed` are terminal.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Outbound transport kind.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[sea_orm(string_value = "bot")]
    Bot,
    #[sea_orm(string_value = "email")]
    Email,
    #[sea_orm(string_value = "sms")]
    Sms,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Bot => "bot",
            NotificationKind::Email => "email",
            NotificationKind::Sms => "sms",
        }
    }
}

/// Dispatch lifecycle states.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "sent")]
    Sent,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "retrying")]
    Retrying,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }
}

/// Notification entity representing one outbound message
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    /// Unique identifier for the notification (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Transport this notification goes out on
    pub kind: NotificationKind,

    /// Transport-specific payload (chat_id + text for bot)
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Current dispatch state
    pub status: NotificationStatus,

    /// Number of dispatch attempts made
    pub attempts: i32,

    /// Attempt budget before the notification dead-letters
    pub max_attempts: i32,

    /// Informational next-retry hint recorded on failure
    pub next_retry_at: Option<DateTimeWithTimeZone>,

    /// Most recent dispatch error
    pub error_message: Option<String>,

    /// When the notification went out
    pub sent_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the notification was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the notification was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant::Entity",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id"
    )]
    Tenant,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
