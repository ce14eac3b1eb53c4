//! WebhookEvent entity model
//!
//! Immutable record of a received provider payload. Ingestion creates rows;
//! reconciliation is the only writer afterwards (processed flag, error
//! message, retry count). Rows are never deleted by the processing core.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::ProviderKind;

/// WebhookEvent entity representing one received payload
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    /// Unique identifier for the event (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Provider kind that sent the payload
    pub source: ProviderKind,

    /// Free-form classification of the payload shape
    pub event_type: String,

    /// The raw payload exactly as received
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Signature header presented by the sender, if any
    pub signature: Option<String>,

    /// Owning tenant; null until reconciliation resolves it
    pub tenant_id: Option<Uuid>,

    /// Whether reconciliation has finished with this event
    pub processed: bool,

    /// When reconciliation finished
    pub processed_at: Option<DateTimeWithTimeZone>,

    /// Last reconciliation error, if any
    pub error_message: Option<String>,

    /// Number of failed reconciliation attempts
    pub retry_count: i32,

    /// Timestamp when the event was received
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
