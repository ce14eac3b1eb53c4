//! Call entity model
//!
//! Telephony events land here, upserted by (tenant_id, external_id).
//! Direction and status keep the provider's vocabulary, so they stay
//! free-form strings rather than closed enums.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Call entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "calls")]
pub struct Model {
    /// Unique identifier for the call (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Call identifier assigned by the telephony provider
    pub external_id: String,

    /// Calling number
    pub from_number: Option<String>,

    /// Called number
    pub to_number: Option<String>,

    /// inbound or outbound (provider vocabulary)
    pub direction: String,

    /// completed, missed, busy, ... (provider vocabulary)
    pub status: String,

    /// Call duration in seconds
    pub duration: Option<i32>,

    /// URL of the call recording, when the provider exposes one
    pub recording_url: Option<String>,

    /// Linked contact, when a phone match was found
    pub contact_id: Option<Uuid>,

    /// Linked lead, when the matched contact has one
    pub lead_id: Option<Uuid>,

    /// When the call started, per the provider
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the call record was created
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
