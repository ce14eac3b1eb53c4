//! Contact entity model
//!
//! Contacts can arrive from CRM payloads (with external ids) or be created
//! through other channels; the phone/email columns are the secondary merge
//! keys reconciliation uses when no external id matches.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Contact entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "contacts")]
pub struct Model {
    /// Unique identifier for the contact (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Display name
    pub name: Option<String>,

    /// Primary phone number
    pub phone: Option<String>,

    /// Primary email address
    pub email: Option<String>,

    /// Map of provider kind to external identifier
    #[sea_orm(column_type = "JsonBinary")]
    pub external_ids: Option<JsonValue>,

    /// Timestamp when the contact was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the contact was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::lead::Entity")]
    Leads,
}

impl Related<super::lead::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Leads.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
