//! Lead entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lead entity, upserted by (tenant_id, external_id)
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "leads")]
pub struct Model {
    /// Unique identifier for the lead (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Identifier assigned by the originating CRM, if any
    pub external_id: Option<String>,

    /// Lead title
    pub title: String,

    /// Provider-defined pipeline status
    pub status: Option<String>,

    /// Owning contact, when known
    pub contact_id: Option<Uuid>,

    /// Raw provider attributes kept for audit
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Timestamp when the lead was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the lead was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::contact::Entity",
        from = "Column::ContactId",
        to = "super::contact::Column::Id"
    )]
    Contact,
}

impl Related<super::contact::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Contact.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
