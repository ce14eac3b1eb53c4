//! Integration entity model
//!
//! An integration connects one tenant to one external provider. Credentials
//! live in `credentials_ciphertext` as an encrypted blob produced by the
//! token guard; provider-specific knobs (CRM account id, bot notify chat)
//! live in the `settings` JSON.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::ProviderKind;

/// Lifecycle status of an integration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "disabled")]
    Disabled,
}

/// Integration entity binding a tenant to a provider
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    /// Unique identifier for the integration (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Which provider this integration talks to
    pub provider: ProviderKind,

    /// Whether the integration participates in processing
    pub status: IntegrationStatus,

    /// Provider-specific settings (account_id, notify_chat_id, api_base, ...)
    #[sea_orm(column_type = "JsonBinary")]
    pub settings: Option<JsonValue>,

    /// Encrypted credential blob (JSON-serialized {ciphertext, iv, auth_tag})
    pub credentials_ciphertext: Option<String>,

    /// Timestamp when the integration was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the integration was last updated
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Reads a string setting from the settings JSON, if present.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.as_ref()?.get(key)?.as_str()
    }
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
