//! # Data Models
//!
//! This module contains all the data models used throughout the Relay Hub API.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod call;
pub mod contact;
pub mod integration;
pub mod job;
pub mod lead;
pub mod notification;
pub mod tenant;
pub mod webhook_event;

pub use call::Entity as Call;
pub use contact::Entity as Contact;
pub use integration::Entity as Integration;
pub use job::Entity as Job;
pub use lead::Entity as Lead;
pub use notification::Entity as Notification;
pub use tenant::Entity as Tenant;
pub use webhook_event::Entity as WebhookEvent;

/// Closed set of external provider kinds the hub integrates with.
///
/// Adding a provider means adding a variant here plus a reconciliation
/// strategy arm; the compiler flags every dispatch site that needs one.
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
pub enum ProviderKind {
    /// CRM platform pushing lead/contact changes
    #[sea_orm(string_value = "crm")]
    Crm,
    /// VoIP platform pushing call events
    #[sea_orm(string_value = "telephony")]
    Telephony,
    /// Messaging-bot platform pushing chat updates
    #[sea_orm(string_value = "bot")]
    Bot,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Crm => "crm",
            ProviderKind::Telephony => "telephony",
            ProviderKind::Bot => "bot",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crm" => Ok(ProviderKind::Crm),
            "telephony" => Ok(ProviderKind::Telephony),
            "bot" => Ok(ProviderKind::Bot),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "relay-hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
