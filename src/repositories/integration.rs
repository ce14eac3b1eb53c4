//! Integration repository
//!
//! Reconciliation looks integrations up two ways: scoped to a tenant when
//! the event already carries one, and across all tenants of a provider when
//! the tenant has to be resolved from payload hints (CRM account id).

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::integration::{self, Column, Entity as Integration, IntegrationStatus};
use crate::models::ProviderKind;

/// Repository for integration persistence
pub struct IntegrationRepository {
    db: DatabaseConnection,
}

impl IntegrationRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        tenant_id: Uuid,
        provider: ProviderKind,
        settings: Option<JsonValue>,
        credentials_ciphertext: Option<String>,
    ) -> Result<integration::Model, DbErr> {
        let now = Utc::now().into();
        let model = integration::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            provider: Set(provider),
            status: Set(IntegrationStatus::Active),
            settings: Set(settings),
            credentials_ciphertext: Set(credentials_ciphertext),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = model.insert(&self.db).await?;

        tracing::info!(
            integration_id = %result.id,
            tenant_id = %result.tenant_id,
            provider = %result.provider.as_str(),
            "Integration created"
        );

        Ok(result)
    }

    /// Finds the active integration binding a tenant to a provider.
    pub async fn find_active(
        &self,
        tenant_id: Uuid,
        provider: ProviderKind,
    ) -> Result<Option<integration::Model>, DbErr> {
        Integration::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Provider.eq(provider))
            .filter(Column::Status.eq(IntegrationStatus::Active))
            .one(&self.db)
            .await
    }

    /// Lists every active integration for a provider across all tenants.
    /// Tenant resolution scans these for a matching settings hint.
    pub async fn find_all_active_by_provider(
        &self,
        provider: ProviderKind,
    ) -> Result<Vec<integration::Model>, DbErr> {
        Integration::find()
            .filter(Column::Provider.eq(provider))
            .filter(Column::Status.eq(IntegrationStatus::Active))
            .all(&self.db)
            .await
    }
}
