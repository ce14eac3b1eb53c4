//! Lead repository
//!
//! Upsert key is (tenant_id, external_id); redelivered provider events must
//! land on the same row. A unique index backs the key, and the insert path
//! falls back to update when a concurrent delivery wins the race.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::lead::{self, Column, Entity as Lead};

/// Repository for lead persistence
pub struct LeadRepository {
    db: DatabaseConnection,
}

impl LeadRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts or updates the lead identified by (tenant, external id).
    /// Returns the row and whether it was created.
    pub async fn upsert_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
        title: String,
        status: Option<String>,
        contact_id: Option<Uuid>,
        metadata: Option<JsonValue>,
    ) -> Result<(lead::Model, bool), DbErr> {
        if let Some(existing) = self.find_by_external_id(tenant_id, external_id).await? {
            let updated = self
                .apply_update(existing, title, status, contact_id, metadata)
                .await?;
            return Ok((updated, false));
        }

        let now = Utc::now().into();
        let model = lead::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            external_id: Set(Some(external_id.to_string())),
            title: Set(title.clone()),
            status: Set(status.clone()),
            contact_id: Set(contact_id),
            metadata: Set(metadata.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(&self.db).await {
            Ok(created) => {
                tracing::info!(
                    lead_id = %created.id,
                    tenant_id = %created.tenant_id,
                    external_id = %external_id,
                    "Lead created"
                );
                Ok((created, true))
            }
            // Concurrent delivery created the row between probe and insert.
            Err(err) if is_unique_violation(&err) => {
                let existing = self
                    .find_by_external_id(tenant_id, external_id)
                    .await?
                    .ok_or(err)?;
                let updated = self
                    .apply_update(existing, title, status, contact_id, metadata)
                    .await?;
                Ok((updated, false))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Option<lead::Model>, DbErr> {
        Lead::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await
    }

    /// The contact's earliest lead; telephony linking attaches calls to it.
    pub async fn find_first_for_contact(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Option<lead::Model>, DbErr> {
        Lead::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ContactId.eq(contact_id))
            .order_by_asc(Column::CreatedAt)
            .one(&self.db)
            .await
    }

    pub async fn count_for_tenant(&self, tenant_id: Uuid) -> Result<u64, DbErr> {
        Lead::find()
            .filter(Column::TenantId.eq(tenant_id))
            .count(&self.db)
            .await
    }

    async fn apply_update(
        &self,
        existing: lead::Model,
        title: String,
        status: Option<String>,
        contact_id: Option<Uuid>,
        metadata: Option<JsonValue>,
    ) -> Result<lead::Model, DbErr> {
        let mut active: lead::ActiveModel = existing.into();
        active.title = Set(title);
        active.status = Set(status);
        if contact_id.is_some() {
            active.contact_id = Set(contact_id);
        }
        active.metadata = Set(metadata);
        active.updated_at = Set(Utc::now().into());
        active.update(&self.db).await
    }
}
