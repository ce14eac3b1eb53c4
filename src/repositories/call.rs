//! Call repository
//!
//! Calls upsert by (tenant_id, external_id) like leads; the provider's call
//! id is the natural key and redeliveries overwrite the mutable fields.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Set,
};
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::call::{self, Column, Entity as Call};

/// Field set written on every telephony upsert.
#[derive(Clone, Debug)]
pub struct CallRecord {
    pub external_id: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub direction: String,
    pub status: String,
    pub duration: Option<i32>,
    pub recording_url: Option<String>,
    pub contact_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub started_at: Option<DateTimeWithTimeZone>,
}

/// Repository for call persistence
pub struct CallRepository {
    db: DatabaseConnection,
}

impl CallRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts or updates the call identified by (tenant, external id).
    /// Returns the row and whether it was created.
    pub async fn upsert_by_external_id(
        &self,
        tenant_id: Uuid,
        record: CallRecord,
    ) -> Result<(call::Model, bool), DbErr> {
        if let Some(existing) = self
            .find_by_external_id(tenant_id, &record.external_id)
            .await?
        {
            let updated = self.apply_update(existing, record).await?;
            return Ok((updated, false));
        }

        let now = Utc::now().into();
        let model = call::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            external_id: Set(record.external_id.clone()),
            from_number: Set(record.from_number.clone()),
            to_number: Set(record.to_number.clone()),
            direction: Set(record.direction.clone()),
            status: Set(record.status.clone()),
            duration: Set(record.duration),
            recording_url: Set(record.recording_url.clone()),
            contact_id: Set(record.contact_id),
            lead_id: Set(record.lead_id),
            started_at: Set(record.started_at),
            created_at: Set(now),
        };

        match model.insert(&self.db).await {
            Ok(created) => {
                tracing::info!(
                    call_id = %created.id,
                    tenant_id = %created.tenant_id,
                    external_id = %created.external_id,
                    "Call recorded"
                );
                Ok((created, true))
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = self
                    .find_by_external_id(tenant_id, &record.external_id)
                    .await?
                    .ok_or(err)?;
                let updated = self.apply_update(existing, record).await?;
                Ok((updated, false))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Option<call::Model>, DbErr> {
        Call::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await
    }

    pub async fn count_for_tenant(&self, tenant_id: Uuid) -> Result<u64, DbErr> {
        Call::find()
            .filter(Column::TenantId.eq(tenant_id))
            .count(&self.db)
            .await
    }

    async fn apply_update(
        &self,
        existing: call::Model,
        record: CallRecord,
    ) -> Result<call::Model, DbErr> {
        let mut active: call::ActiveModel = existing.into();
        active.status = Set(record.status);
        active.duration = Set(record.duration);
        active.recording_url = Set(record.recording_url);
        if record.contact_id.is_some() {
            active.contact_id = Set(record.contact_id);
        }
        if record.lead_id.is_some() {
            active.lead_id = Set(record.lead_id);
        }
        active.update(&self.db).await
    }
}
