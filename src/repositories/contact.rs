//! Contact repository
//!
//! Merge order during reconciliation: provider external id first, then
//! phone/email. The external-id probe filters in Rust because the ids live
//! in a JSON map and serialized-JSON LIKE matching is not portable across
//! backends.

use chrono::Utc;
use sea_orm::sea_query::Condition;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::contact::{self, Column, Entity as Contact};

/// Repository for contact persistence
pub struct ContactRepository {
    db: DatabaseConnection,
}

impl ContactRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        tenant_id: Uuid,
        name: Option<String>,
        phone: Option<String>,
        email: Option<String>,
        external_ids: Option<JsonValue>,
    ) -> Result<contact::Model, DbErr> {
        let now = Utc::now().into();
        let model = contact::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            name: Set(name),
            phone: Set(phone),
            email: Set(email),
            external_ids: Set(external_ids),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = model.insert(&self.db).await?;

        tracing::info!(
            contact_id = %result.id,
            tenant_id = %result.tenant_id,
            "Contact created"
        );

        Ok(result)
    }

    /// Finds the tenant's contact carrying `external_id` under `external_key`
    /// in its provider-id map.
    pub async fn find_by_external_id(
        &self,
        tenant_id: Uuid,
        external_key: &str,
        external_id: &str,
    ) -> Result<Option<contact::Model>, DbErr> {
        let candidates = Contact::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::ExternalIds.is_not_null())
            .all(&self.db)
            .await?;

        Ok(candidates.into_iter().find(|c| {
            c.external_ids
                .as_ref()
                .and_then(|ids| ids.get(external_key))
                .and_then(|id| id.as_str())
                == Some(external_id)
        }))
    }

    /// Finds a contact by phone or email within a tenant. Returns `None`
    /// without querying when neither key is present.
    pub async fn find_by_phone_or_email(
        &self,
        tenant_id: Uuid,
        phone: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<contact::Model>, DbErr> {
        if phone.is_none() && email.is_none() {
            return Ok(None);
        }

        let matcher = Condition::any()
            .add_option(phone.map(|p| Column::Phone.eq(p)))
            .add_option(email.map(|e| Column::Email.eq(e)));

        Contact::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(matcher)
            .one(&self.db)
            .await
    }

    /// Finds a contact whose phone matches any of the given numbers.
    pub async fn find_by_any_phone(
        &self,
        tenant_id: Uuid,
        numbers: &[&str],
    ) -> Result<Option<contact::Model>, DbErr> {
        if numbers.is_empty() {
            return Ok(None);
        }

        Contact::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Phone.is_in(numbers.iter().copied()))
            .one(&self.db)
            .await
    }

    /// Folds a provider identity into an existing contact: the external id
    /// is merged key-wise into the id map, a provided name wins over the
    /// stored one, and phone/email only fill gaps.
    pub async fn merge_provider_identity(
        &self,
        contact: contact::Model,
        name: Option<String>,
        phone: Option<String>,
        email: Option<String>,
        external_key: &str,
        external_id: &str,
    ) -> Result<contact::Model, DbErr> {
        let mut ids = contact
            .external_ids
            .as_ref()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        ids.insert(
            external_key.to_string(),
            JsonValue::String(external_id.to_string()),
        );

        let fill_phone = contact.phone.is_none();
        let fill_email = contact.email.is_none();

        let mut active: contact::ActiveModel = contact.into();
        active.external_ids = Set(Some(JsonValue::Object(ids)));
        if let Some(name) = name {
            active.name = Set(Some(name));
        }
        if fill_phone && phone.is_some() {
            active.phone = Set(phone);
        }
        if fill_email && email.is_some() {
            active.email = Set(email);
        }
        active.updated_at = Set(Utc::now().into());

        active.update(&self.db).await
    }
}
