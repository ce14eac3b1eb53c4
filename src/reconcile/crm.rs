//! CRM payload reconciliation: lead upserts and contact identity merges.

use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ReconcileError, ReconcileHandler, json_id_string};
use crate::repositories::LeadRepository;

/// Key under which the CRM's contact id lives in a contact's id map.
const CRM_ID_KEY: &str = "crm_id";

/// Outcome of one lead upsert.
pub(super) enum LeadUpsert {
    Created,
    Updated,
    Skipped,
}

/// Upserts one raw CRM lead object. Shared by webhook delivery and pull
/// sync, so both paths agree on field mapping.
pub(super) async fn upsert_crm_lead(
    leads: &LeadRepository,
    tenant_id: Uuid,
    lead: &JsonValue,
) -> Result<LeadUpsert, ReconcileError> {
    let Some(external_id) = lead.get("id").and_then(json_id_string) else {
        warn!(tenant_id = %tenant_id, "CRM lead without id; skipping");
        return Ok(LeadUpsert::Skipped);
    };

    let title = lead
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("Untitled Lead")
        .to_string();
    let status = lead.get("status_id").and_then(json_id_string);

    let (_, created) = leads
        .upsert_by_external_id(tenant_id, &external_id, title, status, None, Some(lead.clone()))
        .await?;

    Ok(if created {
        LeadUpsert::Created
    } else {
        LeadUpsert::Updated
    })
}

/// First entry of the CRM's multi-value field shape:
/// `{"phone": [{"value": "..."}]}`.
fn first_collection_value(contact: &JsonValue, field: &str) -> Option<String> {
    contact
        .get(field)?
        .as_array()?
        .first()?
        .get("value")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ReconcileHandler {
    pub(super) async fn apply_crm(
        &self,
        tenant_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), ReconcileError> {
        if let Some(leads) = payload.get("leads").and_then(|v| v.as_array()) {
            for lead in leads {
                upsert_crm_lead(&self.leads, tenant_id, lead).await?;
            }
        }

        if let Some(contacts) = payload.get("contacts").and_then(|v| v.as_array()) {
            for contact in contacts {
                self.reconcile_crm_contact(tenant_id, contact).await?;
            }
        }

        Ok(())
    }

    /// Matches by CRM id first, then by phone/email; merges the CRM identity
    /// into whichever contact wins, or creates a fresh one.
    async fn reconcile_crm_contact(
        &self,
        tenant_id: Uuid,
        contact: &JsonValue,
    ) -> Result<(), ReconcileError> {
        let phone = first_collection_value(contact, "phone");
        let email = first_collection_value(contact, "email");

        if phone.is_none() && email.is_none() {
            debug!(tenant_id = %tenant_id, "CRM contact without phone or email; skipping");
            return Ok(());
        }

        let Some(external_id) = contact.get("id").and_then(json_id_string) else {
            warn!(tenant_id = %tenant_id, "CRM contact without id; skipping");
            return Ok(());
        };

        let name = contact
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let existing = match self
            .contacts
            .find_by_external_id(tenant_id, CRM_ID_KEY, &external_id)
            .await?
        {
            Some(found) => Some(found),
            None => {
                self.contacts
                    .find_by_phone_or_email(tenant_id, phone.as_deref(), email.as_deref())
                    .await?
            }
        };

        match existing {
            Some(found) => {
                self.contacts
                    .merge_provider_identity(found, name, phone, email, CRM_ID_KEY, &external_id)
                    .await?;
            }
            None => {
                self.contacts
                    .create(
                        tenant_id,
                        name,
                        phone,
                        email,
                        Some(json!({ CRM_ID_KEY: external_id })),
                    )
                    .await?;
            }
        }

        Ok(())
    }
}
