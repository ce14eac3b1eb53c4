//! Telephony payload reconciliation: call upserts and phone-based linking.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use super::{ReconcileError, ReconcileHandler, json_id_string};
use crate::repositories::call::CallRecord;

fn str_field(payload: &JsonValue, field: &str) -> Option<String> {
    payload
        .get(field)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ReconcileHandler {
    /// Upserts the call and, when either leg's number matches a known
    /// contact, links the call to that contact and its earliest lead.
    pub(super) async fn apply_telephony(
        &self,
        tenant_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), ReconcileError> {
        let external_id = payload
            .get("call_id")
            .and_then(json_id_string)
            .unwrap_or_else(|| format!("telephony-{}", Utc::now().timestamp_millis()));

        let from_number = str_field(payload, "from");
        let to_number = str_field(payload, "to");

        let mut contact_id = None;
        let mut lead_id = None;
        let numbers: Vec<&str> = [from_number.as_deref(), to_number.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if let Some(contact) = self.contacts.find_by_any_phone(tenant_id, &numbers).await? {
            contact_id = Some(contact.id);
            lead_id = self
                .leads
                .find_first_for_contact(tenant_id, contact.id)
                .await?
                .map(|lead| lead.id);
        }

        let started_at: DateTimeWithTimeZone = payload
            .get("started_at")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .unwrap_or_else(|| Utc::now().into());

        let record = CallRecord {
            external_id,
            from_number,
            to_number,
            direction: str_field(payload, "direction").unwrap_or_else(|| "inbound".to_string()),
            status: str_field(payload, "status").unwrap_or_else(|| "completed".to_string()),
            duration: payload
                .get("duration")
                .and_then(|v| v.as_i64())
                .map(|d| d as i32),
            recording_url: str_field(payload, "recording_url"),
            contact_id,
            lead_id,
            started_at: Some(started_at),
        };

        let (call, _) = self.calls.upsert_by_external_id(tenant_id, record).await?;
        debug!(
            call_id = %call.id,
            tenant_id = %tenant_id,
            contact_linked = call.contact_id.is_some(),
            "Telephony event reconciled"
        );
        Ok(())
    }
}
