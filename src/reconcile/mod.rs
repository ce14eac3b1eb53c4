//! # Reconciliation Pipeline
//!
//! Job handlers that turn persisted webhook events into domain rows, keep
//! tenants in sync with their CRM, and produce export summaries. Every
//! handler is idempotent against redelivery: events are skipped once
//! processed, and all domain writes are keyed upserts.

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::crypto::{CryptoError, EncryptedBlob, TokenGuard};
use crate::models::webhook_event;
use crate::models::{ProviderKind, job};
use crate::providers::{CrmApi, CrmCredentials, ProviderError};
use crate::queue::worker::{JobError, JobHandler};
use crate::queue::{ExportJobPayload, JobQueue, SyncJobPayload, WebhookJobPayload};
use crate::repositories::{
    CallRepository, ContactRepository, IntegrationRepository, LeadRepository,
    NotificationRepository, WebhookEventRepository,
};

mod bot;
mod crm;
mod telephony;


/// Failure while applying an event to domain state.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("credential decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("{0}")]
    Payload(String),
}

impl ReconcileError {
    /// Infrastructure faults heal on retry; bad payloads and bad keys do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Database(_) => true,
            ReconcileError::Provider(err) => err.is_transient(),
            ReconcileError::Crypto(_) => false,
            ReconcileError::Payload(_) => false,
        }
    }
}

impl From<ReconcileError> for JobError {
    fn from(err: ReconcileError) -> Self {
        if err.is_retryable() {
            JobError::retryable(err.to_string())
        } else {
            JobError::fatal(err.to_string())
        }
    }
}

/// Classifies a raw payload at ingest time, before any tenant is known.
pub fn derive_event_type(source: ProviderKind, payload: &JsonValue) -> String {
    match source {
        ProviderKind::Crm => {
            if payload.get("account").and_then(|a| a.get("id")).is_some() {
                "account_update".to_string()
            } else {
                "unknown".to_string()
            }
        }
        ProviderKind::Telephony => payload
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("call_event")
            .to_string(),
        ProviderKind::Bot => "message".to_string(),
    }
}

/// Providers send ids as numbers or strings interchangeably; storage always
/// uses the string form.
fn json_id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Handler for the `webhook-processing` queue.
///
/// Loads the event, resolves its tenant, applies the provider-specific
/// reconciliation and records the outcome on the event row. Event rows are
/// the audit trail: every terminal path leaves `processed = true` with
/// either a clean `processed_at` or an explanatory `error_message`.
pub struct ReconcileHandler {
    events: WebhookEventRepository,
    integrations: IntegrationRepository,
    leads: LeadRepository,
    contacts: ContactRepository,
    calls: CallRepository,
    notifications: NotificationRepository,
    queues: Arc<JobQueue>,
}

impl ReconcileHandler {
    pub fn new(db: DatabaseConnection, queues: Arc<JobQueue>) -> Self {
        Self {
            events: WebhookEventRepository::new(db.clone()),
            integrations: IntegrationRepository::new(db.clone()),
            leads: LeadRepository::new(db.clone()),
            contacts: ContactRepository::new(db.clone()),
            calls: CallRepository::new(db.clone()),
            notifications: NotificationRepository::new(db),
            queues,
        }
    }

    /// Stored tenant wins; otherwise CRM events are matched against the
    /// `account_id` setting of active CRM integrations.
    async fn resolve_tenant(&self, event: &webhook_event::Model) -> Result<Option<Uuid>, DbErr> {
        if let Some(tenant_id) = event.tenant_id {
            return Ok(Some(tenant_id));
        }

        if event.source != ProviderKind::Crm {
            return Ok(None);
        }

        let Some(account_id) = event
            .payload
            .get("account")
            .and_then(|a| a.get("id"))
            .and_then(json_id_string)
        else {
            return Ok(None);
        };

        let integrations = self
            .integrations
            .find_all_active_by_provider(ProviderKind::Crm)
            .await?;

        Ok(integrations
            .into_iter()
            .find(|i| i.setting_str("account_id") == Some(account_id.as_str()))
            .map(|i| i.tenant_id))
    }

    async fn apply(
        &self,
        event: &webhook_event::Model,
        tenant_id: Uuid,
    ) -> Result<(), ReconcileError> {
        match event.source {
            ProviderKind::Crm => self.apply_crm(tenant_id, &event.payload).await,
            ProviderKind::Telephony => self.apply_telephony(tenant_id, &event.payload).await,
            ProviderKind::Bot => self.apply_bot(tenant_id, &event.payload).await,
        }
    }

    /// Books the failure on the event row and translates it for the worker.
    /// A retryable error on the final attempt dead-letters the event along
    /// with the job.
    async fn record_reconcile_failure(
        &self,
        job: &job::Model,
        event: &webhook_event::Model,
        err: ReconcileError,
    ) -> Result<(), JobError> {
        let message = err.to_string();
        let attempts_after = job.attempts_made.saturating_add(1);

        if err.is_retryable() {
            if attempts_after >= job.max_attempts {
                self.events.mark_terminal_failure(event.id, &message).await?;
            } else {
                self.events.record_failure(event.id, &message).await?;
            }
            Err(JobError::retryable(message))
        } else {
            self.events.mark_terminal_failure(event.id, &message).await?;
            Err(JobError::fatal(message))
        }
    }
}

#[async_trait]
impl JobHandler for ReconcileHandler {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &job::Model) -> Result<(), JobError> {
        let payload = WebhookJobPayload::from_json(&job.payload)?;

        let event = self
            .events
            .find_by_id(payload.event_id)
            .await?
            .ok_or_else(|| {
                JobError::fatal(format!("webhook event {} not found", payload.event_id))
            })?;

        if event.processed {
            debug!(event_id = %event.id, "Webhook event already processed; skipping");
            return Ok(());
        }

        let Some(tenant_id) = self.resolve_tenant(&event).await? else {
            warn!(
                event_id = %event.id,
                source = %event.source,
                "Cannot determine tenant for webhook event"
            );
            self.events
                .mark_skipped(event.id, "Cannot determine tenant")
                .await?;
            return Ok(());
        };

        match self.apply(&event, tenant_id).await {
            Ok(()) => {
                self.events.mark_processed(event.id, Some(tenant_id)).await?;
                info!(
                    event_id = %event.id,
                    tenant_id = %tenant_id,
                    event_type = %event.event_type,
                    "Webhook event reconciled"
                );
                Ok(())
            }
            Err(err) => self.record_reconcile_failure(job, &event, err).await,
        }
    }
}

/// Handler for the `sync` queue: pulls the tenant's leads from the CRM and
/// runs them through the same upsert path webhook deliveries use.
pub struct SyncHandler {
    integrations: IntegrationRepository,
    leads: LeadRepository,
    guard: Arc<TokenGuard>,
    crm: Arc<dyn CrmApi>,
}

impl SyncHandler {
    pub fn new(db: DatabaseConnection, guard: Arc<TokenGuard>, crm: Arc<dyn CrmApi>) -> Self {
        Self {
            integrations: IntegrationRepository::new(db.clone()),
            leads: LeadRepository::new(db),
            guard,
            crm,
        }
    }
}

#[async_trait]
impl JobHandler for SyncHandler {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &job::Model) -> Result<(), JobError> {
        let payload = SyncJobPayload::from_json(&job.payload)?;

        let integration = self
            .integrations
            .find_active(payload.tenant_id, ProviderKind::Crm)
            .await?
            .ok_or_else(|| {
                JobError::fatal(format!(
                    "no active crm integration for tenant {}",
                    payload.tenant_id
                ))
            })?;

        let blob_raw = integration
            .credentials_ciphertext
            .as_deref()
            .ok_or_else(|| JobError::fatal("crm integration has no stored credentials"))?;
        let blob = EncryptedBlob::from_json(blob_raw)?;
        let credentials: CrmCredentials = self.guard.decrypt_json(&blob)?;

        let fetched = self.crm.fetch_leads(&credentials).await?;

        let mut created = 0u64;
        let mut updated = 0u64;
        let mut skipped = 0u64;
        for lead in &fetched {
            match crm::upsert_crm_lead(&self.leads, payload.tenant_id, lead).await? {
                crm::LeadUpsert::Created => created += 1,
                crm::LeadUpsert::Updated => updated += 1,
                crm::LeadUpsert::Skipped => skipped += 1,
            }
        }

        info!(
            tenant_id = %payload.tenant_id,
            fetched = fetched.len(),
            created = created,
            updated = updated,
            skipped = skipped,
            "CRM lead sync finished"
        );
        Ok(())
    }
}

/// Handler for the `exports` queue: counts the requested aggregate and logs
/// a summary.
pub struct ExportHandler {
    leads: LeadRepository,
    calls: CallRepository,
}

impl ExportHandler {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            leads: LeadRepository::new(db.clone()),
            calls: CallRepository::new(db),
        }
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &job::Model) -> Result<(), JobError> {
        let payload = ExportJobPayload::from_json(&job.payload)?;

        let rows = match payload.kind.as_str() {
            "leads" => self.leads.count_for_tenant(payload.tenant_id).await?,
            "calls" => self.calls.count_for_tenant(payload.tenant_id).await?,
            other => return Err(JobError::fatal(format!("unknown export kind '{other}'"))),
        };

        info!(
            tenant_id = %payload.tenant_id,
            kind = %payload.kind,
            rows = rows,
            "Export summary produced"
        );
        Ok(())
    }
}
