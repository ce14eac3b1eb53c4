//! # Notification Dispatch
//!
//! Handler for the `notifications` queue. Delivery state lives on the
//! notification row; the job is only the scheduling vehicle, so a retryable
//! transport failure surfaces as a retryable job error and the queue's
//! backoff drives the next attempt. `next_retry_at` on the row is an
//! informational hint, not a second scheduler.

use async_trait::async_trait;
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::crypto::{EncryptedBlob, TokenGuard};
use crate::models::notification::{self, NotificationKind, NotificationStatus};
use crate::models::{ProviderKind, job};
use crate::providers::{BotApi, BotCredentials};
use crate::queue::NotificationJobPayload;
use crate::queue::worker::{JobError, JobHandler};
use crate::repositories::{IntegrationRepository, NotificationRepository};

/// Handler for the `notifications` queue.
pub struct NotificationDispatchHandler {
    notifications: NotificationRepository,
    integrations: IntegrationRepository,
    guard: Arc<TokenGuard>,
    bot: Arc<dyn BotApi>,
}

impl NotificationDispatchHandler {
    pub fn new(db: DatabaseConnection, guard: Arc<TokenGuard>, bot: Arc<dyn BotApi>) -> Self {
        Self {
            notifications: NotificationRepository::new(db.clone()),
            integrations: IntegrationRepository::new(db),
            guard,
            bot,
        }
    }

    /// Terminal failure: the notification dead-letters now, whatever the
    /// remaining attempt budget.
    async fn fail_terminal(
        &self,
        notification: &notification::Model,
        message: &str,
    ) -> Result<(), JobError> {
        self.notifications
            .mark_failed(notification.id, message)
            .await?;
        error!(
            notification_id = %notification.id,
            error = %message,
            "Notification dead-lettered"
        );
        Err(JobError::fatal(message.to_string()))
    }

    /// Books a failure on the row; exhausting the budget flips it terminal.
    async fn record_retryable(
        &self,
        notification: &notification::Model,
        message: &str,
    ) -> Result<(), JobError> {
        let status = self
            .notifications
            .record_failure(notification, message)
            .await?;
        match status {
            NotificationStatus::Retrying => {
                warn!(
                    notification_id = %notification.id,
                    error = %message,
                    "Notification dispatch failed; will retry"
                );
                Err(JobError::retryable(message.to_string()))
            }
            _ => {
                error!(
                    notification_id = %notification.id,
                    error = %message,
                    "Notification dead-lettered"
                );
                Err(JobError::fatal(message.to_string()))
            }
        }
    }

    async fn dispatch_bot(&self, notification: &notification::Model) -> Result<(), JobError> {
        let Some(integration) = self
            .integrations
            .find_active(notification.tenant_id, ProviderKind::Bot)
            .await?
        else {
            return self
                .record_retryable(notification, "no active bot integration")
                .await;
        };

        let Some(raw) = integration.credentials_ciphertext.as_deref() else {
            return self
                .fail_terminal(notification, "bot integration has no stored credentials")
                .await;
        };
        let credentials: BotCredentials = match EncryptedBlob::from_json(raw)
            .and_then(|blob| self.guard.decrypt_json(&blob))
        {
            Ok(credentials) => credentials,
            Err(err) => {
                return self
                    .fail_terminal(notification, &format!("credential decryption failed: {err}"))
                    .await;
            }
        };

        let chat_id = match notification.payload.get("chat_id") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => {
                return self
                    .fail_terminal(notification, "notification payload missing chat_id")
                    .await;
            }
        };
        let Some(text) = notification.payload.get("text").and_then(|v| v.as_str()) else {
            return self
                .fail_terminal(notification, "notification payload missing text")
                .await;
        };

        match self
            .bot
            .send_message(&credentials.bot_token, &chat_id, text)
            .await
        {
            Ok(()) => {
                self.notifications.mark_sent(notification.id).await?;

                let metric_labels = vec![("kind", notification.kind.as_str().to_string())];
                counter!("notifications_sent_total", &metric_labels).increment(1);

                info!(
                    notification_id = %notification.id,
                    tenant_id = %notification.tenant_id,
                    "Notification sent"
                );
                Ok(())
            }
            Err(err) if err.is_transient() => {
                self.record_retryable(notification, &err.to_string()).await
            }
            Err(err) => self.fail_terminal(notification, &err.to_string()).await,
        }
    }
}

#[async_trait]
impl JobHandler for NotificationDispatchHandler {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &job::Model) -> Result<(), JobError> {
        let payload = NotificationJobPayload::from_json(&job.payload)?;

        let notification = self
            .notifications
            .find_by_id(payload.notification_id)
            .await?
            .ok_or_else(|| {
                JobError::fatal(format!(
                    "notification {} not found",
                    payload.notification_id
                ))
            })?;

        if notification.status.is_terminal() {
            debug!(
                notification_id = %notification.id,
                status = ?notification.status,
                "Notification already terminal; skipping"
            );
            return Ok(());
        }

        match notification.kind {
            NotificationKind::Bot => self.dispatch_bot(&notification).await,
            NotificationKind::Email => {
                self.fail_terminal(&notification, "email dispatch not implemented")
                    .await
            }
            NotificationKind::Sms => {
                self.fail_terminal(&notification, "sms dispatch not implemented")
                    .await
            }
        }
    }
}
