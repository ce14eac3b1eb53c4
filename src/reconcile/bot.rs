//! Bot payload reconciliation: inbound chat messages become operator
//! notifications when the tenant opted in via `notify_chat_id`.

use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ReconcileError, ReconcileHandler};
use crate::models::ProviderKind;
use crate::models::job::QueueName;
use crate::models::notification::NotificationKind;
use crate::queue::{AddJobOptions, NotificationJobPayload};

impl ReconcileHandler {
    pub(super) async fn apply_bot(
        &self,
        tenant_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), ReconcileError> {
        let Some(message) = payload.get("message") else {
            debug!(tenant_id = %tenant_id, "Bot update without message; nothing to do");
            return Ok(());
        };

        let Some(integration) = self
            .integrations
            .find_active(tenant_id, ProviderKind::Bot)
            .await?
        else {
            debug!(tenant_id = %tenant_id, "No active bot integration; skipping");
            return Ok(());
        };
        let Some(notify_chat_id) = integration.setting_str("notify_chat_id") else {
            debug!(
                tenant_id = %tenant_id,
                "Bot integration has no notify_chat_id; skipping"
            );
            return Ok(());
        };

        let username = message
            .get("from")
            .and_then(|f| f.get("username"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let text = message.get("text").and_then(|v| v.as_str()).unwrap_or("");

        let notification = self
            .notifications
            .create(
                tenant_id,
                NotificationKind::Bot,
                json!({
                    "chat_id": notify_chat_id,
                    "text": format!("New message from @{username}: {text}"),
                }),
                self.queues.settings(QueueName::Notifications).max_attempts,
            )
            .await?;

        let job_payload = NotificationJobPayload {
            notification_id: notification.id,
        };
        self.queues
            .add_job(
                QueueName::Notifications,
                job_payload.to_json(),
                AddJobOptions {
                    job_key: Some(job_payload.job_key()),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            notification_id = %notification.id,
            tenant_id = %tenant_id,
            "Operator notification enqueued for bot message"
        );
        Ok(())
    }
}
