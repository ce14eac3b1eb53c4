//! Webhook event repository
//!
//! Ingestion inserts rows before anything else touches the payload; the
//! reconciliation worker is the only writer afterwards. `retry_count` is
//! bumped with a column expression so concurrent attempts never lose an
//! increment.

use chrono::{Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::webhook_event::{self, Column, Entity as WebhookEvent};
use crate::models::ProviderKind;

/// Repository for webhook event persistence
pub struct WebhookEventRepository {
    db: DatabaseConnection,
}

impl WebhookEventRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Records a received payload. This write must succeed before the
    /// ingestion handler acknowledges the provider.
    pub async fn insert_event(
        &self,
        source: ProviderKind,
        event_type: String,
        payload: JsonValue,
        signature: Option<String>,
        tenant_id: Option<Uuid>,
    ) -> Result<webhook_event::Model, DbErr> {
        let event = webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            source: Set(source),
            event_type: Set(event_type),
            payload: Set(payload),
            signature: Set(signature),
            tenant_id: Set(tenant_id),
            processed: Set(false),
            processed_at: Set(None),
            error_message: Set(None),
            retry_count: Set(0),
            created_at: Set(Utc::now().into()),
        };

        let result = event.insert(&self.db).await?;

        tracing::info!(
            event_id = %result.id,
            source = %result.source.as_str(),
            event_type = %result.event_type,
            "Webhook event recorded"
        );

        Ok(result)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<webhook_event::Model>, DbErr> {
        WebhookEvent::find_by_id(id).one(&self.db).await
    }

    /// Marks an event fully reconciled, pinning the resolved tenant when the
    /// ingestion path did not already know it.
    pub async fn mark_processed(&self, id: Uuid, tenant_id: Option<Uuid>) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        let mut update = WebhookEvent::update_many()
            .col_expr(Column::Processed, Expr::value(true))
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .filter(Column::Id.eq(id));

        if let Some(tenant_id) = tenant_id {
            update = update.col_expr(Column::TenantId, Expr::value(tenant_id));
        }

        update.exec(&self.db).await?;
        Ok(())
    }

    /// Marks an event processed with an explanatory message. Used when the
    /// payload is undeliverable (no resolvable tenant) rather than failed.
    pub async fn mark_skipped(&self, id: Uuid, reason: &str) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        WebhookEvent::update_many()
            .col_expr(Column::Processed, Expr::value(true))
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .col_expr(Column::ErrorMessage, Expr::value(reason))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;

        tracing::warn!(event_id = %id, reason = %reason, "Webhook event skipped");
        Ok(())
    }

    /// Records a reconciliation failure: stores the message and bumps the
    /// retry counter atomically. The event stays unprocessed so the job
    /// retry (or a later requeue) can pick it up again.
    pub async fn record_failure(&self, id: Uuid, message: &str) -> Result<(), DbErr> {
        WebhookEvent::update_many()
            .col_expr(Column::ErrorMessage, Expr::value(message))
            .col_expr(Column::RetryCount, Expr::col(Column::RetryCount).add(1))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Marks an event processed after its job exhausted the retry budget,
    /// keeping the final error visible to operators. Without this the
    /// requeue sweep would re-enqueue a permanently failing payload forever.
    pub async fn mark_terminal_failure(&self, id: Uuid, message: &str) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        WebhookEvent::update_many()
            .col_expr(Column::Processed, Expr::value(true))
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .col_expr(Column::ErrorMessage, Expr::value(message))
            .col_expr(Column::RetryCount, Expr::col(Column::RetryCount).add(1))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;

        tracing::error!(event_id = %id, error = %message, "Webhook event dead-lettered");
        Ok(())
    }

    /// Annotates an event whose processing job could not be enqueued. The
    /// event stays unprocessed and is recovered by the requeue sweep.
    pub async fn record_enqueue_failure(&self, id: Uuid, message: &str) -> Result<(), DbErr> {
        WebhookEvent::update_many()
            .col_expr(Column::ErrorMessage, Expr::value(message))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Finds unprocessed events that have been sitting for at least
    /// `older_than`, oldest first.
    pub async fn find_unprocessed(
        &self,
        older_than: Duration,
        limit: u64,
    ) -> Result<Vec<webhook_event::Model>, DbErr> {
        let cutoff: DateTimeWithTimeZone = (Utc::now() - older_than).into();

        WebhookEvent::find()
            .filter(Column::Processed.eq(false))
            .filter(Column::CreatedAt.lt(cutoff))
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await
    }
}
