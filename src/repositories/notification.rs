//! Notification repository
//!
//! Dispatch bookkeeping lives here: `attempts` moves through a column
//! expression, and the status decision on failure uses the attempt count
//! the dispatcher loaded, with the exponential hint computed from the
//! pre-increment value.

use chrono::{Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::notification::{
    self, Column, Entity as Notification, NotificationKind, NotificationStatus,
};

/// Repository for notification persistence
pub struct NotificationRepository {
    db: DatabaseConnection,
}

impl NotificationRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        tenant_id: Uuid,
        kind: NotificationKind,
        payload: JsonValue,
        max_attempts: i32,
    ) -> Result<notification::Model, DbErr> {
        let now = Utc::now().into();
        let model = notification::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            kind: Set(kind),
            payload: Set(payload),
            status: Set(NotificationStatus::Pending),
            attempts: Set(0),
            max_attempts: Set(max_attempts),
            next_retry_at: Set(None),
            error_message: Set(None),
            sent_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = model.insert(&self.db).await?;

        tracing::info!(
            notification_id = %result.id,
            tenant_id = %result.tenant_id,
            "Notification created"
        );

        Ok(result)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<notification::Model>, DbErr> {
        Notification::find_by_id(id).one(&self.db).await
    }

    /// Tenant-scoped lookup for the operator API.
    pub async fn find_for_tenant(
        &self,
        id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Option<notification::Model>, DbErr> {
        Notification::find()
            .filter(Column::Id.eq(id))
            .filter(Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await
    }

    pub async fn mark_sent(&self, id: Uuid) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        Notification::update_many()
            .col_expr(Column::Status, Expr::value(NotificationStatus::Sent))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::SentAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Terminal failure regardless of remaining attempt budget. Used when
    /// retrying cannot help (unsupported transport, undecryptable creds).
    pub async fn mark_failed(&self, id: Uuid, message: &str) -> Result<(), DbErr> {
        let now: DateTimeWithTimeZone = Utc::now().into();
        Notification::update_many()
            .col_expr(Column::Status, Expr::value(NotificationStatus::Failed))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::ErrorMessage, Expr::value(message))
            .col_expr(
                Column::NextRetryAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Records a dispatch failure and returns the resulting status. The
    /// retry hint doubles per attempt: 1s after the first failure, 2s after
    /// the second, and so on.
    pub async fn record_failure(
        &self,
        current: &notification::Model,
        message: &str,
    ) -> Result<NotificationStatus, DbErr> {
        let new_attempts = current.attempts.saturating_add(1);
        let status = if new_attempts >= current.max_attempts {
            NotificationStatus::Failed
        } else {
            NotificationStatus::Retrying
        };

        let now: DateTimeWithTimeZone = Utc::now().into();
        let next_retry_at = match status {
            NotificationStatus::Retrying => {
                let backoff_secs = 1_i64 << current.attempts.clamp(0, 20);
                Some(DateTimeWithTimeZone::from(
                    Utc::now() + Duration::seconds(backoff_secs),
                ))
            }
            _ => None,
        };

        Notification::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::ErrorMessage, Expr::value(message))
            .col_expr(Column::NextRetryAt, Expr::value(next_retry_at))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(current.id))
            .exec(&self.db)
            .await?;

        Ok(status)
    }
}
