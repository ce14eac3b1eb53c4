//! Migration to create the webhook_events table.
//!
//! Immutable record of every received provider payload. tenant_id stays null
//! until reconciliation resolves it, so the column carries no foreign key.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebhookEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookEvents::Source).text().not_null())
                    .col(ColumnDef::new(WebhookEvents::EventType).text().not_null())
                    .col(
                        ColumnDef::new(WebhookEvents::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::Signature).text().null())
                    .col(ColumnDef::new(WebhookEvents::TenantId).uuid().null())
                    .col(
                        ColumnDef::new(WebhookEvents::Processed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(WebhookEvents::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_events_processed_created")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::Processed)
                    .col(WebhookEvents::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_events_tenant")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::TenantId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_webhook_events_processed_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_webhook_events_tenant").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(WebhookEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebhookEvents {
    Table,
    Id,
    Source,
    EventType,
    Payload,
    Signature,
    TenantId,
    Processed,
    ProcessedAt,
    ErrorMessage,
    RetryCount,
    CreatedAt,
}
