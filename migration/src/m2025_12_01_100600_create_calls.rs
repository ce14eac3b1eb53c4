//! Migration to create the calls table.
//!
//! Call records upsert by (tenant_id, external_id) so telephony redelivery
//! stays idempotent. contact_id/lead_id are best-effort links.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Calls::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Calls::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Calls::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Calls::ExternalId).text().not_null())
                    .col(ColumnDef::new(Calls::FromNumber).text().null())
                    .col(ColumnDef::new(Calls::ToNumber).text().null())
                    .col(
                        ColumnDef::new(Calls::Direction)
                            .text()
                            .not_null()
                            .default("inbound"),
                    )
                    .col(
                        ColumnDef::new(Calls::Status)
                            .text()
                            .not_null()
                            .default("completed"),
                    )
                    .col(ColumnDef::new(Calls::Duration).integer().null())
                    .col(ColumnDef::new(Calls::RecordingUrl).text().null())
                    .col(ColumnDef::new(Calls::ContactId).uuid().null())
                    .col(ColumnDef::new(Calls::LeadId).uuid().null())
                    .col(
                        ColumnDef::new(Calls::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Calls::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_calls_tenant_id")
                            .from(Calls::Table, Calls::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_calls_tenant_external")
                    .table(Calls::Table)
                    .col(Calls::TenantId)
                    .col(Calls::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_calls_tenant_external").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Calls::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Calls {
    Table,
    Id,
    TenantId,
    ExternalId,
    FromNumber,
    ToNumber,
    Direction,
    Status,
    Duration,
    RecordingUrl,
    ContactId,
    LeadId,
    StartedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
