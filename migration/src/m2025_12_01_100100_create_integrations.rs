//! Migration to create the integrations table.
//!
//! An integration binds a tenant to one external provider (crm, telephony,
//! bot) with provider-specific settings and an encrypted credential blob.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Integrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Integrations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Integrations::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Integrations::Provider).text().not_null())
                    .col(
                        ColumnDef::new(Integrations::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(Integrations::Settings).json_binary().null())
                    .col(
                        ColumnDef::new(Integrations::CredentialsCiphertext)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integrations_tenant_id")
                            .from(Integrations::Table, Integrations::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integrations_tenant_provider_status")
                    .table(Integrations::Table)
                    .col(Integrations::TenantId)
                    .col(Integrations::Provider)
                    .col(Integrations::Status)
                    .to_owned(),
            )
            .await?;

        // Tenant resolution scans active integrations of one provider kind.
        manager
            .create_index(
                Index::create()
                    .name("idx_integrations_provider_status")
                    .table(Integrations::Table)
                    .col(Integrations::Provider)
                    .col(Integrations::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integrations_tenant_provider_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_integrations_provider_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Integrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
    TenantId,
    Provider,
    Status,
    Settings,
    CredentialsCiphertext,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
