//! Migration to create the leads table.
//!
//! Leads upsert by (tenant_id, external_id), so that pair is unique. Rows
//! created through other channels may have no external id yet.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Leads::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Leads::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Leads::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Leads::ExternalId).text().null())
                    .col(ColumnDef::new(Leads::Title).text().not_null())
                    .col(ColumnDef::new(Leads::Status).text().null())
                    .col(ColumnDef::new(Leads::ContactId).uuid().null())
                    .col(ColumnDef::new(Leads::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(Leads::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Leads::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_leads_tenant_id")
                            .from(Leads::Table, Leads::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_leads_contact_id")
                            .from(Leads::Table, Leads::ContactId)
                            .to(Contacts::Table, Contacts::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_leads_tenant_external")
                    .table(Leads::Table)
                    .col(Leads::TenantId)
                    .col(Leads::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Call linking walks a contact's leads oldest-first.
        manager
            .create_index(
                Index::create()
                    .name("idx_leads_contact_created")
                    .table(Leads::Table)
                    .col(Leads::ContactId)
                    .col(Leads::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_leads_tenant_external").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_leads_contact_created").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Leads::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Leads {
    Table,
    Id,
    TenantId,
    ExternalId,
    Title,
    Status,
    ContactId,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Contacts {
    Table,
    Id,
}
