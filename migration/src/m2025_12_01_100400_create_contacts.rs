//! Migration to create the contacts table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Contacts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Contacts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Contacts::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Contacts::Name).text().null())
                    .col(ColumnDef::new(Contacts::Phone).text().null())
                    .col(ColumnDef::new(Contacts::Email).text().null())
                    .col(ColumnDef::new(Contacts::ExternalIds).json_binary().null())
                    .col(
                        ColumnDef::new(Contacts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Contacts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_contacts_tenant_id")
                            .from(Contacts::Table, Contacts::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Secondary merge keys used when a payload carries no external id.
        manager
            .create_index(
                Index::create()
                    .name("idx_contacts_tenant_phone")
                    .table(Contacts::Table)
                    .col(Contacts::TenantId)
                    .col(Contacts::Phone)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_contacts_tenant_email")
                    .table(Contacts::Table)
                    .col(Contacts::TenantId)
                    .col(Contacts::Email)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_contacts_tenant_phone").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_contacts_tenant_email").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Contacts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Contacts {
    Table,
    Id,
    TenantId,
    Name,
    Phone,
    Email,
    ExternalIds,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
