//! Migration to create the jobs table.
//!
//! One row per queued unit of work across all named queues. The unique
//! job_key index is the dedup primitive; the claim index serves the worker
//! pool's due-job selection.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::Queue).text().not_null())
                    .col(ColumnDef::new(Jobs::JobKey).text().null())
                    .col(ColumnDef::new(Jobs::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(Jobs::Priority)
                            .small_integer()
                            .not_null()
                            .default(10),
                    )
                    .col(
                        ColumnDef::new(Jobs::AttemptsMade)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::MaxAttempts).integer().not_null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .text()
                            .not_null()
                            .default("waiting"),
                    )
                    .col(
                        ColumnDef::new(Jobs::NextRunAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Jobs::LastError).json_binary().null())
                    .col(
                        ColumnDef::new(Jobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Dedup guard: at most one row per explicit job key within a queue.
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_queue_job_key")
                    .table(Jobs::Table)
                    .col(Jobs::Queue)
                    .col(Jobs::JobKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Claim path: due jobs per queue, ordered by priority ASC then age.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (queue, status, next_run_at, priority, created_at)".to_string(),
            ))
            .await?;

        // Retention reaping and terminal sweeps scan by finish time.
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_terminal")
                    .table(Jobs::Table)
                    .col(Jobs::Queue)
                    .col(Jobs::Status)
                    .col(Jobs::FinishedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_jobs_queue_job_key").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_claim").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_terminal").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    Queue,
    JobKey,
    Payload,
    Priority,
    AttemptsMade,
    MaxAttempts,
    Status,
    NextRunAt,
    LastError,
    StartedAt,
    FinishedAt,
    CreatedAt,
    UpdatedAt,
}
