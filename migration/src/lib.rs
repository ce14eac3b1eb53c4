//! Database migrations for the Relay Hub API.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_100000_create_tenants;
mod m2025_12_01_100100_create_integrations;
mod m2025_12_01_100200_create_webhook_events;
mod m2025_12_01_100300_create_jobs;
mod m2025_12_01_100400_create_contacts;
mod m2025_12_01_100500_create_leads;
mod m2025_12_01_100600_create_calls;
mod m2025_12_01_100700_create_notifications;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_100000_create_tenants::Migration),
            Box::new(m2025_12_01_100100_create_integrations::Migration),
            Box::new(m2025_12_01_100200_create_webhook_events::Migration),
            Box::new(m2025_12_01_100300_create_jobs::Migration),
            Box::new(m2025_12_01_100400_create_contacts::Migration),
            Box::new(m2025_12_01_100500_create_leads::Migration),
            Box::new(m2025_12_01_100600_create_calls::Migration),
            Box::new(m2025_12_01_100700_create_notifications::Migration),
        ]
    }
}
