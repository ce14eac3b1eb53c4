//! Shared helpers for the integration suites: in-memory databases with
//! migrations applied, plus common fixture rows.

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use relay_hub::crypto::TokenGuard;
use relay_hub::models::ProviderKind;
use relay_hub::models::tenant::PlanTier;
use relay_hub::providers::BotCredentials;
use relay_hub::repositories::{IntegrationRepository, TenantRepository};
use sea_orm::{Database, DatabaseConnection};
use serde_json::json;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Creates a tenant on the given plan and returns its id.
#[allow(dead_code)]
pub async fn seed_tenant(db: &DatabaseConnection, plan: PlanTier) -> Result<Uuid> {
    let tenant = TenantRepository::new(db.clone())
        .create(Some("Test Tenant".to_string()), plan)
        .await?;
    Ok(tenant.id)
}

/// Creates an active bot integration holding encrypted credentials and the
/// operator notify chat.
#[allow(dead_code)]
pub async fn seed_bot_integration(
    db: &DatabaseConnection,
    guard: &TokenGuard,
    tenant_id: Uuid,
    bot_token: &str,
    notify_chat_id: &str,
) -> Result<()> {
    let blob = guard.encrypt_json(&BotCredentials {
        bot_token: bot_token.to_string(),
    })?;
    IntegrationRepository::new(db.clone())
        .create(
            tenant_id,
            ProviderKind::Bot,
            Some(json!({ "notify_chat_id": notify_chat_id })),
            Some(blob.to_json()?),
        )
        .await?;
    Ok(())
}

/// Creates an active CRM integration mapped to a provider-side account, so
/// untenanted CRM events resolve to the tenant.
#[allow(dead_code)]
pub async fn seed_crm_integration(
    db: &DatabaseConnection,
    tenant_id: Uuid,
    account_id: &str,
) -> Result<()> {
    IntegrationRepository::new(db.clone())
        .create(
            tenant_id,
            ProviderKind::Crm,
            Some(json!({ "account_id": account_id })),
            None,
        )
        .await?;
    Ok(())
}
