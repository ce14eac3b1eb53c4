//! # Tenant Repository

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, Set};
use uuid::Uuid;

use crate::models::tenant::{ActiveModel, Entity, Model, PlanTier};

/// Repository for tenant database operations
pub struct TenantRepository {
    db: DatabaseConnection,
}

impl TenantRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Find a tenant by ID
    pub async fn find_by_id(&self, tenant_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(tenant_id).one(&self.db).await
    }

    /// Create a tenant on the given plan
    pub async fn create(&self, name: Option<String>, plan: PlanTier) -> Result<Model, DbErr> {
        let tenant = ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name),
            plan: Set(plan),
            created_at: Set(Utc::now().fixed_offset()),
        };

        let result = tenant.insert(&self.db).await?;

        tracing::info!(tenant_id = %result.id, plan = %result.plan.as_str(), "Tenant created");

        Ok(result)
    }
}
