//! # Rate Limiter
//!
//! Sliding-window request limiting per tenant and endpoint, with per-window
//! ceilings chosen by the tenant's plan tier. Window state lives in the
//! coordination store; a store failure fails open.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::models::tenant::PlanTier;
use crate::store::CoordinationStore;

/// Window keys are retained a little past the window so late inspections
/// still see the tail of a burst.
const KEY_TTL_SLACK: Duration = Duration::from_secs(60);

/// Outcome of a rate limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Per-endpoint usage entry for the tenant snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EndpointUsage {
    /// Endpoint identifier the window tracks
    pub endpoint: String,
    /// Hits recorded inside the current window
    pub used: u64,
    /// Requests allowed per window for the tenant's plan
    pub limit: u32,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
}

/// Plan-aware sliding-window limiter over a [`CoordinationStore`].
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    config: RateLimitConfig,
}

fn window_key(tenant_id: Uuid, endpoint: &str) -> String {
    format!("rate_limit:{}:{}", tenant_id, endpoint)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn key_ttl(&self) -> Duration {
        self.config.window() + KEY_TTL_SLACK
    }

    /// Record one hit and decide whether the request may proceed.
    ///
    /// A store failure yields an allowed decision with a full remaining
    /// budget; the degraded mode is observable through the
    /// `rate_limiter_fail_open_total` counter.
    pub async fn check(
        &self,
        tenant_id: Uuid,
        endpoint: &str,
        plan: PlanTier,
    ) -> RateLimitDecision {
        let limit = self.config.max_for_plan(plan);
        let now_ms = now_millis();
        let reset_at = millis_to_datetime(now_ms + self.config.window_ms);

        let key = window_key(tenant_id, endpoint);
        let count = match self
            .store
            .window_hit(&key, now_ms, self.config.window_ms, self.key_ttl())
            .await
        {
            Ok(count) => count,
            Err(error) => {
                warn!(
                    tenant_id = %tenant_id,
                    endpoint = %endpoint,
                    error = %error,
                    "Rate limit store unavailable, failing open"
                );
                counter!("rate_limiter_fail_open_total").increment(1);

                return RateLimitDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at,
                };
            }
        };

        RateLimitDecision {
            allowed: count <= limit as u64,
            limit,
            remaining: limit.saturating_sub(count.min(u32::MAX as u64) as u32),
            reset_at,
        }
    }

    /// Inspect the current window without consuming a hit.
    pub async fn peek(
        &self,
        tenant_id: Uuid,
        endpoint: &str,
        plan: PlanTier,
    ) -> Result<RateLimitDecision, crate::store::StoreError> {
        let limit = self.config.max_for_plan(plan);
        let now_ms = now_millis();
        let key = window_key(tenant_id, endpoint);

        let count = self
            .store
            .window_count(&key, now_ms, self.config.window_ms)
            .await?;
        let reset_at = self.reset_hint(&key, now_ms).await?;

        Ok(RateLimitDecision {
            allowed: count < limit as u64,
            limit,
            remaining: limit.saturating_sub(count.min(u32::MAX as u64) as u32),
            reset_at,
        })
    }

    /// Drop the window for a tenant/endpoint pair. Returns whether a window
    /// existed.
    pub async fn reset(
        &self,
        tenant_id: Uuid,
        endpoint: &str,
    ) -> Result<bool, crate::store::StoreError> {
        self.store.remove(&window_key(tenant_id, endpoint)).await
    }

    /// Enumerate the tenant's active windows with usage and reset hints.
    pub async fn tenant_snapshot(
        &self,
        tenant_id: Uuid,
        plan: PlanTier,
    ) -> Result<Vec<EndpointUsage>, crate::store::StoreError> {
        let limit = self.config.max_for_plan(plan);
        let prefix = format!("rate_limit:{}:", tenant_id);
        let now_ms = now_millis();

        let mut usages = Vec::new();
        for key in self.store.scan_keys(&prefix).await? {
            let endpoint = key[prefix.len()..].to_string();
            let used = self
                .store
                .window_count(&key, now_ms, self.config.window_ms)
                .await?;
            let reset_at = self.reset_hint(&key, now_ms).await?;

            usages.push(EndpointUsage {
                endpoint,
                used,
                limit,
                reset_at,
            });
        }

        Ok(usages)
    }

    async fn reset_hint(
        &self,
        key: &str,
        now_ms: u64,
    ) -> Result<DateTime<Utc>, crate::store::StoreError> {
        // TTL includes the retention slack; subtract it back out so the hint
        // points at the window edge, not the key expiry.
        let remaining = self
            .store
            .ttl(key)
            .await?
            .unwrap_or_else(|| self.key_ttl())
            .saturating_sub(KEY_TTL_SLACK);
        Ok(millis_to_datetime(now_ms + remaining.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;

    fn limiter_with(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), config)
    }

    fn small_config(max: u32) -> RateLimitConfig {
        RateLimitConfig {
            window_ms: 60_000,
            free_max: max,
            pro_max: max * 5,
            enterprise_max: max * 10,
        }
    }

    #[tokio::test]
    async fn test_allows_until_threshold() {
        let limiter = limiter_with(small_config(3));
        let tenant = Uuid::new_v4();

        for expected_remaining in [2u32, 1, 0] {
            let decision = limiter.check(tenant, "notifications", PlanTier::Free).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 3);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.check(tenant, "notifications", PlanTier::Free).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_remaining_decreases_monotonically() {
        let limiter = limiter_with(small_config(10));
        let tenant = Uuid::new_v4();

        let mut last = u32::MAX;
        for _ in 0..10 {
            let decision = limiter.check(tenant, "notifications", PlanTier::Free).await;
            assert!(decision.remaining < last);
            last = decision.remaining;
        }
        assert_eq!(last, 0);
    }

    #[tokio::test]
    async fn test_windows_are_scoped_per_tenant_and_endpoint() {
        let limiter = limiter_with(small_config(1));
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        assert!(limiter.check(tenant_a, "notifications", PlanTier::Free).await.allowed);
        assert!(!limiter.check(tenant_a, "notifications", PlanTier::Free).await.allowed);

        // Different endpoint and different tenant have their own windows
        assert!(limiter.check(tenant_a, "exports", PlanTier::Free).await.allowed);
        assert!(limiter.check(tenant_b, "notifications", PlanTier::Free).await.allowed);
    }

    #[tokio::test]
    async fn test_plan_tier_selects_threshold() {
        let limiter = limiter_with(small_config(2));
        let tenant = Uuid::new_v4();

        let decision = limiter.check(tenant, "notifications", PlanTier::Pro).await;
        assert_eq!(decision.limit, 10);
        let decision = limiter
            .check(tenant, "notifications", PlanTier::Enterprise)
            .await;
        assert_eq!(decision.limit, 20);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let limiter = limiter_with(small_config(5));
        let tenant = Uuid::new_v4();

        limiter.check(tenant, "notifications", PlanTier::Free).await;
        limiter.check(tenant, "notifications", PlanTier::Free).await;

        let before = limiter
            .peek(tenant, "notifications", PlanTier::Free)
            .await
            .unwrap();
        let after = limiter
            .peek(tenant, "notifications", PlanTier::Free)
            .await
            .unwrap();

        assert_eq!(before.remaining, 3);
        assert_eq!(after.remaining, 3);
    }

    #[tokio::test]
    async fn test_reset_clears_window() {
        let limiter = limiter_with(small_config(1));
        let tenant = Uuid::new_v4();

        assert!(limiter.check(tenant, "notifications", PlanTier::Free).await.allowed);
        assert!(!limiter.check(tenant, "notifications", PlanTier::Free).await.allowed);

        assert!(limiter.reset(tenant, "notifications").await.unwrap());
        assert!(limiter.check(tenant, "notifications", PlanTier::Free).await.allowed);

        // Resetting a missing window reports false
        assert!(!limiter.reset(tenant, "never-used").await.unwrap());
    }

    #[tokio::test]
    async fn test_tenant_snapshot_lists_active_windows() {
        let limiter = limiter_with(small_config(10));
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();

        limiter.check(tenant, "notifications", PlanTier::Free).await;
        limiter.check(tenant, "notifications", PlanTier::Free).await;
        limiter.check(tenant, "exports", PlanTier::Free).await;
        limiter.check(other, "notifications", PlanTier::Free).await;

        let snapshot = limiter.tenant_snapshot(tenant, PlanTier::Free).await.unwrap();

        assert_eq!(snapshot.len(), 2);
        let notifications = snapshot
            .iter()
            .find(|u| u.endpoint == "notifications")
            .unwrap();
        assert_eq!(notifications.used, 2);
        assert_eq!(notifications.limit, 10);
        let exports = snapshot.iter().find(|u| u.endpoint == "exports").unwrap();
        assert_eq!(exports.used, 1);
    }

    struct FailingStore;

    #[async_trait]
    impl CoordinationStore for FailingStore {
        async fn window_hit(
            &self,
            _key: &str,
            _now_ms: u64,
            _window_ms: u64,
            _ttl: Duration,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn window_count(
            &self,
            _key: &str,
            _now_ms: u64,
            _window_ms: u64,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn remove(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn scan_keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), small_config(1));
        let tenant = Uuid::new_v4();

        // Every check is allowed while the store is down
        for _ in 0..5 {
            let decision = limiter.check(tenant, "notifications", PlanTier::Free).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, decision.limit);
        }
    }
}
