//! # Coordination Store
//!
//! Shared mutable state for cross-instance coordination, narrowed to the
//! operations the rate limiter needs: an atomic sliding-window batch, window
//! inspection, key removal and prefix scans. The in-process [`MemoryStore`]
//! is the shipped backend; the trait is the seam for a networked store.
//!
//! Queue claiming and job dedup deliberately do not go through this trait:
//! they coordinate through single-statement compare-and-set updates against
//! the relational store instead.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{AppConfig, ConfigError};

/// Errors surfaced by coordination store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store operation failed: {0}")]
    Operation(String),
}

/// Key-scoped sliding-window state shared between instances.
///
/// Implementations must make [`CoordinationStore::window_hit`] atomic per
/// key: prune, insert, TTL refresh and count happen as one step, so two
/// racing callers can never both observe a count below the ceiling that
/// their combined hits exceed.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Record a hit at `now_ms` and return the number of members inside
    /// `[now_ms - window_ms, now_ms]`, including this hit. The key's TTL is
    /// refreshed to `ttl`.
    async fn window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Count members currently inside the window without recording a hit.
    async fn window_count(&self, key: &str, now_ms: u64, window_ms: u64)
    -> Result<u64, StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Enumerate live keys starting with `prefix`.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remaining TTL for a key, or `None` when it does not exist.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

/// Build the coordination store backend selected by configuration.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn CoordinationStore>, ConfigError> {
    if config.coordination_url.starts_with("memory:") {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Err(ConfigError::UnsupportedCoordinationStore {
            url: config.coordination_url.clone(),
        })
    }
}
