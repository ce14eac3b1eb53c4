//! In-process coordination store backed by a mutex-guarded map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CoordinationStore, StoreError};

struct WindowEntry {
    /// Millisecond timestamps of recorded hits, oldest first.
    members: Vec<u64>,
    expires_at: Instant,
}

impl WindowEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    fn prune(&mut self, cutoff_ms: u64) {
        self.members.retain(|&ts| ts > cutoff_ms);
    }
}

/// Single-process [`CoordinationStore`].
///
/// Every operation takes the map mutex exactly once and performs pure
/// computation under it, which gives the per-key atomicity the trait
/// demands without any await points inside the critical section.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn window_cutoff(now_ms: u64, window_ms: u64) -> u64 {
    now_ms.saturating_sub(window_ms)
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        let entry = entries.entry(key.to_string()).or_insert_with(|| WindowEntry {
            members: Vec::new(),
            expires_at: now + ttl,
        });

        if entry.is_expired(now) {
            entry.members.clear();
        }

        entry.prune(window_cutoff(now_ms, window_ms));
        entry.members.push(now_ms);
        entry.expires_at = now + ttl;

        Ok(entry.members.len() as u64)
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        let Some(entry) = entries.get_mut(key) else {
            return Ok(0);
        };
        if entry.is_expired(now) {
            entries.remove(key);
            return Ok(0);
        }

        entry.prune(window_cutoff(now_ms, window_ms));
        Ok(entry.members.len() as u64)
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(entries.remove(key).is_some())
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        // Drop expired entries as we pass them so the map does not
        // accumulate dead windows between hits.
        entries.retain(|_, entry| !entry.is_expired(now));

        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();

        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.expires_at - now))
    }
}
