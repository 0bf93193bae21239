// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded, priority-tiered diagnostic store.
//!
//! ## Eviction
//!
//! Capacity is enforced on entry count and on estimated aggregate bytes.
//! Expired entries go first; after that the least-recently-accessed
//! non-critical entry is evicted. Critical entries are evicted only when
//! nothing else is left and the store is still over capacity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fixed per-entry bookkeeping overhead added to size estimates.
const ENTRY_OVERHEAD_BYTES: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiagnosticConfig {
    pub max_entries: usize,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    pub ttl_low: Duration,
    pub ttl_medium: Duration,
    pub ttl_high: Duration,
    pub ttl_critical: Duration,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_memory_mb: 16,
            ttl_low: Duration::from_secs(5 * 60),
            ttl_medium: Duration::from_secs(15 * 60),
            ttl_high: Duration::from_secs(60 * 60),
            ttl_critical: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl DiagnosticConfig {
    pub fn ttl(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Low => self.ttl_low,
            Priority::Medium => self.ttl_medium,
            Priority::High => self.ttl_high,
            Priority::Critical => self.ttl_critical,
        }
    }

    pub fn max_bytes(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticEntry {
    pub id: String,
    pub session_id: String,
    pub url: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub created_at: Instant,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
    pub size_bytes: usize,
    /// Logical access clock; higher is more recent.
    pub last_access: u64,
}

impl DiagnosticEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub inserts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub critical_evictions: u64,
    pub expirations: u64,
    /// Entries larger than the whole byte budget, never stored.
    pub rejected: u64,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, DiagnosticEntry>,
    total_bytes: usize,
    clock: u64,
    next_id: u64,
    stats: DiagnosticStats,
}

impl StoreInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, id: &str) -> Option<DiagnosticEntry> {
        let entry = self.entries.remove(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn expire(&mut self, config: &DiagnosticConfig) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(config.ttl(e.priority)))
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    /// Least-recently-accessed victim, preferring non-critical entries.
    fn victim(&self) -> Option<String> {
        self.entries
            .values()
            .filter(|e| e.priority != Priority::Critical)
            .min_by_key(|e| e.last_access)
            .or_else(|| self.entries.values().min_by_key(|e| e.last_access))
            .map(|e| e.id.clone())
    }

    fn over_capacity(&self, config: &DiagnosticConfig) -> bool {
        self.entries.len() > config.max_entries || self.total_bytes > config.max_bytes()
    }
}

/// Thread-safe diagnostic store. Size accounting is serialized by one lock.
pub struct DiagnosticStore {
    config: DiagnosticConfig,
    inner: Mutex<StoreInner>,
}

impl DiagnosticStore {
    pub fn new(config: DiagnosticConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn config(&self) -> &DiagnosticConfig {
        &self.config
    }

    /// Store an entry and enforce capacity. Returns the entry id, or `None`
    /// when the entry could not be retained.
    pub async fn record(
        &self,
        session_id: &str,
        url: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Option<String> {
        let size_bytes = estimate_size(session_id, url, &payload);
        let mut inner = self.inner.lock().await;

        if size_bytes > self.config.max_bytes() {
            inner.stats.rejected += 1;
            tracing::debug!("diagnostic entry of {size_bytes} byte(s) exceeds store budget");
            return None;
        }

        inner.expire(&self.config);

        inner.next_id += 1;
        let id = format!("diag-{}", inner.next_id);
        let last_access = inner.tick();
        inner.entries.insert(
            id.clone(),
            DiagnosticEntry {
                id: id.clone(),
                session_id: session_id.to_string(),
                url: url.to_string(),
                payload,
                priority,
                created_at: Instant::now(),
                recorded_at: chrono::Utc::now(),
                size_bytes,
                last_access,
            },
        );
        inner.total_bytes += size_bytes;
        inner.stats.inserts += 1;

        while inner.over_capacity(&self.config) {
            let Some(victim) = inner.victim() else {
                break;
            };
            if let Some(evicted) = inner.remove(&victim) {
                inner.stats.evictions += 1;
                if evicted.priority == Priority::Critical {
                    inner.stats.critical_evictions += 1;
                }
                tracing::debug!("evicted diagnostic entry {} ({:?})", evicted.id, evicted.priority);
            }
        }

        inner.entries.contains_key(&id).then_some(id)
    }

    /// Fetch an entry, refreshing its access time.
    pub async fn get(&self, id: &str) -> Option<DiagnosticEntry> {
        let mut inner = self.inner.lock().await;
        let expired = match inner.entries.get(id) {
            Some(entry) => entry.is_expired(self.config.ttl(entry.priority)),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        if expired {
            inner.remove(id);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }
        let now = inner.tick();
        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(id)?;
        entry.last_access = now;
        Some(entry.clone())
    }

    /// Remove every entry past its tier TTL.
    pub async fn expire(&self) -> usize {
        self.inner.lock().await.expire(&self.config)
    }

    /// Entries for one session, oldest first. Does not count as access.
    pub async fn entries_for(&self, session_id: &str) -> Vec<DiagnosticEntry> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<DiagnosticEntry> = inner
            .entries
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    pub async fn stats(&self) -> DiagnosticStats {
        let inner = self.inner.lock().await;
        DiagnosticStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            ..inner.stats.clone()
        }
    }
}

impl Default for DiagnosticStore {
    fn default() -> Self {
        Self::new(DiagnosticConfig::default())
    }
}

fn estimate_size(session_id: &str, url: &str, payload: &serde_json::Value) -> usize {
    let payload_len = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0);
    ENTRY_OVERHEAD_BYTES + session_id.len() + url.len() + payload_len
}
