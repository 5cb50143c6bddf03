//! DNS answer cache
//!
//! Responses seen on the relayed DNS path are stored by question; later
//! queries for the same question are answered locally.
//!
//! - **LRU Eviction**: moka bounds the entry count
//! - **TTL Management**: per-entry expiry from the smallest answer TTL
//! - **Statistics**: atomic hit/miss/insert counters
//!
//! ```text
//! query bytes ─▶ DnsAnswerCache::query() ─┬─ Hit  ─▶ DnsAnswer::pack() ─▶ local reply
//!                                         └─ Miss ─▶ relay to proxy
//! proxy reply ─▶ DnsAnswerCache::store()
//! ```

mod entry;
mod key;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType};
use moka::notification::RemovalCause;
use moka::sync::Cache;
use moka::Expiry;
use serde::Serialize;
use tracing::trace;

pub use entry::CacheEntry;
pub use key::CacheKey;

use super::{DnsAnswer, DnsCache};
use crate::config::DnsCacheConfig;

/// Cache counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            inserts: self.inserts(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStatsSnapshot {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-entry expiry using the entry's clamped TTL
struct CacheEntryExpiry;

impl Expiry<CacheKey, CacheEntry> for CacheEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(Duration::from_secs(u64::from(value.original_ttl())))
    }
}

/// moka-backed [`DnsCache`]
pub struct DnsAnswerCache {
    cache: Cache<CacheKey, CacheEntry>,
    config: DnsCacheConfig,
    stats: Arc<CacheStats>,
}

impl DnsAnswerCache {
    #[must_use]
    pub fn new(config: DnsCacheConfig) -> Self {
        let stats = Arc::new(CacheStats::default());
        let listener_stats = Arc::clone(&stats);

        let cache = Cache::builder()
            .max_capacity(config.max_entries as u64)
            .expire_after(CacheEntryExpiry)
            .eviction_listener(move |_key, _value, cause| match cause {
                RemovalCause::Size => {
                    listener_stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Expired => {
                    listener_stats.expirations.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Explicit | RemovalCause::Replaced => {}
            })
            .build();

        Self {
            cache,
            config,
            stats,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Approximate entry count (pending moka maintenance excluded)
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush pending moka bookkeeping so counts are exact.
    pub fn run_maintenance(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    fn lookup(&self, query: &Message) -> Option<DnsAnswer> {
        if query.message_type() != MessageType::Query {
            return None;
        }
        let key = CacheKey::from_message(query)?;
        let entry = self.cache.get(&key)?;
        if entry.is_expired() {
            return None;
        }
        Some(DnsAnswer::new(entry.to_answer_message(query)))
    }
}

impl DnsCache for DnsAnswerCache {
    fn query(&self, raw_query: &[u8]) -> Option<DnsAnswer> {
        if !self.config.enabled {
            return None;
        }
        let Ok(query) = Message::from_vec(raw_query) else {
            trace!(len = raw_query.len(), "unparseable DNS query, not cached");
            self.stats.record_miss();
            return None;
        };

        match self.lookup(&query) {
            Some(answer) => {
                self.stats.record_hit();
                Some(answer)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    fn store(&self, raw_response: &[u8]) {
        if !self.config.enabled {
            return;
        }
        let Ok(response) = Message::from_vec(raw_response) else {
            return;
        };
        let Some(key) = CacheKey::from_message(&response) else {
            return;
        };
        let Some(entry) =
            CacheEntry::from_response(response, self.config.min_ttl_secs, self.config.max_ttl_secs)
        else {
            return;
        };

        trace!(qname = key.qname(), qtype = key.qtype(), ttl = entry.original_ttl(), "caching DNS answer");
        self.cache.insert(key, entry);
        self.stats.record_insert();
    }
}

impl std::fmt::Debug for DnsAnswerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsAnswerCache")
            .field("enabled", &self.config.enabled)
            .field("entries", &self.cache.entry_count())
            .field("max_entries", &self.config.max_entries)
            .finish()
    }
}
