use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::Rule;

pub const DEFAULT_RULE_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_RULE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleCacheConfig {
    pub capacity: NonZeroUsize,
    /// `None` keeps entries until they are evicted or invalidated.
    pub ttl: Option<Duration>,
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_RULE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ttl: Some(DEFAULT_RULE_TTL),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` records that the source had no rules for this address.
    rules: Option<Arc<[Rule]>>,
    fetched_at: Instant,
}

/// Source address -> rule list, LRU-bounded with an optional TTL.
///
/// Negative answers are cached as well so an unknown source cannot force a source lookup per
/// frame.
pub struct RuleCache {
    entries: LruCache<IpAddr, CacheEntry>,
    ttl: Option<Duration>,
    stats: RuleCacheStats,
}

/// Outcome of a cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached {
    Hit(Option<Arc<[Rule]>>),
    Miss,
}

impl RuleCache {
    pub fn new(cfg: RuleCacheConfig) -> Self {
        Self {
            entries: LruCache::new(cfg.capacity),
            ttl: cfg.ttl,
            stats: RuleCacheStats::default(),
        }
    }

    pub fn get(&mut self, ip: IpAddr, now: Instant) -> Cached {
        let expired = match self.entries.get(&ip) {
            None => {
                self.stats.misses += 1;
                return Cached::Miss;
            }
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| now.saturating_duration_since(entry.fetched_at) >= ttl),
        };

        if expired {
            self.entries.pop(&ip);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return Cached::Miss;
        }

        self.stats.hits += 1;
        match self.entries.get(&ip) {
            Some(entry) => Cached::Hit(entry.rules.clone()),
            None => Cached::Miss,
        }
    }

    pub fn insert(&mut self, ip: IpAddr, rules: Option<Arc<[Rule]>>, now: Instant) {
        let entry = CacheEntry {
            rules,
            fetched_at: now,
        };
        if let Some((evicted, _)) = self.entries.push(ip, entry) {
            if evicted != ip {
                self.stats.evictions += 1;
            }
        }
    }

    pub fn invalidate(&mut self, ip: IpAddr) -> bool {
        self.entries.pop(&ip).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RuleCacheStats {
        self.stats
    }
}
