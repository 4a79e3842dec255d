//! Bounded cache of translated logical flows. Keys are fingerprints of
//! the expression and its resolved dependencies; values are the finished
//! rule bodies. The cache survives force-recomputes (its memory is
//! reused, only stale entries are dropped by retraction) and is bounded
//! both by entry count and by bytes, with a high-water-mark trim policy.

use crate::config::LflowCacheConfig;
use flowsync_types::log::info;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub struct CachedFlow {
    pub table: u8,
    pub priority: u16,
    pub match_: String,
    pub actions: String,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    flows: Vec<CachedFlow>,
    /// Resource keys the translation consumed (address sets, port groups,
    /// template variables); replayed into the dependency manager on hits.
    refs: Vec<String>,
    bytes: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LflowCacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub trims: u64,
    pub high_water_entries: usize,
}

#[derive(Debug)]
pub struct LflowCache {
    config: LflowCacheConfig,
    entries: HashMap<String, CacheEntry>,
    bytes: usize,
    stats: LflowCacheStats,
    /// Millisecond clock of the last trim, fed by the main loop; trims are
    /// rate-limited by `trim_timeout_ms`.
    last_trim_ms: i64,
}

fn entry_bytes(key: &str, flows: &[CachedFlow], refs: &[String]) -> usize {
    key.len()
        + refs.iter().map(String::len).sum::<usize>()
        + flows
            .iter()
            .map(|f| f.match_.len() + f.actions.len() + std::mem::size_of::<CachedFlow>())
            .sum::<usize>()
}

impl LflowCache {
    pub fn new(config: LflowCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            bytes: 0,
            stats: LflowCacheStats::default(),
            last_trim_ms: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Applies a configuration change; a shrink below current usage takes
    /// effect through an immediate trim.
    pub fn reconfigure(&mut self, config: LflowCacheConfig, now_ms: i64) {
        self.config = config;
        if !self.config.enabled {
            self.flush();
        } else {
            self.trim(now_ms, true);
        }
    }

    pub fn get(&mut self, key: &str) -> Option<(Vec<CachedFlow>, Vec<String>)> {
        if !self.config.enabled {
            return None;
        }
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.hits += 1;
                Some((entry.flows.clone(), entry.refs.clone()))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: String, flows: Vec<CachedFlow>, refs: Vec<String>, now_ms: i64) {
        if !self.config.enabled {
            return;
        }
        let bytes = entry_bytes(&key, &flows, &refs);
        if let Some(prev) = self.entries.insert(key, CacheEntry { flows, refs, bytes }) {
            self.bytes = self.bytes.saturating_sub(prev.bytes);
        }
        self.bytes += bytes;
        self.stats.high_water_entries = self.stats.high_water_entries.max(self.entries.len());
        if self.over_limit() {
            self.trim(now_ms, false);
        }
    }

    pub fn invalidate(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.bytes = self.bytes.saturating_sub(entry.bytes);
        }
    }

    pub fn flush(&mut self) {
        self.entries.clear();
        self.bytes = 0;
        info!("lflow cache flushed");
    }

    pub fn stats(&self) -> LflowCacheStats {
        LflowCacheStats {
            entries: self.entries.len(),
            bytes: self.bytes,
            ..self.stats
        }
    }

    fn over_limit(&self) -> bool {
        self.entries.len() > self.config.limit_entries
            || self.bytes > self.config.limit_kb.saturating_mul(1024)
    }

    /// Evicts down to the high-water mark (`trim_wmark_perc` of the
    /// limits). Unforced trims respect `trim_timeout_ms` and the
    /// `trim_limit` floor.
    pub fn trim(&mut self, now_ms: i64, force: bool) {
        if !force {
            if self.entries.len() <= self.config.trim_limit {
                return;
            }
            if now_ms.saturating_sub(self.last_trim_ms) < self.config.trim_timeout_ms as i64 {
                return;
            }
        }
        let target_entries =
            (self.config.limit_entries * self.config.trim_wmark_perc as usize) / 100;
        let target_bytes =
            (self.config.limit_kb.saturating_mul(1024) * self.config.trim_wmark_perc as usize)
                / 100;
        if self.entries.len() <= target_entries && self.bytes <= target_bytes {
            return;
        }
        let before = self.entries.len();
        while self.entries.len() > target_entries || self.bytes > target_bytes {
            let Some(key) = self.entries.keys().next().cloned() else {
                break;
            };
            self.invalidate(&key);
        }
        self.stats.trims += 1;
        self.last_trim_ms = now_ms;
        info!(
            "lflow cache trimmed {} -> {} entries",
            before,
            self.entries.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flows(n: usize) -> Vec<CachedFlow> {
        (0..n)
            .map(|i| CachedFlow {
                table: 8,
                priority: 100,
                match_: format!("ip.src == 10.0.0.{i}"),
                actions: "next;".to_string(),
            })
            .collect()
    }

    fn small_config() -> LflowCacheConfig {
        LflowCacheConfig {
            enabled: true,
            limit_entries: 10,
            limit_kb: 1024,
            trim_limit: 0,
            trim_wmark_perc: 50,
            trim_timeout_ms: 0,
        }
    }

    #[test]
    fn test_hit_miss_accounting() {
        let mut cache = LflowCache::new(small_config());
        assert!(cache.get("k1").is_none());
        cache.insert("k1".into(), flows(2), vec!["as:x".into()], 0);
        assert_eq!(cache.get("k1").unwrap().0.len(), 2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_trim_to_watermark() {
        let mut cache = LflowCache::new(small_config());
        for i in 0..11 {
            cache.insert(format!("k{i}"), flows(1), Vec::new(), 1_000);
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 5, "trimmed to 50% of the entry limit");
        assert!(stats.trims >= 1);
        assert_eq!(stats.high_water_entries, 11);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let mut cache = LflowCache::new(LflowCacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.insert("k".into(), flows(1), Vec::new(), 0);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }
}
