//! Query Cache: fingerprinted query results with tag/table
//! invalidation, pluggable eviction, and access-count-driven warming.

pub mod compression;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dataplane_core::config::{CacheConfig, EvictionPolicy};
use dataplane_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hashing::fnv1a_str;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheStatRow {
    pub query_hash: String,
    pub query_text: String,
    pub hit_count: u64,
    pub miss_count: u64,
}

struct Entry {
    payload: Vec<u8>,
    tags: HashSet<String>,
    triggers: HashSet<String>,
    created_at: Instant,
    last_accessed: parking_lot::Mutex<Instant>,
    access_count: std::sync::atomic::AtomicU64,
    ttl: Duration,
    size: usize,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }

    fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
        self.access_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn hybrid_score(&self) -> f64 {
        let access_count = self.access_count.load(std::sync::atomic::Ordering::Relaxed) as f64;
        let idle_hours = self.last_accessed.lock().elapsed().as_secs_f64() / 3600.0;
        0.3 * access_count + 0.7 * idle_hours
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct AccessCounter {
    text: String,
    count: std::sync::atomic::AtomicU64,
}

pub struct QueryCache {
    config: CacheConfig,
    entries: DashMap<String, Entry>,
    access_counters: DashMap<String, AccessCounter>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
    evictions: std::sync::atomic::AtomicU64,
    memory_bytes: std::sync::atomic::AtomicU64,
    query_text_by_hash: DashMap<String, String>,
}

/// Stable hash over the normalized query text and its parameters
pub fn fingerprint(query: &str, params: &[dataplane_core::Value]) -> String {
    let normalized: String = query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut combined = normalized;
    for p in params {
        combined.push('\u{1}');
        combined.push_str(&p.stable_repr());
    }
    format!("{:016x}", fnv1a_str(&combined))
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            access_counters: DashMap::new(),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
            evictions: std::sync::atomic::AtomicU64::new(0),
            memory_bytes: std::sync::atomic::AtomicU64::new(0),
            query_text_by_hash: DashMap::new(),
        }
    }

    /// Track every lookup, cached or not, so the warming tick can find
    /// hot queries that are not (yet) cached
    fn bump_access_counter(&self, key: &str, query_text: &str) {
        self.access_counters
            .entry(key.to_string())
            .or_insert_with(|| AccessCounter {
                text: query_text.to_string(),
                count: std::sync::atomic::AtomicU64::new(0),
            })
            .count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get<T: for<'de> Deserialize<'de>>(&self, query: &str, params: &[dataplane_core::Value]) -> Option<T> {
        let key = fingerprint(query, params);
        self.bump_access_counter(&key, query);

        let Some(entry) = self.entries.get(&key) else {
            self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        };

        if entry.is_expired() {
            let size = entry.size;
            drop(entry);
            self.entries.remove(&key);
            self.memory_bytes.fetch_sub(size as u64, std::sync::atomic::Ordering::Relaxed);
            self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        }

        entry.touch();
        match compression::decode(&entry.payload, self.config.compression) {
            Ok(value) => {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                warn!(error = %e, query_hash = %key, "cache entry failed to decode, evicting");
                let size = entry.size;
                drop(entry);
                self.entries.remove(&key);
                self.memory_bytes.fetch_sub(size as u64, std::sync::atomic::Ordering::Relaxed);
                self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put<T: Serialize>(
        &self,
        query: &str,
        params: &[dataplane_core::Value],
        value: &T,
        ttl: Duration,
        tags: &[String],
        triggers: &[String],
    ) -> Result<()> {
        let key = fingerprint(query, params);
        let payload = compression::encode(value, self.config.compression)?;
        let size = payload.len();

        if size as u64 > self.config.max_memory_bytes {
            return Err(Error::CacheRefused(format!(
                "entry of {size} bytes exceeds cache memory cap of {} bytes",
                self.config.max_memory_bytes
            )));
        }

        self.make_space(size)?;

        let entry = Entry {
            payload,
            tags: tags.iter().cloned().collect(),
            triggers: triggers.iter().cloned().collect(),
            created_at: Instant::now(),
            last_accessed: parking_lot::Mutex::new(Instant::now()),
            access_count: std::sync::atomic::AtomicU64::new(0),
            ttl,
            size,
        };

        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.memory_bytes.fetch_sub(old.size as u64, std::sync::atomic::Ordering::Relaxed);
        }
        self.memory_bytes.fetch_add(size as u64, std::sync::atomic::Ordering::Relaxed);
        self.query_text_by_hash.insert(key, query.to_string());
        Ok(())
    }

    /// Evict entries until both the entry-count cap and the memory cap
    /// can accommodate `incoming_size`, using the configured policy
    fn make_space(&self, incoming_size: usize) -> Result<()> {
        let mut guard = 0;
        while self.entries.len() >= self.config.max_entries
            || self.memory_bytes.load(std::sync::atomic::Ordering::Relaxed) + incoming_size as u64
                > self.config.max_memory_bytes
        {
            guard += 1;
            if guard > self.entries.len() + 1 {
                break;
            }
            let Some(victim_key) = self.pick_eviction_victim() else { break };
            if let Some((_, entry)) = self.entries.remove(&victim_key) {
                self.memory_bytes.fetch_sub(entry.size as u64, std::sync::atomic::Ordering::Relaxed);
                self.evictions.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn pick_eviction_victim(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let ordering_key = |_key: &String, entry: &Entry| -> f64 {
            match self.config.eviction {
                EvictionPolicy::Lru => entry.last_accessed.lock().elapsed().as_secs_f64(),
                // Negated so `max_by` below still picks the worst entry: the
                // fewest accesses, i.e. ascending access count, evicted first.
                EvictionPolicy::Lfu => -(entry.access_count.load(std::sync::atomic::Ordering::Relaxed) as f64),
                EvictionPolicy::Ttl => entry.created_at.elapsed().as_secs_f64(),
                // Same negation as Lfu: hybrid_score is ascending (low score
                // evicted first), but max_by below picks the largest value.
                EvictionPolicy::Hybrid => -entry.hybrid_score(),
            }
        };

        // Ascending by the policy's score: the worst-ranked (e.g. oldest,
        // least-used) entry goes first
        self.entries
            .iter()
            .max_by(|a, b| ordering_key(a.key(), a.value()).partial_cmp(&ordering_key(b.key(), b.value())).unwrap())
            .map(|e| e.key().clone())
    }

    pub fn invalidate_by_table(&self, table: &str) -> usize {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().triggers.contains(table))
            .map(|e| e.key().clone())
            .collect();
        for k in &victims {
            if let Some((_, entry)) = self.entries.remove(k) {
                self.memory_bytes.fetch_sub(entry.size as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
        victims.len()
    }

    pub fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let tag_set: HashSet<&str> = tags.iter().map(|s| s.as_str()).collect();
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().tags.iter().any(|t| tag_set.contains(t.as_str())))
            .map(|e| e.key().clone())
            .collect();
        for k in &victims {
            if let Some((_, entry)) = self.entries.remove(k) {
                self.memory_bytes.fetch_sub(entry.size as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
        victims.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.memory_bytes.store(0, std::sync::atomic::Ordering::Relaxed);
    }

    /// Eagerly drop expired entries; a background tick calls this so
    /// expiry isn't solely dependent on reads
    pub fn sweep_expired(&self) -> usize {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for k in &victims {
            if let Some((_, entry)) = self.entries.remove(k) {
                self.memory_bytes.fetch_sub(entry.size as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
        victims.len()
    }

    /// Queries with an access count at or above the warming threshold
    /// and not currently cached, top-N by count The caller
    /// executes and re-inserts each one with a longer TTL.
    pub fn warming_candidates(&self, top_n: usize) -> Vec<(String, String)> {
        let mut candidates: Vec<(String, String, u64)> = self
            .access_counters
            .iter()
            .filter(|c| {
                let count = c.value().count.load(std::sync::atomic::Ordering::Relaxed);
                count >= self.config.warming_threshold && !self.entries.contains_key(c.key())
            })
            .map(|c| (c.key().clone(), c.value().text.clone(), c.value().count.load(std::sync::atomic::Ordering::Relaxed)))
            .collect();

        candidates.sort_by(|a, b| b.2.cmp(&a.2));
        candidates.truncate(top_n);
        candidates.into_iter().map(|(hash, text, _)| (hash, text)).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(std::sync::atomic::Ordering::Relaxed),
            misses: self.misses.load(std::sync::atomic::Ordering::Relaxed),
            entry_count: self.entries.len(),
            memory_bytes: self.memory_bytes.load(std::sync::atomic::Ordering::Relaxed),
            evictions: self.evictions.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    /// Per-query hit/miss rows for persistence into `query_cache_stats`
    ///; additive instrumentation, not part of cache behavior.
    pub fn stats_snapshot(&self) -> Vec<QueryCacheStatRow> {
        self.query_text_by_hash
            .iter()
            .map(|e| {
                let hash = e.key().clone();
                let text = e.value().clone();
                let hits = self.entries.get(&hash).map(|entry| {
                    entry.access_count.load(std::sync::atomic::Ordering::Relaxed)
                }).unwrap_or(0);
                let misses = self
                    .access_counters
                    .get(&hash)
                    .map(|c| c.count.load(std::sync::atomic::Ordering::Relaxed).saturating_sub(hits))
                    .unwrap_or(0);
                QueryCacheStatRow { query_hash: hash, query_text: text, hit_count: hits, miss_count: misses }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplane_core::Value;

    fn cache() -> QueryCache {
        QueryCache::new(CacheConfig {
            max_entries: 3,
            max_memory_bytes: 1_000_000,
            default_ttl_ms: 60_000,
            eviction: EvictionPolicy::Lru,
            compression: dataplane_core::config::Compression::None,
            warming_threshold: 2,
        })
    }

    #[test]
    fn put_then_get_round_trips() {
        let c = cache();
        c.put("SELECT * FROM docs", &[], &"result-1".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        let got: Option<String> = c.get("SELECT * FROM docs", &[]);
        assert_eq!(got, Some("result-1".to_string()));
        assert_eq!(c.stats().hits, 1);
    }

    #[test]
    fn miss_is_recorded_for_unknown_query() {
        let c = cache();
        let got: Option<String> = c.get("SELECT * FROM nothing", &[]);
        assert!(got.is_none());
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let c = cache();
        c.put("SELECT 1", &[], &"v".to_string(), Duration::from_millis(1), &[], &[]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let got: Option<String> = c.get("SELECT 1", &[]);
        assert!(got.is_none());
        assert_eq!(c.stats().entry_count, 0);
    }

    #[test]
    fn entry_count_cap_evicts_least_recently_used() {
        let c = cache();
        c.put("q1", &[], &"a".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        c.put("q2", &[], &"b".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        c.put("q3", &[], &"c".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        let _: Option<String> = c.get("q2", &[]);
        let _: Option<String> = c.get("q3", &[]);
        c.put("q4", &[], &"d".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        assert_eq!(c.stats().entry_count, 3);
        let q1: Option<String> = c.get("q1", &[]);
        assert!(q1.is_none());
    }

    #[test]
    fn invalidate_by_table_removes_matching_triggers() {
        let c = cache();
        c.put("q1", &[], &"a".to_string(), Duration::from_secs(60), &[], &["documents".to_string()]).unwrap();
        c.put("q2", &[], &"b".to_string(), Duration::from_secs(60), &[], &["users".to_string()]).unwrap();
        let removed = c.invalidate_by_table("documents");
        assert_eq!(removed, 1);
        assert_eq!(c.stats().entry_count, 1);
    }

    #[test]
    fn invalidate_by_tags_removes_matching_entries() {
        let c = cache();
        c.put("q1", &[], &"a".to_string(), Duration::from_secs(60), &["tag-a".to_string()], &[]).unwrap();
        c.put("q2", &[], &"b".to_string(), Duration::from_secs(60), &["tag-b".to_string()], &[]).unwrap();
        let removed = c.invalidate_by_tags(&["tag-a".to_string()]);
        assert_eq!(removed, 1);
    }

    #[test]
    fn oversized_entry_is_refused() {
        let c = QueryCache::new(CacheConfig { max_memory_bytes: 4, ..CacheConfig::default() });
        let result = c.put("q1", &[], &"a very long value indeed".to_string(), Duration::from_secs(60), &[], &[]);
        assert!(matches!(result, Err(Error::CacheRefused(_))));
    }

    #[test]
    fn warming_candidates_surface_frequently_missed_queries() {
        let c = cache();
        let _: Option<String> = c.get("hot query", &[]);
        let _: Option<String> = c.get("hot query", &[]);
        let candidates = c.warming_candidates(10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1, "hot query");
    }

    #[test]
    fn fingerprint_ignores_whitespace_and_case_differences() {
        let a = fingerprint("SELECT  *   FROM docs", &[]);
        let b = fingerprint("select * from docs", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn lfu_eviction_drops_the_least_accessed_entry() {
        let c = QueryCache::new(CacheConfig {
            max_entries: 3,
            max_memory_bytes: 1_000_000,
            default_ttl_ms: 60_000,
            eviction: EvictionPolicy::Lfu,
            compression: dataplane_core::config::Compression::None,
            warming_threshold: 2,
        });
        c.put("q1", &[], &"a".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        c.put("q2", &[], &"b".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        c.put("q3", &[], &"c".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        // q1 and q3 get read repeatedly; q2 is never read again, so it
        // carries the lowest access count.
        for _ in 0..5 {
            let _: Option<String> = c.get("q1", &[]);
            let _: Option<String> = c.get("q3", &[]);
        }
        c.put("q4", &[], &"d".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        assert_eq!(c.stats().entry_count, 3);
        let q2: Option<String> = c.get("q2", &[]);
        assert!(q2.is_none());
        let q1: Option<String> = c.get("q1", &[]);
        assert!(q1.is_some());
    }

    #[test]
    fn hybrid_eviction_drops_the_lowest_scoring_entry() {
        let c = QueryCache::new(CacheConfig {
            max_entries: 3,
            max_memory_bytes: 1_000_000,
            default_ttl_ms: 60_000,
            eviction: EvictionPolicy::Hybrid,
            compression: dataplane_core::config::Compression::None,
            warming_threshold: 2,
        });
        c.put("q1", &[], &"a".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        c.put("q2", &[], &"b".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        c.put("q3", &[], &"c".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        // q1 and q3 are re-accessed (raising access_count and resetting
        // last_accessed); q2 is left untouched since insertion, so it
        // carries the lowest hybrid score and should be evicted first.
        for _ in 0..5 {
            let _: Option<String> = c.get("q1", &[]);
            let _: Option<String> = c.get("q3", &[]);
        }
        c.put("q4", &[], &"d".to_string(), Duration::from_secs(60), &[], &[]).unwrap();
        assert_eq!(c.stats().entry_count, 3);
        let q2: Option<String> = c.get("q2", &[]);
        assert!(q2.is_none());
        let q1: Option<String> = c.get("q1", &[]);
        assert!(q1.is_some());
    }

    #[test]
    fn fingerprint_distinguishes_parameters() {
        let a = fingerprint("SELECT * FROM docs WHERE id = ?", &[Value::Int(1)]);
        let b = fingerprint("SELECT * FROM docs WHERE id = ?", &[Value::Int(2)]);
        assert_ne!(a, b);
    }
}
