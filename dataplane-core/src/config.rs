//! Operational knobs for every data-plane component.
//!
//! Every optional key carries a `#[serde(default = "...")]` so a caller
//! can supply a partial TOML/YAML document and get sane production
//! defaults for the rest.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    Fixed,
    Dynamic,
    Adaptive,
}

impl Default for PoolStrategy {
    fn default() -> Self {
        PoolStrategy::Dynamic
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_min")]
    pub min: usize,
    #[serde(default = "default_pool_max")]
    pub max: usize,
    #[serde(default = "default_pool_initial")]
    pub initial: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default)]
    pub strategy: PoolStrategy,
    #[serde(default = "default_true")]
    pub warm_on_start: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            initial: default_pool_initial(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            stale_timeout_ms: default_stale_timeout_ms(),
            max_age_ms: default_max_age_ms(),
            strategy: PoolStrategy::default(),
            warm_on_start: true,
        }
    }
}

fn default_pool_min() -> usize {
    2
}
fn default_pool_max() -> usize {
    20
}
fn default_pool_initial() -> usize {
    4
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_idle_timeout_ms() -> u64 {
    300_000
}
fn default_stale_timeout_ms() -> u64 {
    600_000
}
fn default_max_age_ms() -> u64 {
    1_800_000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    #[serde(default = "default_true")]
    pub enable_read_splitting: bool,
    #[serde(default = "default_max_lag_ms")]
    pub max_lag_ms: u64,
    #[serde(default = "default_true")]
    pub failover_enabled: bool,
    #[serde(default = "default_session_window_ms")]
    pub session_window_ms: u64,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            enable_read_splitting: true,
            max_lag_ms: default_max_lag_ms(),
            failover_enabled: true,
            session_window_ms: default_session_window_ms(),
        }
    }
}

fn default_max_lag_ms() -> u64 {
    1_000
}
fn default_session_window_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    Hash,
    Range,
    ConsistentHash,
    Directory,
    Geographic,
}

impl Default for ShardStrategy {
    fn default() -> Self {
        ShardStrategy::Hash
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardKeyConfig {
    pub column: String,
    #[serde(default = "default_hash_type")]
    pub r#type: String,
    #[serde(default = "default_hash_fn")]
    pub hash_fn: String,
}

fn default_hash_type() -> String {
    "text".to_string()
}
fn default_hash_fn() -> String {
    "fnv1a".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRouterConfig {
    #[serde(default)]
    pub strategy: ShardStrategy,
    pub shard_key: ShardKeyConfig,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    #[serde(default)]
    pub auto_rebalancing: bool,
    #[serde(default = "default_max_shard_size")]
    pub max_shard_size: u64,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    #[serde(default)]
    pub range_boundaries: Vec<i64>,
    #[serde(default)]
    pub geo_regions: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub enable_cross_shard: bool,
}

fn default_replication_factor() -> u32 {
    1
}
fn default_max_shard_size() -> u64 {
    50 * 1024 * 1024 * 1024
}
fn default_virtual_nodes() -> u32 {
    256
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    ConsistentHashing,
    Adaptive,
}

impl Default for BalancerStrategy {
    fn default() -> Self {
        BalancerStrategy::Adaptive
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_breaker_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: BalancerStrategy,
    #[serde(default)]
    pub enable_circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub enable_session_affinity: bool,
    #[serde(default = "default_affinity_window_ms")]
    pub affinity_window_ms: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancerStrategy::default(),
            enable_circuit_breaker: CircuitBreakerConfig::default(),
            enable_session_affinity: true,
            affinity_window_ms: default_affinity_window_ms(),
        }
    }
}

fn default_affinity_window_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Ttl,
    Hybrid,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Hybrid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Zstd,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default)]
    pub eviction: EvictionPolicy,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default = "default_warming_threshold")]
    pub warming_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_memory_bytes: default_max_memory_bytes(),
            default_ttl_ms: default_ttl_ms(),
            eviction: EvictionPolicy::default(),
            compression: Compression::default(),
            warming_threshold: default_warming_threshold(),
        }
    }
}

fn default_max_entries() -> usize {
    10_000
}
fn default_max_memory_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_ttl_ms() -> u64 {
    60_000
}
fn default_warming_threshold() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "t_pool_util")]
    pub connection_pool_utilization: f64,
    #[serde(default = "t_query_latency")]
    pub avg_query_response_time: f64,
    #[serde(default = "t_slow_rate")]
    pub slow_query_rate: f64,
    #[serde(default = "t_hit_rate")]
    pub cache_hit_rate: f64,
    #[serde(default = "t_cpu")]
    pub cpu_usage: f64,
    #[serde(default = "t_mem")]
    pub memory_usage: f64,
    #[serde(default = "t_disk")]
    pub disk_usage: f64,
    #[serde(default = "t_io_wait")]
    pub disk_io_wait: f64,
    #[serde(default = "t_conn_err")]
    pub connection_errors: f64,
    #[serde(default = "t_lock_waits")]
    pub lock_waits: f64,
    #[serde(default = "t_deadlocks")]
    pub deadlocks: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            connection_pool_utilization: t_pool_util(),
            avg_query_response_time: t_query_latency(),
            slow_query_rate: t_slow_rate(),
            cache_hit_rate: t_hit_rate(),
            cpu_usage: t_cpu(),
            memory_usage: t_mem(),
            disk_usage: t_disk(),
            disk_io_wait: t_io_wait(),
            connection_errors: t_conn_err(),
            lock_waits: t_lock_waits(),
            deadlocks: t_deadlocks(),
        }
    }
}

fn t_pool_util() -> f64 {
    80.0
}
fn t_query_latency() -> f64 {
    100.0
}
fn t_slow_rate() -> f64 {
    5.0
}
fn t_hit_rate() -> f64 {
    80.0
}
fn t_cpu() -> f64 {
    80.0
}
fn t_mem() -> f64 {
    85.0
}
fn t_disk() -> f64 {
    90.0
}
fn t_io_wait() -> f64 {
    20.0
}
fn t_conn_err() -> f64 {
    1.0
}
fn t_lock_waits() -> f64 {
    10.0
}
fn t_deadlocks() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_alert_interval_ms")]
    pub alert_interval_ms: u64,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    #[serde(default)]
    pub enable_system_metrics: bool,
    #[serde(default = "default_alert_retention_days")]
    pub alert_retention_days: u32,
    #[serde(default = "default_max_alerts_per_hour")]
    pub max_alerts_per_hour: u32,
    #[serde(default = "default_alert_cooldown_ms")]
    pub alert_cooldown_ms: u64,
    #[serde(default)]
    pub notification_channels: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            alert_interval_ms: default_alert_interval_ms(),
            alert_thresholds: AlertThresholds::default(),
            enable_system_metrics: false,
            alert_retention_days: default_alert_retention_days(),
            max_alerts_per_hour: default_max_alerts_per_hour(),
            alert_cooldown_ms: default_alert_cooldown_ms(),
            notification_channels: vec!["log".to_string()],
        }
    }
}

fn default_monitor_interval_ms() -> u64 {
    10_000
}
fn default_alert_interval_ms() -> u64 {
    2_000
}
fn default_alert_retention_days() -> u32 {
    30
}
fn default_max_alerts_per_hour() -> u32 {
    20
}
fn default_alert_cooldown_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    #[serde(default = "default_metadata_dsn")]
    pub dsn: String,
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        Self {
            dsn: default_metadata_dsn(),
        }
    }
}

fn default_metadata_dsn() -> String {
    "sqlite::memory:".to_string()
}

/// One physical database server the composition root should dial on
/// startup, for either the unsharded primary/replica topology or a
/// shard's own endpoint. Kept in `dataplane-core` (rather than next to
/// `Endpoint`/`Shard` in `dataplane-server`) so it can be loaded through
/// the same `config`-crate/serde path as every other operational knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpecConfig {
    pub id: String,
    pub dsn: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub az: String,
}

fn default_weight() -> u32 {
    100
}

/// Unsharded topology: one primary plus its read replicas, routed by
/// the read/write splitter and load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub primary: EndpointSpecConfig,
    #[serde(default)]
    pub replicas: Vec<EndpointSpecConfig>,
}

/// One shard's identity and connection descriptor, registered with the
/// shard router at startup (the `shards` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSpecConfig {
    pub id: String,
    pub dsn: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub az: String,
    #[serde(default)]
    pub range_start: Option<i64>,
    #[serde(default)]
    pub range_end: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerLevel {
    Conservative,
    Moderate,
    Aggressive,
}

impl Default for OptimizerLevel {
    fn default() -> Self {
        OptimizerLevel::Conservative
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub level: OptimizerLevel,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { level: OptimizerLevel::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexAdvisorConfig {
    #[serde(default = "default_min_freq")]
    pub min_freq: u64,
}

impl Default for IndexAdvisorConfig {
    fn default() -> Self {
        Self { min_freq: default_min_freq() }
    }
}

fn default_min_freq() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub splitter: SplitterConfig,
    #[serde(default)]
    pub topology: Option<TopologyConfig>,
    #[serde(default)]
    pub shard_router: Option<ShardRouterConfig>,
    #[serde(default)]
    pub shards: Vec<ShardSpecConfig>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub metadata_store: MetadataStoreConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub index_advisor: IndexAdvisorConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = "pool:\n  max: 50\n";
        let cfg: DataPlaneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.pool.max, 50);
        assert_eq!(cfg.pool.min, 2);
        assert_eq!(cfg.cache.eviction, EvictionPolicy::Hybrid);
    }

    #[test]
    fn alert_thresholds_default_matches_original_values() {
        let t = AlertThresholds::default();
        assert_eq!(t.cache_hit_rate, 80.0);
        assert_eq!(t.deadlocks, 0.1);
    }
}
