//! Shard Router: extract a shard key from an incoming query,
//! select the shard(s) to serve it, and evolve topology online.

pub mod migration;
pub mod strategies;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dataplane_core::config::{ShardKeyConfig, ShardRouterConfig, ShardStrategy};
use dataplane_core::{Error, Result, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::endpoint::{EndpointRole, EndpointState};
use crate::pool::ConnectionPool;
use migration::{MigrationKind, MigrationProgressSink, MigrationRecord, MigrationStatus, NullProgressSink, ShardDataMover};
use strategies::{RoutingIndex, ShardTopologyEntry};

#[derive(Debug, Default)]
pub struct ShardMetrics {
    pub record_count: AtomicU64,
    pub bytes: AtomicU64,
    ema_latency_ms: parking_lot::Mutex<f64>,
}

impl ShardMetrics {
    pub fn record_latency(&self, ms: f64) {
        let mut ema = self.ema_latency_ms.lock();
        *ema = if *ema == 0.0 { ms } else { 0.2 * ms + 0.8 * *ema };
    }

    pub fn ema_latency_ms(&self) -> f64 {
        *self.ema_latency_ms.lock()
    }
}

pub struct Shard {
    pub id: String,
    pub dsn: String,
    pub pool: ConnectionPool,
    state: parking_lot::RwLock<EndpointState>,
    pub weight: u32,
    pub role: EndpointRole,
    pub region: String,
    pub az: String,
    pub range: Option<(i64, i64)>,
    pub metrics: ShardMetrics,
}

impl Shard {
    /// Constructs a shard around an already-opened pool. `state` starts
    /// `Healthy`; the router's `remove_shard` is what moves it to
    /// `Maintenance` during an online removal.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        dsn: String,
        pool: ConnectionPool,
        weight: u32,
        role: EndpointRole,
        region: String,
        az: String,
        range: Option<(i64, i64)>,
    ) -> Self {
        Self {
            id,
            dsn,
            pool,
            state: parking_lot::RwLock::new(EndpointState::Healthy),
            weight,
            role,
            region,
            az,
            range,
            metrics: ShardMetrics::default(),
        }
    }

    pub fn state(&self) -> EndpointState {
        *self.state.read()
    }

    pub fn set_state(&self, s: EndpointState) {
        *self.state.write() = s;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), EndpointState::Healthy | EndpointState::Degraded)
    }

    fn topology_entry(&self) -> ShardTopologyEntry {
        ShardTopologyEntry {
            id: self.id.clone(),
            weight: self.weight,
            region: self.region.clone(),
            range: self.range,
        }
    }
}

pub enum RouteDecision {
    SingleShard(Arc<Shard>),
    CrossShard(Vec<Arc<Shard>>),
}

static EQ_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(\?|'[^']*'|-?\d+)").unwrap());

pub struct ShardRouter {
    shards: DashMap<String, Arc<Shard>>,
    config: ShardRouterConfig,
    routing_index: parking_lot::RwLock<Arc<RoutingIndex>>,
    progress_sink: Arc<dyn MigrationProgressSink>,
}

impl ShardRouter {
    pub fn new(config: ShardRouterConfig) -> Self {
        let router = Self {
            shards: DashMap::new(),
            config,
            routing_index: parking_lot::RwLock::new(Arc::new(RoutingIndex::Hash(Vec::new()))),
            progress_sink: Arc::new(NullProgressSink),
        };
        router.rebuild_index();
        router
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn MigrationProgressSink>) -> Self {
        self.progress_sink = sink;
        self
    }

    fn rebuild_index(&self) {
        let entries: Vec<ShardTopologyEntry> = self
            .shards
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().topology_entry())
            .collect();

        let index = match self.config.strategy {
            ShardStrategy::Hash => RoutingIndex::build_hash(&entries),
            ShardStrategy::Range => RoutingIndex::build_range(&entries),
            ShardStrategy::ConsistentHash => RoutingIndex::build_consistent_hash(&entries, self.config.virtual_nodes),
            ShardStrategy::Geographic => RoutingIndex::build_geographic(&entries, &self.config.geo_regions),
            ShardStrategy::Directory => {
                // Directory entries are explicit and persisted separately
                //; an empty map here means "none registered yet".
                RoutingIndex::Directory(HashMap::new())
            }
        };
        *self.routing_index.write() = Arc::new(index);
    }

    pub fn add_shard(&self, shard: Arc<Shard>) {
        info!(shard = %shard.id, "adding shard to topology");
        self.shards.insert(shard.id.clone(), shard);
        self.rebuild_index();
    }

    /// Register an explicit key -> shard mapping for directory routing.
    pub fn assign_directory_key(&self, key: &str, shard_id: &str) {
        let mut guard = self.routing_index.write();
        if let RoutingIndex::Directory(map) = Arc::make_mut(&mut guard) {
            map.insert(key.to_string(), shard_id.to_string());
        }
    }

    pub fn shard(&self, id: &str) -> Option<Arc<Shard>> {
        self.shards.get(id).map(|s| s.value().clone())
    }

    pub fn active_shards(&self) -> Vec<Arc<Shard>> {
        self.shards.iter().filter(|e| e.value().is_active()).map(|e| e.value().clone()).collect()
    }

    /// Extract the shard-key value by matching the configured column
    /// against WHERE equality forms
    pub fn extract_shard_key(&self, query: &str, params: &[Value]) -> Option<Value> {
        extract_key_value(query, params, &self.config.shard_key)
    }

    /// Route a query to one shard (key present) or fan out across all
    /// active shards (key absent and cross-shard enabled).
    pub fn route(&self, query: &str, params: &[Value], region_hint: Option<&str>) -> Result<RouteDecision> {
        match self.extract_shard_key(query, params) {
            Some(value) => {
                let key = value.stable_repr();
                let shard_id = self.lookup_shard_id(&key, &value, region_hint).ok_or_else(|| {
                    Error::RoutingInconsistent(format!("key '{key}' does not map to any active shard"))
                })?;
                let shard = self.shard(&shard_id).ok_or_else(|| {
                    Error::RoutingInconsistent(format!("routing index referenced unknown shard '{shard_id}'"))
                })?;
                Ok(RouteDecision::SingleShard(shard))
            }
            None => {
                if self.config.enable_cross_shard {
                    Ok(RouteDecision::CrossShard(self.active_shards()))
                } else {
                    Err(Error::NoShardKey { column: self.config.shard_key.column.clone() })
                }
            }
        }
    }

    fn lookup_shard_id(&self, key: &str, value: &Value, region_hint: Option<&str>) -> Option<String> {
        let index = self.routing_index.read().clone();
        match (&*index, self.config.strategy) {
            (_, ShardStrategy::Hash) | (_, ShardStrategy::ConsistentHash) => {
                index.route_hash(key).map(|s| s.to_string())
            }
            (_, ShardStrategy::Range) => value.as_int().and_then(|k| index.route_range(k)).map(|s| s.to_string()),
            (_, ShardStrategy::Directory) => index.route_directory(key).map(|s| s.to_string()),
            (_, ShardStrategy::Geographic) => {
                let region = region_hint.unwrap_or("default");
                index.route_geographic(region, key).map(|s| s.to_string())
            }
        }
    }

    /// Add shard, then rebuild routing indexes atomically; no data moves
    pub fn add_shard_online(&self, shard: Arc<Shard>) {
        self.add_shard(shard);
    }

    /// Remove a shard, optionally migrating its rows to their
    /// recomputed destinations under the post-removal topology first.
    pub async fn remove_shard(
        &self,
        shard_id: &str,
        migrate: bool,
        mover: Option<Arc<dyn ShardDataMover>>,
    ) -> Result<()> {
        let shard = self
            .shard(shard_id)
            .ok_or_else(|| Error::RoutingInconsistent(format!("shard '{shard_id}' not found")))?;
        shard.set_state(EndpointState::Maintenance);

        // Routing index recomputed as if the shard were already gone,
        // so migration targets reflect the post-removal topology.
        let remaining: Vec<ShardTopologyEntry> = self
            .shards
            .iter()
            .filter(|e| e.key() != shard_id && e.value().is_active())
            .map(|e| e.value().topology_entry())
            .collect();
        let target_index = build_index_for(self.config.strategy, &remaining, self.config.virtual_nodes, &self.config.geo_regions);

        if migrate {
            let mover = mover.ok_or_else(|| {
                Error::MigrationFailed { migration_id: "n/a".into(), reason: "migrate=true requires a ShardDataMover".into() }
            })?;
            self.run_migration(&shard, &target_index, mover.as_ref()).await?;
        }

        self.shards.remove(shard_id);
        self.rebuild_index();
        info!(shard = %shard_id, migrated = migrate, "shard removed from topology");
        Ok(())
    }

    async fn run_migration(&self, shard: &Arc<Shard>, target_index: &RoutingIndex, mover: &dyn ShardDataMover) -> Result<()> {
        let mut record = MigrationRecord::new(shard.id.clone(), "multiple".to_string(), MigrationKind::RemoveShard);
        record.status = MigrationStatus::InProgress;
        self.progress_sink.record_migration(&record).await;

        let keys = mover
            .keys_on_shard(&shard.id)
            .await
            .map_err(|e| Error::MigrationFailed { migration_id: record.migration_id.clone(), reason: e.to_string() })?;

        let total = keys.len().max(1);
        for (i, key) in keys.iter().enumerate() {
            let dest = self
                .lookup_shard_id_against(target_index, &key.stable_repr(), key)
                .ok_or_else(|| Error::MigrationFailed {
                    migration_id: record.migration_id.clone(),
                    reason: "no destination shard under post-removal topology".to_string(),
                })?;

            mover
                .copy_row(key, &shard.id, &dest)
                .await
                .map_err(|e| Error::MigrationFailed { migration_id: record.migration_id.clone(), reason: e.to_string() })?;
            mover
                .delete_row(key, &shard.id)
                .await
                .map_err(|e| Error::MigrationFailed { migration_id: record.migration_id.clone(), reason: e.to_string() })?;

            record.progress = ((i + 1) as f64 / total as f64) * 100.0;
            self.progress_sink.record_migration(&record).await;
        }

        record.status = MigrationStatus::Completed;
        record.progress = 100.0;
        record.completed_at = Some(chrono::Utc::now());
        self.progress_sink.record_migration(&record).await;
        Ok(())
    }

    fn lookup_shard_id_against(&self, index: &RoutingIndex, key: &str, value: &Value) -> Option<String> {
        match self.config.strategy {
            ShardStrategy::Hash | ShardStrategy::ConsistentHash => index.route_hash(key).map(|s| s.to_string()),
            ShardStrategy::Range => value.as_int().and_then(|k| index.route_range(k)).map(|s| s.to_string()),
            ShardStrategy::Directory => index.route_directory(key).map(|s| s.to_string()),
            ShardStrategy::Geographic => index.route_geographic("default", key).map(|s| s.to_string()),
        }
    }
}

fn build_index_for(
    strategy: ShardStrategy,
    entries: &[ShardTopologyEntry],
    virtual_nodes: u32,
    geo_regions: &HashMap<String, Vec<String>>,
) -> RoutingIndex {
    match strategy {
        ShardStrategy::Hash => RoutingIndex::build_hash(entries),
        ShardStrategy::Range => RoutingIndex::build_range(entries),
        ShardStrategy::ConsistentHash => RoutingIndex::build_consistent_hash(entries, virtual_nodes),
        ShardStrategy::Geographic => RoutingIndex::build_geographic(entries, geo_regions),
        ShardStrategy::Directory => RoutingIndex::Directory(HashMap::new()),
    }
}

fn extract_key_value(query: &str, params: &[Value], shard_key: &ShardKeyConfig) -> Option<Value> {
    let placeholders_before = |pos: usize| query[..pos].matches('?').count();

    for caps in EQ_PARAM.captures_iter(query) {
        let column = &caps[1];
        if !column.eq_ignore_ascii_case(&shard_key.column) {
            continue;
        }
        let raw = &caps[2];
        if raw == "?" {
            let whole = caps.get(0).unwrap();
            let idx = placeholders_before(whole.start()) + raw.matches('?').count() - 1;
            return params.get(idx).cloned();
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Some(Value::Int(i));
        }
        return Some(Value::Text(raw.trim_matches('\'').to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::connector::mock::MockConnector;
    use dataplane_core::config::{PoolStrategy, ShardKeyConfig};

    async fn make_shard(id: &str) -> Arc<Shard> {
        let connector = Arc::new(MockConnector::new());
        let pool_cfg = dataplane_core::config::PoolConfig {
            strategy: PoolStrategy::Fixed,
            warm_on_start: false,
            ..Default::default()
        };
        let pool = ConnectionPool::new(format!("mock://{id}"), connector, pool_cfg).await.unwrap();
        Arc::new(Shard {
            id: id.to_string(),
            dsn: format!("mock://{id}"),
            pool,
            state: parking_lot::RwLock::new(EndpointState::Healthy),
            weight: 100,
            role: EndpointRole::Primary,
            region: "us".to_string(),
            az: "us-1a".to_string(),
            range: None,
            metrics: ShardMetrics::default(),
        })
    }

    fn hash_config() -> ShardRouterConfig {
        ShardRouterConfig {
            strategy: ShardStrategy::Hash,
            shard_key: ShardKeyConfig { column: "id".to_string(), r#type: "text".to_string(), hash_fn: "fnv1a".to_string() },
            replication_factor: 1,
            auto_rebalancing: false,
            max_shard_size: 0,
            virtual_nodes: 64,
            range_boundaries: vec![],
            geo_regions: HashMap::new(),
            enable_cross_shard: true,
        }
    }

    #[tokio::test]
    async fn hash_routing_is_deterministic_for_a_placeholder_param() {
        let router = ShardRouter::new(hash_config());
        router.add_shard(make_shard("s1").await);
        router.add_shard(make_shard("s2").await);
        router.add_shard(make_shard("s3").await);

        let query = "SELECT * FROM documents WHERE id = ?";
        let params = vec![Value::Text("doc_123".to_string())];

        let first = match router.route(query, &params, None).unwrap() {
            RouteDecision::SingleShard(s) => s.id.clone(),
            _ => panic!("expected single shard"),
        };
        let second = match router.route(query, &params, None).unwrap() {
            RouteDecision::SingleShard(s) => s.id.clone(),
            _ => panic!("expected single shard"),
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_shard_key_fans_out_when_cross_shard_enabled() {
        let router = ShardRouter::new(hash_config());
        router.add_shard(make_shard("s1").await);
        router.add_shard(make_shard("s2").await);

        let decision = router.route("SELECT * FROM documents", &[], None).unwrap();
        match decision {
            RouteDecision::CrossShard(shards) => assert_eq!(shards.len(), 2),
            _ => panic!("expected cross-shard fan-out"),
        }
    }

    #[tokio::test]
    async fn missing_shard_key_fails_when_cross_shard_disabled() {
        let mut cfg = hash_config();
        cfg.enable_cross_shard = false;
        let router = ShardRouter::new(cfg);
        router.add_shard(make_shard("s1").await);

        let result = router.route("SELECT * FROM documents", &[], None);
        assert!(matches!(result, Err(Error::NoShardKey { .. })));
    }

    struct InMemoryMover {
        rows: parking_lot::Mutex<HashMap<String, (Value, String)>>,
    }

    #[async_trait::async_trait]
    impl ShardDataMover for InMemoryMover {
        async fn keys_on_shard(&self, shard_id: &str) -> anyhow::Result<Vec<Value>> {
            Ok(self
                .rows
                .lock()
                .values()
                .filter(|(_, s)| s == shard_id)
                .map(|(v, _)| v.clone())
                .collect())
        }

        async fn copy_row(&self, key: &Value, _source: &str, target: &str) -> anyhow::Result<()> {
            self.rows.lock().insert(key.stable_repr(), (key.clone(), target.to_string()));
            Ok(())
        }

        async fn delete_row(&self, _key: &Value, _source: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn remove_shard_with_migration_moves_rows_to_remaining_shards() {
        let router = ShardRouter::new(hash_config());
        router.add_shard(make_shard("s1").await);
        router.add_shard(make_shard("s2").await);

        let mut rows = HashMap::new();
        for i in 0..20 {
            let v = Value::Text(format!("doc_{i}"));
            rows.insert(v.stable_repr(), (v, "s1".to_string()));
        }
        let mover = Arc::new(InMemoryMover { rows: parking_lot::Mutex::new(rows) });

        router.remove_shard("s1", true, Some(mover.clone())).await.unwrap();

        assert!(router.shard("s1").is_none());
        assert!(router.shard("s2").is_some());
        let remaining_on_s1 = mover.keys_on_shard("s1").await.unwrap();
        assert!(remaining_on_s1.is_empty());
    }
}
