//! The composition root: `DataPlane` constructs every component
//! exactly once from a `DataPlaneConfig`, wires the request path end
//! to end, and spawns the background workers. Tests that only need
//! one subsystem build it directly instead of going through here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dataplane_core::config::{DataPlaneConfig, EndpointSpecConfig, OptimizerLevel, ShardSpecConfig};
use dataplane_core::{Error, Result, Row, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::balancer::{BalancerStats, LoadBalancer, SelectRequest};
use crate::cache::{CacheStats, QueryCache};
use crate::classifier::{classify, Classification};
use crate::endpoint::{Endpoint, EndpointRole, EndpointSpec};
use crate::index_advisor::{IndexAdvisor, IndexRecommendation};
use crate::metadata::{MetadataStore, ShardRow};
use crate::monitor::{HealthReport, MonitorSources, PerformanceMonitor};
use crate::optimizer::{Optimizer, RewriteLevel};
use crate::pool::connector::Connector;
use crate::pool::{ConnectionPool, Outcome, PoolStats};
use crate::shard::migration::ShardDataMover;
use crate::shard::{RouteDecision, Shard, ShardRouter};
use crate::splitter::{ReadWriteSplitter, Route, SplitterOptions};

/// Caller-supplied request options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub force_primary: bool,
    pub session_consistency: bool,
    pub preferred_region: Option<String>,
    pub session_id: Option<String>,
    pub timeout_ms: Option<u64>,
    pub tags: Vec<String>,
    pub invalidation_triggers: Vec<String>,
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub rows: Vec<Row>,
    pub shards_queried: Vec<String>,
    pub duration_ms: u64,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub health: HealthReport,
    pub cache: CacheStats,
    pub balancer: Vec<BalancerStats>,
    pub pools: Vec<(String, PoolStats)>,
    pub failover_count: u64,
    pub open_alert_count: usize,
}

fn default_acquire_timeout(cfg: &DataPlaneConfig, opts: &ExecuteOptions) -> Duration {
    Duration::from_millis(opts.timeout_ms.unwrap_or(cfg.pool.acquire_timeout_ms))
}

fn to_rewrite_level(level: OptimizerLevel) -> RewriteLevel {
    match level {
        OptimizerLevel::Conservative => RewriteLevel::Conservative,
        OptimizerLevel::Moderate => RewriteLevel::Moderate,
        OptimizerLevel::Aggressive => RewriteLevel::Aggressive,
    }
}

async fn open_pool(spec: &EndpointSpecConfig, connector: &Arc<dyn Connector>, cfg: &DataPlaneConfig) -> Result<ConnectionPool> {
    ConnectionPool::new(spec.dsn.clone(), connector.clone(), cfg.pool.clone()).await
}

/// Either the unsharded primary/replica group routed by the splitter
/// and balancer, or the shard router. A deployment picks one at
/// startup via `DataPlaneConfig::topology` / `shard_router`; the two
/// are not combined in this implementation (see DESIGN.md).
enum Topology {
    Unsharded {
        primary: Arc<Endpoint>,
        replicas: Vec<Arc<Endpoint>>,
        splitter: ReadWriteSplitter,
        balancer: Arc<LoadBalancer>,
    },
    Sharded { router: Arc<ShardRouter> },
}

struct Inner {
    config: DataPlaneConfig,
    topology: Topology,
    cache: Arc<QueryCache>,
    optimizer: Optimizer,
    index_advisor: IndexAdvisor,
    monitor: Arc<PerformanceMonitor>,
    metadata: Arc<MetadataStore>,
    shutdown: CancellationToken,
    shards_mutated: AtomicBool,
}

/// The composed data plane. Cheap to clone (an `Arc` underneath,
/// matching `ConnectionPool`'s own handle pattern) so a transaction
/// handle or a background task can hold one without borrowing.
#[derive(Clone)]
pub struct DataPlane {
    inner: Arc<Inner>,
}

impl DataPlane {
    /// Builds every component, opens the configured endpoints'
    /// connection pools, and spawns the background workers.
    /// `connector` is the physical-connectivity abstraction; tests
    /// pass `pool::connector::mock::MockConnector`.
    pub async fn new(config: DataPlaneConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let metadata = Arc::new(MetadataStore::open(&config.metadata_store).await?);
        let cache = Arc::new(QueryCache::new(config.cache.clone()));
        let optimizer = Optimizer::new(to_rewrite_level(config.optimizer.level));
        let index_advisor = IndexAdvisor::new(config.index_advisor.min_freq);

        let topology = if let Some(shard_cfg) = &config.shard_router {
            let router = Arc::new(ShardRouter::new(shard_cfg.clone()).with_progress_sink(metadata.clone()));
            for spec in &config.shards {
                let shard = build_shard(spec, &connector, &config).await?;
                metadata
                    .upsert_shard(&ShardRow {
                        shard_id: shard.id.clone(),
                        connection_string: shard.dsn.clone(),
                        state: "healthy".to_string(),
                        weight: shard.weight as i64,
                        replica_count: 0,
                        range_start: spec.range_start,
                        range_end: spec.range_end,
                        region: shard.region.clone(),
                        az: shard.az.clone(),
                    })
                    .await?;
                router.add_shard(shard);
            }
            Topology::Sharded { router }
        } else {
            let topo_cfg = config.topology.clone().ok_or_else(|| {
                Error::ConfigInvalid("either `topology` (primary/replicas) or `shard_router` must be configured".to_string())
            })?;
            let primary = Arc::new(build_endpoint(&topo_cfg.primary, EndpointRole::Primary, &connector, &config).await?);
            let mut replicas = Vec::with_capacity(topo_cfg.replicas.len());
            for spec in &topo_cfg.replicas {
                replicas.push(Arc::new(build_endpoint(spec, EndpointRole::Replica, &connector, &config).await?));
            }

            let splitter = ReadWriteSplitter::new(primary.clone(), replicas.clone(), config.splitter.clone());
            let mut all = vec![primary.clone()];
            all.extend(replicas.iter().cloned());
            let balancer = Arc::new(LoadBalancer::new(config.load_balancer.clone(), all));

            Topology::Unsharded { primary, replicas, splitter, balancer }
        };

        let mut sources = MonitorSources { cache: Some(cache.clone()), ..Default::default() };
        match &topology {
            Topology::Unsharded { primary, replicas, balancer, .. } => {
                if let Some(pool) = &primary.pool {
                    sources.pools.push((primary.spec.id.clone(), pool.clone()));
                }
                for r in replicas {
                    if let Some(pool) = &r.pool {
                        sources.pools.push((r.spec.id.clone(), pool.clone()));
                    }
                }
                sources.balancers.push(("primary_group".to_string(), balancer.clone()));
            }
            Topology::Sharded { router } => {
                for shard in router.active_shards() {
                    sources.pools.push((shard.id.clone(), shard.pool.clone()));
                }
            }
        }

        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone(), sources));
        monitor.clone().spawn();

        let data_plane = Self {
            inner: Arc::new(Inner {
                config,
                topology,
                cache,
                optimizer,
                index_advisor,
                monitor,
                metadata,
                shutdown: CancellationToken::new(),
                shards_mutated: AtomicBool::new(false),
            }),
        };
        data_plane.spawn_background_workers();
        Ok(data_plane)
    }

    fn spawn_background_workers(&self) {
        // Cache sweep + usage-driven warming
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => this.cache_tick().await,
                }
            }
        });

        // Replica lag refresh + balancer weight adaptation, only
        // meaningful for the unsharded splitter/balancer pair.
        if let Topology::Unsharded { splitter: _, balancer, .. } = &self.inner.topology {
            let balancer = balancer.clone();
            let shutdown = self.inner.shutdown.clone();
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(15));
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Topology::Unsharded { splitter, .. } = &this.inner.topology {
                                splitter.refresh_lag();
                            }
                            balancer.rebalance_weights();
                        }
                    }
                }
            });
        }
    }

    async fn cache_tick(&self) {
        let swept = self.inner.cache.sweep_expired();
        if swept > 0 {
            info!(swept, "cache swept expired entries");
        }
        for (hash, query_text) in self.inner.cache.warming_candidates(20) {
            let warm_ttl = Duration::from_millis(self.inner.config.cache.default_ttl_ms * 4);
            match self.execute_internal(&query_text, &[], &ExecuteOptions::default()).await {
                Ok(result) if !result.from_cache => {
                    if let Err(e) = self.inner.cache.put(&query_text, &[], &result.rows, warm_ttl, &[], &[]) {
                        warn!(error = %e, query_hash = %hash, "cache warming insert refused");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, query_hash = %hash, "cache warming query failed"),
            }
        }
    }

    /// `execute(query, params, opts) -> {rows, shards_queried, duration_ms, from_cache}`
    pub async fn execute(&self, query: &str, params: &[Value], opts: ExecuteOptions) -> Result<ExecuteResult> {
        self.inner.index_advisor.observe(query);
        self.execute_internal(query, params, &opts).await
    }

    async fn execute_internal(&self, query: &str, params: &[Value], opts: &ExecuteOptions) -> Result<ExecuteResult> {
        let started = Instant::now();
        let classification = classify(query);
        let session_id = opts.session_id.clone().unwrap_or_else(|| "default".to_string());

        if classification.is_cacheable() && !opts.force_primary {
            if let Some(rows) = self.inner.cache.get::<Vec<Row>>(query, params) {
                return Ok(ExecuteResult {
                    rows,
                    shards_queried: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    from_cache: true,
                });
            }
        }

        let rewrite = self.inner.optimizer.optimize(query);
        let query_to_run = rewrite.rewritten.as_str();

        let (rows, shards_queried) = match &self.inner.topology {
            Topology::Unsharded { primary, replicas, splitter, balancer } => {
                let rows = self
                    .run_unsharded(primary, replicas, splitter, balancer, &session_id, classification, query_to_run, params, opts)
                    .await?;
                (rows, vec![primary.spec.id.clone()])
            }
            Topology::Sharded { router } => self.run_sharded(router, query_to_run, params, opts).await?,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.inner.monitor.record_query(duration_ms as f64);

        if classification.is_cacheable() && !opts.force_primary {
            let ttl = Duration::from_millis(opts.ttl_ms.unwrap_or(self.inner.config.cache.default_ttl_ms));
            if let Err(e) = self.inner.cache.put(query, params, &rows, ttl, &opts.tags, &opts.invalidation_triggers) {
                // Cache errors never fail the request
                warn!(error = %e, "cache insert refused");
            }
        }

        Ok(ExecuteResult { rows, shards_queried, duration_ms, from_cache: false })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_unsharded(
        &self,
        primary: &Arc<Endpoint>,
        replicas: &[Arc<Endpoint>],
        splitter: &ReadWriteSplitter,
        balancer: &Arc<LoadBalancer>,
        session_id: &str,
        classification: Classification,
        query: &str,
        params: &[Value],
        opts: &ExecuteOptions,
    ) -> Result<Vec<Row>> {
        let split_opts = SplitterOptions { force_primary: opts.force_primary, session_consistency: opts.session_consistency };
        let route = match splitter.route(session_id, classification, split_opts) {
            Ok(route) => route,
            Err(_) if !classification.routes_to_primary() => splitter.route_read_with_primary_down()?,
            Err(e) => return Err(e),
        };

        let endpoint = match route {
            Route::Primary => primary.clone(),
            Route::Replica(e) => {
                if balancer.is_breaker_open(&e.spec.id) {
                    // Breaker tripped after the splitter's own lag/health
                    // filter ran; ask the balancer for a breaker-safe
                    // alternative among the same replicas before giving
                    // up to primary ("if none, fall back to primary").
                    let req = SelectRequest { affinity_key: Some(session_id.to_string()) };
                    match balancer.select(req) {
                        Ok(decision) if replicas.iter().any(|r| r.spec.id == decision.endpoint.spec.id) => decision.endpoint,
                        _ => primary.clone(),
                    }
                } else {
                    e
                }
            }
        };

        self.run_on_endpoint(&endpoint, balancer, query, params, opts).await
    }

    async fn run_on_endpoint(
        &self,
        endpoint: &Arc<Endpoint>,
        balancer: &Arc<LoadBalancer>,
        query: &str,
        params: &[Value],
        opts: &ExecuteOptions,
    ) -> Result<Vec<Row>> {
        let Some(pool) = &endpoint.pool else {
            return Err(Error::EndpointUnavailable {
                role: endpoint.spec.id.clone(),
                reason: "endpoint has no connection pool attached".to_string(),
            });
        };

        let timeout = default_acquire_timeout(&self.inner.config, opts);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let lease = pool.acquire(timeout).await?;
            let started = Instant::now();
            match lease.execute(query, params).await {
                Ok(rows) => {
                    pool.release(lease, Outcome::Success).await;
                    balancer.record_result(&endpoint.spec.id, started.elapsed().as_secs_f64() * 1000.0, true);
                    return Ok(rows);
                }
                Err(e) => {
                    pool.release(lease, Outcome::Failure).await;
                    balancer.record_result(&endpoint.spec.id, started.elapsed().as_secs_f64() * 1000.0, false);
                    // Transient connection failures are retried
                    // internally up to a small bound; anything
                    // else surfaces immediately.
                    if e.is_recoverable() && attempts < 3 {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn run_sharded(
        &self,
        router: &Arc<ShardRouter>,
        query: &str,
        params: &[Value],
        opts: &ExecuteOptions,
    ) -> Result<(Vec<Row>, Vec<String>)> {
        let timeout = default_acquire_timeout(&self.inner.config, opts);
        match router.route(query, params, opts.preferred_region.as_deref())? {
            RouteDecision::SingleShard(shard) => {
                let rows = self.run_on_shard(&shard, query, params, timeout).await?;
                Ok((rows, vec![shard.id.clone()]))
            }
            RouteDecision::CrossShard(shards) => {
                // Fan out and merge. This does not
                // reconcile duplicates from overlapping keys during an
                // in-flight migration — merged rows may contain the same
                // logical row from both source and target shard.
                let futures = shards.iter().map(|shard| {
                    let shard = shard.clone();
                    let query = query.to_string();
                    let params = params.to_vec();
                    async move { (shard.id.clone(), self.run_on_shard(&shard, &query, &params, timeout).await) }
                });
                let results = futures::future::join_all(futures).await;
                let mut rows = Vec::new();
                let mut shard_ids = Vec::new();
                for (id, result) in results {
                    shard_ids.push(id);
                    rows.extend(result?);
                }
                Ok((rows, shard_ids))
            }
        }
    }

    async fn run_on_shard(&self, shard: &Arc<Shard>, query: &str, params: &[Value], timeout: Duration) -> Result<Vec<Row>> {
        let started = Instant::now();
        let lease = shard.pool.acquire(timeout).await?;
        let result = lease.execute(query, params).await;
        let ok = result.is_ok();
        shard.pool.release(lease, if ok { Outcome::Success } else { Outcome::Failure }).await;
        shard.metrics.record_latency(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// `begin_transaction(opts) -> TxnHandle` Binds the session to
    /// one endpoint (primary, unsharded) or one shard (its first
    /// statement's shard key) until `commit`/`rollback`
    pub fn begin_transaction(&self, opts: ExecuteOptions) -> TxnHandle {
        TxnHandle {
            data_plane: self.clone(),
            session_id: opts.session_id.clone().unwrap_or_else(|| format!("txn-{}", Uuid::new_v4())),
            opts,
            bound_shard: parking_lot::Mutex::new(None),
            completed: AtomicBool::new(false),
        }
    }

    // --- Administrative surface ---

    pub async fn add_shard(&self, spec: ShardSpecConfig, connector: Arc<dyn Connector>) -> Result<()> {
        let Topology::Sharded { router } = &self.inner.topology else {
            return Err(Error::ConfigInvalid("add_shard requires a sharded topology".to_string()));
        };
        let shard = build_shard(&spec, &connector, &self.inner.config).await?;
        self.inner
            .metadata
            .upsert_shard(&ShardRow {
                shard_id: shard.id.clone(),
                connection_string: shard.dsn.clone(),
                state: "healthy".to_string(),
                weight: shard.weight as i64,
                replica_count: 0,
                range_start: spec.range_start,
                range_end: spec.range_end,
                region: shard.region.clone(),
                az: shard.az.clone(),
            })
            .await?;
        router.add_shard_online(shard);
        self.inner.shards_mutated.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn remove_shard(&self, shard_id: &str, migrate: bool, mover: Option<Arc<dyn ShardDataMover>>) -> Result<()> {
        let Topology::Sharded { router } = &self.inner.topology else {
            return Err(Error::ConfigInvalid("remove_shard requires a sharded topology".to_string()));
        };
        router.remove_shard(shard_id, migrate, mover).await?;
        self.inner.metadata.remove_shard(shard_id).await?;
        Ok(())
    }

    pub fn get_statistics(&self) -> Statistics {
        let health = self.inner.monitor.force_health_check();
        let cache = self.inner.cache.stats();
        let (balancer, pools) = match &self.inner.topology {
            Topology::Unsharded { primary, replicas, balancer, .. } => {
                let mut pools = Vec::new();
                if let Some(p) = &primary.pool {
                    pools.push((primary.spec.id.clone(), p.stats()));
                }
                for r in replicas {
                    if let Some(p) = &r.pool {
                        pools.push((r.spec.id.clone(), p.stats()));
                    }
                }
                (balancer.statistics(), pools)
            }
            Topology::Sharded { router } => {
                let pools = router.active_shards().iter().map(|s| (s.id.clone(), s.pool.stats())).collect();
                (Vec::new(), pools)
            }
        };
        let failover_count = match &self.inner.topology {
            Topology::Unsharded { splitter, .. } => splitter.failover_count(),
            Topology::Sharded { .. } => 0,
        };
        Statistics { health, cache, balancer, pools, failover_count, open_alert_count: self.inner.monitor.open_alerts().len() }
    }

    /// `health`: a full collection + alert-evaluation pass.
    pub async fn health(&self) -> HealthReport {
        self.inner.monitor.collect_and_evaluate().await.1
    }

    /// `force_health_check`: a synchronous snapshot without
    /// re-running alert evaluation.
    pub fn force_health_check(&self) -> HealthReport {
        self.inner.monitor.force_health_check()
    }

    pub fn invalidate_cache_by_table(&self, table: &str) -> usize {
        self.inner.cache.invalidate_by_table(table)
    }

    pub fn invalidate_cache_by_tags(&self, tags: &[String]) -> usize {
        self.inner.cache.invalidate_by_tags(tags)
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// `warm_pool(n)`: warms every known pool by `n` connections.
    pub async fn warm_pool(&self, n: usize) -> Result<()> {
        match &self.inner.topology {
            Topology::Unsharded { primary, replicas, .. } => {
                if let Some(p) = &primary.pool {
                    p.warm(n).await?;
                }
                for r in replicas {
                    if let Some(p) = &r.pool {
                        p.warm(n).await?;
                    }
                }
            }
            Topology::Sharded { router } => {
                for shard in router.active_shards() {
                    shard.pool.warm(n).await?;
                }
            }
        }
        Ok(())
    }

    /// Offline index recommendations derived from every query
    /// observed through `execute` so far.
    pub fn index_recommendations(&self) -> Vec<IndexRecommendation> {
        self.inner.index_advisor.recommend()
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.monitor.shutdown();
        match &self.inner.topology {
            Topology::Unsharded { primary, replicas, .. } => {
                if let Some(p) = &primary.pool {
                    p.shutdown().await;
                }
                for r in replicas {
                    if let Some(p) = &r.pool {
                        p.shutdown().await;
                    }
                }
            }
            Topology::Sharded { router } => {
                for shard in router.active_shards() {
                    shard.pool.shutdown().await;
                }
            }
        }
        info!("data plane shut down");
    }
}

async fn build_endpoint(spec: &EndpointSpecConfig, role: EndpointRole, connector: &Arc<dyn Connector>, cfg: &DataPlaneConfig) -> Result<Endpoint> {
    let pool = open_pool(spec, connector, cfg).await?;
    Ok(Endpoint::with_pool(
        EndpointSpec { id: spec.id.clone(), dsn: spec.dsn.clone(), role, weight: spec.weight, region: spec.region.clone(), az: spec.az.clone() },
        pool,
    ))
}

async fn build_shard(spec: &ShardSpecConfig, connector: &Arc<dyn Connector>, cfg: &DataPlaneConfig) -> Result<Arc<Shard>> {
    let pool = ConnectionPool::new(spec.dsn.clone(), connector.clone(), cfg.pool.clone()).await?;
    Ok(Arc::new(Shard::new(
        spec.id.clone(),
        spec.dsn.clone(),
        pool,
        spec.weight,
        EndpointRole::Primary,
        spec.region.clone(),
        spec.az.clone(),
        spec.range_start.zip(spec.range_end),
    )))
}

/// `begin_transaction(opts) -> TxnHandle`, `handle.execute(...)`,
/// `handle.commit()`, `handle.rollback()` Every statement in a
/// transaction targets the one endpoint (unsharded) or shard (sharded)
/// bound on its first `execute` call; this crate does not attempt
/// cross-shard transactions (no distributed transaction
/// manager).
pub struct TxnHandle {
    data_plane: DataPlane,
    session_id: String,
    opts: ExecuteOptions,
    bound_shard: parking_lot::Mutex<Option<Arc<Shard>>>,
    completed: AtomicBool,
}

impl TxnHandle {
    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<ExecuteResult> {
        if self.completed.load(Ordering::Relaxed) {
            return Err(Error::ConfigInvalid("transaction already completed".to_string()));
        }

        match &self.data_plane.inner.topology {
            Topology::Unsharded { primary, replicas, balancer, .. } => {
                self.data_plane.inner.index_advisor.observe(query);
                let started = Instant::now();
                // Transactions bind to the primary for their whole
                // lifetime: every statement forces primary.
                let rows = self
                    .data_plane
                    .run_on_endpoint(primary, balancer, query, params, &ExecuteOptions { force_primary: true, ..self.opts.clone() })
                    .await?;
                let _ = replicas;
                Ok(ExecuteResult { rows, shards_queried: vec![primary.spec.id.clone()], duration_ms: started.elapsed().as_millis() as u64, from_cache: false })
            }
            Topology::Sharded { router } => {
                let started = Instant::now();
                let shard = {
                    let mut bound = self.bound_shard.lock();
                    if bound.is_none() {
                        match router.route(query, params, self.opts.preferred_region.as_deref())? {
                            RouteDecision::SingleShard(s) => *bound = Some(s),
                            RouteDecision::CrossShard(_) => {
                                return Err(Error::RoutingInconsistent(
                                    "transaction's first statement must resolve to a single shard".to_string(),
                                ))
                            }
                        }
                    }
                    bound.as_ref().unwrap().clone()
                };
                let timeout = default_acquire_timeout(&self.data_plane.inner.config, &self.opts);
                let rows = self.data_plane.run_on_shard(&shard, query, params, timeout).await?;
                Ok(ExecuteResult { rows, shards_queried: vec![shard.id.clone()], duration_ms: started.elapsed().as_millis() as u64, from_cache: false })
            }
        }
    }

    async fn finish(&self, statement: &str) -> Result<()> {
        self.completed.store(true, Ordering::Relaxed);
        match &self.data_plane.inner.topology {
            Topology::Unsharded { primary, balancer, .. } => {
                self.data_plane.run_on_endpoint(primary, balancer, statement, &[], &self.opts).await?;
                if let Topology::Unsharded { splitter, .. } = &self.data_plane.inner.topology {
                    splitter.clear_session(&self.session_id);
                }
            }
            Topology::Sharded { .. } => {
                let shard = self.bound_shard.lock().clone();
                if let Some(shard) = shard {
                    let timeout = default_acquire_timeout(&self.data_plane.inner.config, &self.opts);
                    self.data_plane.run_on_shard(&shard, statement, &[], timeout).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplane_core::config::{PoolConfig, PoolStrategy, TopologyConfig};
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn unsharded_config() -> DataPlaneConfig {
        DataPlaneConfig {
            pool: PoolConfig { strategy: PoolStrategy::Fixed, warm_on_start: false, min: 1, max: 5, initial: 1, ..Default::default() },
            topology: Some(TopologyConfig {
                primary: EndpointSpecConfig { id: "db1".to_string(), dsn: "mock://db1".to_string(), weight: 100, region: "us".to_string(), az: "us-1a".to_string() },
                replicas: vec![
                    EndpointSpecConfig { id: "db2".to_string(), dsn: "mock://db2".to_string(), weight: 100, region: "us".to_string(), az: "us-1a".to_string() },
                    EndpointSpecConfig { id: "db3".to_string(), dsn: "mock://db3".to_string(), weight: 100, region: "us".to_string(), az: "us-1a".to_string() },
                ],
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn select_routes_to_a_replica_and_insert_routes_to_primary() {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
        let connector: Arc<dyn Connector> = Arc::new(crate::pool::connector::mock::MockConnector::new());
        let dp = DataPlane::new(unsharded_config(), connector).await.unwrap();

        let select = dp.execute("SELECT * FROM documents WHERE id = 42", &[], ExecuteOptions::default()).await.unwrap();
        assert!(!select.from_cache);
        assert_eq!(select.shards_queried, vec!["db1".to_string()]);

        let insert = dp
            .execute("INSERT INTO documents(id,title) VALUES (1,'t')", &[], ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(insert.shards_queried, vec!["db1".to_string()]);
        dp.shutdown().await;
    }

    #[tokio::test]
    async fn cache_hit_after_first_read() {
        let connector: Arc<dyn Connector> = Arc::new(crate::pool::connector::mock::MockConnector::new());
        let dp = DataPlane::new(unsharded_config(), connector).await.unwrap();

        let query = "SELECT COUNT(*) FROM documents";
        let first = dp.execute(query, &[], ExecuteOptions::default()).await.unwrap();
        assert!(!first.from_cache);
        let second = dp.execute(query, &[], ExecuteOptions::default()).await.unwrap();
        assert!(second.from_cache);
        dp.shutdown().await;
    }

    #[tokio::test]
    async fn invalidate_by_table_forces_a_miss() {
        let connector: Arc<dyn Connector> = Arc::new(crate::pool::connector::mock::MockConnector::new());
        let dp = DataPlane::new(unsharded_config(), connector).await.unwrap();

        let query = "SELECT COUNT(*) FROM documents";
        let opts = ExecuteOptions { invalidation_triggers: vec!["documents".to_string()], ..Default::default() };
        let first = dp.execute(query, &[], opts.clone()).await.unwrap();
        assert!(!first.from_cache);
        let hit = dp.execute(query, &[], opts.clone()).await.unwrap();
        assert!(hit.from_cache);

        dp.invalidate_cache_by_table("documents");
        let miss = dp.execute(query, &[], opts).await.unwrap();
        assert!(!miss.from_cache);
        dp.shutdown().await;
    }

    #[tokio::test]
    async fn transaction_binds_primary_for_its_whole_lifetime() {
        let connector: Arc<dyn Connector> = Arc::new(crate::pool::connector::mock::MockConnector::new());
        let dp = DataPlane::new(unsharded_config(), connector).await.unwrap();

        let txn = dp.begin_transaction(ExecuteOptions::default());
        txn.execute("UPDATE documents SET title='x' WHERE id=7", &[]).await.unwrap();
        txn.execute("SELECT title FROM documents WHERE id=7", &[]).await.unwrap();
        txn.commit().await.unwrap();
        assert!(txn.completed.load(AtomicOrdering::Relaxed));
        dp.shutdown().await;
    }

    fn sharded_config() -> DataPlaneConfig {
        use dataplane_core::config::{ShardKeyConfig, ShardRouterConfig, ShardStrategy};
        DataPlaneConfig {
            pool: PoolConfig { strategy: PoolStrategy::Fixed, warm_on_start: false, min: 1, max: 5, initial: 1, ..Default::default() },
            shard_router: Some(ShardRouterConfig {
                strategy: ShardStrategy::Hash,
                shard_key: ShardKeyConfig { column: "id".to_string(), r#type: "text".to_string(), hash_fn: "fnv1a".to_string() },
                replication_factor: 1,
                auto_rebalancing: false,
                max_shard_size: 0,
                virtual_nodes: 64,
                range_boundaries: vec![],
                geo_regions: Default::default(),
                enable_cross_shard: true,
            }),
            shards: vec![
                ShardSpecConfig { id: "s1".to_string(), dsn: "mock://s1".to_string(), weight: 100, region: "us".to_string(), az: "us-1a".to_string(), range_start: None, range_end: None },
                ShardSpecConfig { id: "s2".to_string(), dsn: "mock://s2".to_string(), weight: 100, region: "us".to_string(), az: "us-1a".to_string(), range_start: None, range_end: None },
                ShardSpecConfig { id: "s3".to_string(), dsn: "mock://s3".to_string(), weight: 100, region: "us".to_string(), az: "us-1a".to_string(), range_start: None, range_end: None },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn hash_sharded_lookup_is_deterministic() {
        let connector: Arc<dyn Connector> = Arc::new(crate::pool::connector::mock::MockConnector::new());
        let dp = DataPlane::new(sharded_config(), connector).await.unwrap();

        let query = "SELECT * FROM documents WHERE id = ?";
        let params = vec![Value::Text("doc_123".to_string())];
        let first = dp.execute(query, &params, ExecuteOptions::default()).await.unwrap();
        let second = dp.execute(query, &params, ExecuteOptions::default()).await.unwrap();
        assert_eq!(first.shards_queried, second.shards_queried);
        assert_eq!(first.shards_queried.len(), 1);
        dp.shutdown().await;
    }

    #[tokio::test]
    async fn cross_shard_fan_out_queries_every_active_shard() {
        let connector: Arc<dyn Connector> = Arc::new(crate::pool::connector::mock::MockConnector::new());
        let dp = DataPlane::new(sharded_config(), connector).await.unwrap();

        let result = dp.execute("SELECT * FROM documents", &[], ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.shards_queried.len(), 3);
        dp.shutdown().await;
    }
}
