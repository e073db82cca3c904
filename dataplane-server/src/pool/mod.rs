//! Connection Pool: lifecycle of physical connections to one
//! endpoint, warming, health maintenance, and adaptive sizing.

pub mod connector;
pub mod sizing;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dataplane_core::config::PoolConfig;
use dataplane_core::{Error, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use connector::{Connector, PhysicalConnection};
use sizing::{RollingSamples, SizeDecision, SizingContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Active,
    Stale,
    Invalid,
}

/// One physical connection plus its usage metrics
pub struct ManagedConnection {
    pub id: Uuid,
    conn: Box<dyn PhysicalConnection>,
    created_at: Instant,
    last_used: parking_lot::Mutex<Instant>,
    query_count: AtomicU64,
    ema_query_time_ms: parking_lot::Mutex<f64>,
    error_count: AtomicU64,
    state: parking_lot::Mutex<ConnState>,
}

impl ManagedConnection {
    fn new(conn: Box<dyn PhysicalConnection>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            conn,
            created_at: now,
            last_used: parking_lot::Mutex::new(now),
            query_count: AtomicU64::new(0),
            ema_query_time_ms: parking_lot::Mutex::new(0.0),
            error_count: AtomicU64::new(0),
            state: parking_lot::Mutex::new(ConnState::Idle),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    fn set_state(&self, s: ConnState) {
        *self.state.lock() = s;
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn record_query(&self, elapsed_ms: f64, ok: bool) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let mut ema = self.ema_query_time_ms.lock();
        *ema = if *ema == 0.0 {
            elapsed_ms
        } else {
            0.2 * elapsed_ms + 0.8 * *ema
        };
    }

    async fn is_alive(&self) -> bool {
        self.conn.ping().await
    }
}

/// Exclusive, time-bounded right to use one connection. Must be
/// released on every path, including failure — dropping an unreleased
/// lease is treated as a failed outcome and logged, so a panicking
/// caller never leaks the connection out of the pool's accounting.
pub struct Lease {
    pool: Arc<PoolInner>,
    conn: Option<Arc<ManagedConnection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Lease {
    pub fn connection_id(&self) -> Uuid {
        self.conn.as_ref().expect("lease already released").id
    }

    /// Record a query's elapsed time against this leased connection and
    /// the pool's rolling response-time samples (feeds `stats()` and the
    /// Adaptive sizing strategy).
    pub fn record_query(&self, elapsed: Duration, ok: bool) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if let Some(c) = &self.conn {
            c.record_query(elapsed_ms, ok);
        }
        self.pool.record_response_time(elapsed_ms);
    }

    /// Runs a query against the leased connection and records the
    /// elapsed time and outcome against it, the way `record_query`
    /// would be called by hand around a raw driver call.
    pub async fn execute(&self, query: &str, params: &[dataplane_core::Value]) -> Result<Vec<dataplane_core::Row>> {
        let conn = self.conn.as_ref().expect("lease already released");
        let started = Instant::now();
        let result = conn.conn.execute(query, params).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        conn.record_query(elapsed_ms, result.is_ok());
        self.pool.record_response_time(elapsed_ms);
        result
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(connection_id = %conn.id, "lease dropped without explicit release, returning as failure");
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(conn, Outcome::Failure).await;
            });
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub peak_active: usize,
    pub mean_wait_ms: f64,
    pub p95_wait_ms: f64,
    pub mean_response_ms: f64,
    pub p95_response_ms: f64,
}

impl PoolStats {
    /// successful / total requests — "pool efficiency".
    pub fn efficiency(&self) -> f64 {
        let total = self.successful_requests + self.failed_requests;
        if total == 0 {
            1.0
        } else {
            self.successful_requests as f64 / total as f64
        }
    }
}

struct State {
    idle: VecDeque<Arc<ManagedConnection>>,
    active: std::collections::HashSet<Uuid>,
    total: usize,
    peak_active: usize,
    successful_requests: u64,
    failed_requests: u64,
    wait_samples: RollingSamples,
    response_samples: RollingSamples,
}

pub struct PoolInner {
    dsn: String,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: parking_lot::Mutex<State>,
    notify: Notify,
    shutdown: CancellationToken,
}

/// Public handle to a pool for one endpoint. Cloning is cheap (an
/// `Arc` underneath); the maintenance worker holds its own clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub async fn new(dsn: impl Into<String>, connector: Arc<dyn Connector>, config: PoolConfig) -> Result<Self> {
        let dsn = dsn.into();
        let inner = Arc::new(PoolInner {
            dsn,
            connector,
            state: parking_lot::Mutex::new(State {
                idle: VecDeque::new(),
                active: std::collections::HashSet::new(),
                total: 0,
                peak_active: 0,
                successful_requests: 0,
                failed_requests: 0,
                wait_samples: RollingSamples::new(100),
                response_samples: RollingSamples::new(100),
            }),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            config,
        });

        let pool = Self { inner };
        if pool.inner.config.warm_on_start {
            pool.warm(pool.inner.config.initial).await?;
        }
        pool.spawn_maintenance();
        Ok(pool)
    }

    fn spawn_maintenance(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.maintenance_tick().await;
                    }
                }
            }
        });
    }

    pub async fn warm(&self, n: usize) -> Result<()> {
        for _ in 0..n {
            if self.inner.state.lock().total >= self.inner.config.max {
                break;
            }
            match self.inner.open_one().await {
                Ok(conn) => {
                    let mut s = self.inner.state.lock();
                    conn.set_state(ConnState::Idle);
                    s.idle.push_back(conn);
                }
                Err(e) => {
                    warn!(error = %e, "failed to warm connection");
                    break;
                }
            }
        }
        Ok(())
    }

    /// `acquire(timeout) -> Lease | TimeoutError`
    pub async fn acquire(&self, timeout: Duration) -> Result<Lease> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(conn) = self.try_take_idle_or_create().await? {
                if conn.is_alive().await {
                    conn.touch();
                    conn.set_state(ConnState::Active);
                    let wait_ms = started.elapsed().as_secs_f64() * 1000.0;
                    let mut s = self.inner.state.lock();
                    s.active.insert(conn.id);
                    s.peak_active = s.peak_active.max(s.active.len());
                    s.wait_samples.push(wait_ms);
                    return Ok(Lease {
                        pool: self.inner.clone(),
                        conn: Some(conn),
                    });
                } else {
                    // Failed health when pulled: discard and retry immediately.
                    self.inner.discard(&conn);
                    continue;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let mut s = self.inner.state.lock();
                s.failed_requests += 1;
                return Err(Error::Timeout(timeout.as_millis() as u64));
            }

            let notified = self.inner.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {
                    let mut s = self.inner.state.lock();
                    s.failed_requests += 1;
                    return Err(Error::Timeout(timeout.as_millis() as u64));
                }
            }
        }
    }

    /// Pops an idle connection if one exists and is not past its
    /// lifetime bounds; otherwise creates one directly if under `max`.
    /// Returns `Ok(None)` when the caller should wait.
    async fn try_take_idle_or_create(&self) -> Result<Option<Arc<ManagedConnection>>> {
        let reserved_new = {
            let mut s = self.inner.state.lock();
            while let Some(conn) = s.idle.pop_front() {
                let stale = conn.idle_for() > Duration::from_millis(self.inner.config.stale_timeout_ms)
                    || conn.age() > Duration::from_millis(self.inner.config.max_age_ms);
                if stale {
                    conn.set_state(ConnState::Stale);
                    s.total = s.total.saturating_sub(1);
                    continue;
                }
                return Ok(Some(conn));
            }
            if s.total < self.inner.config.max {
                s.total += 1;
                true
            } else {
                false
            }
        };

        if !reserved_new {
            return Ok(None);
        }

        match self.inner.open_one().await {
            Ok(conn) => Ok(Some(conn)),
            Err(e) => {
                let mut s = self.inner.state.lock();
                s.total = s.total.saturating_sub(1);
                debug!(error = %e, "connection creation failed, will be retried by caller loop");
                Ok(None)
            }
        }
    }

    /// `release(lease, outcome)` Consumes the lease so it can
    /// never be released twice.
    pub async fn release(&self, mut lease: Lease, outcome: Outcome) {
        if let Some(conn) = lease.conn.take() {
            self.inner.release(conn, outcome).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let s = self.inner.state.lock();
        PoolStats {
            total: s.total,
            idle: s.idle.len(),
            active: s.active.len(),
            successful_requests: s.successful_requests,
            failed_requests: s.failed_requests,
            peak_active: s.peak_active,
            mean_wait_ms: s.wait_samples.mean(),
            p95_wait_ms: s.wait_samples.p95(),
            mean_response_ms: s.response_samples.mean(),
            p95_response_ms: s.response_samples.p95(),
        }
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut s = self.inner.state.lock();
        s.idle.clear();
        s.total = 0;
    }

    pub fn dsn(&self) -> &str {
        &self.inner.dsn
    }
}

impl PoolInner {
    fn record_response_time(&self, elapsed_ms: f64) {
        self.state.lock().response_samples.push(elapsed_ms);
    }

    async fn open_one(&self) -> Result<Arc<ManagedConnection>> {
        let physical = self.connector.connect(&self.dsn).await?;
        Ok(Arc::new(ManagedConnection::new(physical)))
    }

    fn discard(&self, conn: &Arc<ManagedConnection>) {
        conn.set_state(ConnState::Invalid);
        let mut s = self.state.lock();
        s.total = s.total.saturating_sub(1);
    }

    async fn release(&self, conn: Arc<ManagedConnection>, outcome: Outcome) {
        let mut s = self.state.lock();
        s.active.remove(&conn.id);
        match outcome {
            Outcome::Success => s.successful_requests += 1,
            Outcome::Failure => s.failed_requests += 1,
        }

        let past_lifetime = conn.age() > Duration::from_millis(self.config.max_age_ms);
        let invalid = matches!(conn.state(), ConnState::Invalid | ConnState::Stale) || past_lifetime;

        if invalid || outcome == Outcome::Failure && !conn_is_reusable(&conn).await {
            s.total = s.total.saturating_sub(1);
        } else {
            conn.set_state(ConnState::Idle);
            s.idle.push_back(conn);
        }
        drop(s);
        self.notify.notify_one();
    }

    async fn maintenance_tick(&self) {
        self.evict_unhealthy().await;
        self.resize().await;
    }

    async fn evict_unhealthy(&self) {
        let candidates: Vec<Arc<ManagedConnection>> = {
            let s = self.state.lock();
            s.idle.iter().cloned().collect()
        };
        let mut dead = Vec::new();
        for conn in candidates {
            let stale = conn.idle_for() > Duration::from_millis(self.config.stale_timeout_ms)
                || conn.age() > Duration::from_millis(self.config.max_age_ms);
            if stale || !conn.is_alive().await {
                dead.push(conn.id);
            }
        }
        if dead.is_empty() {
            return;
        }
        let mut s = self.state.lock();
        let before = s.idle.len();
        s.idle.retain(|c| !dead.contains(&c.id));
        let removed = before - s.idle.len();
        s.total = s.total.saturating_sub(removed).max(self.config.min.min(s.total));
        info!(removed, "pool maintenance evicted unhealthy/stale idle connections");
    }

    async fn resize(&self) {
        let decision = {
            let s = self.state.lock();
            let ctx = SizingContext {
                active: s.active.len(),
                total: s.total,
                idle: s.idle.len(),
                min: self.config.min,
                max: self.config.max,
                wait_time_mean_ms: s.wait_samples.mean(),
                response_time_mean_ms: s.response_samples.mean(),
            };
            sizing::decide(self.config.strategy, &ctx)
        };

        match decision {
            SizeDecision::GrowBy(n) if n > 0 => {
                for _ in 0..n {
                    match self.open_one().await {
                        Ok(conn) => {
                            let mut s = self.state.lock();
                            if s.total >= self.config.max {
                                break;
                            }
                            s.total += 1;
                            conn.set_state(ConnState::Idle);
                            s.idle.push_back(conn);
                        }
                        Err(e) => {
                            warn!(error = %e, "adaptive grow failed to open connection");
                            break;
                        }
                    }
                }
            }
            SizeDecision::ShrinkIdleBy(n) if n > 0 => {
                let mut s = self.state.lock();
                let keep_at_least = self.config.min;
                let mut removed = 0;
                while removed < n && s.idle.len() > 0 && s.total > keep_at_least {
                    s.idle.pop_back();
                    s.total -= 1;
                    removed += 1;
                }
            }
            _ => {}
        }
    }
}

/// After a failed query a connection might still be structurally fine
/// (the failure was a query-level error, not a transport break); only a
/// dead ping invalidates it outright.
async fn conn_is_reusable(conn: &Arc<ManagedConnection>) -> bool {
    conn.is_alive().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector::mock::MockConnector;
    use dataplane_core::config::PoolStrategy;

    fn test_config() -> PoolConfig {
        PoolConfig {
            min: 1,
            max: 3,
            initial: 1,
            acquire_timeout_ms: 200,
            idle_timeout_ms: 60_000,
            stale_timeout_ms: 60_000,
            max_age_ms: 3_600_000,
            strategy: PoolStrategy::Fixed,
            warm_on_start: false,
        }
    }

    #[tokio::test]
    async fn acquire_release_round_trip_keeps_total_in_bounds() {
        let connector = Arc::new(MockConnector::new());
        let pool = ConnectionPool::new("mock://a", connector, test_config()).await.unwrap();

        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.total, 1);

        pool.release(lease, Outcome::Success).await;
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
        assert!(stats.total >= test_config().min && stats.total <= test_config().max);
    }

    #[tokio::test]
    async fn acquire_with_zero_timeout_fails_immediately_when_exhausted() {
        let connector = Arc::new(MockConnector::new());
        let mut cfg = test_config();
        cfg.max = 1;
        let pool = ConnectionPool::new("mock://a", connector, cfg).await.unwrap();

        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let result = pool.acquire(Duration::from_millis(0)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        pool.release(lease, Outcome::Success).await;
    }

    #[tokio::test]
    async fn acquire_creates_new_connection_when_idle_empty_and_under_max() {
        let connector = Arc::new(MockConnector::new());
        let pool = ConnectionPool::new("mock://a", connector, test_config()).await.unwrap();

        let l1 = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let l2 = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.stats().total, 2);
        pool.release(l1, Outcome::Success).await;
        pool.release(l2, Outcome::Success).await;
    }

    #[tokio::test]
    async fn dead_connection_pulled_from_idle_is_discarded_and_retried() {
        let connector = Arc::new(MockConnector::new());
        let pool = ConnectionPool::new("mock://a", connector.clone(), test_config()).await.unwrap();

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(lease, Outcome::Success).await;
        assert_eq!(pool.stats().idle, 1);

        connector.kill();
        let lease2 = pool.acquire(Duration::from_millis(200)).await.unwrap();
        // The dead idle connection was discarded and a fresh one created.
        assert_eq!(pool.stats().total, 1);
        pool.release(lease2, Outcome::Success).await;
    }

    #[tokio::test]
    async fn dropping_a_lease_without_release_still_returns_connection() {
        let connector = Arc::new(MockConnector::new());
        let pool = ConnectionPool::new("mock://a", connector, test_config()).await.unwrap();

        {
            let _lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        }
        // Give the spawned safety-net release task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn lease_record_query_feeds_pool_response_time_stats() {
        let connector = Arc::new(MockConnector::new());
        let pool = ConnectionPool::new("mock://a", connector, test_config()).await.unwrap();

        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.stats().mean_response_ms, 0.0);
        lease.record_query(Duration::from_millis(5), true);
        pool.release(lease, Outcome::Success).await;

        let stats = pool.stats();
        assert!(stats.mean_response_ms > 0.0, "mean_response_ms should reflect the recorded query");
        assert!(stats.p95_response_ms > 0.0);
    }
}
