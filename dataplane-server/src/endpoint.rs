//! The Endpoint data model: identity, role, weight, region/AZ,
//! health state, and the rolling metrics the monitor and load balancer
//! read to make routing decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::pool::ConnectionPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    Primary,
    Replica,
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Healthy,
    Degraded,
    Failed,
    Readonly,
    Maintenance,
}

/// Identity and connection descriptor for one physical database server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub id: String,
    pub dsn: String,
    pub role: EndpointRole,
    pub weight: u32,
    pub region: String,
    pub az: String,
}

/// Rolling metrics kept per endpoint. Uses atomics for the hot-path
/// counters so `record_result` never blocks a concurrent reader; the
/// EMA fields use a lock because they are read-modify-write floats,
/// updated at a rate that makes a short critical section a non-issue
/// (mirrors the pool's own accounting discipline).
#[derive(Debug)]
pub struct EndpointMetrics {
    pub connection_count: AtomicU64,
    pub error_count: AtomicU64,
    pub success_count: AtomicU64,
    ema_response_time_ms: parking_lot::Mutex<f64>,
    last_health_check: parking_lot::Mutex<Option<Instant>>,
    observed_lag_ms: AtomicU64,
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self {
            connection_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            ema_response_time_ms: parking_lot::Mutex::new(0.0),
            last_health_check: parking_lot::Mutex::new(None),
            observed_lag_ms: AtomicU64::new(0),
        }
    }
}

const EMA_ALPHA: f64 = 0.2;

impl EndpointMetrics {
    pub fn record_success(&self, latency_ms: f64) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let mut ema = self.ema_response_time_ms.lock();
        *ema = if *ema == 0.0 {
            latency_ms
        } else {
            EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * *ema
        };
    }

    pub fn record_failure(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ema_response_time_ms(&self) -> f64 {
        *self.ema_response_time_ms.lock()
    }

    pub fn record_health_check(&self) {
        *self.last_health_check.lock() = Some(Instant::now());
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        *self.last_health_check.lock()
    }

    pub fn set_observed_lag_ms(&self, lag_ms: u64) {
        self.observed_lag_ms.store(lag_ms, Ordering::Relaxed);
    }

    pub fn observed_lag_ms(&self) -> u64 {
        self.observed_lag_ms.load(Ordering::Relaxed)
    }

    pub fn error_rate(&self) -> f64 {
        let ok = self.success_count.load(Ordering::Relaxed);
        let err = self.error_count.load(Ordering::Relaxed);
        let total = ok + err;
        if total == 0 {
            0.0
        } else {
            err as f64 / total as f64
        }
    }
}

/// A live endpoint: identity plus its mutable state and metrics. Held
/// behind an `Arc` so the splitter, router, and balancer can all hold
/// non-owning references. Owns its own connection
/// pool the same way a `Shard` does; `pool` is `None` only for
/// endpoints built directly in unit tests that never lease a
/// connection.
pub struct Endpoint {
    pub spec: EndpointSpec,
    state: parking_lot::RwLock<EndpointState>,
    pub metrics: EndpointMetrics,
    pub pool: Option<ConnectionPool>,
}

impl Endpoint {
    pub fn new(spec: EndpointSpec) -> Self {
        Self {
            spec,
            state: parking_lot::RwLock::new(EndpointState::Healthy),
            metrics: EndpointMetrics::default(),
            pool: None,
        }
    }

    pub fn with_pool(spec: EndpointSpec, pool: ConnectionPool) -> Self {
        Self {
            spec,
            state: parking_lot::RwLock::new(EndpointState::Healthy),
            metrics: EndpointMetrics::default(),
            pool: Some(pool),
        }
    }

    pub fn state(&self) -> EndpointState {
        *self.state.read()
    }

    pub fn set_state(&self, state: EndpointState) {
        *self.state.write() = state;
    }

    pub fn is_usable_for_reads(&self) -> bool {
        matches!(
            self.state(),
            EndpointState::Healthy | EndpointState::Degraded | EndpointState::Readonly
        )
    }

    pub fn is_usable_for_writes(&self) -> bool {
        matches!(self.state(), EndpointState::Healthy | EndpointState::Degraded)
    }

    /// Lag must be within bound *and* the endpoint must be healthy to
    /// count as a replica read candidate.
    pub fn within_lag(&self, max_lag: Duration) -> bool {
        self.metrics.observed_lag_ms() <= max_lag.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> EndpointSpec {
        EndpointSpec {
            id: id.to_string(),
            dsn: "sqlite::memory:".to_string(),
            role: EndpointRole::Replica,
            weight: 100,
            region: "us-east".to_string(),
            az: "us-east-1a".to_string(),
        }
    }

    #[test]
    fn ema_response_time_converges_toward_recent_samples() {
        let m = EndpointMetrics::default();
        m.record_success(100.0);
        for _ in 0..50 {
            m.record_success(10.0);
        }
        assert!(m.ema_response_time_ms() < 20.0);
    }

    #[test]
    fn degraded_endpoint_is_usable_for_reads_not_writes() {
        let e = Endpoint::new(spec("db2"));
        e.set_state(EndpointState::Degraded);
        assert!(e.is_usable_for_reads());
        assert!(e.is_usable_for_writes());
        e.set_state(EndpointState::Readonly);
        assert!(e.is_usable_for_reads());
        assert!(!e.is_usable_for_writes());
    }
}
