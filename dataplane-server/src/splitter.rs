//! Read/Write Splitter: route by classification, enforce session
//! read-after-write consistency, gate replica reads on lag, and fail
//! over to a promoted replica when the primary is unavailable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dataplane_core::config::SplitterConfig;
use dataplane_core::{Error, Result};
use tracing::{info, warn};

use crate::classifier::Classification;
use crate::endpoint::{Endpoint, EndpointState};

/// Placeholder hook for replica lag measurement:
/// the original's lag computation is a hash-diff heuristic and is
/// explicitly not production-grade. A real driver supplies its own
/// `LagProbe` (e.g. reading replication slot position); this crate
/// ships only the documented-placeholder implementation.
pub trait LagProbe: Send + Sync {
    fn measure_lag_ms(&self, primary: &Endpoint, replica: &Endpoint) -> u64;
}

/// Hash-diff heuristic carried over unchanged from the source: derives
/// a pseudo-lag from the endpoints' current success-count skew. This is
/// a placeholder, not a real replication-lag measurement.
pub struct HeuristicLagProbe;

impl LagProbe for HeuristicLagProbe {
    fn measure_lag_ms(&self, primary: &Endpoint, replica: &Endpoint) -> u64 {
        use std::sync::atomic::Ordering;
        let p = primary.metrics.success_count.load(Ordering::Relaxed);
        let r = replica.metrics.success_count.load(Ordering::Relaxed);
        p.saturating_sub(r).min(5_000)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SplitterOptions {
    pub force_primary: bool,
    pub session_consistency: bool,
}

#[derive(Clone)]
struct SessionBinding {
    endpoint_id: String,
    bound_until: Instant,
}

pub struct ReadWriteSplitter {
    primary: Arc<Endpoint>,
    replicas: Vec<Arc<Endpoint>>,
    config: SplitterConfig,
    lag_probe: Arc<dyn LagProbe>,
    sessions: DashMap<String, SessionBinding>,
    failover_count: std::sync::atomic::AtomicU64,
}

pub enum Route {
    Primary,
    Replica(Arc<Endpoint>),
}

impl ReadWriteSplitter {
    pub fn new(primary: Arc<Endpoint>, replicas: Vec<Arc<Endpoint>>, config: SplitterConfig) -> Self {
        Self {
            primary,
            replicas,
            config,
            lag_probe: Arc::new(HeuristicLagProbe),
            sessions: DashMap::new(),
            failover_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn with_lag_probe(mut self, probe: Arc<dyn LagProbe>) -> Self {
        self.lag_probe = probe;
        self
    }

    pub fn failover_count(&self) -> u64 {
        self.failover_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Refresh every replica's observed lag against the primary. A
    /// background tick calls this; tests can call it directly.
    pub fn refresh_lag(&self) {
        for replica in &self.replicas {
            let lag = self.lag_probe.measure_lag_ms(&self.primary, replica);
            replica.metrics.set_observed_lag_ms(lag);
        }
    }

    /// Route rules
    pub fn route(&self, session_id: &str, classification: Classification, opts: SplitterOptions) -> Result<Route> {
        if classification.routes_to_primary() || opts.force_primary {
            if !self.primary.is_usable_for_writes() {
                return self.failover_for_write();
            }
            if opts.session_consistency {
                self.bind_session(session_id, &self.primary.spec.id);
            }
            return Ok(Route::Primary);
        }

        if opts.session_consistency {
            if let Some(route) = self.session_route(session_id) {
                return Ok(route);
            }
        }

        if !self.config.enable_read_splitting {
            return Ok(Route::Primary);
        }

        let max_lag = Duration::from_millis(self.config.max_lag_ms);
        let mut candidates: Vec<&Arc<Endpoint>> = self
            .replicas
            .iter()
            .filter(|r| r.is_usable_for_reads() && r.within_lag(max_lag))
            .collect();

        if candidates.is_empty() {
            return Ok(Route::Primary);
        }

        candidates.sort_by(|a, b| composite_score(a).partial_cmp(&composite_score(b)).unwrap());
        Ok(Route::Replica(candidates[0].clone()))
    }

    fn session_route(&self, session_id: &str) -> Option<Route> {
        let binding = self.sessions.get(session_id)?;
        if binding.bound_until < Instant::now() {
            drop(binding);
            self.sessions.remove(session_id);
            return None;
        }
        if binding.endpoint_id == self.primary.spec.id {
            return Some(Route::Primary);
        }
        self.replicas
            .iter()
            .find(|r| r.spec.id == binding.endpoint_id)
            .map(|r| Route::Replica(r.clone()))
    }

    fn bind_session(&self, session_id: &str, endpoint_id: &str) {
        self.sessions.insert(
            session_id.to_string(),
            SessionBinding {
                endpoint_id: endpoint_id.to_string(),
                bound_until: Instant::now() + Duration::from_millis(self.config.session_window_ms),
            },
        );
    }

    /// Clears a session's endpoint binding, e.g. on transaction commit.
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    fn failover_for_write(&self) -> Result<Route> {
        if !self.config.failover_enabled {
            return Err(Error::EndpointUnavailable {
                role: "primary".to_string(),
                reason: "primary unavailable and failover disabled".to_string(),
            });
        }
        warn!("primary unavailable; write cannot be served by a promoted replica");
        self.failover_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(Error::EndpointUnavailable {
            role: "primary".to_string(),
            reason: "primary down, failover promotes reads only; writes must wait for recovery".to_string(),
        })
    }

    /// When the primary is down and failover is enabled, reads still
    /// need somewhere to go: promote the healthiest (lowest-lag) replica.
    pub fn route_read_with_primary_down(&self) -> Result<Route> {
        if !self.config.failover_enabled {
            return Err(Error::EndpointUnavailable {
                role: "primary".to_string(),
                reason: "primary down and failover disabled".to_string(),
            });
        }
        let best = self
            .replicas
            .iter()
            .filter(|r| r.is_usable_for_reads())
            .min_by_key(|r| r.metrics.observed_lag_ms());

        match best {
            Some(r) => {
                self.failover_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(endpoint = %r.spec.id, "promoted replica to serve reads during primary outage");
                Ok(Route::Replica(r.clone()))
            }
            None => Err(Error::EndpointUnavailable {
                role: "replica".to_string(),
                reason: "no healthy replica available to promote".to_string(),
            }),
        }
    }
}

/// `load_factor + lag_factor + (100-weight)/100`, lower is better.
fn composite_score(e: &Arc<Endpoint>) -> f64 {
    let load_factor = e.metrics.connection_count.load(std::sync::atomic::Ordering::Relaxed) as f64;
    let lag_factor = e.metrics.observed_lag_ms() as f64 / 100.0;
    let weight_factor = (100 - e.spec.weight.min(100)) as f64 / 100.0;
    load_factor + lag_factor + weight_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointRole, EndpointSpec};

    fn endpoint(id: &str, role: EndpointRole, weight: u32) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(EndpointSpec {
            id: id.to_string(),
            dsn: "mock://".to_string(),
            role,
            weight,
            region: "us-east".to_string(),
            az: "us-east-1a".to_string(),
        }))
    }

    fn splitter() -> ReadWriteSplitter {
        let primary = endpoint("db1", EndpointRole::Primary, 100);
        let replicas = vec![
            endpoint("db2", EndpointRole::Replica, 100),
            endpoint("db3", EndpointRole::Replica, 100),
        ];
        ReadWriteSplitter::new(primary, replicas, SplitterConfig::default())
    }

    #[test]
    fn writes_route_to_primary() {
        let s = splitter();
        let route = s.route("session-1", Classification::Write, SplitterOptions::default()).unwrap();
        assert!(matches!(route, Route::Primary));
    }

    #[test]
    fn reads_route_to_a_healthy_replica() {
        let s = splitter();
        let route = s.route("session-1", Classification::Read, SplitterOptions::default()).unwrap();
        match route {
            Route::Replica(e) => assert!(e.spec.id == "db2" || e.spec.id == "db3"),
            Route::Primary => panic!("expected replica"),
        }
    }

    #[test]
    fn session_consistency_routes_read_after_write_to_same_endpoint() {
        let s = splitter();
        let opts = SplitterOptions { force_primary: false, session_consistency: true };
        let write_route = s.route("session-7", Classification::Write, opts).unwrap();
        assert!(matches!(write_route, Route::Primary));

        let read_route = s.route("session-7", Classification::Read, opts).unwrap();
        assert!(matches!(read_route, Route::Primary));
    }

    #[test]
    fn replicas_beyond_max_lag_are_excluded() {
        let s = splitter();
        for r in &s.replicas {
            r.metrics.set_observed_lag_ms(100_000);
        }
        let route = s.route("session-1", Classification::Read, SplitterOptions::default()).unwrap();
        assert!(matches!(route, Route::Primary));
    }

    #[test]
    fn all_replicas_failed_with_failover_routes_reads_to_primary_fallback() {
        let s = splitter();
        for r in &s.replicas {
            r.set_state(EndpointState::Failed);
        }
        let route = s.route("session-1", Classification::Read, SplitterOptions::default()).unwrap();
        assert!(matches!(route, Route::Primary));
    }

    #[test]
    fn primary_down_promotes_lowest_lag_replica_for_reads() {
        let s = splitter();
        s.replicas[0].metrics.set_observed_lag_ms(500);
        s.replicas[1].metrics.set_observed_lag_ms(50);
        let route = s.route_read_with_primary_down().unwrap();
        match route {
            Route::Replica(e) => assert_eq!(e.spec.id, "db3"),
            _ => panic!("expected promoted replica"),
        }
        assert_eq!(s.failover_count(), 1);
    }
}
