//! Load Balancer: selects among a homogeneous group of endpoints
//! (replicas of one shard, or all shards for cross-shard fan-out).

pub mod affinity;
pub mod circuit_breaker;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dataplane_core::config::{BalancerStrategy, LoadBalancerConfig};
use dataplane_core::{Error, Result};
use tracing::{info, warn};

use crate::endpoint::{Endpoint, EndpointState};
use crate::hashing::fnv1a_str;
use affinity::AffinityTable;
use circuit_breaker::CircuitBreaker;

#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
    pub affinity_key: Option<String>,
}

pub struct RoutingDecision {
    pub endpoint: Arc<Endpoint>,
}

#[derive(Debug, Clone)]
pub struct BalancerStats {
    pub endpoint_id: String,
    pub weight: u64,
    pub breaker_state: circuit_breaker::BreakerState,
    pub connection_count: u64,
    pub ema_response_time_ms: f64,
    pub error_rate: f64,
}

pub struct LoadBalancer {
    strategy: BalancerStrategy,
    endpoints: Vec<Arc<Endpoint>>,
    breakers: DashMap<String, CircuitBreaker>,
    weights: DashMap<String, AtomicU64>,
    affinity: Option<AffinityTable>,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig, endpoints: Vec<Arc<Endpoint>>) -> Self {
        let breakers = DashMap::new();
        let weights = DashMap::new();
        for e in &endpoints {
            breakers.insert(
                e.spec.id.clone(),
                CircuitBreaker::new(
                    config.enable_circuit_breaker.failure_threshold,
                    config.enable_circuit_breaker.success_threshold,
                    config.enable_circuit_breaker.timeout_ms,
                ),
            );
            weights.insert(e.spec.id.clone(), AtomicU64::new(e.spec.weight as u64));
        }

        let affinity = config
            .enable_session_affinity
            .then(|| AffinityTable::new(Duration::from_millis(config.affinity_window_ms)));

        Self {
            strategy: config.strategy,
            endpoints,
            breakers,
            weights,
            affinity,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    fn is_eligible(&self, e: &Arc<Endpoint>) -> bool {
        matches!(e.state(), EndpointState::Healthy | EndpointState::Degraded)
            && self.breakers.get(&e.spec.id).map(|b| b.allows_selection()).unwrap_or(true)
    }

    fn eligible(&self) -> Vec<&Arc<Endpoint>> {
        self.endpoints.iter().filter(|e| self.is_eligible(e)).collect()
    }

    pub fn select(&self, request: SelectRequest) -> Result<RoutingDecision> {
        if let (Some(affinity), Some(key)) = (&self.affinity, &request.affinity_key) {
            if let Some(bound_id) = affinity.get(key) {
                if let Some(endpoint) = self.endpoints.iter().find(|e| e.spec.id == bound_id) {
                    if self.is_eligible(endpoint) {
                        return Ok(RoutingDecision { endpoint: endpoint.clone() });
                    }
                }
                affinity.clear(key);
            }
        }

        let candidates = self.eligible();
        if candidates.is_empty() {
            return Err(Error::EndpointUnavailable {
                role: "balancer".to_string(),
                reason: "no endpoint is healthy/degraded with a closed circuit breaker".to_string(),
            });
        }

        let chosen = match self.strategy {
            BalancerStrategy::RoundRobin => self.select_round_robin(&candidates),
            BalancerStrategy::WeightedRoundRobin => self.select_weighted(&candidates),
            BalancerStrategy::LeastConnections => self.select_least_connections(&candidates),
            BalancerStrategy::LeastResponseTime => self.select_least_response_time(&candidates),
            BalancerStrategy::ConsistentHashing => {
                self.select_consistent_hash(&candidates, request.affinity_key.as_deref())
            }
            BalancerStrategy::Adaptive => self.select_adaptive(&candidates),
        }
        .clone();

        if let (Some(affinity), Some(key)) = (&self.affinity, &request.affinity_key) {
            affinity.bind(key, &chosen.spec.id);
        }

        Ok(RoutingDecision { endpoint: chosen })
    }

    fn select_round_robin<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[idx]
    }

    fn select_weighted<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        let total: u64 = candidates
            .iter()
            .map(|e| self.weights.get(&e.spec.id).map(|w| w.load(Ordering::Relaxed)).unwrap_or(1).max(1))
            .sum();
        if total == 0 {
            return self.select_round_robin(candidates);
        }
        let target = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as u64 % total;
        let mut cumulative = 0u64;
        for e in candidates {
            let w = self.weights.get(&e.spec.id).map(|w| w.load(Ordering::Relaxed)).unwrap_or(1).max(1);
            cumulative += w;
            if target < cumulative {
                return e;
            }
        }
        candidates[candidates.len() - 1]
    }

    fn select_least_connections<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        candidates
            .iter()
            .min_by_key(|e| e.metrics.connection_count.load(Ordering::Relaxed))
            .copied()
            .unwrap()
    }

    fn select_least_response_time<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.metrics
                    .ema_response_time_ms()
                    .partial_cmp(&b.metrics.ema_response_time_ms())
                    .unwrap()
            })
            .copied()
            .unwrap()
    }

    fn select_consistent_hash<'a>(&self, candidates: &[&'a Arc<Endpoint>], key: Option<&str>) -> &'a Arc<Endpoint> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        let hash_key = key.unwrap_or("__no_affinity_key__");
        let idx = (fnv1a_str(hash_key) as usize) % sorted.len();
        sorted[idx]
    }

    fn select_adaptive<'a>(&self, candidates: &[&'a Arc<Endpoint>]) -> &'a Arc<Endpoint> {
        candidates
            .iter()
            .max_by(|a, b| self.adaptive_score(a).partial_cmp(&self.adaptive_score(b)).unwrap())
            .copied()
            .unwrap()
    }

    fn adaptive_score(&self, e: &Arc<Endpoint>) -> f64 {
        let health_factor = match e.state() {
            EndpointState::Healthy => 1.0,
            EndpointState::Degraded => 0.5,
            _ => 0.0,
        };
        let error_factor = (1.0 - e.metrics.error_rate()).max(0.0);
        let speed_factor = 1.0 / (1.0 + e.metrics.ema_response_time_ms() / 100.0);
        let load_factor = 1.0 / (1.0 + e.metrics.connection_count.load(Ordering::Relaxed) as f64);
        let weight = self.weights.get(&e.spec.id).map(|w| w.load(Ordering::Relaxed)).unwrap_or(100) as f64;
        let weight_factor = weight / 100.0;

        0.3 * health_factor * error_factor + 0.3 * speed_factor + 0.2 * load_factor + 0.2 * weight_factor
    }

    /// Every completed request reports its outcome: updates EMA latency,
    /// success/error counters, and drives the breaker state machine
    pub fn record_result(&self, endpoint_id: &str, latency_ms: f64, success: bool) {
        let Some(endpoint) = self.endpoints.iter().find(|e| e.spec.id == endpoint_id) else {
            warn!(endpoint_id, "record_result for unknown endpoint");
            return;
        };

        if success {
            endpoint.metrics.record_success(latency_ms);
        } else {
            endpoint.metrics.record_failure();
        }

        if let Some(breaker) = self.breakers.get(endpoint_id) {
            if success {
                breaker.record_success();
            } else {
                let failed_health = endpoint.state() == EndpointState::Failed || endpoint.metrics.error_rate() > 0.5;
                breaker.record_failure(failed_health);
            }
        }
    }

    /// Slow-tick weight adaptation: healthier, faster,
    /// less-loaded endpoints gain weight; failed endpoints drop to zero.
    pub fn rebalance_weights(&self) {
        for e in &self.endpoints {
            let new_weight = if !e.is_usable_for_reads() {
                0
            } else {
                (self.adaptive_score(e) * 100.0).round().clamp(1.0, 1000.0) as u64
            };
            if let Some(w) = self.weights.get(&e.spec.id) {
                w.store(new_weight, Ordering::Relaxed);
            }
            info!(endpoint = %e.spec.id, weight = new_weight, "rebalanced endpoint weight");
        }
    }

    pub fn clear_affinity(&self, key: &str) {
        if let Some(affinity) = &self.affinity {
            affinity.clear(key);
        }
    }

    /// Whether `endpoint_id`'s breaker currently excludes it from
    /// selection. Lets the composition root double-check a candidate
    /// the splitter already picked before leasing a connection from it
    ///
    pub fn is_breaker_open(&self, endpoint_id: &str) -> bool {
        self.breakers.get(endpoint_id).map(|b| !b.allows_selection()).unwrap_or(false)
    }

    pub fn statistics(&self) -> Vec<BalancerStats> {
        self.endpoints
            .iter()
            .map(|e| BalancerStats {
                endpoint_id: e.spec.id.clone(),
                weight: self.weights.get(&e.spec.id).map(|w| w.load(Ordering::Relaxed)).unwrap_or(0),
                breaker_state: self
                    .breakers
                    .get(&e.spec.id)
                    .map(|b| b.state())
                    .unwrap_or(circuit_breaker::BreakerState::Closed),
                connection_count: e.metrics.connection_count.load(Ordering::Relaxed),
                ema_response_time_ms: e.metrics.ema_response_time_ms(),
                error_rate: e.metrics.error_rate(),
            })
            .collect()
    }
}
