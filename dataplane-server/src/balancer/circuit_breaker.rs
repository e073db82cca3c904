//! Per-endpoint circuit breaker: CLOSED -> OPEN -> HALF_OPEN -> CLOSED.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: parking_lot::Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout: Duration::from_millis(timeout_ms),
            inner: parking_lot::Mutex::new(Inner {
                state: BreakerState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// OPEN -> HALF_OPEN once the timeout elapses; read lazily so the
    /// breaker doesn't need its own background ticker.
    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                }
            }
        }
    }

    /// Selection only considers a non-OPEN breaker
    pub fn allows_selection(&self) -> bool {
        self.state() != BreakerState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                }
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, endpoint_failed_health: bool) {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        match inner.state {
            BreakerState::Closed => {
                if endpoint_failed_health && inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_failure_threshold_with_failed_health() {
        let cb = CircuitBreaker::new(3, 2, 60_000);
        for _ in 0..3 {
            cb.record_failure(true);
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allows_selection());
    }

    #[test]
    fn does_not_open_without_failed_health() {
        let cb = CircuitBreaker::new(3, 2, 60_000);
        for _ in 0..10 {
            cb.record_failure(false);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new(1, 2, 1);
        cb.record_failure(true);
        assert_eq!(cb.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_reopens_on_any_failure() {
        let cb = CircuitBreaker::new(1, 2, 1);
        cb.record_failure(true);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_failure(true);
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
