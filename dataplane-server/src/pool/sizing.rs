//! Sizing strategies for the maintenance tick

use dataplane_core::config::PoolStrategy;

/// A bounded ring of recent samples, used for both wait-time and
/// response-time rolling means (~100 samples).
#[derive(Debug, Default)]
pub struct RollingSamples {
    samples: std::collections::VecDeque<f64>,
    capacity: usize,
}

impl RollingSamples {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    pub fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// Decision produced by a sizing strategy for one maintenance tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeDecision {
    GrowBy(usize),
    ShrinkIdleBy(usize),
    NoChange,
}

pub struct SizingContext {
    pub active: usize,
    pub total: usize,
    pub idle: usize,
    pub min: usize,
    pub max: usize,
    pub wait_time_mean_ms: f64,
    pub response_time_mean_ms: f64,
}

pub fn decide(strategy: PoolStrategy, ctx: &SizingContext) -> SizeDecision {
    match strategy {
        PoolStrategy::Fixed => SizeDecision::NoChange,
        PoolStrategy::Dynamic => decide_dynamic(ctx),
        PoolStrategy::Adaptive => decide_adaptive(ctx),
    }
}

fn decide_dynamic(ctx: &SizingContext) -> SizeDecision {
    let utilization = if ctx.total == 0 {
        0.0
    } else {
        ctx.active as f64 / ctx.total as f64
    };
    if utilization > 0.8 && ctx.total < ctx.max {
        SizeDecision::GrowBy(5.min(ctx.max - ctx.total))
    } else if utilization < 0.3 && ctx.total > ctx.min {
        SizeDecision::ShrinkIdleBy(ctx.idle / 2)
    } else {
        SizeDecision::NoChange
    }
}

/// More aggressive on wait time than on response time: a long
/// queue for a connection is a harder signal of undersizing than a
/// merely-slow-but-served query.
fn decide_adaptive(ctx: &SizingContext) -> SizeDecision {
    const HIGH_WAIT_MS: f64 = 50.0;
    const SLOW_RESPONSE_MS: f64 = 200.0;

    let sustained_high_wait = ctx.wait_time_mean_ms > HIGH_WAIT_MS;
    let slow_responses = ctx.response_time_mean_ms > SLOW_RESPONSE_MS;

    if ctx.total < ctx.max && (sustained_high_wait || slow_responses) {
        let grow = if sustained_high_wait { 5 } else { 2 };
        SizeDecision::GrowBy(grow.min(ctx.max - ctx.total))
    } else if ctx.total > ctx.min
        && ctx.wait_time_mean_ms < HIGH_WAIT_MS / 2.0
        && ctx.response_time_mean_ms < SLOW_RESPONSE_MS / 2.0
        && ctx.idle > 2
    {
        SizeDecision::ShrinkIdleBy(1)
    } else {
        SizeDecision::NoChange
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(active: usize, total: usize, idle: usize) -> SizingContext {
        SizingContext {
            active,
            total,
            idle,
            min: 2,
            max: 20,
            wait_time_mean_ms: 0.0,
            response_time_mean_ms: 0.0,
        }
    }

    #[test]
    fn dynamic_grows_above_80_percent_utilization() {
        let decision = decide_dynamic(&ctx(9, 10, 1));
        assert_eq!(decision, SizeDecision::GrowBy(5));
    }

    #[test]
    fn dynamic_shrinks_below_30_percent_utilization() {
        let decision = decide_dynamic(&ctx(2, 10, 8));
        assert_eq!(decision, SizeDecision::ShrinkIdleBy(4));
    }

    #[test]
    fn dynamic_never_grows_past_max() {
        let mut c = ctx(17, 18, 1);
        c.max = 20;
        assert_eq!(decide_dynamic(&c), SizeDecision::GrowBy(2));
    }

    #[test]
    fn adaptive_prefers_wait_time_signal_over_response_time() {
        let mut c = ctx(5, 10, 5);
        c.wait_time_mean_ms = 100.0;
        assert_eq!(decide_adaptive(&c), SizeDecision::GrowBy(5));

        let mut c2 = ctx(5, 10, 5);
        c2.response_time_mean_ms = 300.0;
        assert_eq!(decide_adaptive(&c2), SizeDecision::GrowBy(2));
    }

    #[test]
    fn adaptive_shrinks_only_when_both_signals_low_and_idle_over_two() {
        let c = ctx(1, 10, 3);
        assert_eq!(decide_adaptive(&c), SizeDecision::ShrinkIdleBy(1));
        let c2 = ctx(1, 10, 1);
        assert_eq!(decide_adaptive(&c2), SizeDecision::NoChange);
    }

    #[test]
    fn rolling_samples_drops_oldest_past_capacity() {
        let mut r = RollingSamples::new(3);
        r.push(1.0);
        r.push(2.0);
        r.push(3.0);
        r.push(4.0);
        assert_eq!(r.mean(), 3.0);
    }
}
