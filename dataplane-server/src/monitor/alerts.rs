//! Alert rule evaluation: threshold rules with cooldown and a
//! per-hour rate cap, one unresolved alert per rule at a time, monotone
//! resolution (a resolved alert is never re-opened; a fresh violation
//! mints a new alert id).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// Which direction of deviation counts as a violation. Cache hit rate
/// alerts below its threshold; everything else (utilization, latency,
/// error/failure rates) alerts above
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Above,
    Below,
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub metric_name: String,
    pub condition: Condition,
    pub threshold: f64,
    pub cooldown: Duration,
    pub channels: Vec<String>,
}

impl AlertRule {
    pub fn violated_by(&self, value: f64) -> bool {
        match self.condition {
            Condition::Above => value > self.threshold,
            Condition::Below => value < self.threshold,
        }
    }

    /// deviation = (value - threshold) / threshold, or its mirror for a
    /// "below" rule so a worse-than-threshold reading is always positive.
    fn deviation(&self, value: f64) -> f64 {
        if self.threshold.abs() < f64::EPSILON {
            return 0.0;
        }
        match self.condition {
            Condition::Above => (value - self.threshold) / self.threshold,
            Condition::Below => (self.threshold - value) / self.threshold,
        }
    }
}

/// Deviation -> severity bucketing against configured default thresholds:
/// the original used two buckets (warning/critical); this crate refines
/// that into the four configured severities without changing the cut
/// points the original used for its two tiers.
fn severity_from_deviation(deviation: f64) -> Severity {
    if deviation >= 1.0 {
        Severity::Emergency
    } else if deviation >= 0.5 {
        Severity::Critical
    } else if deviation >= 0.25 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub metric_name: String,
    pub severity: Severity,
    pub threshold: f64,
    pub observed_value: f64,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
}

pub enum AlertEvent {
    Fired(Alert),
    Updated(Alert),
    Resolved(Alert),
}

struct RuleState {
    open_alert: Option<Alert>,
    last_fired: Option<Instant>,
    hour_window_start: Instant,
    fired_this_hour: u32,
}

impl Default for RuleState {
    fn default() -> Self {
        Self {
            open_alert: None,
            last_fired: None,
            hour_window_start: Instant::now(),
            fired_this_hour: 0,
        }
    }
}

/// Evaluates every configured rule against the latest value of its
/// metric. One `AlertEngine` instance is shared by the monitor's
/// collection tick and the public `force_health_check`/admin surface.
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    max_alerts_per_hour: u32,
    state: DashMap<String, RuleState>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, max_alerts_per_hour: u32) -> Self {
        Self {
            rules,
            max_alerts_per_hour,
            state: DashMap::new(),
        }
    }

    /// Evaluate one freshly-observed metric value against whichever
    /// rule (if any) watches that metric name.
    pub fn evaluate(&self, metric_name: &str, value: f64) -> Option<AlertEvent> {
        let rule = self.rules.iter().find(|r| r.metric_name == metric_name)?;
        let mut entry = self.state.entry(rule.metric_name.clone()).or_default();

        if entry.hour_window_start.elapsed() >= Duration::from_secs(3600) {
            entry.hour_window_start = Instant::now();
            entry.fired_this_hour = 0;
        }

        let violated = rule.violated_by(value);

        if violated {
            if let Some(open) = &mut entry.open_alert {
                open.observed_value = value;
                return Some(AlertEvent::Updated(open.clone()));
            }

            if let Some(last) = entry.last_fired {
                if last.elapsed() < rule.cooldown {
                    return None;
                }
            }
            if entry.fired_this_hour >= self.max_alerts_per_hour {
                return None;
            }

            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                metric_name: rule.metric_name.clone(),
                severity: severity_from_deviation(rule.deviation(value)),
                threshold: rule.threshold,
                observed_value: value,
                triggered_at: Utc::now(),
                resolved_at: None,
                acknowledged: false,
            };
            entry.open_alert = Some(alert.clone());
            entry.last_fired = Some(Instant::now());
            entry.fired_this_hour += 1;
            Some(AlertEvent::Fired(alert))
        } else if let Some(mut open) = entry.open_alert.take() {
            open.resolved_at = Some(Utc::now());
            Some(AlertEvent::Resolved(open))
        } else {
            None
        }
    }

    pub fn channels_for(&self, metric_name: &str) -> Vec<String> {
        self.rules
            .iter()
            .find(|r| r.metric_name == metric_name)
            .map(|r| r.channels.clone())
            .unwrap_or_default()
    }

    pub fn open_alerts(&self) -> Vec<Alert> {
        self.state.iter().filter_map(|e| e.open_alert.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> AlertRule {
        AlertRule {
            metric_name: "cache_hit_rate".to_string(),
            condition: Condition::Below,
            threshold: 80.0,
            cooldown: Duration::from_secs(300),
            channels: vec!["log".to_string()],
        }
    }

    #[test]
    fn lifecycle_fires_updates_then_resolves() {
        let engine = AlertEngine::new(vec![rule()], 20);

        assert!(engine.evaluate("cache_hit_rate", 90.0).is_none());

        let fired = engine.evaluate("cache_hit_rate", 70.0).unwrap();
        let first_id = match fired {
            AlertEvent::Fired(a) => a.id,
            _ => panic!("expected Fired"),
        };
        assert_eq!(engine.open_alerts().len(), 1);

        let updated = engine.evaluate("cache_hit_rate", 70.0).unwrap();
        match updated {
            AlertEvent::Updated(a) => assert_eq!(a.id, first_id),
            _ => panic!("expected Updated, not a new alert"),
        }
        assert_eq!(engine.open_alerts().len(), 1);

        let resolved = engine.evaluate("cache_hit_rate", 85.0).unwrap();
        match resolved {
            AlertEvent::Resolved(a) => assert_eq!(a.id, first_id),
            _ => panic!("expected Resolved"),
        }
        assert!(engine.open_alerts().is_empty());
    }

    #[test]
    fn resolved_alert_is_never_reopened_with_the_same_id() {
        let engine = AlertEngine::new(vec![rule()], 20);
        let first = match engine.evaluate("cache_hit_rate", 70.0).unwrap() {
            AlertEvent::Fired(a) => a.id,
            _ => unreachable!(),
        };
        engine.evaluate("cache_hit_rate", 90.0);
        let second = match engine.evaluate("cache_hit_rate", 60.0).unwrap() {
            AlertEvent::Fired(a) => a.id,
            _ => panic!("expected a fresh Fired alert"),
        };
        assert_ne!(first, second);
    }

    #[test]
    fn severity_escalates_with_deviation() {
        assert_eq!(severity_from_deviation(0.1), Severity::Info);
        assert_eq!(severity_from_deviation(0.3), Severity::Warning);
        assert_eq!(severity_from_deviation(0.6), Severity::Critical);
        assert_eq!(severity_from_deviation(1.5), Severity::Emergency);
    }

    #[test]
    fn at_most_one_unresolved_alert_per_rule_at_any_time() {
        let engine = AlertEngine::new(vec![rule()], 20);
        for _ in 0..5 {
            engine.evaluate("cache_hit_rate", 10.0);
            assert!(engine.open_alerts().len() <= 1);
        }
    }
}
