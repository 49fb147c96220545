//! Best-effort alert delivery.
//!
//! Notification never affects persistence: the stored alert is the source
//! of truth and a failed delivery is logged by the caller, not retried.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use crate::detect::{AlertRecord, Severity};
use crate::error::{Error, Result};

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &AlertRecord) -> Result<()>;
}

/// Posts a title/body text block to an incoming-message webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::High => ":red_circle:",
        Severity::Medium => ":large_orange_circle:",
        Severity::Low => ":large_yellow_circle:",
    }
}

/// Message body for one alert.
pub fn webhook_payload(alert: &AlertRecord) -> Value {
    let headline = format!(
        "{} *{}* ({} severity)",
        severity_marker(alert.severity),
        alert.title,
        alert.severity
    );
    json!({
        "text": format!("{headline}\n{}", alert.message),
        "blocks": [
            { "type": "section", "text": { "type": "mrkdwn", "text": headline } },
            { "type": "section", "text": { "type": "mrkdwn", "text": alert.message } },
            { "type": "context", "elements": [
                { "type": "mrkdwn", "text": format!("alert `{}` at {}", alert.id, alert.timestamp.to_rfc3339()) }
            ]}
        ]
    })
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &AlertRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&webhook_payload(alert))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::TransientIo(format!("webhook returned {status}")));
        }
        info!(alert_id = %alert.id, "alert delivered to webhook");
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &AlertRecord) -> Result<()> {
        info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            title = %alert.title,
            "alert raised (no webhook configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AlertType;
    use chrono::Utc;

    fn sample() -> AlertRecord {
        let now = Utc::now();
        AlertRecord {
            id: "spike_desktop-us_20250301_233".into(),
            alert_type: AlertType::Spike,
            title: "Traffic spike: Desktop / US".into(),
            message: "500 events vs forecast 150".into(),
            timestamp: now,
            severity: Severity::High,
            data: json!({}),
            acknowledged: false,
            acknowledged_at: None,
            created_at: now,
        }
    }

    #[test]
    fn test_payload_contains_title_and_body() {
        let payload = webhook_payload(&sample());
        let text = payload["text"].as_str().unwrap();
        assert!(text.contains("Traffic spike: Desktop / US"));
        assert!(text.contains("500 events vs forecast 150"));
        assert!(text.contains("high severity"));
        assert_eq!(payload["blocks"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_reports_failure() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(500)).unwrap();
        let err = notifier.notify(&sample()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
