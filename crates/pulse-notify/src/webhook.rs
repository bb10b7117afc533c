//! Plain-JSON webhook sink. No body templating; the event is posted as-is.

use crate::Notifier;
use anyhow::Result;
use async_trait::async_trait;
use pulse_common::types::{AlertEvent, AlertEventKind};
use std::time::Duration;

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn body(event: &AlertEvent) -> serde_json::Value {
        serde_json::json!({
            "id": event.alert.id,
            "kind": match event.kind {
                AlertEventKind::Fired => "fired",
                AlertEventKind::Resolved => "resolved",
            },
            "resource": event.alert.resource_id,
            "resourceName": event.alert.resource_name,
            "metric": event.alert.metric,
            "level": event.alert.level,
            "value": event.alert.value,
            "threshold": event.alert.threshold,
            "message": event.alert.message,
            "count": event.count,
            "timestamp": event.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::body(event))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned HTTP {status}: {body}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_common::types::{Alert, AlertLevel};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> AlertEvent {
        AlertEvent {
            kind: AlertEventKind::Fired,
            alert: Alert {
                id: "abc123".into(),
                resource_id: "guest/pve1/qemu/100".into(),
                resource_name: "web".into(),
                metric: "memory".into(),
                threshold: 90.0,
                value: 93.5,
                level: AlertLevel::Warning,
                first_seen: Utc::now(),
                last_seen: Utc::now(),
                acknowledged: false,
                suppressed: false,
                message: "web memory at 93.5% (threshold 90%)".into(),
            },
            count: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn posts_event_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "kind": "fired",
                "resource": "guest/pve1/qemu/100",
                "level": "warning"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri()));
        notifier.notify(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri()));
        assert!(notifier.notify(&event()).await.is_err());
    }
}
