//! Notification sinks for alert events.
//!
//! The alert engine's dispatcher owns queueing, grouping, and retry; a
//! [`Notifier`] performs exactly one delivery attempt per call and reports
//! failure through its `Result`.

pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use pulse_common::types::{AlertEvent, AlertEventKind};

/// An alert event sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs, e.g. `"webhook"`.
    fn name(&self) -> &str;

    /// Deliver one event. One attempt only; the caller retries.
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}

/// Default sink when nothing else is configured: alert traffic lands in
/// the process log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        match event.kind {
            AlertEventKind::Fired => tracing::warn!(
                alert_id = %event.alert.id,
                resource = %event.alert.resource_id,
                metric = %event.alert.metric,
                level = %event.alert.level,
                value = event.alert.value,
                count = event.count,
                "{}",
                event.alert.message
            ),
            AlertEventKind::Resolved => tracing::info!(
                alert_id = %event.alert.id,
                resource = %event.alert.resource_id,
                metric = %event.alert.metric,
                "alert resolved"
            ),
        }
        Ok(())
    }
}
