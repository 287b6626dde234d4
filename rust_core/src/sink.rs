//! Outgoing message seam.
//!
//! Delivery failures are logged by the caller and never retried.

use async_trait::async_trait;
use tracing::info;

use crate::models::DeliveryTarget;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, message: &str) -> anyhow::Result<()>;
}

/// Writes every message to the log instead of sending it. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, target: &DeliveryTarget, message: &str) -> anyhow::Result<()> {
        info!(recipient = %target, "[dry-run] {}", message.replace('\n', " | "));
        Ok(())
    }
}
