use async_trait::async_trait;

use crate::domain::rpc::protocol::{AlertLevel, AlertMessage};

/// Delivery target of the alert server.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &AlertMessage) -> Result<(), String>;
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &AlertMessage) -> Result<(), String> {
        let workflow = alert.workflow_instance_id.as_ref().map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
        match alert.level {
            AlertLevel::Info => log::info!("[ALERT] {} (workflow {}): {}", alert.title, workflow, alert.content),
            AlertLevel::Warning => log::warn!("[ALERT] {} (workflow {}): {}", alert.title, workflow, alert.content),
            AlertLevel::Critical => log::error!("[ALERT] {} (workflow {}): {}", alert.title, workflow, alert.content),
        }
        Ok(())
    }
}
