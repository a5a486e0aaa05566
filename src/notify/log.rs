use async_trait::async_trait;
use tracing::{info, warn};

use super::NotificationProvider;
use crate::{
    alerts::{Alert, AlertLevel},
    error::NotificationError,
};

/// Writes alerts to the tracing output, handy when no external channel is set up
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProvider;

#[async_trait]
impl NotificationProvider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<bool, NotificationError> {
        match alert.level {
            AlertLevel::Critical | AlertLevel::Warning => warn!(
                nodes = %alert.node_list(),
                "{} alert: {}",
                alert.level,
                alert.summary()
            ),
            AlertLevel::Info => info!(
                nodes = %alert.node_list(),
                "{} alert: {}",
                alert.level,
                alert.summary()
            ),
        }
        Ok(true)
    }
}
