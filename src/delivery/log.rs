use crate::delivery::traits::{DeliverySink, OutboundAlert};
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Dry-run sink: logs every notification instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    fn id(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, message: &OutboundAlert) -> Result<()> {
        info!(
            destination = %message.destination,
            username = message.username.as_deref().unwrap_or("-"),
            "[dry-run] {}",
            message.content
        );
        Ok(())
    }
}
