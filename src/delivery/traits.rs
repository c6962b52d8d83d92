use crate::error::Result;
use crate::model::Destination;
use async_trait::async_trait;

/// A composed notification ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAlert {
    pub destination: Destination,
    /// Display name override (webhooks only).
    pub username: Option<String>,
    pub content: String,
}

/// Delivery sink contract. New transports only need to implement this trait.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Stable sink identifier (e.g. `discord-webhook`, `log`).
    fn id(&self) -> &'static str;

    /// Send one notification.
    ///
    /// Fails with [`WatchError::DeliveryFailed`](crate::WatchError::DeliveryFailed).
    async fn deliver(&self, message: &OutboundAlert) -> Result<()>;
}
