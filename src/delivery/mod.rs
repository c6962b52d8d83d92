//! Notification delivery (Discord bot, Discord webhooks, dry-run logging).
//!
//! Sinks are pluggable behind [`DeliverySink`]. [`RoutingSink`] picks the
//! transport from the message's [`Destination`].

pub mod discord;
pub mod log;
pub mod traits;

pub use discord::{DiscordBotSink, DiscordWebhookSink};
pub use log::LogSink;
pub use traits::{DeliverySink, OutboundAlert};

use crate::error::{Result, WatchError};
use crate::model::Destination;
use async_trait::async_trait;
use std::sync::Arc;

/// Dispatches each message to the sink that handles its destination.
pub struct RoutingSink {
    channels: Option<Arc<dyn DeliverySink>>,
    webhooks: Arc<dyn DeliverySink>,
}

impl RoutingSink {
    /// `channels` is `None` when no bot token is configured.
    pub fn new(channels: Option<Arc<dyn DeliverySink>>, webhooks: Arc<dyn DeliverySink>) -> Self {
        Self { channels, webhooks }
    }
}

#[async_trait]
impl DeliverySink for RoutingSink {
    fn id(&self) -> &'static str {
        "routing"
    }

    async fn deliver(&self, message: &OutboundAlert) -> Result<()> {
        match &message.destination {
            Destination::Webhook { .. } => self.webhooks.deliver(message).await,
            Destination::Channel { channel_id } => match &self.channels {
                Some(sink) => sink.deliver(message).await,
                None => Err(WatchError::DeliveryFailed(format!(
                    "channel {channel_id} needs a bot token but none is configured"
                ))),
            },
        }
    }
}
