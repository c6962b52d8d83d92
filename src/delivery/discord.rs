use crate::delivery::traits::{DeliverySink, OutboundAlert};
use crate::error::{Result, WatchError};
use crate::model::Destination;
use async_trait::async_trait;
use serde_json::json;

/// Default Discord REST API root.
pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Sends notifications to Discord channels through the bot REST API.
pub struct DiscordBotSink {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl DiscordBotSink {
    pub fn new(bot_token: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: DISCORD_API_BASE.to_owned(),
            client,
        }
    }

    /// Point the sink at a different API root (used by tests).
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self
    }
}

#[async_trait]
impl DeliverySink for DiscordBotSink {
    fn id(&self) -> &'static str {
        "discord-bot"
    }

    async fn deliver(&self, message: &OutboundAlert) -> Result<()> {
        let Destination::Channel { channel_id } = &message.destination else {
            return Err(WatchError::DeliveryFailed(
                "discord bot sink can only deliver to channels".to_owned(),
            ));
        };
        if self.bot_token.trim().is_empty() {
            return Err(WatchError::DeliveryFailed(
                "discord bot token is empty".to_owned(),
            ));
        }

        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&json!({ "content": message.content }))
            .send()
            .await
            .map_err(|e| WatchError::DeliveryFailed(format!("discord send failed: {e}")))?;

        check_status(response).await
    }
}

/// Sends notifications to Discord webhook URLs.
pub struct DiscordWebhookSink {
    client: reqwest::Client,
}

impl DiscordWebhookSink {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliverySink for DiscordWebhookSink {
    fn id(&self) -> &'static str {
        "discord-webhook"
    }

    async fn deliver(&self, message: &OutboundAlert) -> Result<()> {
        let Destination::Webhook { url } = &message.destination else {
            return Err(WatchError::DeliveryFailed(
                "webhook sink can only deliver to webhook URLs".to_owned(),
            ));
        };

        let mut body = json!({ "content": message.content });
        if let Some(username) = &message.username {
            body["username"] = json!(username);
        }

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            // reqwest errors include the URL, which carries the webhook token.
            .map_err(|e| {
                WatchError::DeliveryFailed(format!("webhook send failed: {}", e.without_url()))
            })?;

        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(WatchError::DeliveryFailed(format!(
        "discord responded {status}: {body}"
    )))
}
