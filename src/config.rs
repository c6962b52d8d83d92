//! Configuration types for the notifier.

use crate::diff::AlertPolicy;
use crate::error::{Result, WatchError};
use crate::model::{Destination, GroupKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Torn API access.
    pub torn: TornConfig,
    /// Faction hospital alerts.
    pub hospital: HospitalConfig,
    /// Idle-watch status alerts.
    pub idle_watch: IdleWatchConfig,
    /// Notification delivery.
    pub delivery: DeliveryConfig,
    /// Persistence paths.
    pub storage: StorageConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Torn API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TornConfig {
    /// API key (env `TORN_API_KEY` overrides).
    pub api_key: String,
    /// API root URL.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for TornConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: crate::source::torn::TORN_API_BASE.to_owned(),
            request_timeout_secs: 10,
        }
    }
}

/// Hospital-release alert settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HospitalConfig {
    pub enabled: bool,
    /// Seconds between polls of each watched faction.
    pub poll_interval_secs: u64,
    /// Seconds before release at which the alert fires.
    pub lead_window_secs: u64,
}

impl Default for HospitalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 300,
            lead_window_secs: 30,
        }
    }
}

/// Idle-watch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleWatchConfig {
    pub enabled: bool,
    /// Seconds between polls of the idle-watch group.
    pub poll_interval_secs: u64,
    /// Delay before the first idle-watch poll after startup.
    pub initial_delay_secs: u64,
}

impl Default for IdleWatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            initial_delay_secs: 10,
        }
    }
}

/// Delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Discord bot token for channel destinations (env `DISCORD_BOT_TOKEN`).
    pub bot_token: Option<String>,
    /// Fallback webhook for faction groups without their own destination.
    pub hospital_webhook_url: Option<String>,
    /// Fallback webhook for the idle-watch group.
    pub idle_webhook_url: Option<String>,
    /// Webhook display name for hospital alerts.
    pub hospital_username: String,
    /// Webhook display name for idle-watch alerts.
    pub idle_username: String,
    /// Role mentioned at the start of hospital alerts.
    pub mention_role_id: Option<String>,
    /// Per-delivery timeout in seconds.
    pub timeout_secs: u64,
    /// Log notifications instead of sending them.
    pub dry_run: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            hospital_webhook_url: None,
            idle_webhook_url: None,
            hospital_username: "Hospital Alert Bot".to_owned(),
            idle_username: "IdleOp Alert".to_owned(),
            mention_role_id: None,
            timeout_secs: 10,
            dry_run: false,
        }
    }
}

impl DeliveryConfig {
    /// Default destination for groups of `kind` that carry none.
    #[must_use]
    pub fn fallback_destination(&self, kind: GroupKind) -> Option<Destination> {
        let url = match kind {
            GroupKind::Hospital => self.hospital_webhook_url.as_ref(),
            GroupKind::IdleWatch => self.idle_webhook_url.as_ref(),
        };
        url.filter(|u| !u.trim().is_empty())
            .map(|url| Destination::Webhook { url: url.clone() })
    }

    /// Webhook display name for alerts of `kind`.
    #[must_use]
    pub fn username(&self, kind: GroupKind) -> &str {
        match kind {
            GroupKind::Hospital => &self.hospital_username,
            GroupKind::IdleWatch => &self.idle_username,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Watch list file. `None` uses [`crate::watch_dirs::watch_list_file`].
    pub watch_list_path: Option<PathBuf>,
}

impl StorageConfig {
    #[must_use]
    pub fn watch_list_path(&self) -> PathBuf {
        self.watch_list_path
            .clone()
            .unwrap_or_else(crate::watch_dirs::watch_list_file)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write daily rolling log files under [`crate::watch_dirs::logs_dir`].
    pub file: bool,
}

impl WatchConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            WatchError::Config(format!("failed to parse '{}': {e}", path.display()))
        })
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| WatchError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::watch_dirs::config_file()
    }

    /// Apply secrets and legacy settings from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Recognized keys: `TORN_API_KEY`, `DISCORD_BOT_TOKEN`,
    /// `HOSPITAL_WEBHOOK_URL`, `SILENT_WEBHOOK_URL`, `FACTION_ROLE_ID`,
    /// `HOSPITAL_INTERVAL` (seconds).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("TORN_API_KEY") {
            self.torn.api_key = key;
        }
        if let Some(token) = non_empty("DISCORD_BOT_TOKEN") {
            self.delivery.bot_token = Some(token);
        }
        if let Some(url) = non_empty("HOSPITAL_WEBHOOK_URL") {
            self.delivery.hospital_webhook_url = Some(url);
        }
        if let Some(url) = non_empty("SILENT_WEBHOOK_URL") {
            self.delivery.idle_webhook_url = Some(url);
        }
        if let Some(role) = non_empty("FACTION_ROLE_ID") {
            self.delivery.mention_role_id = Some(role);
        }
        if let Some(secs) = non_empty("HOSPITAL_INTERVAL").and_then(|v| v.trim().parse().ok()) {
            self.hospital.poll_interval_secs = secs;
        }
    }

    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.torn.api_key.trim().is_empty() {
            return Err(WatchError::Config(
                "torn.api_key must be set (or TORN_API_KEY)".into(),
            ));
        }
        if self.torn.request_timeout_secs == 0 {
            return Err(WatchError::Config(
                "torn.request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.hospital.poll_interval_secs == 0 {
            return Err(WatchError::Config(
                "hospital.poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.idle_watch.poll_interval_secs == 0 {
            return Err(WatchError::Config(
                "idle_watch.poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.delivery.timeout_secs == 0 {
            return Err(WatchError::Config(
                "delivery.timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Alerting policy for faction hospital groups.
    #[must_use]
    pub fn hospital_policy(&self) -> AlertPolicy {
        AlertPolicy::scheduled(Duration::from_secs(self.hospital.lead_window_secs))
    }

    /// Alerting policy for the idle-watch group.
    #[must_use]
    pub fn idle_policy(&self) -> AlertPolicy {
        AlertPolicy::on_change()
    }

    /// Poll interval for groups of `kind`.
    #[must_use]
    pub fn poll_interval(&self, kind: GroupKind) -> Duration {
        match kind {
            GroupKind::Hospital => Duration::from_secs(self.hospital.poll_interval_secs),
            GroupKind::IdleWatch => Duration::from_secs(self.idle_watch.poll_interval_secs),
        }
    }

    /// Returns `false` when polling for groups of `kind` is switched off.
    #[must_use]
    pub fn is_enabled(&self, kind: GroupKind) -> bool {
        match kind {
            GroupKind::Hospital => self.hospital.enabled,
            GroupKind::IdleWatch => self.idle_watch.enabled,
        }
    }
}
