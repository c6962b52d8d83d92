//! Notifier: turns fired timers and status transitions into delivered
//! messages.
//!
//! A fired hospital alert is re-checked against the live cache before it is
//! composed. If the member no longer shows the hospital stay the alert was
//! timed against, the send is suppressed. Delivery failures are logged and
//! never retried; the timer entry is already gone by the time the notifier
//! runs.

use crate::cache::StateCache;
use crate::config::WatchConfig;
use crate::delivery::{DeliverySink, OutboundAlert};
use crate::diff::Transition;
use crate::error::{Result, WatchError};
use crate::model::{Destination, EntityId, GroupId, GroupKind, PendingAlert};
use crate::timers::TimerRegistry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{error, info};

/// Torn attack page for a player.
const ATTACK_URL: &str = "https://www.torn.com/loader2.php?sid=getInAttack&user2ID=";

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Delivered,
    /// Dropped because the alert no longer described reality, or the
    /// watcher is shutting down.
    Suppressed,
    Failed,
}

/// Message presentation settings.
#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub hospital_username: String,
    pub idle_username: String,
    pub mention_role_id: Option<String>,
    pub hospital_fallback: Option<Destination>,
    pub idle_fallback: Option<Destination>,
    pub delivery_timeout: Duration,
}

impl NotifierSettings {
    #[must_use]
    pub fn from_config(config: &WatchConfig) -> Self {
        let delivery = &config.delivery;
        Self {
            hospital_username: delivery.username(GroupKind::Hospital).to_owned(),
            idle_username: delivery.username(GroupKind::IdleWatch).to_owned(),
            mention_role_id: delivery
                .mention_role_id
                .clone()
                .filter(|r| !r.trim().is_empty()),
            hospital_fallback: delivery.fallback_destination(GroupKind::Hospital),
            idle_fallback: delivery.fallback_destination(GroupKind::IdleWatch),
            delivery_timeout: Duration::from_secs(delivery.timeout_secs),
        }
    }
}

/// Composes and delivers notifications for every group.
pub struct Notifier {
    sink: Arc<dyn DeliverySink>,
    cache: StateCache,
    timers: TimerRegistry,
    settings: NotifierSettings,
    destinations: RwLock<HashMap<GroupId, Destination>>,
}

impl Notifier {
    pub fn new(
        sink: Arc<dyn DeliverySink>,
        cache: StateCache,
        timers: TimerRegistry,
        settings: NotifierSettings,
    ) -> Self {
        Self {
            sink,
            cache,
            timers,
            settings,
            destinations: RwLock::new(HashMap::new()),
        }
    }

    /// Record (or clear, with `None`) a group's own destination.
    pub fn set_destination(&self, group: GroupId, destination: Option<Destination>) {
        let mut map = self
            .destinations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match destination {
            Some(dest) => {
                map.insert(group, dest);
            }
            None => {
                map.remove(&group);
            }
        }
    }

    /// Where `group`'s notifications go: its own destination, else the
    /// configured fallback for its kind.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::NoDestination`] when neither is set.
    pub fn resolve_destination(&self, group: GroupId) -> Result<Destination> {
        let own = self
            .destinations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group)
            .cloned();
        own.or_else(|| match group.kind() {
            GroupKind::Hospital => self.settings.hospital_fallback.clone(),
            GroupKind::IdleWatch => self.settings.idle_fallback.clone(),
        })
        .ok_or(WatchError::NoDestination(group))
    }

    /// Handle a fired hospital timer.
    pub async fn on_alert_fired(&self, alert: PendingAlert) -> AlertOutcome {
        if self.timers.is_shut_down() {
            return AlertOutcome::Suppressed;
        }

        let still_current = self
            .cache
            .descriptor(alert.group, alert.entity)
            .is_some_and(|d| d.is_alertable() && d.target_time == Some(alert.target_time));
        if !still_current {
            info!(
                group = %alert.group,
                entity = %alert.entity,
                "suppressing alert: member no longer matches the scheduled release"
            );
            return AlertOutcome::Suppressed;
        }

        let lead_secs = (alert.target_time - alert.alert_at).num_seconds().max(0);
        let content = hospital_message(
            self.settings.mention_role_id.as_deref(),
            &alert.label,
            alert.entity,
            lead_secs,
        );
        self.send(alert.group, alert.entity, content).await
    }

    /// Handle an immediate status transition.
    pub async fn on_transition(&self, group: GroupId, transition: &Transition) -> AlertOutcome {
        if self.timers.is_shut_down() {
            return AlertOutcome::Suppressed;
        }
        let content = status_change_message(
            &transition.label,
            transition.entity,
            &transition.from,
            &transition.to,
        );
        self.send(group, transition.entity, content).await
    }

    async fn send(&self, group: GroupId, entity: EntityId, content: String) -> AlertOutcome {
        match self.deliver(group, content).await {
            Ok(()) => {
                info!(group = %group, entity = %entity, sink = self.sink.id(), "notification delivered");
                AlertOutcome::Delivered
            }
            Err(e) => {
                error!(group = %group, entity = %entity, error = %e, "notification not delivered");
                AlertOutcome::Failed
            }
        }
    }

    async fn deliver(&self, group: GroupId, content: String) -> Result<()> {
        let destination = self.resolve_destination(group)?;
        let username = match group.kind() {
            GroupKind::Hospital => &self.settings.hospital_username,
            GroupKind::IdleWatch => &self.settings.idle_username,
        };
        let message = OutboundAlert {
            destination,
            username: Some(username.clone()),
            content,
        };
        tokio::time::timeout(self.settings.delivery_timeout, self.sink.deliver(&message))
            .await
            .map_err(|_| {
                WatchError::DeliveryFailed(format!(
                    "{} timed out after {}s",
                    message.destination,
                    self.settings.delivery_timeout.as_secs()
                ))
            })?
    }
}

/// Hospital release alert text.
#[must_use]
pub fn hospital_message(
    mention_role_id: Option<&str>,
    name: &str,
    entity: EntityId,
    lead_secs: i64,
) -> String {
    let mention = mention_role_id
        .map(|role| format!("<@&{role}> "))
        .unwrap_or_default();
    format!("{mention}**{name}** exits hospital in {lead_secs}s! {ATTACK_URL}{entity}")
}

/// Idle-watch status change text.
#[must_use]
pub fn status_change_message(name: &str, entity: EntityId, from: &str, to: &str) -> String {
    format!("**{name}** (ID:{entity}) status changed: **{from}** → **{to}**")
}
