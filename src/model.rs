//! Core data model: entities, groups, state descriptors, and pending alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Torn state string that marks a hospitalized member.
pub const HOSPITAL_STATE: &str = "Hospital";

/// Stable identifier of a tracked entity (a Torn player ID).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The polling and caching unit.
///
/// Serialized as `faction:<id>` or `idle-watch` so persisted watch lists
/// stay human-editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupId {
    /// One faction whose members' hospital timers are tracked.
    Faction(u64),
    /// The global set of users whose last-action status is watched.
    IdleWatch,
}

/// What kind of alerting a group performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Future alert a fixed lead before release from hospital.
    Hospital,
    /// Immediate alert on any status change.
    IdleWatch,
}

impl GroupId {
    /// Returns the alerting kind for this group.
    #[must_use]
    pub fn kind(&self) -> GroupKind {
        match self {
            Self::Faction(_) => GroupKind::Hospital,
            Self::IdleWatch => GroupKind::IdleWatch,
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Faction(id) => write!(f, "faction:{id}"),
            Self::IdleWatch => f.write_str("idle-watch"),
        }
    }
}

impl FromStr for GroupId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "idle-watch" {
            return Ok(Self::IdleWatch);
        }
        let id = trimmed.strip_prefix("faction:").unwrap_or(trimmed);
        id.parse::<u64>()
            .map(Self::Faction)
            .map_err(|_| format!("unrecognized group id `{trimmed}`"))
    }
}

impl Serialize for GroupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Whether an entity currently qualifies for a future alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Active,
    Inactive,
}

/// Last-seen state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDescriptor {
    /// Qualifying state.
    pub kind: StateKind,
    /// Absolute time the qualifying state ends, when known.
    pub target_time: Option<DateTime<Utc>>,
    /// Display name used in notifications.
    pub label: String,
    /// Raw status value reported by the source (`Hospital`, `Online`, ...).
    pub status: String,
}

impl StateDescriptor {
    /// Descriptor for a faction member.
    ///
    /// Active iff the state is `Hospital` and a release time is known.
    #[must_use]
    pub fn hospital(
        label: impl Into<String>,
        state: impl Into<String>,
        release_at: Option<DateTime<Utc>>,
    ) -> Self {
        let status = state.into();
        let kind = if status == HOSPITAL_STATE && release_at.is_some() {
            StateKind::Active
        } else {
            StateKind::Inactive
        };
        Self {
            kind,
            target_time: release_at.filter(|_| kind == StateKind::Active),
            label: label.into(),
            status,
        }
    }

    /// Descriptor for an idle-watched user. Transitions are the event, so
    /// there is never a target time.
    #[must_use]
    pub fn presence(label: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            kind: StateKind::Inactive,
            target_time: None,
            label: label.into(),
            status: status.into(),
        }
    }

    /// Returns `true` when the entity is active with a resolvable target time.
    #[must_use]
    pub fn is_alertable(&self) -> bool {
        self.kind == StateKind::Active && self.target_time.is_some()
    }
}

/// Mapping of entity to last-seen state for one group.
pub type TrackedGroup = BTreeMap<EntityId, StateDescriptor>;

/// A record the source could not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntry {
    pub entity: Option<EntityId>,
    pub reason: String,
}

/// Result of one successful fetch for a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Well-formed entities.
    pub entities: TrackedGroup,
    /// Records skipped because they were malformed.
    pub invalid: Vec<InvalidEntry>,
}

impl Snapshot {
    /// Build a snapshot with no invalid entries.
    #[must_use]
    pub fn from_entities(entities: impl IntoIterator<Item = (EntityId, StateDescriptor)>) -> Self {
        Self {
            entities: entities.into_iter().collect(),
            invalid: Vec::new(),
        }
    }

    /// IDs of malformed entries that could still be identified.
    pub fn invalid_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.invalid.iter().filter_map(|entry| entry.entity)
    }
}

/// A scheduled, not-yet-fired notification for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAlert {
    pub entity: EntityId,
    pub group: GroupId,
    /// The end of the qualifying state the alert is timed against.
    pub target_time: DateTime<Utc>,
    /// When the alert fires (`target_time - lead window`).
    pub alert_at: DateTime<Utc>,
    pub label: String,
}

/// Where a group's notifications are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    /// A Discord channel, sent through the bot REST API.
    Channel { channel_id: String },
    /// A Discord webhook URL.
    Webhook { url: String },
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel { channel_id } => write!(f, "channel {channel_id}"),
            // Webhook URLs embed a secret token.
            Self::Webhook { .. } => f.write_str("webhook"),
        }
    }
}
