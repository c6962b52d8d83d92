//! Error types for the tornwatch notifier.

use crate::model::{EntityId, GroupId, InvalidEntry};

/// Top-level error type for polling, scheduling, and delivery.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The snapshot source could not be reached or returned unusable data.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The snapshot source signalled throttling.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A notification could not be delivered.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// One entity in a snapshot was malformed.
    #[error("invalid snapshot entry{}: {reason}", entity_suffix(.entity))]
    InvalidSnapshot {
        /// Entity the bad record belonged to, when it could be identified.
        entity: Option<EntityId>,
        /// What was wrong with the record.
        reason: String,
    },

    /// No destination could be resolved for a group's notifications.
    #[error("no delivery destination for {0}")]
    NoDestination(GroupId),

    /// The group is not on the watch list.
    #[error("{0} is not watched")]
    UnknownGroup(GroupId),

    /// The group is already on the watch list.
    #[error("{0} is already watched")]
    AlreadyWatched(GroupId),

    /// The watcher is shutting down and accepts no new work.
    #[error("watcher is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Watch list persistence error.
    #[error("watch list error: {0}")]
    WatchList(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Returns `true` for errors that the next poll tick may resolve.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_) | Self::RateLimited(_))
    }

    /// Returns `true` when the upstream asked us to slow down.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

impl From<InvalidEntry> for WatchError {
    fn from(entry: InvalidEntry) -> Self {
        Self::InvalidSnapshot {
            entity: entry.entity,
            reason: entry.reason,
        }
    }
}

fn entity_suffix(entity: &Option<EntityId>) -> String {
    entity.map(|id| format!(" for {id}")).unwrap_or_default()
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, WatchError>;
