//! Snapshot sources: where fresh entity state comes from.

pub mod torn;

pub use torn::TornSource;

use crate::error::Result;
use crate::model::{EntityId, GroupId, Snapshot};
use async_trait::async_trait;

/// What to fetch for one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub group: GroupId,
    /// Explicit members, for groups (idle-watch) that the source cannot
    /// enumerate itself. Empty for factions.
    pub members: Vec<EntityId>,
}

impl SnapshotRequest {
    #[must_use]
    pub fn faction(faction_id: u64) -> Self {
        Self {
            group: GroupId::Faction(faction_id),
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn idle_watch(members: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            group: GroupId::IdleWatch,
            members: members.into_iter().collect(),
        }
    }
}

/// Source of truth for entity state.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current state of every entity in the requested group.
    ///
    /// Fails with [`WatchError::SourceUnavailable`](crate::WatchError::SourceUnavailable)
    /// or [`WatchError::RateLimited`](crate::WatchError::RateLimited). Malformed
    /// individual records are reported in [`Snapshot::invalid`] instead of
    /// failing the whole fetch.
    async fn fetch_snapshot(&self, request: &SnapshotRequest) -> Result<Snapshot>;
}
