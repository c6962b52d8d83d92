//! Last-seen state per tracked group.

use crate::model::{EntityId, GroupId, StateDescriptor, TrackedGroup};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared table of the most recent successful snapshot of every group.
///
/// Writes replace a group's mapping wholesale, so readers always see either
/// the previous or the new snapshot and never a mix.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    groups: Arc<RwLock<HashMap<GroupId, TrackedGroup>>>,
}

impl StateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the group's last snapshot.
    #[must_use]
    pub fn get(&self, group: GroupId) -> Option<TrackedGroup> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group)
            .cloned()
    }

    /// Returns the last-seen descriptor for one entity of a group.
    #[must_use]
    pub fn descriptor(&self, group: GroupId, entity: EntityId) -> Option<StateDescriptor> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group)
            .and_then(|members| members.get(&entity))
            .cloned()
    }

    /// Replace a group's snapshot.
    pub fn set(&self, group: GroupId, members: TrackedGroup) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group, members);
    }

    /// Drop a group's snapshot, returning it.
    pub fn remove(&self, group: GroupId) -> Option<TrackedGroup> {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group)
    }

    /// Drop one entity from a group's snapshot.
    pub fn remove_entity(&self, group: GroupId, entity: EntityId) -> Option<StateDescriptor> {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&group)
            .and_then(|members| members.remove(&entity))
    }
}
