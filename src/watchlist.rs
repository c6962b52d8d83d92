//! Persisted watch list: which groups are polled, where their alerts go,
//! which users the idle-watch group tracks, and the status each of those
//! users was last seen with.

use crate::error::{Result, WatchError};
use crate::model::{Destination, EntityId, GroupId, TrackedGroup};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// One watched group and its own delivery destination, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupWatch {
    pub group: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
}

/// Persisted group membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchList {
    pub groups: Vec<GroupWatch>,
    /// Members of the idle-watch group.
    pub idle_users: BTreeSet<EntityId>,
    /// Last status seen for each idle-watched user, so a change that happens
    /// while the process is down is still reported after a restart.
    #[serde(skip_serializing_if = "TrackedGroup::is_empty")]
    pub idle_baseline: TrackedGroup,
}

impl WatchList {
    #[must_use]
    pub fn get(&self, group: GroupId) -> Option<&GroupWatch> {
        self.groups.iter().find(|g| g.group == group)
    }

    #[must_use]
    pub fn contains(&self, group: GroupId) -> bool {
        self.get(group).is_some()
    }

    /// Add or update a group. Returns `false` when it was already present.
    pub fn upsert(&mut self, group: GroupId, destination: Option<Destination>) -> bool {
        if let Some(existing) = self.groups.iter_mut().find(|g| g.group == group) {
            existing.destination = destination;
            return false;
        }
        self.groups.push(GroupWatch { group, destination });
        true
    }

    /// Remove a group. Returns `false` when it was not present.
    pub fn remove(&mut self, group: GroupId) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.group != group);
        self.groups.len() != before
    }

    /// Stop watching a user and forget their baseline. Returns `false` when
    /// the user was not watched.
    pub fn remove_user(&mut self, user: EntityId) -> bool {
        self.idle_baseline.remove(&user);
        self.idle_users.remove(&user)
    }

    /// Forget every idle-watched user.
    pub fn clear_users(&mut self) {
        self.idle_users.clear();
        self.idle_baseline.clear();
    }

    /// Baseline entries for users still on the list.
    #[must_use]
    pub fn baseline(&self) -> TrackedGroup {
        self.idle_baseline
            .iter()
            .filter(|(id, _)| self.idle_users.contains(id))
            .map(|(id, d)| (*id, d.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.idle_users.is_empty()
    }
}

/// Load/save seam for the watch list.
pub trait WatchListStore: Send + Sync {
    /// Load the persisted list.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::WatchList`] when the stored list exists but
    /// cannot be read.
    fn load(&self) -> Result<WatchList>;

    /// Replace the persisted list.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::WatchList`] on write failure.
    fn save(&self, list: &WatchList) -> Result<()>;
}

/// JSON file store with atomic replace-on-save.
#[derive(Debug, Clone)]
pub struct JsonFileWatchList {
    path: PathBuf,
}

impl JsonFileWatchList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WatchListStore for JsonFileWatchList {
    fn load(&self) -> Result<WatchList> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %self.path.display(),
                    "no watch list found; starting with nothing watched"
                );
                return Ok(WatchList::default());
            }
            Err(e) => {
                return Err(WatchError::WatchList(format!(
                    "failed to read '{}': {e}",
                    self.path.display()
                )));
            }
        };
        let list: WatchList = serde_json::from_slice(&bytes).map_err(|e| {
            WatchError::WatchList(format!("failed to parse '{}': {e}", self.path.display()))
        })?;
        info!(
            path = %self.path.display(),
            groups = list.groups.len(),
            idle_users = list.idle_users.len(),
            "watch list loaded"
        );
        Ok(list)
    }

    fn save(&self, list: &WatchList) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WatchError::WatchList(format!("failed to create watch list directory: {e}"))
            })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(list)
            .map_err(|e| WatchError::WatchList(format!("failed to serialize watch list: {e}")))?;
        std::fs::write(&tmp_path, json).map_err(|e| {
            WatchError::WatchList(format!("failed to write watch list temp file: {e}"))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            WatchError::WatchList(format!("failed to finalize watch list file: {e}"))
        })?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryWatchList {
    list: Mutex<WatchList>,
}

impl MemoryWatchList {
    #[must_use]
    pub fn new(list: WatchList) -> Self {
        Self {
            list: Mutex::new(list),
        }
    }

    /// Current stored contents.
    #[must_use]
    pub fn snapshot(&self) -> WatchList {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl WatchListStore for MemoryWatchList {
    fn load(&self) -> Result<WatchList> {
        Ok(self.snapshot())
    }

    fn save(&self, list: &WatchList) -> Result<()> {
        *self.list.lock().unwrap_or_else(PoisonError::into_inner) = list.clone();
        Ok(())
    }
}
