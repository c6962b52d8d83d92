//! Timer registry: at most one live one-shot timer per entity.
//!
//! Every mutation goes through a single mutex, so a `schedule` racing a
//! `cancel` for the same entity always leaves either the new timer or no
//! timer, never a dangling entry.
//!
//! A timer that wakes up must *claim* its entry before firing. The claim
//! succeeds only if the entry still carries the generation the timer was
//! armed with, which rules out firing after a cancel, a replacement, or
//! shutdown even when the abort arrives after the sleep already finished.
//!
//! A claimed alert leaves a *notified* record behind holding the target time
//! it fired for. Timers sleep on the monotonic clock while polls compare
//! against the wall clock, so a timer may fire before the wall clock reaches
//! `alert_at`; the record keeps the next poll from arming the same alert
//! again. It is dropped when the entity is cancelled, rescheduled, or its
//! group is swept.

use crate::model::{EntityId, GroupId, PendingAlert};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

struct TimerEntry {
    alert: PendingAlert,
    generation: u64,
    handle: AbortHandle,
}

struct NotifiedEntry {
    group: GroupId,
    target_time: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<EntityId, TimerEntry>,
    notified: HashMap<EntityId, NotifiedEntry>,
    /// Claimed timers whose callback is still running, by generation.
    firing: HashMap<u64, AbortHandle>,
    next_generation: u64,
    shut_down: bool,
}

/// Owner of every pending alert timer.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct TimerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TimerRegistry")
            .field("pending", &inner.entries.len())
            .field("notified", &inner.notified.len())
            .field("firing", &inner.firing.len())
            .field("shut_down", &inner.shut_down)
            .finish()
    }
}

impl TimerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a one-shot timer for `alert.entity`, replacing any existing one.
    ///
    /// `on_fire` runs once, after `delay`, unless the timer is cancelled or
    /// replaced first. Its registry entry is removed before `on_fire` starts;
    /// a shutdown aborts `on_fire` even while it runs.
    ///
    /// Returns `false` (and arms nothing) after [`shutdown`](Self::shutdown).
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, alert: PendingAlert, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce(PendingAlert) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.shut_down {
            return false;
        }

        let entity = alert.entity;
        inner.notified.remove(&entity);
        if let Some(old) = inner.entries.remove(&entity) {
            old.handle.abort();
            debug!(entity = %entity, old_alert_at = %old.alert.alert_at, "replacing pending alert");
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let registry = self.clone();
        // The entry is inserted before the lock is released, so the task's
        // claim cannot observe the map without it.
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(alert) = registry.claim(entity, generation) {
                on_fire(alert).await;
                registry.finish(generation);
            }
        });

        inner.entries.insert(
            entity,
            TimerEntry {
                alert,
                generation,
                handle: task.abort_handle(),
            },
        );
        true
    }

    fn claim(&self, entity: EntityId, generation: u64) -> Option<PendingAlert> {
        let mut inner = self.lock();
        if inner.shut_down {
            return None;
        }
        let current = inner.entries.get(&entity).map(|entry| entry.generation);
        if current != Some(generation) {
            return None;
        }
        let entry = inner.entries.remove(&entity)?;
        inner.notified.insert(
            entity,
            NotifiedEntry {
                group: entry.alert.group,
                target_time: entry.alert.target_time,
            },
        );
        inner.firing.insert(generation, entry.handle);
        Some(entry.alert)
    }

    fn finish(&self, generation: u64) {
        self.lock().firing.remove(&generation);
    }

    /// Cancel the entity's pending timer and forget any alert it already
    /// fired. Returns `true` when a pending timer existed.
    ///
    /// Cancelling an unknown or already-fired entity never aborts anything.
    pub fn cancel(&self, entity: EntityId) -> bool {
        let mut inner = self.lock();
        inner.notified.remove(&entity);
        match inner.entries.remove(&entity) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer belonging to `group`.
    pub fn cancel_group(&self, group: GroupId) -> Vec<EntityId> {
        let mut inner = self.lock();
        let doomed: Vec<EntityId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.alert.group == group)
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            if let Some(entry) = inner.entries.remove(id) {
                entry.handle.abort();
            }
        }
        inner.notified.retain(|_, notified| notified.group != group);
        doomed
    }

    #[must_use]
    pub fn has(&self, entity: EntityId) -> bool {
        self.lock().entries.contains_key(&entity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Target times already accounted for in `group`: alerts still pending
    /// and alerts that have fired and not been cancelled since.
    #[must_use]
    pub fn armed_targets(&self, group: GroupId) -> HashMap<EntityId, DateTime<Utc>> {
        let inner = self.lock();
        let notified = inner
            .notified
            .iter()
            .filter(|(_, notified)| notified.group == group)
            .map(|(id, notified)| (*id, notified.target_time));
        let pending = inner
            .entries
            .values()
            .filter(|entry| entry.alert.group == group)
            .map(|entry| (entry.alert.entity, entry.alert.target_time));
        notified.chain(pending).collect()
    }

    /// Target time the entity was last notified for, if its alert fired.
    #[must_use]
    pub fn notified_target(&self, entity: EntityId) -> Option<DateTime<Utc>> {
        self.lock().notified.get(&entity).map(|n| n.target_time)
    }

    /// All pending alerts, soonest first.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingAlert> {
        let mut alerts: Vec<PendingAlert> = self
            .lock()
            .entries
            .values()
            .map(|entry| entry.alert.clone())
            .collect();
        alerts.sort_by(|a, b| a.alert_at.cmp(&b.alert_at).then(a.entity.cmp(&b.entity)));
        alerts
    }

    /// Cancel every timer, abort alerts still being delivered, and refuse
    /// new timers. Returns how many pending timers were cancelled.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.lock();
        inner.shut_down = true;
        let count = inner.entries.len();
        for (_, entry) in inner.entries.drain() {
            entry.handle.abort();
        }
        for (_, handle) in inner.firing.drain() {
            handle.abort();
        }
        inner.notified.clear();
        count
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }
}
