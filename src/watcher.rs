//! The watcher: owns every group's poll loop and exposes the command
//! surface (`watch`, `unwatch`, `force_poll`, `list_pending`, `shutdown`).
//!
//! One poll of a group runs as:
//!
//! 1. take the group's single-flight lock,
//! 2. fetch a snapshot (time-bounded),
//! 3. [`reconcile`] it against the cached mapping and the armed alerts,
//! 4. cancel, write the cache, then arm new timers,
//! 5. deliver any immediate status transitions.
//!
//! A failure at step 2 returns before anything is touched, so the group's
//! cache and timers stay exactly as the last successful poll left them.

use crate::cache::StateCache;
use crate::clock::Clock;
use crate::config::WatchConfig;
use crate::delivery::DeliverySink;
use crate::diff::{AlertPolicy, Reconciliation, reconcile};
use crate::error::{Result, WatchError};
use crate::model::{
    Destination, EntityId, GroupId, GroupKind, PendingAlert, Snapshot, TrackedGroup,
};
use crate::notifier::{Notifier, NotifierSettings};
use crate::poller::{PollLoop, PollOutcome, PollSchedule};
use crate::source::{SnapshotRequest, SnapshotSource};
use crate::timers::TimerRegistry;
use crate::watchlist::{GroupWatch, WatchList, WatchListStore};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as FlightLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling and alerting parameters.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub hospital_policy: AlertPolicy,
    pub idle_policy: AlertPolicy,
    pub hospital_schedule: PollSchedule,
    pub idle_schedule: PollSchedule,
    pub hospital_enabled: bool,
    pub idle_enabled: bool,
    /// Upper bound on one snapshot fetch.
    pub fetch_timeout: Duration,
}

impl WatcherSettings {
    #[must_use]
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            hospital_policy: config.hospital_policy(),
            idle_policy: config.idle_policy(),
            hospital_schedule: PollSchedule::every(config.poll_interval(GroupKind::Hospital)),
            idle_schedule: PollSchedule::every(config.poll_interval(GroupKind::IdleWatch))
                .with_initial_delay(Duration::from_secs(config.idle_watch.initial_delay_secs)),
            hospital_enabled: config.is_enabled(GroupKind::Hospital),
            idle_enabled: config.is_enabled(GroupKind::IdleWatch),
            fetch_timeout: Duration::from_secs(config.torn.request_timeout_secs),
        }
    }

    fn policy(&self, kind: GroupKind) -> AlertPolicy {
        match kind {
            GroupKind::Hospital => self.hospital_policy,
            GroupKind::IdleWatch => self.idle_policy,
        }
    }

    fn schedule(&self, kind: GroupKind) -> PollSchedule {
        match kind {
            GroupKind::Hospital => self.hospital_schedule,
            GroupKind::IdleWatch => self.idle_schedule,
        }
    }

    fn enabled(&self, kind: GroupKind) -> bool {
        match kind {
            GroupKind::Hospital => self.hospital_enabled,
            GroupKind::IdleWatch => self.idle_enabled,
        }
    }
}

/// External collaborators of a [`Watcher`].
pub struct WatcherParts {
    pub source: Arc<dyn SnapshotSource>,
    pub sink: Arc<dyn DeliverySink>,
    pub store: Arc<dyn WatchListStore>,
    pub clock: Arc<dyn Clock>,
}

struct GroupHandle {
    flight: Arc<FlightLock<()>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WatchState {
    list: WatchList,
    groups: HashMap<GroupId, GroupHandle>,
}

struct WatcherInner {
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn WatchListStore>,
    clock: Arc<dyn Clock>,
    cache: StateCache,
    timers: TimerRegistry,
    notifier: Arc<Notifier>,
    settings: WatcherSettings,
    state: Mutex<WatchState>,
    shutdown: CancellationToken,
}

/// Handle to the running notifier core. Cloning shares the same core.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    /// Build a watcher from configuration.
    pub fn new(config: &WatchConfig, parts: WatcherParts) -> Self {
        Self::with_settings(
            WatcherSettings::from_config(config),
            NotifierSettings::from_config(config),
            parts,
        )
    }

    pub fn with_settings(
        settings: WatcherSettings,
        notifier_settings: NotifierSettings,
        parts: WatcherParts,
    ) -> Self {
        let cache = StateCache::new();
        let timers = TimerRegistry::new();
        let notifier = Arc::new(Notifier::new(
            parts.sink,
            cache.clone(),
            timers.clone(),
            notifier_settings,
        ));
        Self {
            inner: Arc::new(WatcherInner {
                source: parts.source,
                store: parts.store,
                clock: parts.clock,
                cache,
                timers,
                notifier,
                settings,
                state: Mutex::new(WatchState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Load the persisted watch list and start polling every group in it.
    ///
    /// Returns the number of groups started.
    ///
    /// # Errors
    ///
    /// Fails if the watch list cannot be loaded; callers should treat that
    /// as fatal.
    pub fn start(&self) -> Result<usize> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let list = inner.store.load()?;
        if list.is_empty() {
            warn!("watch list is empty; nothing will be polled until a group is watched");
        }

        let mut state = inner.lock_state();
        for watch in &list.groups {
            inner
                .notifier
                .set_destination(watch.group, watch.destination.clone());
        }
        let mut groups: Vec<GroupId> = list.groups.iter().map(|w| w.group).collect();
        if !list.idle_users.is_empty() && !groups.contains(&GroupId::IdleWatch) {
            groups.push(GroupId::IdleWatch);
        }
        let baseline = list.baseline();
        if !baseline.is_empty() {
            debug!(users = baseline.len(), "restored idle-watch baseline");
            inner.cache.set(GroupId::IdleWatch, baseline);
        }
        state.list = list;

        let mut started = 0;
        for group in groups {
            if !state.groups.contains_key(&group) {
                let handle = inner.spawn_group(group);
                state.groups.insert(group, handle);
                started += 1;
            }
        }
        info!(groups = started, "watcher started");
        Ok(started)
    }

    /// Start polling `group`, optionally with its own destination.
    ///
    /// # Errors
    ///
    /// [`WatchError::AlreadyWatched`] if the group is already on the list,
    /// [`WatchError::ShuttingDown`] after shutdown, or a persistence error.
    pub fn watch(&self, group: GroupId, destination: Option<Destination>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let mut state = inner.lock_state();
        if state.list.contains(group) {
            return Err(WatchError::AlreadyWatched(group));
        }

        let mut list = state.list.clone();
        list.upsert(group, destination.clone());
        inner.store.save(&list)?;
        state.list = list;
        inner.notifier.set_destination(group, destination);

        if !state.groups.contains_key(&group) {
            let handle = inner.spawn_group(group);
            state.groups.insert(group, handle);
        }
        info!(group = %group, "group watched");
        Ok(())
    }

    /// Change where a watched group's notifications go. `None` reverts to the
    /// configured default for the group's kind.
    ///
    /// # Errors
    ///
    /// [`WatchError::UnknownGroup`] if the group is not watched, or a
    /// persistence error.
    pub fn set_destination(&self, group: GroupId, destination: Option<Destination>) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        if !state.list.contains(group) {
            return Err(WatchError::UnknownGroup(group));
        }
        let mut list = state.list.clone();
        list.upsert(group, destination.clone());
        inner.store.save(&list)?;
        state.list = list;
        inner.notifier.set_destination(group, destination);
        Ok(())
    }

    /// Stop polling `group`, cancel all its pending alerts, and drop its
    /// cached state. Unwatching the idle-watch group also forgets its users.
    ///
    /// Returns the number of pending alerts cancelled.
    ///
    /// # Errors
    ///
    /// [`WatchError::UnknownGroup`] if the group is not watched, or a
    /// persistence error.
    pub async fn unwatch(&self, group: GroupId) -> Result<usize> {
        let inner = &self.inner;
        let handle = {
            let mut state = inner.lock_state();
            if !state.list.contains(group) && !state.groups.contains_key(&group) {
                return Err(WatchError::UnknownGroup(group));
            }
            let mut list = state.list.clone();
            list.remove(group);
            if group == GroupId::IdleWatch {
                list.clear_users();
            }
            inner.store.save(&list)?;
            state.list = list;
            state.groups.remove(&group)
        };
        inner.notifier.set_destination(group, None);

        let mut cancelled = inner.drop_group_state(group);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            // A poll that passed its cancellation check before the cancel
            // may still have applied; wait it out and sweep again.
            let _flight = handle.flight.lock().await;
            cancelled += inner.drop_group_state(group);
        }
        info!(group = %group, cancelled, "group unwatched");
        Ok(cancelled)
    }

    /// Add a user to the idle-watch group, starting the group if needed.
    ///
    /// Returns `false` if the user was already watched.
    ///
    /// # Errors
    ///
    /// [`WatchError::ShuttingDown`] after shutdown, or a persistence error.
    pub fn watch_user(&self, user: EntityId) -> Result<bool> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let mut state = inner.lock_state();
        if state.list.idle_users.contains(&user) {
            return Ok(false);
        }

        let mut list = state.list.clone();
        list.idle_users.insert(user);
        if !list.contains(GroupId::IdleWatch) {
            list.upsert(GroupId::IdleWatch, None);
        }
        inner.store.save(&list)?;
        state.list = list;

        if !state.groups.contains_key(&GroupId::IdleWatch) {
            let handle = inner.spawn_group(GroupId::IdleWatch);
            state.groups.insert(GroupId::IdleWatch, handle);
        }
        info!(user = %user, "user added to idle watch");
        Ok(true)
    }

    /// Remove a user from the idle-watch group.
    ///
    /// Returns `false` if the user was not watched.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the list cannot be saved.
    pub async fn unwatch_user(&self, user: EntityId) -> Result<bool> {
        let inner = &self.inner;
        let flight = {
            let mut state = inner.lock_state();
            if !state.list.idle_users.contains(&user) {
                return Ok(false);
            }
            let mut list = state.list.clone();
            list.remove_user(user);
            inner.store.save(&list)?;
            state.list = list;
            state
                .groups
                .get(&GroupId::IdleWatch)
                .map(|handle| Arc::clone(&handle.flight))
        };

        if let Some(flight) = flight {
            let _flight = flight.lock().await;
            inner.cache.remove_entity(GroupId::IdleWatch, user);
        } else {
            inner.cache.remove_entity(GroupId::IdleWatch, user);
        }
        info!(user = %user, "user removed from idle watch");
        Ok(true)
    }

    /// Poll `group` now, waiting for any poll already in flight, and return
    /// what the poll decided.
    ///
    /// # Errors
    ///
    /// [`WatchError::UnknownGroup`] for an unwatched group, the fetch error
    /// when the source fails, or [`WatchError::ShuttingDown`].
    pub async fn force_poll(&self, group: GroupId) -> Result<Reconciliation> {
        match self.inner.poll_group(group, true).await? {
            PollOutcome::Completed(reconciliation) => Ok(reconciliation),
            PollOutcome::InFlight => Ok(Reconciliation::default()),
        }
    }

    /// Every pending alert, soonest first.
    #[must_use]
    pub fn list_pending(&self) -> Vec<PendingAlert> {
        self.inner.timers.pending()
    }

    /// Watched groups with their destinations.
    #[must_use]
    pub fn watched_groups(&self) -> Vec<GroupWatch> {
        self.inner.lock_state().list.groups.clone()
    }

    /// Users in the idle-watch group.
    #[must_use]
    pub fn idle_users(&self) -> Vec<EntityId> {
        self.inner
            .lock_state()
            .list
            .idle_users
            .iter()
            .copied()
            .collect()
    }

    /// Last successfully polled state of `group`.
    #[must_use]
    pub fn cached(&self, group: GroupId) -> Option<TrackedGroup> {
        self.inner.cache.get(group)
    }

    /// Cancel every timer, stop every poll loop, and refuse further work.
    ///
    /// Returns the number of pending alerts cancelled.
    pub async fn shutdown(&self) -> usize {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let cancelled = inner.timers.shutdown();

        let tasks: Vec<JoinHandle<()>> = {
            let mut state = inner.lock_state();
            state
                .groups
                .values_mut()
                .filter_map(|handle| handle.task.take())
                .collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "poll loop ended abnormally");
            }
        }
        info!(cancelled, "watcher shut down");
        cancelled
    }
}

impl WatcherInner {
    fn lock_state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(WatchError::ShuttingDown);
        }
        Ok(())
    }

    fn spawn_group(self: &Arc<Self>, group: GroupId) -> GroupHandle {
        let cancel = self.shutdown.child_token();
        let flight = Arc::new(FlightLock::new(()));
        let kind = group.kind();

        let task = if self.settings.enabled(kind) {
            let poll_loop = PollLoop::new(group, self.settings.schedule(kind), cancel.clone());
            let inner = Arc::clone(self);
            Some(tokio::spawn(poll_loop.run(move || {
                let inner = Arc::clone(&inner);
                async move { inner.poll_group(group, false).await }
            })))
        } else {
            info!(group = %group, "polling disabled for this group kind; use force_poll");
            None
        };

        GroupHandle {
            flight,
            cancel,
            task,
        }
    }

    /// One poll. With `wait` unset, returns [`PollOutcome::InFlight`]
    /// instead of waiting for a poll already running.
    async fn poll_group(self: &Arc<Self>, group: GroupId, wait: bool) -> Result<PollOutcome> {
        self.ensure_running()?;
        let (flight, cancel) = {
            let state = self.lock_state();
            let handle = state
                .groups
                .get(&group)
                .ok_or(WatchError::UnknownGroup(group))?;
            (Arc::clone(&handle.flight), handle.cancel.clone())
        };

        let _flight = if wait {
            flight.lock_owned().await
        } else {
            match flight.try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => return Ok(PollOutcome::InFlight),
            }
        };
        self.ensure_running()?;
        if cancel.is_cancelled() {
            return Err(WatchError::UnknownGroup(group));
        }

        let request = self.request_for(group);
        let snapshot = self.fetch(&request).await?;
        if cancel.is_cancelled() {
            return Err(WatchError::UnknownGroup(group));
        }
        for entry in &snapshot.invalid {
            let e = WatchError::from(entry.clone());
            warn!(group = %group, error = %e, "skipping malformed entry");
        }

        let reconciliation = self.apply(group, &snapshot);
        if group == GroupId::IdleWatch {
            self.persist_baseline(&reconciliation.next_state);
        }
        join_all(
            reconciliation
                .immediate
                .iter()
                .map(|transition| self.notifier.on_transition(group, transition)),
        )
        .await;
        Ok(PollOutcome::Completed(reconciliation))
    }

    fn request_for(&self, group: GroupId) -> SnapshotRequest {
        match group {
            GroupId::Faction(id) => SnapshotRequest::faction(id),
            GroupId::IdleWatch => {
                SnapshotRequest::idle_watch(self.lock_state().list.idle_users.iter().copied())
            }
        }
    }

    async fn fetch(&self, request: &SnapshotRequest) -> Result<Snapshot> {
        if request.group == GroupId::IdleWatch && request.members.is_empty() {
            return Ok(Snapshot::default());
        }
        let timeout = self.settings.fetch_timeout;
        tokio::time::timeout(timeout, self.source.fetch_snapshot(request))
            .await
            .map_err(|_| {
                WatchError::SourceUnavailable(format!(
                    "{} fetch timed out after {}s",
                    request.group,
                    timeout.as_secs()
                ))
            })?
    }

    fn apply(&self, group: GroupId, snapshot: &Snapshot) -> Reconciliation {
        let policy = self.settings.policy(group.kind());
        let previous = self.cache.get(group).unwrap_or_default();
        let armed = self.timers.armed_targets(group);
        let reconciliation = reconcile(&policy, &previous, snapshot, &armed, self.clock.now());

        for entity in &reconciliation.to_cancel {
            if self.timers.cancel(*entity) {
                info!(group = %group, entity = %entity, "pending alert cancelled");
            }
        }

        // The cache must be current before any new timer can fire and
        // re-check it.
        self.cache.set(group, reconciliation.next_state.clone());

        for request in &reconciliation.to_schedule {
            let alert = PendingAlert {
                entity: request.entity,
                group,
                target_time: request.target_time,
                alert_at: request.alert_at,
                label: request.label.clone(),
            };
            let notifier = Arc::clone(&self.notifier);
            let armed = self.timers.schedule(alert, request.delay, move |alert| async move {
                notifier.on_alert_fired(alert).await;
            });
            if armed {
                info!(
                    group = %group,
                    entity = %request.entity,
                    alert_at = %request.alert_at,
                    "alert scheduled"
                );
            }
        }

        for alert in self.timers.pending().iter().filter(|a| a.group == group) {
            debug!(
                group = %group,
                entity = %alert.entity,
                label = %alert.label,
                alert_at = %alert.alert_at,
                "pending alert"
            );
        }
        reconciliation
    }

    /// Save the idle-watch baseline if this poll changed it. A failed save is
    /// logged and retried on the next poll.
    fn persist_baseline(&self, seen: &TrackedGroup) {
        let mut state = self.lock_state();
        let baseline: TrackedGroup = seen
            .iter()
            .filter(|(id, _)| state.list.idle_users.contains(id))
            .map(|(id, d)| (*id, d.clone()))
            .collect();
        if state.list.idle_baseline == baseline {
            return;
        }
        let mut list = state.list.clone();
        list.idle_baseline = baseline;
        match self.store.save(&list) {
            Ok(()) => state.list = list,
            Err(e) => warn!(error = %e, "failed to persist idle-watch baseline"),
        }
    }

    /// Cancel the group's timers and drop its cache entry.
    fn drop_group_state(&self, group: GroupId) -> usize {
        let cancelled = self.timers.cancel_group(group).len();
        self.cache.remove(group);
        cancelled
    }
}
