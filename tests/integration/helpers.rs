//! Shared helpers for integration tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tornwatch::clock::ManualClock;
use tornwatch::delivery::{DeliverySink, OutboundAlert};
use tornwatch::diff::AlertPolicy;
use tornwatch::model::{EntityId, GroupId, Snapshot, StateDescriptor};
use tornwatch::notifier::NotifierSettings;
use tornwatch::poller::PollSchedule;
use tornwatch::source::{SnapshotRequest, SnapshotSource};
use tornwatch::watcher::WatcherSettings;
use tornwatch::watchlist::{MemoryWatchList, WatchList, WatchListStore};
use tornwatch::{Destination, Result, WatchError, Watcher, WatcherParts};

pub(crate) const LEAD: Duration = Duration::from_secs(30);
pub(crate) const HOSPITAL_HOOK: &str = "https://discord.test/api/webhooks/1/hospital";
pub(crate) const IDLE_HOOK: &str = "https://discord.test/api/webhooks/2/idle";

/// Fixed wall-clock start for every test.
pub(crate) fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000, 0).unwrap()
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    t0() + TimeDelta::seconds(secs)
}

pub(crate) fn hospitalized(name: &str, release_in_secs: i64) -> StateDescriptor {
    StateDescriptor::hospital(name, "Hospital", Some(at(release_in_secs)))
}

pub(crate) fn okay(name: &str) -> StateDescriptor {
    StateDescriptor::hospital(name, "Okay", None)
}

pub(crate) fn presence(name: &str, status: &str) -> StateDescriptor {
    StateDescriptor::presence(name, status)
}

pub(crate) fn snapshot(entries: Vec<(u64, StateDescriptor)>) -> Snapshot {
    Snapshot::from_entities(entries.into_iter().map(|(id, d)| (EntityId(id), d)))
}

/// One scripted fetch result.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Ok(Snapshot),
    /// Succeeds with the snapshot once the gate is notified.
    Gated(Arc<Notify>, Snapshot),
    /// Never completes.
    Hang,
    Unavailable,
    RateLimited,
}

/// Source that replays scripted results per group. Once a group's script
/// runs out, its last successful snapshot is repeated.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    scripts: Mutex<HashMap<GroupId, VecDeque<Step>>>,
    last: Mutex<HashMap<GroupId, Snapshot>>,
    calls: Mutex<HashMap<GroupId, usize>>,
}

impl ScriptedSource {
    pub(crate) fn push(&self, group: GroupId, step: Step) {
        self.scripts
            .lock()
            .unwrap()
            .entry(group)
            .or_default()
            .push_back(step);
    }

    pub(crate) fn calls(&self, group: GroupId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&group)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch_snapshot(&self, request: &SnapshotRequest) -> Result<Snapshot> {
        let group = request.group;
        *self.calls.lock().unwrap().entry(group).or_default() += 1;
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&group)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Ok(snapshot)) => {
                self.last.lock().unwrap().insert(group, snapshot.clone());
                Ok(snapshot)
            }
            Some(Step::Gated(gate, snapshot)) => {
                gate.notified().await;
                self.last.lock().unwrap().insert(group, snapshot.clone());
                Ok(snapshot)
            }
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Unavailable) => Err(WatchError::SourceUnavailable("scripted outage".into())),
            Some(Step::RateLimited) => Err(WatchError::RateLimited("scripted throttle".into())),
            None => self
                .last
                .lock()
                .unwrap()
                .get(&group)
                .cloned()
                .ok_or_else(|| WatchError::SourceUnavailable(format!("no script for {group}"))),
        }
    }
}

/// Sink that records every delivered message.
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<OutboundAlert>>,
}

impl RecordingSink {
    pub(crate) fn sent(&self) -> Vec<OutboundAlert> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn contents(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.content).collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    fn id(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, message: &OutboundAlert) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// A watcher wired to scripted collaborators.
pub(crate) struct Harness {
    pub(crate) watcher: Watcher,
    pub(crate) source: Arc<ScriptedSource>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) store: Arc<MemoryWatchList>,
    pub(crate) clock: ManualClock,
}

impl Harness {
    /// Background loops off: polls happen only through `force_poll`.
    pub(crate) fn manual() -> Self {
        Self::build(false, WatchList::default())
    }

    /// Background loops off, starting from a previously saved list.
    pub(crate) fn restored(list: WatchList) -> Self {
        Self::build(false, list)
    }

    /// Background loops on, 300s hospital / 30s idle interval, no jitter.
    pub(crate) fn looping(list: WatchList) -> Self {
        Self::build(true, list)
    }

    fn build(loops: bool, list: WatchList) -> Self {
        let source = Arc::new(ScriptedSource::default());
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryWatchList::new(list));
        let clock = ManualClock::new(t0());

        let settings = WatcherSettings {
            hospital_policy: AlertPolicy::scheduled(LEAD),
            idle_policy: AlertPolicy::on_change(),
            hospital_schedule: PollSchedule::every(Duration::from_secs(300))
                .with_jitter(Duration::ZERO),
            idle_schedule: PollSchedule::every(Duration::from_secs(30))
                .with_jitter(Duration::ZERO)
                .with_initial_delay(Duration::from_secs(10)),
            hospital_enabled: loops,
            idle_enabled: loops,
            fetch_timeout: Duration::from_secs(10),
        };
        let notifier = NotifierSettings {
            hospital_username: "Hospital Alert Bot".into(),
            idle_username: "IdleOp Alert".into(),
            mention_role_id: None,
            hospital_fallback: Some(Destination::Webhook {
                url: HOSPITAL_HOOK.into(),
            }),
            idle_fallback: Some(Destination::Webhook {
                url: IDLE_HOOK.into(),
            }),
            delivery_timeout: Duration::from_secs(5),
        };
        let watcher = Watcher::with_settings(
            settings,
            notifier,
            WatcherParts {
                source: Arc::clone(&source) as Arc<dyn SnapshotSource>,
                sink: Arc::clone(&sink) as Arc<dyn DeliverySink>,
                store: Arc::clone(&store) as Arc<dyn WatchListStore>,
                clock: Arc::new(clock.clone()),
            },
        );
        Self {
            watcher,
            source,
            sink,
            store,
            clock,
        }
    }

    /// Move wall-clock and tokio time forward together, then let woken
    /// tasks run.
    pub(crate) async fn advance(&self, secs: u64) {
        self.clock
            .advance(TimeDelta::seconds(i64::try_from(secs).unwrap()));
        tokio::time::sleep(Duration::from_secs(secs)).await;
        settle().await;
    }
}

/// Yield a few times so spawned tasks can finish.
pub(crate) async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}
