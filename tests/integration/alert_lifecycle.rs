//! End-to-end alert behavior: scheduling, replacement, suppression, and
//! exactly-once delivery.

use crate::helpers::{
    HOSPITAL_HOOK, Harness, IDLE_HOOK, Step, at, hospitalized, okay, presence, settle, snapshot,
};
use chrono::TimeDelta;
use std::time::Duration;
use tornwatch::{Destination, EntityId, GroupId};

const FACTION: GroupId = GroupId::Faction(1);

#[tokio::test(start_paused = true)]
async fn recovered_member_never_alerts() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(123, hospitalized("M123", 40))])));
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(123, okay("M123"))])));

    let first = h.watcher.force_poll(FACTION).await.unwrap();
    assert_eq!(first.to_schedule.len(), 1);
    let pending = h.watcher.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].alert_at, at(10));

    h.advance(5).await;
    let second = h.watcher.force_poll(FACTION).await.unwrap();
    assert_eq!(second.to_cancel, vec![EntityId(123)]);
    assert!(h.watcher.list_pending().is_empty());

    h.advance(60).await;
    assert!(h.sink.sent().is_empty(), "recovered member must not be alerted");
}

#[tokio::test(start_paused = true)]
async fn constant_release_time_alerts_exactly_once() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(7, hospitalized("Eve", 600))])));

    // Poll repeatedly before, around, and after the alert time.
    for _ in 0..12 {
        h.watcher.force_poll(FACTION).await.unwrap();
        assert!(h.watcher.list_pending().len() <= 1);
        h.advance(60).await;
    }

    let sent = h.sink.sent();
    assert_eq!(sent.len(), 1, "got {:?}", h.sink.contents());
    assert_eq!(
        sent[0].destination,
        Destination::Webhook {
            url: HOSPITAL_HOOK.into()
        }
    );
    assert_eq!(sent[0].username.as_deref(), Some("Hospital Alert Bot"));
    assert!(sent[0].content.starts_with("**Eve** exits hospital in 30s!"));
    assert!(sent[0].content.ends_with("user2ID=7"));
}

#[tokio::test(start_paused = true)]
async fn lagging_wall_clock_does_not_rearm_a_fired_alert() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(123, hospitalized("M123", 40))])));
    h.watcher.force_poll(FACTION).await.unwrap();

    // The timer fires on tokio time at +10s while the wall clock reads +9s.
    h.clock.advance(TimeDelta::seconds(9));
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(h.sink.sent().len(), 1);

    let again = h.watcher.force_poll(FACTION).await.unwrap();
    assert!(again.to_schedule.is_empty(), "re-armed: {again:?}");
    assert!(h.watcher.list_pending().is_empty());

    h.advance(120).await;
    assert_eq!(h.sink.sent().len(), 1, "release time alerted twice");
}

#[tokio::test(start_paused = true)]
async fn rehospitalized_member_is_alerted_again() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(4, hospitalized("Rex", 40))])));
    h.watcher.force_poll(FACTION).await.unwrap();
    h.advance(45).await;
    assert_eq!(h.sink.sent().len(), 1);

    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(4, hospitalized("Rex", 300))])));
    let r = h.watcher.force_poll(FACTION).await.unwrap();
    assert_eq!(r.to_schedule.len(), 1);
    h.advance(300).await;
    assert_eq!(h.sink.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn changed_release_time_replaces_the_alert() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(7, hospitalized("Eve", 300))])));
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(7, hospitalized("Eve", 900))])));

    h.watcher.force_poll(FACTION).await.unwrap();
    h.advance(60).await;
    h.watcher.force_poll(FACTION).await.unwrap();

    let pending = h.watcher.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target_time, at(900));
    assert_eq!(pending[0].alert_at, at(870));

    // Past the old alert time: nothing.
    h.advance(240).await;
    assert!(h.sink.sent().is_empty());

    // Past the new one: exactly one.
    h.advance(600).await;
    assert_eq!(h.sink.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn identical_snapshot_twice_changes_nothing() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source.push(
        FACTION,
        Step::Ok(snapshot(vec![
            (1, hospitalized("A", 500)),
            (2, okay("B")),
            (3, hospitalized("C", 20)),
        ])),
    );

    let first = h.watcher.force_poll(FACTION).await.unwrap();
    assert_eq!(first.to_schedule.len(), 1, "C's window is already missed");
    let second = h.watcher.force_poll(FACTION).await.unwrap();
    assert!(second.is_noop(), "second poll produced {second:?}");
    assert_eq!(h.watcher.cached(FACTION).unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn member_leaving_faction_cancels_alert() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(9, hospitalized("Gone", 400))])));
    h.source.push(FACTION, Step::Ok(snapshot(Vec::new())));

    h.watcher.force_poll(FACTION).await.unwrap();
    let r = h.watcher.force_poll(FACTION).await.unwrap();
    assert_eq!(r.to_cancel, vec![EntityId(9)]);

    h.advance(600).await;
    assert!(h.sink.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn status_change_notifies_once() {
    let h = Harness::manual();
    h.watcher.watch_user(EntityId(77)).unwrap();
    let idle = GroupId::IdleWatch;
    h.source
        .push(idle, Step::Ok(snapshot(vec![(77, presence("U77", "Online"))])));
    h.source
        .push(idle, Step::Ok(snapshot(vec![(77, presence("U77", "Offline"))])));
    h.source
        .push(idle, Step::Ok(snapshot(vec![(77, presence("U77", "Offline"))])));

    let baseline = h.watcher.force_poll(idle).await.unwrap();
    assert!(baseline.immediate.is_empty());
    assert!(h.sink.sent().is_empty());

    let changed = h.watcher.force_poll(idle).await.unwrap();
    assert_eq!(changed.immediate.len(), 1);

    let repeat = h.watcher.force_poll(idle).await.unwrap();
    assert!(repeat.immediate.is_empty());

    let sent = h.sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].content,
        "**U77** (ID:77) status changed: **Online** → **Offline**"
    );
    assert_eq!(sent[0].username.as_deref(), Some("IdleOp Alert"));
    assert_eq!(
        sent[0].destination,
        Destination::Webhook {
            url: IDLE_HOOK.into()
        }
    );
    assert!(h.watcher.list_pending().is_empty(), "idle watch never arms timers");
}

#[tokio::test(start_paused = true)]
async fn group_destination_wins_over_default() {
    let h = Harness::manual();
    let channel = Destination::Channel {
        channel_id: "4242".into(),
    };
    h.watcher.watch(FACTION, Some(channel.clone())).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(5, hospitalized("Dan", 100))])));

    h.watcher.force_poll(FACTION).await.unwrap();
    h.advance(80).await;

    let sent = h.sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, channel);
}

#[tokio::test(start_paused = true)]
async fn no_alert_fires_after_shutdown() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source.push(
        FACTION,
        Step::Ok(snapshot(vec![
            (1, hospitalized("A", 100)),
            (2, hospitalized("B", 200)),
        ])),
    );
    h.watcher.force_poll(FACTION).await.unwrap();
    assert_eq!(h.watcher.list_pending().len(), 2);

    assert_eq!(h.watcher.shutdown().await, 2);
    h.advance(600).await;
    assert!(h.sink.sent().is_empty());
    assert!(h.watcher.list_pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unwatch_cascades_to_pending_alerts() {
    let h = Harness::manual();
    h.watcher.watch(FACTION, None).unwrap();
    h.source
        .push(FACTION, Step::Ok(snapshot(vec![(1, hospitalized("A", 100))])));
    h.watcher.force_poll(FACTION).await.unwrap();

    assert_eq!(h.watcher.unwatch(FACTION).await.unwrap(), 1);
    assert!(!h.store.snapshot().contains(FACTION));
    h.advance(200).await;
    assert!(h.sink.sent().is_empty());
}
