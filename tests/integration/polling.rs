//! Poll loop behavior: startup scan, per-group failure isolation,
//! single-flight polling, fetch timeouts, and rate-limit backoff.

use crate::helpers::{Harness, Step, hospitalized, okay, presence, settle, snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tornwatch::watchlist::WatchList;
use tornwatch::{EntityId, GroupId, WatchError};

const A: GroupId = GroupId::Faction(1);
const B: GroupId = GroupId::Faction(2);

#[tokio::test(start_paused = true)]
async fn failed_poll_leaves_other_groups_untouched() {
    let h = Harness::manual();
    h.watcher.watch(A, None).unwrap();
    h.watcher.watch(B, None).unwrap();
    h.source
        .push(A, Step::Ok(snapshot(vec![(10, hospitalized("A10", 500))])));
    h.source
        .push(B, Step::Ok(snapshot(vec![(20, hospitalized("B20", 600))])));
    h.watcher.force_poll(A).await.unwrap();
    h.watcher.force_poll(B).await.unwrap();

    let cached_a = h.watcher.cached(A).unwrap();
    let cached_b = h.watcher.cached(B).unwrap();
    let pending_before = h.watcher.list_pending();
    assert_eq!(pending_before.len(), 2);

    h.source.push(A, Step::Unavailable);
    h.source
        .push(B, Step::Ok(snapshot(vec![(20, hospitalized("B20", 600))])));
    let err = h.watcher.force_poll(A).await.unwrap_err();
    assert!(matches!(err, WatchError::SourceUnavailable(_)));
    assert!(h.watcher.force_poll(B).await.unwrap().is_noop());

    assert_eq!(h.watcher.cached(A).unwrap(), cached_a, "failed poll keeps stale cache");
    assert_eq!(h.watcher.cached(B).unwrap(), cached_b);
    assert_eq!(h.watcher.list_pending(), pending_before);
}

#[tokio::test(start_paused = true)]
async fn malformed_member_is_skipped_not_fatal() {
    let h = Harness::manual();
    h.watcher.watch(A, None).unwrap();
    h.source.push(
        A,
        Step::Ok(snapshot(vec![(1, hospitalized("One", 500)), (2, okay("Two"))])),
    );
    h.watcher.force_poll(A).await.unwrap();

    let mut partial = snapshot(vec![(2, hospitalized("Two", 800))]);
    partial.invalid.push(tornwatch::model::InvalidEntry {
        entity: Some(EntityId(1)),
        reason: "status missing".into(),
    });
    h.source.push(A, Step::Ok(partial));

    let r = h.watcher.force_poll(A).await.unwrap();
    assert!(r.to_cancel.is_empty(), "bad record must not cancel member 1");
    assert_eq!(r.to_schedule.len(), 1);
    assert_eq!(h.watcher.list_pending().len(), 2);
    assert!(h.watcher.cached(A).unwrap().contains_key(&EntityId(1)));
}

#[tokio::test(start_paused = true)]
async fn startup_scan_polls_every_group_then_on_interval() {
    let mut list = WatchList::default();
    list.upsert(A, None);
    list.upsert(B, None);
    let h = Harness::looping(list);
    h.source.push(A, Step::Ok(snapshot(vec![(1, okay("x"))])));
    h.source.push(B, Step::Ok(snapshot(vec![(2, okay("y"))])));

    assert_eq!(h.watcher.start().unwrap(), 2);
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(h.source.calls(A), 1);
    assert_eq!(h.source.calls(B), 1);

    tokio::time::sleep(Duration::from_secs(300)).await;
    settle().await;
    assert_eq!(h.source.calls(A), 2);
    assert_eq!(h.source.calls(B), 2);

    h.watcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_group_waits_for_initial_delay() {
    let mut list = WatchList::default();
    list.idle_users.insert(EntityId(77));
    let h = Harness::looping(list);
    h.source.push(
        GroupId::IdleWatch,
        Step::Ok(snapshot(vec![(77, presence("U77", "Online"))])),
    );

    h.watcher.start().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(h.source.calls(GroupId::IdleWatch), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(h.source.calls(GroupId::IdleWatch), 1);

    h.watcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_group_backs_off_alone() {
    let mut list = WatchList::default();
    list.upsert(A, None);
    list.upsert(B, None);
    let h = Harness::looping(list);
    h.source.push(A, Step::RateLimited);
    h.source.push(A, Step::Ok(snapshot(vec![(1, okay("x"))])));
    h.source.push(B, Step::Ok(snapshot(vec![(2, okay("y"))])));

    h.watcher.start().unwrap();
    // Scan at t=0, ticks at 300 and 600; A skips the tick at 300.
    tokio::time::sleep(Duration::from_secs(650)).await;
    settle().await;
    assert_eq!(h.source.calls(A), 2);
    assert_eq!(h.source.calls(B), 3);

    h.watcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_polling() {
    let mut list = WatchList::default();
    list.upsert(A, None);
    let h = Harness::looping(list);
    h.source.push(A, Step::Ok(snapshot(vec![(1, okay("x"))])));

    h.watcher.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    h.watcher.shutdown().await;

    tokio::time::sleep(Duration::from_secs(1_000)).await;
    settle().await;
    assert_eq!(h.source.calls(A), 1);
    assert!(matches!(
        h.watcher.force_poll(A).await,
        Err(WatchError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn tick_during_running_poll_is_skipped() {
    let mut list = WatchList::default();
    list.upsert(A, None);
    let h = Harness::looping(list);
    h.source.push(A, Step::Ok(snapshot(vec![(1, okay("x"))])));

    h.watcher.start().unwrap();
    tokio::time::sleep(Duration::from_secs(295)).await;
    settle().await;
    assert_eq!(h.source.calls(A), 1);

    let gate = Arc::new(Notify::new());
    h.source.push(
        A,
        Step::Gated(Arc::clone(&gate), snapshot(vec![(1, okay("x"))])),
    );
    let watcher = h.watcher.clone();
    let forced = tokio::spawn(async move { watcher.force_poll(A).await });
    settle().await;
    assert_eq!(h.source.calls(A), 2);

    // The loop's tick at 300s lands while the forced poll holds the group.
    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(h.source.calls(A), 2, "tick must be skipped, not queued");

    gate.notify_one();
    assert!(forced.await.unwrap().is_ok());
    settle().await;
    assert_eq!(h.source.calls(A), 2);

    tokio::time::sleep(Duration::from_secs(300)).await;
    settle().await;
    assert_eq!(h.source.calls(A), 3);

    h.watcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hung_fetch_times_out_and_keeps_cache() {
    let h = Harness::manual();
    h.watcher.watch(A, None).unwrap();
    h.source
        .push(A, Step::Ok(snapshot(vec![(1, hospitalized("One", 500))])));
    h.watcher.force_poll(A).await.unwrap();
    let cached = h.watcher.cached(A).unwrap();
    let pending = h.watcher.list_pending();

    h.source.push(A, Step::Hang);
    let started = tokio::time::Instant::now();
    let err = h.watcher.force_poll(A).await.unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, WatchError::SourceUnavailable(_)), "got {err}");
    assert!(err.to_string().contains("timed out"));
    assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
    assert_eq!(h.watcher.cached(A).unwrap(), cached);
    assert_eq!(h.watcher.list_pending(), pending);

    // The group is free again for the next poll.
    assert!(h.watcher.force_poll(A).await.unwrap().is_noop());
}
