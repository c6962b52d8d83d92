//! Diff engine: turns a `(previous, fresh)` snapshot pair into timer
//! mutations and immediate transitions.
//!
//! [`reconcile`] is pure. It reads the group's previous mapping, the fresh
//! snapshot, and the target times of alerts already armed for the group
//! (pending, or fired and not yet retired), and returns everything the caller must apply: alerts to (re)schedule,
//! alerts to cancel, immediate transitions to emit, and the mapping that
//! becomes the group's new cache entry.
//!
//! Two alerting modes share the engine:
//!
//! - [`Trigger::Scheduled`]: alert `lead_window` before an active entity's
//!   target time. Unchanged entities are left alone, a changed target time
//!   replaces the pending alert, and an entity that stops qualifying has its
//!   alert cancelled.
//! - [`Trigger::OnChange`]: every change of the raw status value between
//!   two polls is an immediate transition. An entity seen for the first time
//!   only establishes a baseline.

use crate::model::{EntityId, Snapshot, StateDescriptor, TrackedGroup};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// When an entity is alert-worthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fire `lead_window` before the entity's target time.
    Scheduled { lead_window: Duration },
    /// Fire immediately whenever the status value changes.
    OnChange,
}

/// Per-use-case alerting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    pub trigger: Trigger,
}

impl AlertPolicy {
    #[must_use]
    pub fn scheduled(lead_window: Duration) -> Self {
        Self {
            trigger: Trigger::Scheduled { lead_window },
        }
    }

    #[must_use]
    pub fn on_change() -> Self {
        Self {
            trigger: Trigger::OnChange,
        }
    }
}

/// A future alert to arm (replacing any existing one for the entity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub entity: EntityId,
    pub label: String,
    pub target_time: DateTime<Utc>,
    pub alert_at: DateTime<Utc>,
    /// Time from the reconciliation's `now` until `alert_at`.
    pub delay: Duration,
}

/// A status change to notify about right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub entity: EntityId,
    pub label: String,
    pub from: String,
    pub to: String,
}

/// Everything one poll decided for a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_schedule: Vec<ScheduleRequest>,
    /// Entities whose pending or already-fired alert is retired.
    pub to_cancel: Vec<EntityId>,
    pub immediate: Vec<Transition>,
    /// The group's cache entry after this poll.
    pub next_state: TrackedGroup,
}

impl Reconciliation {
    /// Returns `true` when the poll requires no timer or notification work.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_schedule.is_empty() && self.to_cancel.is_empty() && self.immediate.is_empty()
    }
}

/// Diff a fresh snapshot against the previous one.
///
/// `armed` holds, per entity of this group, the target time of the alert
/// that is pending or has already fired for it. An entity whose fresh target
/// matches is left alone, so a target time is alerted at most once no matter
/// how the wall clock compares with the timer that fired.
///
/// Malformed entries in `fresh` that can still be identified keep their
/// previous descriptor and pending alert untouched.
#[must_use]
pub fn reconcile(
    policy: &AlertPolicy,
    previous: &TrackedGroup,
    fresh: &Snapshot,
    armed: &HashMap<EntityId, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Reconciliation {
    let skipped: BTreeSet<EntityId> = fresh
        .invalid_ids()
        .filter(|id| !fresh.entities.contains_key(id))
        .collect();

    let mut next_state = fresh.entities.clone();
    for id in &skipped {
        if let Some(prev) = previous.get(id) {
            next_state.insert(*id, prev.clone());
        }
    }

    let mut result = match policy.trigger {
        Trigger::Scheduled { lead_window } => {
            reconcile_scheduled(lead_window, fresh, armed, &skipped, now)
        }
        Trigger::OnChange => reconcile_on_change(previous, fresh, armed, &skipped),
    };
    result.next_state = next_state;
    result
}

fn reconcile_scheduled(
    lead_window: Duration,
    fresh: &Snapshot,
    armed: &HashMap<EntityId, DateTime<Utc>>,
    skipped: &BTreeSet<EntityId>,
    now: DateTime<Utc>,
) -> Reconciliation {
    let lead = TimeDelta::from_std(lead_window).unwrap_or(TimeDelta::MAX);
    let mut to_schedule = Vec::new();
    let mut to_cancel = BTreeSet::new();

    for (id, descriptor) in &fresh.entities {
        let existing = armed.get(id).copied();
        let Some(target_time) = alertable_target(descriptor) else {
            if existing.is_some() {
                to_cancel.insert(*id);
            }
            continue;
        };

        if existing == Some(target_time) {
            continue;
        }

        let alert_at = target_time
            .checked_sub_signed(lead)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match (alert_at - now).to_std() {
            Ok(delay) if !delay.is_zero() => to_schedule.push(ScheduleRequest {
                entity: *id,
                label: descriptor.label.clone(),
                target_time,
                alert_at,
                delay,
            }),
            // Alert window already missed: drop, and retire any alert
            // that was timed against the old target.
            _ => {
                if existing.is_some() {
                    to_cancel.insert(*id);
                }
            }
        }
    }

    for id in armed.keys() {
        if !fresh.entities.contains_key(id) && !skipped.contains(id) {
            to_cancel.insert(*id);
        }
    }

    Reconciliation {
        to_schedule,
        to_cancel: to_cancel.into_iter().collect(),
        immediate: Vec::new(),
        next_state: TrackedGroup::new(),
    }
}

fn reconcile_on_change(
    previous: &TrackedGroup,
    fresh: &Snapshot,
    armed: &HashMap<EntityId, DateTime<Utc>>,
    skipped: &BTreeSet<EntityId>,
) -> Reconciliation {
    let immediate = fresh
        .entities
        .iter()
        .filter_map(|(id, descriptor)| {
            let prev = previous.get(id)?;
            (prev.status != descriptor.status).then(|| Transition {
                entity: *id,
                label: descriptor.label.clone(),
                from: prev.status.clone(),
                to: descriptor.status.clone(),
            })
        })
        .collect();

    // On-change groups never arm timers; anything pending is stale.
    let mut to_cancel: Vec<EntityId> = armed
        .keys()
        .filter(|id| !skipped.contains(id))
        .copied()
        .collect();
    to_cancel.sort();

    Reconciliation {
        to_schedule: Vec::new(),
        to_cancel,
        immediate,
        next_state: TrackedGroup::new(),
    }
}

fn alertable_target(descriptor: &StateDescriptor) -> Option<DateTime<Utc>> {
    if descriptor.is_alertable() {
        descriptor.target_time
    } else {
        None
    }
}
