//! Tornwatch: poll-and-alert engine for Torn faction hospital releases and
//! watched players' activity.
//!
//! # Architecture
//!
//! Every watched group (one faction, or the global idle-watch set) is polled
//! on its own loop:
//! - **Source**: fetches a snapshot of the group from the Torn API
//! - **Cache**: holds the last successful snapshot per group
//! - **Diff**: compares previous and fresh snapshots into timer mutations
//! - **Timers**: one cancellable one-shot alert per entity
//! - **Notifier**: re-checks a fired alert and delivers it through a sink
//! - **Watcher**: ties the above together and exposes watch/unwatch/force-poll

pub mod cache;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod diff;
pub mod error;
pub mod http;
pub mod model;
pub mod notifier;
pub mod poller;
pub mod source;
pub mod timers;
pub mod watch_dirs;
pub mod watcher;
pub mod watchlist;

pub use config::WatchConfig;
pub use error::{Result, WatchError};
pub use model::{Destination, EntityId, GroupId, PendingAlert, StateDescriptor};
pub use watcher::{Watcher, WatcherParts};
