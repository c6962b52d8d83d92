//! Torn API v2 snapshot source.
//!
//! Factions are fetched in one request (`/v2/faction/{id}/members`); the
//! idle-watch group is fetched one profile per watched user
//! (`/v2/user/{id}?selections=profile`).
//!
//! The API key travels in the query string, so every error message built
//! here strips the request URL.

use crate::error::{Result, WatchError};
use crate::model::{EntityId, GroupId, InvalidEntry, Snapshot, StateDescriptor};
use crate::source::{SnapshotRequest, SnapshotSource};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

/// Default Torn API root.
pub const TORN_API_BASE: &str = "https://api.torn.com";

/// Torn error code for "Too many requests".
const TORN_ERROR_TOO_MANY_REQUESTS: u64 = 5;

/// Snapshot source backed by the Torn HTTP API.
pub struct TornSource {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    id: Option<u64>,
    name: Option<String>,
    status: Option<StatusRecord>,
}

#[derive(Debug, Deserialize)]
struct StatusRecord {
    state: Option<String>,
    until: Option<i64>,
}

impl TornSource {
    pub fn new(api_key: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: TORN_API_BASE.to_owned(),
            client,
        }
    }

    /// Point the source at a different API root (used by tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn endpoint(&self, path: &str, extra: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|e| WatchError::Config(format!("invalid Torn base URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in extra {
                query.append_pair(key, value);
            }
            query.append_pair("striptags", "true");
            query.append_pair("key", &self.api_key);
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value> {
        let response = self.client.get(url).send().await.map_err(|e| {
            WatchError::SourceUnavailable(format!("torn request failed: {}", e.without_url()))
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(WatchError::RateLimited(format!("torn responded {status}")));
        }
        if !status.is_success() {
            return Err(WatchError::SourceUnavailable(format!(
                "torn responded {status}"
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            WatchError::SourceUnavailable(format!("torn body unreadable: {}", e.without_url()))
        })?;
        check_api_error(&body)?;
        Ok(body)
    }

    async fn fetch_faction(&self, faction_id: u64) -> Result<Snapshot> {
        let url = self.endpoint(&format!("/v2/faction/{faction_id}/members"), &[])?;
        let body = self.get_json(url).await?;
        let members = body
            .get("members")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                WatchError::SourceUnavailable(format!(
                    "faction {faction_id} response has no members array"
                ))
            })?;

        let mut snapshot = Snapshot::default();
        for raw in members {
            match parse_member(raw) {
                Ok((id, descriptor)) => {
                    snapshot.entities.insert(id, descriptor);
                }
                Err(entry) => snapshot.invalid.push(entry),
            }
        }
        debug!(
            faction = faction_id,
            members = snapshot.entities.len(),
            invalid = snapshot.invalid.len(),
            "fetched faction members"
        );
        Ok(snapshot)
    }

    async fn fetch_user(
        &self,
        user: EntityId,
    ) -> Result<std::result::Result<StateDescriptor, InvalidEntry>> {
        let url = self.endpoint(
            &format!("/v2/user/{}", user.0),
            &[("selections", "profile")],
        )?;
        let body = self.get_json(url).await?;
        // v2 nests the profile; older responses put it at the root.
        let profile = body.get("profile").unwrap_or(&body);
        Ok(parse_presence(user, profile))
    }

    async fn fetch_idle_watch(&self, members: &[EntityId]) -> Result<Snapshot> {
        let results = join_all(members.iter().map(|id| self.fetch_user(*id))).await;

        let mut snapshot = Snapshot::default();
        let mut last_failure = None;
        for (id, result) in members.iter().zip(results) {
            match result {
                Ok(Ok(descriptor)) => {
                    snapshot.entities.insert(*id, descriptor);
                }
                Ok(Err(entry)) => snapshot.invalid.push(entry),
                Err(e) if e.is_rate_limited() => return Err(e),
                Err(e) => {
                    warn!(user = %id, error = %e, "idle-watch fetch failed for user");
                    snapshot.invalid.push(InvalidEntry {
                        entity: Some(*id),
                        reason: e.to_string(),
                    });
                    last_failure = Some(e);
                }
            }
        }

        if snapshot.entities.is_empty() {
            if let Some(e) = last_failure {
                return Err(e);
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl SnapshotSource for TornSource {
    async fn fetch_snapshot(&self, request: &SnapshotRequest) -> Result<Snapshot> {
        match request.group {
            GroupId::Faction(faction_id) => self.fetch_faction(faction_id).await,
            GroupId::IdleWatch => self.fetch_idle_watch(&request.members).await,
        }
    }
}

fn check_api_error(body: &Value) -> Result<()> {
    let Some(error) = body.get("error") else {
        return Ok(());
    };
    let code = error.get("code").and_then(Value::as_u64).unwrap_or_default();
    let message = error
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    if code == TORN_ERROR_TOO_MANY_REQUESTS {
        Err(WatchError::RateLimited(format!("torn error {code}: {message}")))
    } else {
        Err(WatchError::SourceUnavailable(format!(
            "torn error {code}: {message}"
        )))
    }
}

fn parse_member(raw: &Value) -> std::result::Result<(EntityId, StateDescriptor), InvalidEntry> {
    let entity = raw.get("id").and_then(Value::as_u64).map(EntityId);
    let record: MemberRecord = serde_json::from_value(raw.clone()).map_err(|e| InvalidEntry {
        entity,
        reason: format!("unparseable member: {e}"),
    })?;

    let id = record.id.map(EntityId).ok_or_else(|| InvalidEntry {
        entity: None,
        reason: "member has no id".to_owned(),
    })?;
    let status = record.status.ok_or_else(|| InvalidEntry {
        entity: Some(id),
        reason: "member has no status".to_owned(),
    })?;
    let state = status.state.ok_or_else(|| InvalidEntry {
        entity: Some(id),
        reason: "member status has no state".to_owned(),
    })?;

    let label = record.name.unwrap_or_else(|| id.to_string());
    let release_at = status.until.and_then(epoch_secs);
    Ok((id, StateDescriptor::hospital(label, state, release_at)))
}

fn parse_presence(
    user: EntityId,
    profile: &Value,
) -> std::result::Result<StateDescriptor, InvalidEntry> {
    let status = profile
        .get("last_action")
        .and_then(|a| a.get("status"))
        .and_then(Value::as_str)
        .ok_or_else(|| InvalidEntry {
            entity: Some(user),
            reason: "profile has no last_action.status".to_owned(),
        })?;
    let label = profile
        .get("name")
        .and_then(Value::as_str)
        .map_or_else(|| user.to_string(), str::to_owned);
    Ok(StateDescriptor::presence(label, status))
}

fn epoch_secs(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}
