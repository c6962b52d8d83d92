//! Shared HTTP client construction for the Torn API and Discord.

use crate::error::WatchError;
use std::time::Duration;

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("tornwatch/", env!("CARGO_PKG_VERSION"));

/// Build a [`reqwest::Client`] whose requests time out after `timeout`.
///
/// # Errors
///
/// Returns [`WatchError::Config`] if the client cannot be constructed.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, WatchError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| WatchError::Config(format!("failed to build HTTP client: {e}")))
}
