//! Leader election through a session-bound lock in an external key/value
//! store (consul-style HTTP API).
//!
//! The daemon creates a session named after the service, then tries to
//! acquire `kv/<service>/leader` bound to that session with a compare-and-swap
//! PUT. Losing the race means polling the key until the lock is released; the
//! engine starts only once the session holds the lock.

use std::time::Duration;

use error_stack::{report, Result};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::config::LeaderElectionConfig;
use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};

/// Errors surfaced while contending for leadership.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key/value store could not be reached.
    #[error("reach the key/value store")]
    Transport,

    /// The store answered with something unexpected.
    #[error("unexpected response from the key/value store")]
    Protocol,
}

/// Honors the store's lock-delay between acquisition attempts.
const ACQUIRE_BACKOFF: Duration = Duration::from_secs(5);

/// The value stored under the leader key; only the binding session matters.
const LEADER_VALUE: &str = "I am the leader";

/// A held leadership session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderSession {
    /// The session id binding the lock.
    pub id: String,
}

/// Contends for leadership, blocking until this process holds the lock.
pub fn contend(config: &LeaderElectionConfig) -> Result<LeaderSession, Error> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context(Error::Transport)
        .describe("construct http client for leader election")?;

    let session = create_session(&client, config)?;
    info!("created leadership session {}", session.id);

    loop {
        if try_acquire(&client, config, &session)? {
            info!("this instance is the leader");
            return Ok(session);
        }
        debug!("leader lock is held elsewhere; waiting");
        // There may be a lock-delay in effect; wait before retrying.
        std::thread::sleep(ACQUIRE_BACKOFF);
    }
}

fn endpoint(config: &LeaderElectionConfig, path: &str) -> Result<Url, Error> {
    config
        .endpoint()
        .join(path)
        .context(Error::Protocol)
        .describe_lazy(|| format!("build endpoint '{path}'"))
}

fn create_session(
    client: &reqwest::blocking::Client,
    config: &LeaderElectionConfig,
) -> Result<LeaderSession, Error> {
    let response: Value = client
        .put(endpoint(config, "v1/session/create")?)
        .json(&json!({ "Name": config.service() }))
        .send()
        .context(Error::Transport)
        .describe("create leadership session")?
        .error_for_status()
        .context(Error::Transport)?
        .json()
        .context(Error::Protocol)
        .describe("parse session-create response")?;

    response["ID"]
        .as_str()
        .map(|id| LeaderSession { id: id.to_owned() })
        .ok_or_else(|| report!(Error::Protocol))
        .describe("session-create response carried no ID")
        .help_lazy(|| format!("response was: {response}"))
}

fn try_acquire(
    client: &reqwest::blocking::Client,
    config: &LeaderElectionConfig,
    session: &LeaderSession,
) -> Result<bool, Error> {
    let path = format!("v1/kv/{}/leader?acquire={}", config.service(), session.id);
    let acquired: Value = client
        .put(endpoint(config, &path)?)
        .body(LEADER_VALUE)
        .send()
        .context(Error::Transport)
        .describe("acquire leader key")?
        .error_for_status()
        .context(Error::Transport)?
        .json()
        .context(Error::Protocol)
        .describe("parse acquire response")?;

    acquired
        .as_bool()
        .ok_or_else(|| report!(Error::Protocol))
        .describe_lazy(|| format!("acquire response was: {acquired}"))
}
