//! Cheap change detection for repository "snoop" URLs.
//!
//! Each managed repository may advertise an HTTP endpoint whose content
//! changes whenever the remote changes. Probing that endpoint is much cheaper
//! than a git fetch, so the engine consults the watcher first and may skip the
//! fetch entirely when nothing moved.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::time::Duration;

use error_stack::{Report, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ext::error_stack::{DescribeContext, IntoContext};

/// Errors surfaced by the watcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP probe failed outright.
    #[error("probe url")]
    Probe,

    /// Loading or storing the persisted observations failed.
    #[error("persist url observations")]
    Persist,
}

/// One observation of a URL: the response status and a digest of the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// HTTP status code of the last probe.
    pub status: u16,

    /// Hex SHA-256 of the response body.
    pub digest: String,
}

/// Issues HTTP probes on behalf of the watcher. Injected so tests can supply
/// canned responses.
pub trait UrlProbe: Send {
    /// Fetch the URL and describe what came back.
    fn probe(&self, url: &str) -> Result<Observation, Error>;
}

/// Probe implementation backed by a blocking HTTP client.
#[derive(Debug)]
pub struct HttpProbe {
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    /// Build a probe with a conservative timeout; snoop endpoints are
    /// supposed to be cheap.
    pub fn new() -> Result<Self, Error> {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context(Error::Probe)
            .describe("construct http client for snoop probes")
            .map(|client| Self { client })
    }
}

impl UrlProbe for HttpProbe {
    fn probe(&self, url: &str) -> Result<Observation, Error> {
        let response = self
            .client
            .get(url)
            .send()
            .context(Error::Probe)
            .describe_lazy(|| format!("probe '{url}'"))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .context(Error::Probe)
            .describe_lazy(|| format!("read body of '{url}'"))?;
        let digest = format!("{:x}", Sha256::digest(&body));
        Ok(Observation { status, digest })
    }
}

/// Tracks the last observation per URL and answers "has this changed?".
pub struct UrlWatcher {
    probe: Box<dyn UrlProbe>,
    results: BTreeMap<String, Observation>,
    visited: HashSet<String>,
}

impl UrlWatcher {
    /// Create an empty watcher using the provided probe.
    pub fn new(probe: Box<dyn UrlProbe>) -> Self {
        Self {
            probe,
            results: BTreeMap::new(),
            visited: HashSet::new(),
        }
    }

    /// Probe `url` and report whether it changed since the last observation.
    ///
    /// A URL counts as changed when there is no prior observation, the prior
    /// observation was an error status (>= 400), or the body digest differs.
    /// A failing probe also counts as changed: the engine must not skip
    /// fetches just because the snoop endpoint is down.
    pub fn peek_has_url_recently_changed(&mut self, url: &str) -> bool {
        let current = match self.probe.probe(url) {
            Ok(observation) => observation,
            Err(err) => {
                debug!("snoop probe failed, treating as changed: {err:?}");
                return true;
            }
        };
        let changed = match self.results.get(url) {
            None => true,
            Some(previous) => previous.status >= 400 || previous.digest != current.digest,
        };
        self.results.insert(url.to_owned(), current);
        changed
    }

    /// Record that the engine acted on this URL's repository this cycle.
    /// Unvisited entries belong to repositories that are no longer configured
    /// and are dropped by [`UrlWatcher::prune_unvisited`].
    pub fn mark_visited(&mut self, url: &str) {
        self.visited.insert(url.to_owned());
    }

    /// Drop observations for URLs that were never visited, then reset the
    /// visited set for the next round.
    pub fn prune_unvisited(&mut self) {
        let visited = std::mem::take(&mut self.visited);
        self.results.retain(|url, _| visited.contains(url));
    }

    /// Load persisted observations, replacing the current set.
    pub fn load(&mut self, stream: impl Read) -> Result<(), Error> {
        self.results = serde_json::from_reader(stream)
            .context(Error::Persist)
            .describe("parse persisted url observations")?;
        Ok(())
    }

    /// Persist the current observations.
    pub fn dump(&self, stream: impl Write) -> Result<(), Error> {
        serde_json::to_writer(stream, &self.results)
            .context(Error::Persist)
            .describe("serialize url observations")
    }
}

impl std::fmt::Debug for UrlWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlWatcher")
            .field("results", &self.results)
            .field("visited", &self.visited)
            .finish_non_exhaustive()
    }
}

/// Construct a report for probe failures in fakes and tests.
pub fn probe_error() -> Report<Error> {
    Report::new(Error::Probe)
}
