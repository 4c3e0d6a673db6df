//! Types and functions for parsing & validating the on-disk configuration.
//!
//! Everything is YAML under the data root: `config.yaml` tunes the engine,
//! `phabricators/<name>.yaml` describes review-service instances,
//! `repohosts/<name>.yaml` describes where repositories are cloned from, and
//! `repositories/<name>.yaml` describes each managed repository. Raw carriers
//! deny unknown fields so typos fail loudly at startup instead of silently
//! configuring nothing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;
use delegate::delegate;
use derive_new::new;
use error_stack::{report, Report, Result};
use getset::{CopyGetters, Getters};
use secrecy::Secret;
use serde::Deserialize;
use url::Url;

use crate::config::args::DataRoot;
use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::{WrapErr, WrapOk};

/// Errors that are possibly surfaced during validation of config values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A config file could not be read.
    #[error("read config file")]
    ReadFile,

    /// A config file could not be parsed.
    #[error("parse config file")]
    ParseFile,

    /// A parsed value failed validation.
    #[error("validate config value")]
    Validate,

    /// A repository references an unknown phabricator or repohost.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),
}

/// Engine tuning as parsed from `config.yaml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineConfig {
    status_path: Option<PathBuf>,
    sleep_interval: Option<String>,
    max_workers: Option<usize>,
    max_overrunnable: Option<usize>,
    max_diff_size: Option<ByteSize>,
    leader_election: Option<RawLeaderElection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLeaderElection {
    endpoint: String,
    service: Option<String>,
}

/// Validated engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct EngineConfig {
    /// Where the reporter writes its JSON snapshot.
    #[getset(get = "pub")]
    status_path: PathBuf,

    /// Sleep between engine cycles.
    #[getset(get_copy = "pub")]
    sleep_interval: Duration,

    /// Worker threads in the repository pool.
    #[getset(get_copy = "pub")]
    max_workers: usize,

    /// How many slow repositories may overrun into the next cycle.
    #[getset(get_copy = "pub")]
    max_overrunnable: usize,

    /// Byte budget for review diffs, measured as UTF-8.
    #[getset(get_copy = "pub")]
    max_diff_size: ByteSize,

    /// Leader-election settings, when enabled.
    #[getset(get = "pub")]
    leader_election: Option<LeaderElectionConfig>,
}

/// Validated leader-election settings.
#[derive(Debug, Clone, PartialEq, Eq, Getters, new)]
#[getset(get = "pub")]
pub struct LeaderElectionConfig {
    /// Base URL of the key/value store's HTTP API.
    endpoint: Url,

    /// Service name the lock is keyed under.
    service: String,
}

impl EngineConfig {
    fn validate(raw: RawEngineConfig, root: &DataRoot) -> Result<Self, Error> {
        let sleep_interval = match raw.sleep_interval {
            Some(text) => humantime::parse_duration(&text)
                .context(Error::Validate)
                .describe_lazy(|| format!("parse 'sleep_interval' value '{text}'"))
                .help("use a duration such as '60s' or '2m 30s'")?,
            None => Duration::from_secs(60),
        };
        let max_workers = raw.max_workers.unwrap_or(8);
        if max_workers == 0 {
            return report!(Error::Validate)
                .wrap_err()
                .describe("'max_workers' must be at least 1");
        }
        let max_overrunnable = raw.max_overrunnable.unwrap_or(max_workers / 2);
        if max_overrunnable >= max_workers {
            return report!(Error::Validate)
                .wrap_err()
                .describe("'max_overrunnable' must be below 'max_workers'");
        }
        let leader_election = match raw.leader_election {
            None => None,
            Some(raw) => {
                let endpoint = Url::parse(&raw.endpoint)
                    .context(Error::Validate)
                    .describe_lazy(|| {
                        format!("parse 'leader_election.endpoint' value '{}'", raw.endpoint)
                    })?;
                Some(LeaderElectionConfig {
                    endpoint,
                    service: raw.service.unwrap_or_else(|| "arcyd".to_owned()),
                })
            }
        };
        Ok(Self {
            status_path: raw.status_path.unwrap_or_else(|| root.status_file()),
            sleep_interval,
            max_workers,
            max_overrunnable,
            max_diff_size: raw.max_diff_size.unwrap_or(ByteSize::mib(1)),
            leader_election,
        })
    }
}

/// A review-service instance as parsed from `phabricators/<name>.yaml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPhabricator {
    instance_uri: String,
    api_token: Secret<String>,
    review_url_format: Option<String>,
}

/// A validated review-service instance.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct PhabricatorConfig {
    /// Name of this instance in repo configs.
    name: String,

    /// Base URL of the instance.
    instance_uri: Url,

    /// Conduit API token.
    api_token: Secret<String>,

    /// Format string for browse URLs, `{id}` substituted.
    review_url_format: Option<String>,
}

/// A repository host as parsed from `repohosts/<name>.yaml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRepohost {
    clone_url_format: String,
    snoop_url_format: Option<String>,
    #[serde(default)]
    admin_emails: Vec<String>,
}

/// A repository as parsed from `repositories/<name>.yaml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRepo {
    phabricator: String,
    repohost: String,
    #[serde(default)]
    human_name: Option<String>,
    #[serde(default)]
    admin_emails: Vec<String>,
    #[serde(default)]
    snoop_url: Option<String>,
    #[serde(default)]
    remote: Option<String>,
}

/// A validated repository descriptor; immutable per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Getters, new)]
#[getset(get = "pub")]
pub struct RepoDescriptor {
    /// Machine name; also the working-copy directory name.
    name: String,

    /// Human-facing name for reports.
    human_name: String,

    /// Local working copy location.
    working_copy: PathBuf,

    /// URL the working copy is cloned from.
    clone_url: String,

    /// Git remote name used in the working copy.
    remote: String,

    /// The review-service instance this repository reports to.
    phabricator: String,

    /// Who to tell when this repository misbehaves.
    admin_emails: Vec<String>,

    /// Cheap endpoint that changes when the remote changes.
    snoop_url: Option<Url>,
}

/// The validated set of managed repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq, new)]
pub struct Repositories(Vec<RepoDescriptor>);

impl Repositories {
    delegate! {
        to self.0 {
            /// Iterate over configured repositories.
            pub fn iter(&self) -> impl Iterator<Item = &RepoDescriptor>;

            /// Number of configured repositories.
            pub fn len(&self) -> usize;

            /// Whether no repositories are configured.
            pub fn is_empty(&self) -> bool;
        }
    }
}

/// The entire validated configuration.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct Config {
    /// Engine tuning.
    engine: EngineConfig,

    /// Review-service instances by name.
    phabricators: BTreeMap<String, PhabricatorConfig>,

    /// Managed repositories.
    repositories: Repositories,
}

impl Config {
    /// Load and validate everything under the data root.
    pub fn load(root: &DataRoot) -> Result<Self, Error> {
        let engine = if root.config_file().exists() {
            let raw: RawEngineConfig = parse_yaml(&root.config_file())?;
            EngineConfig::validate(raw, root)?
        } else {
            EngineConfig::validate(RawEngineConfig::default(), root)?
        };

        let mut phabricators = BTreeMap::new();
        for (name, path) in named_yaml_files(&root.phabricators_dir())? {
            let raw: RawPhabricator = parse_yaml(&path)?;
            let instance_uri = Url::parse(&raw.instance_uri)
                .context(Error::Validate)
                .describe_lazy(|| format!("parse 'instance_uri' of phabricator '{name}'"))?;
            phabricators.insert(
                name.clone(),
                PhabricatorConfig {
                    name,
                    instance_uri,
                    api_token: raw.api_token,
                    review_url_format: raw.review_url_format,
                },
            );
        }

        let mut repohosts = BTreeMap::new();
        for (name, path) in named_yaml_files(&root.repohosts_dir())? {
            let raw: RawRepohost = parse_yaml(&path)?;
            repohosts.insert(name, raw);
        }

        let mut repositories = Vec::new();
        for (name, path) in named_yaml_files(&root.repositories_dir())? {
            let raw: RawRepo = parse_yaml(&path)?;
            repositories.push(Self::validate_repo(root, name, raw, &phabricators, &repohosts)?);
        }

        Ok(Self {
            engine,
            phabricators,
            repositories: Repositories(repositories),
        })
    }

    fn validate_repo(
        root: &DataRoot,
        name: String,
        raw: RawRepo,
        phabricators: &BTreeMap<String, PhabricatorConfig>,
        repohosts: &BTreeMap<String, RawRepohost>,
    ) -> Result<RepoDescriptor, Error> {
        if !phabricators.contains_key(&raw.phabricator) {
            return report!(Error::UnresolvedReference(format!(
                "repository '{name}' references unknown phabricator '{}'",
                raw.phabricator
            )))
            .wrap_err()
            .help("add the instance with 'arcyd add-phabricator' first");
        }
        let repohost = repohosts.get(&raw.repohost).ok_or_else(|| {
            Report::new(Error::UnresolvedReference(format!(
                "repository '{name}' references unknown repohost '{}'",
                raw.repohost
            )))
        })
        .help("add the host with 'arcyd add-repohost' first")?;

        let clone_url = substitute_repo(&repohost.clone_url_format, &name);
        let snoop_url = match raw
            .snoop_url
            .or_else(|| {
                repohost
                    .snoop_url_format
                    .as_ref()
                    .map(|format| substitute_repo(format, &name))
            }) {
            Some(text) => Url::parse(&text)
                .context(Error::Validate)
                .describe_lazy(|| format!("parse snoop url of repository '{name}'"))
                .map(Some)?,
            None => None,
        };

        let mut admin_emails = repohost.admin_emails.clone();
        admin_emails.extend(raw.admin_emails);

        RepoDescriptor {
            human_name: raw.human_name.unwrap_or_else(|| name.clone()),
            working_copy: root.working_copy(&name),
            clone_url,
            remote: raw.remote.unwrap_or_else(|| "origin".to_owned()),
            phabricator: raw.phabricator,
            admin_emails,
            snoop_url,
            name,
        }
        .wrap_ok()
    }
}

fn substitute_repo(format: &str, repo_name: &str) -> String {
    format.replace("{repo}", repo_name)
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T, Error> {
    let content = std::fs::read_to_string(path)
        .context(Error::ReadFile)
        .describe_lazy(|| format!("read '{}'", path.display()))?;
    serde_yaml::from_str(&content)
        .context(Error::ParseFile)
        .describe_lazy(|| format!("parse '{}'", path.display()))
        .help("compare the file against the examples in the documentation")
}

/// Enumerate `<name>.yaml` files in `dir`, which may be absent.
fn named_yaml_files(dir: &std::path::Path) -> Result<Vec<(String, PathBuf)>, Error> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir)
        .context(Error::ReadFile)
        .describe_lazy(|| format!("list '{}'", dir.display()))?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.context(Error::ReadFile)?;
        let path = entry.path();
        if path.extension().map(|ext| ext == "yaml").unwrap_or(false) {
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                found.push((stem.to_owned(), path.clone()));
            }
        }
    }
    found.sort();
    Ok(found)
}
