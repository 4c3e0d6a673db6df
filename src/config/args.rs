//! Types and functions for parsing & validating CLI arguments.

use std::path::{Path, PathBuf};

use clap::Parser;
use error_stack::{report, Report, Result};
use getset::Getters;

use crate::ext::error_stack::{DescribeContext, ErrorHelper};
use crate::ext::result::{WrapErr, WrapOk};

/// Errors that are possibly surfaced during validation of config values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The data root could not be determined.
    #[error("locate data root")]
    DataRootLocation,

    /// The data root does not look like an initialized arcyd instance.
    #[error("data root is not initialized")]
    DataRootNotInitialized,
}

/// Environment variable overriding the default data root.
pub const DATA_ROOT_VAR: &str = "ARCYD_DATA_ROOT";

/// Base arguments, used in most arcyd subcommands.
/// The "Raw" prefix indicates that this is the initial parsed value before any validation.
#[derive(Debug, Clone, Parser)]
pub struct RawDataRootArgs {
    /// The arcyd data root: the directory holding configuration, working
    /// copies and runtime state.
    ///
    /// If unset, the `ARCYD_DATA_ROOT` environment variable is consulted,
    /// then `~/.arcyd`.
    #[arg(long)]
    data_root: Option<PathBuf>,
}

impl RawDataRootArgs {
    /// Validate the raw args, requiring an initialized data root.
    pub fn validate(self) -> Result<DataRoot, Error> {
        let root = self.validate_init()?;
        if !root.config_file().exists() {
            return report!(Error::DataRootNotInitialized)
                .wrap_err()
                .describe_lazy(|| format!("data root: '{}'", root.path().display()))
                .help("run 'arcyd init' to initialize a data root first");
        }
        Ok(root)
    }

    /// Validate the raw args for `init`: resolve the location but don't
    /// require it to be initialized yet.
    pub fn validate_init(self) -> Result<DataRoot, Error> {
        let path = if let Some(provided) = self.data_root {
            provided
        } else if let Some(from_env) = std::env::var_os(DATA_ROOT_VAR) {
            PathBuf::from(from_env)
        } else {
            dirs::home_dir()
                .map(|home| home.join(".arcyd"))
                .ok_or_else(|| Report::new(Error::DataRootLocation))
                .help("set the --data-root argument or the ARCYD_DATA_ROOT variable")?
        };
        DataRoot { path }.wrap_ok()
    }
}

/// The validated data root, and the layout of everything inside it.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct DataRoot {
    /// The directory everything lives under.
    #[getset(get = "pub")]
    path: PathBuf,
}

impl DataRoot {
    /// Build a data root at an explicit path, for tests and tools.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The engine tuning file.
    pub fn config_file(&self) -> PathBuf {
        self.path.join("config.yaml")
    }

    /// Directory of review-service instance configs.
    pub fn phabricators_dir(&self) -> PathBuf {
        self.path.join("phabricators")
    }

    /// Directory of repository-host configs.
    pub fn repohosts_dir(&self) -> PathBuf {
        self.path.join("repohosts")
    }

    /// Directory of repository descriptor configs.
    pub fn repositories_dir(&self) -> PathBuf {
        self.path.join("repositories")
    }

    /// Directory of managed working copies.
    pub fn working_copies_dir(&self) -> PathBuf {
        self.path.join("var").join("repos")
    }

    /// The working copy for one repository.
    pub fn working_copy(&self, repo_name: &str) -> PathBuf {
        self.working_copies_dir().join(repo_name)
    }

    /// The pid file of the running daemon.
    pub fn pid_file(&self) -> PathBuf {
        self.path.join("var").join("pid")
    }

    /// Requests graceful shutdown when created.
    pub fn kill_file(&self) -> PathBuf {
        self.command_dir().join("killfile")
    }

    /// Requests an engine reset when created.
    pub fn reset_file(&self) -> PathBuf {
        self.command_dir().join("resetfile")
    }

    /// Pauses the engine while present.
    pub fn pause_file(&self) -> PathBuf {
        self.command_dir().join("pausefile")
    }

    fn command_dir(&self) -> PathBuf {
        self.path.join("var").join("command")
    }

    /// Directory of log files.
    pub fn log_dir(&self) -> PathBuf {
        self.path.join("var").join("log")
    }

    /// The structured debug log.
    pub fn debug_log(&self) -> PathBuf {
        self.log_dir().join("debug")
    }

    /// Default location of the status snapshot.
    pub fn status_file(&self) -> PathBuf {
        self.path.join("var").join("status.json")
    }

    /// Persisted url-watcher observations.
    pub fn url_watcher_file(&self) -> PathBuf {
        self.path.join("var").join("url-watcher.json")
    }
}

impl AsRef<Path> for DataRoot {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}
