//! Filesystem helpers: atomic writes and the data-root lock file.
//!
//! Structural mutations of the on-disk configuration (adding or removing a
//! repository) happen under [`with_config_lock`]; normal engine cycles never
//! take the lock.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use error_stack::{Report, Result};
use tempfile::NamedTempFile;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};

/// Errors surfaced from filesystem helpers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An underlying IO operation failed.
    #[error("underlying IO operation")]
    IO,

    /// The config lock is already held.
    #[error("config directory is locked")]
    Locked,
}

/// Write `content` to `path` such that observers see either the old content
/// or the new content, never a partial file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), Error> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .context(Error::IO)
        .describe_lazy(|| format!("create parent directory '{}'", parent.display()))?;

    let mut file = NamedTempFile::new_in(parent)
        .context(Error::IO)
        .describe("create temporary file for atomic write")?;
    file.write_all(content)
        .context(Error::IO)
        .describe_lazy(|| format!("stage content for '{}'", path.display()))?;
    file.persist(path)
        .map(|_| ())
        .map_err(|err| err.error)
        .context(Error::IO)
        .describe_lazy(|| format!("atomically replace '{}'", path.display()))
}

/// Read a file to a string with the standard error context attached.
pub fn read_to_string(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path)
        .context(Error::IO)
        .describe_lazy(|| format!("read '{}'", path.display()))
}

/// A held lock on the config directory. Released on drop.
#[derive(Debug)]
pub struct ConfigLock {
    path: PathBuf,
}

impl ConfigLock {
    fn acquire(root: &Path) -> Result<Self, Error> {
        let path = root.join("var").join("run").join("lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(Error::IO)
                .describe_lazy(|| format!("create lock directory '{}'", parent.display()))?;
        }
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Report::new(Error::Locked))
                    .describe_lazy(|| format!("lock file already exists at '{}'", path.display()))
                    .help(
                        "another arcyd instance may be mutating the config; \
                         if you are certain none is running, delete the lock file",
                    );
            }
            Err(err) => return Err(err).context(Error::IO),
        };
        // The holder's pid, for humans inspecting a stale lock.
        let _ = write!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Run `action` while holding the data root's config lock.
pub fn with_config_lock<T>(
    root: &Path,
    action: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    let lock = ConfigLock::acquire(root)?;
    let result = action();
    drop(lock);
    result
}
