//! Single-instance guard: the pid file and the stop/restart protocol.
//!
//! At most one engine may run against a data root. The pid file records the
//! live instance; starting checks it, stopping writes the kill file and waits
//! for the old instance to act on it.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use error_stack::{report, Result};
use tracing::{debug, info};

use crate::config::DataRoot;
use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::WrapErr;

/// Errors surfaced by the guard.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another instance is already running against this data root.
    #[error("another arcyd instance is running (pid {0})")]
    AlreadyRunning(i32),

    /// The running instance did not stop within the allotted time.
    #[error("running instance (pid {0}) did not stop in time")]
    StopTimedOut(i32),

    /// An underlying IO operation failed.
    #[error("underlying IO operation")]
    IO,
}

/// How long `stop` waits for the running instance to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the old instance.
const STOP_POLL: Duration = Duration::from_millis(200);

/// Manages the pid file under a data root.
#[derive(Debug, Clone)]
pub struct InstanceGuard {
    pid_file: PathBuf,
    kill_file: PathBuf,
}

impl InstanceGuard {
    /// Build a guard for the given data root.
    pub fn new(root: &DataRoot) -> Self {
        Self {
            pid_file: root.pid_file(),
            kill_file: root.kill_file(),
        }
    }

    /// The pid recorded in the pid file, if any.
    pub fn recorded_pid(&self) -> Option<i32> {
        let content = std::fs::read_to_string(&self.pid_file).ok()?;
        content.trim().parse().ok()
    }

    /// Error out if a live instance holds this data root. A pid file whose
    /// process is gone is stale and is cleaned up.
    pub fn check_not_running(&self) -> Result<(), Error> {
        let Some(pid) = self.recorded_pid() else {
            return Ok(());
        };
        if process_is_alive(pid) {
            return report!(Error::AlreadyRunning(pid))
                .wrap_err()
                .describe_lazy(|| format!("pid file: '{}'", self.pid_file.display()))
                .help("use 'arcyd stop' to stop it, or 'arcyd restart'");
        }
        debug!("removing stale pid file for dead pid {pid}");
        let _ = std::fs::remove_file(&self.pid_file);
        Ok(())
    }

    /// Record this process as the running instance.
    pub fn write_pid(&self) -> Result<(), Error> {
        if let Some(parent) = self.pid_file.parent() {
            std::fs::create_dir_all(parent)
                .context(Error::IO)
                .describe_lazy(|| format!("create '{}'", parent.display()))?;
        }
        std::fs::write(&self.pid_file, format!("{}\n", std::process::id()))
            .context(Error::IO)
            .describe_lazy(|| format!("write pid file '{}'", self.pid_file.display()))
    }

    /// Remove the pid file on clean shutdown.
    pub fn clear_pid(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
    }

    /// Ask the running instance to stop and wait until it is gone.
    ///
    /// Writes the kill file, waits for the daemon to remove it and exit, then
    /// removes the pid file. With `force`, a stubborn instance is terminated
    /// and stale state cleaned up rather than erroring.
    pub fn stop_running_instance(&self, force: bool) -> Result<(), Error> {
        let Some(pid) = self.recorded_pid() else {
            info!("no instance is running");
            return Ok(());
        };
        if !process_is_alive(pid) {
            info!("recorded instance (pid {pid}) is already gone; cleaning up");
            self.clear_pid();
            return Ok(());
        }

        if let Some(parent) = self.kill_file.parent() {
            std::fs::create_dir_all(parent)
                .context(Error::IO)
                .describe_lazy(|| format!("create '{}'", parent.display()))?;
        }
        std::fs::write(&self.kill_file, "")
            .context(Error::IO)
            .describe_lazy(|| format!("write kill file '{}'", self.kill_file.display()))?;
        info!("asked pid {pid} to stop; waiting");

        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if !process_is_alive(pid) {
                self.clear_pid();
                let _ = std::fs::remove_file(&self.kill_file);
                return Ok(());
            }
            std::thread::sleep(STOP_POLL);
        }

        if force {
            info!("pid {pid} ignored the kill file; terminating it");
            terminate(pid);
            std::thread::sleep(STOP_POLL);
            self.clear_pid();
            let _ = std::fs::remove_file(&self.kill_file);
            return Ok(());
        }
        report!(Error::StopTimedOut(pid))
            .wrap_err()
            .help("re-run with '--force' to terminate the instance")
    }
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_pid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_in(tmp: &tempfile::TempDir) -> InstanceGuard {
        InstanceGuard::new(&DataRoot::at(tmp.path()))
    }

    #[test]
    fn no_pid_file_means_not_running() {
        let tmp = tempfile::tempdir().expect("must create temporary directory");
        guard_in(&tmp).check_not_running().expect("must pass");
    }

    #[test]
    fn live_pid_blocks_startup() {
        let tmp = tempfile::tempdir().expect("must create temporary directory");
        let guard = guard_in(&tmp);
        // Our own pid is definitely alive.
        guard.write_pid().expect("must write");
        let err = guard.check_not_running().expect_err("must refuse");
        assert!(matches!(err.current_context(), Error::AlreadyRunning(_)));
    }

    #[test]
    fn stale_pid_is_cleaned_up() {
        let tmp = tempfile::tempdir().expect("must create temporary directory");
        let guard = guard_in(&tmp);
        if let Some(parent) = guard.pid_file.parent() {
            std::fs::create_dir_all(parent).expect("must create");
        }
        // A pid that is effectively never alive on test systems.
        std::fs::write(&guard.pid_file, "999999999\n").expect("must write");
        guard.check_not_running().expect("stale pid must not block");
        assert!(!guard.pid_file.exists());
    }

    #[test]
    fn clear_pid_allows_restart() {
        let tmp = tempfile::tempdir().expect("must create temporary directory");
        let guard = guard_in(&tmp);
        guard.write_pid().expect("must write");
        guard.clear_pid();
        guard.check_not_running().expect("must pass after clear");
    }

    #[test]
    fn stop_with_no_instance_is_ok() {
        let tmp = tempfile::tempdir().expect("must create temporary directory");
        guard_in(&tmp).stop_running_instance(false).expect("must pass");
    }
}
