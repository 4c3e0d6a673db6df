//! Implementation for the `stop` subcommand.

use error_stack::{Result, ResultExt};

use crate::config::DataRoot;
use crate::guard::InstanceGuard;

/// Errors encountered while stopping the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The running instance did not stop.
    #[error("stop the running instance")]
    Stop,
}

/// Ask the running instance to stop and wait for it.
pub fn main(root: &DataRoot, force: bool) -> Result<(), Error> {
    InstanceGuard::new(root)
        .stop_running_instance(force)
        .change_context(Error::Stop)
}
