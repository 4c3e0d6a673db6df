//! Implementation for the `restart` subcommand.

use error_stack::{Result, ResultExt};

use crate::config::{Config, DataRoot};
use crate::scheduler::EngineExit;
use crate::subcommand::{start, stop};

/// Errors encountered while restarting the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Stopping the old instance failed.
    #[error("stop the old instance")]
    Stop,

    /// Starting the new instance failed.
    #[error("start the new instance")]
    Start,
}

/// Stop any running instance, then start a fresh one.
pub fn main(
    root: &DataRoot,
    config: Config,
    force: bool,
    foreground: bool,
    no_loop: bool,
) -> Result<EngineExit, Error> {
    stop::main(root, force).change_context(Error::Stop)?;
    start::main(root, config, foreground, no_loop).change_context(Error::Start)
}
