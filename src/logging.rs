//! Tracing sink configuration.
//!
//! Two layers, in the spirit of keeping terse human output and complete
//! machine output separate:
//! - a compact INFO-level layer on stderr for humans;
//! - a JSON layer writing every trace through a non-blocking rolling
//!   appender under `<data-root>/var/log/debug`.

use error_stack::Result;
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter, layer::SubscriberExt, Layer, Registry};

use crate::config::DataRoot;
use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};

/// Errors surfaced while configuring logging.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The log directory could not be created.
    #[error("create log directory")]
    EnsureLogRoot,

    /// The rolling appender could not be constructed.
    #[error("configure log output location")]
    LogConfig,

    /// The trace sink is a global singleton and was configured twice.
    #[error("trace sink was configured again after being configured once")]
    TraceSinkReconfigured,
}

/// Retained rotated debug logs.
const MAX_ROTATED_LOGS: usize = 9;

/// Rotate the debug log when it grows past this.
const MAX_LOG_BYTES: u64 = 50 * 1024 * 1024;

/// Initialize the tracing sinks. The returned guard must be held for the
/// process lifetime; dropping it stops the background log writer.
#[must_use = "dropping the guard stops the log writer"]
pub fn run_tracing_sink(root: &DataRoot) -> Result<WorkerGuard, Error> {
    let log_dir = root.log_dir();
    std::fs::create_dir_all(&log_dir)
        .context(Error::EnsureLogRoot)
        .describe_lazy(|| format!("log directory: '{}'", log_dir.display()))?;

    let file = BasicRollingFileAppender::new(
        root.debug_log(),
        RollingConditionBasic::new().max_size(MAX_LOG_BYTES),
        MAX_ROTATED_LOGS,
    )
    .context(Error::LogConfig)?;
    let (sink, guard) = tracing_appender::non_blocking(file);

    let subscriber = Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(false)
                .with_level(true)
                .with_line_number(false)
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_filter(filter::LevelFilter::INFO),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(sink),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context(Error::TraceSinkReconfigured)
        .help("this is a program bug, not something a configuration change can fix")?;
    Ok(guard)
}
