//! Log setup.
//!
//! Logs go to `$PARLEY_HOME/logs/parley.log`; stdout and stderr belong to the
//! front-end. Verbosity comes from `PARLEY_LOG` (an `EnvFilter` directive
//! string) and defaults to `parley=info`, which also covers `parley_core`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::paths;

pub const LOG_ENV: &str = "PARLEY_LOG";
pub const LOG_FILE: &str = "parley.log";
const DEFAULT_DIRECTIVES: &str = "parley=info";

/// Installs the global subscriber writing to the default log directory.
///
/// Keep the returned guard alive until exit; dropping it flushes the writer.
///
/// # Errors
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init() -> Result<WorkerGuard> {
    init_in(&paths::log_dir())
}

/// Like [`init`], writing to `dir`.
///
/// # Errors
/// See [`init`].
pub fn init_in(dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(guard)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}
