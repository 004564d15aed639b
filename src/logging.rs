//! Tracing setup.
//!
//! Logs go to stderr and, unless disabled, are appended to a per-day plain
//! text file under the instrument's record directory:
//! `<record_dir>/<instrument_id>/Log/runner-YYYYMMDD.log`.
//! `RUST_LOG` takes precedence over the configured level.

use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{RunnerError, RunnerResult};

/// Log file for `date` inside an instrument directory.
pub fn log_file_path(instrument_dir: &Path, date: NaiveDate) -> PathBuf {
    instrument_dir
        .join("Log")
        .join(format!("runner-{}.log", date.format("%Y%m%d")))
}

/// Open (append) a log file, creating its directory.
pub fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. Returns the log file in use, if any.
pub fn init(config: &LoggingConfig, instrument_dir: &Path) -> RunnerResult<Option<PathBuf>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file_layer, path) = if config.to_file {
        let path = log_file_path(instrument_dir, chrono::Local::now().date_naive());
        let file = open_log_file(&path)?;
        let layer = fmt::layer()
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .with_filter(filter());
        (Some(layer), Some(path))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| RunnerError::Unknown(format!("cannot install log subscriber: {}", e)))?;

    Ok(path)
}
