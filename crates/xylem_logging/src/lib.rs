//! Logging setup shared by the xylem binaries.
//!
//! Every process logs to a per-application file under the xylem home
//! directory and mirrors events to stderr, so interactive output on stdout
//! stays machine readable. Initialize once, early in `main`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the xylem home directory.
pub const XYLEM_HOME_ENV: &str = "XYLEM_HOME";

const DEFAULT_LOG_FILTER: &str = "xylem=info,xylem_store=info,xylem_schema=info";
const VERBOSE_LOG_FILTER: &str = "xylem=debug,xylem_store=debug,xylem_schema=debug";

/// Options for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the log file, without extension.
    pub app_name: String,
    /// Lower the default filter from info to debug.
    pub verbose: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            app_name: "xylem".to_string(),
            verbose: false,
        }
    }
}

/// Root directory for xylem state: `$XYLEM_HOME` or `~/.xylem`.
pub fn xylem_home() -> PathBuf {
    if let Ok(home) = std::env::var(XYLEM_HOME_ENV) {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".xylem"))
        .unwrap_or_else(|| PathBuf::from(".xylem"))
}

/// Directory holding log files.
pub fn logs_dir() -> PathBuf {
    xylem_home().join("logs")
}

/// Create the logs directory if needed and return it.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let dir = logs_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    Ok(dir)
}

#[derive(Clone)]
struct SharedFileWriter {
    inner: Arc<Mutex<File>>,
}

struct SharedFileGuard {
    inner: Arc<Mutex<File>>,
}

impl Write for SharedFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        file.flush()
    }
}

impl<'a> MakeWriter<'a> for SharedFileWriter {
    type Writer = SharedFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Install the global tracing subscriber and return the log file path.
///
/// `RUST_LOG` overrides the built-in filter when set. Fails if a subscriber
/// is already installed in this process.
pub fn init_logging(config: &LogConfig) -> Result<PathBuf> {
    let logs = ensure_logs_dir()?;
    let log_path = logs.join(format!("{}.log", config.app_name));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;
    let file_writer = SharedFileWriter {
        inner: Arc::new(Mutex::new(file)),
    };

    let default_filter = if config.verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(log_path)
}
