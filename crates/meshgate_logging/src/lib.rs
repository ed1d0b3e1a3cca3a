//! Shared logging utilities for Meshgate binaries.
//!
//! Log output goes to a size-rotated file under the Meshgate home directory
//! and, filtered, to stderr. The rotation scheme is `<app>.log` for the
//! live file with numbered backups (`<app>.log.1` is the newest backup).

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "meshgate=info,meshgate_mcp=info,meshgate_worker=info";
const BACKUP_COUNT: usize = 4;
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by Meshgate binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rotating file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let writer = RollingWriter::open(log_dir, config.app_name)
        .context("Failed to open the rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Get the Meshgate home directory: ~/.meshgate
pub fn meshgate_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("MESHGATE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshgate")
}

/// Get the logs directory: ~/.meshgate/logs
pub fn logs_dir() -> PathBuf {
    meshgate_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-rotated log writer. Cloning shares the underlying file, so the same
/// value serves as both the `MakeWriter` factory and the writer it makes.
#[derive(Clone)]
pub struct RollingWriter {
    state: Arc<Mutex<RollingState>>,
}

struct RollingState {
    dir: PathBuf,
    stem: String,
    file: File,
    written: u64,
}

impl RollingWriter {
    /// Open (or append to) `<dir>/<app>.log`, rotating first if the file is
    /// already over the size threshold.
    pub fn open(dir: PathBuf, app_name: &str) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let stem: String = app_name
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();

        let mut state = RollingState::open(dir, stem)?;
        if state.written >= ROTATE_AT_BYTES {
            state.rotate()?;
        }
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }
}

impl RollingState {
    fn open(dir: PathBuf, stem: String) -> Result<Self> {
        let path = dir.join(format!("{stem}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            dir,
            stem,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, index))
    }

    /// Shift `.log.N` backups up by one (dropping the oldest), move the live
    /// file to `.log.1`, and start a fresh live file.
    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();

        let _ = fs::remove_file(self.backup_path(BACKUP_COUNT));
        for index in (1..BACKUP_COUNT).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                let _ = fs::rename(&from, self.backup_path(index + 1));
            }
        }

        let live = self.dir.join(format!("{}.log", self.stem));
        if live.exists() {
            fs::rename(&live, self.backup_path(1))?;
        }
        self.file = OpenOptions::new().create(true).append(true).open(&live)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        if state.written + buf.len() as u64 > ROTATE_AT_BYTES {
            state.rotate()?;
        }
        let bytes = state.file.write(buf)?;
        state.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
