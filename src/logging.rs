//! Logging infrastructure for the pool master and its forked workers.
//!
//! # Environment Variables
//!
//! - `LOGGING` / `VERBOSE` - info / debug level
//! - `VVERBOSE` - trace level
//! - `RESPOOL_LOG_FORMAT` - pretty, compact or json
//! - `RESPOOL_LOG_FILE` - log file path (in addition to stderr)
//! - `RUST_LOG` - standard filter, overrides the level flags
//!
//! The file sink is reopened in place when the master handles `HUP`, so a
//! rotated log file is picked up without restarting the pool; children forked
//! afterwards inherit the new descriptor.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{s}'. Valid options: pretty, compact, json"
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Path to a log file (None = stderr only)
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
        }
    }
}

impl LogConfig {
    /// Build the configuration from the worker-verbosity environment
    /// variables shared with the workers.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if std::env::var("VVERBOSE").is_ok() {
            config.level = Level::TRACE;
        } else if std::env::var("VERBOSE").is_ok() || std::env::var("LOGGING").is_ok() {
            config.level = Level::DEBUG;
        }

        if let Ok(format) = std::env::var("RESPOOL_LOG_FORMAT") {
            if let Ok(parsed) = format.parse() {
                config.format = parsed;
            }
        }
        if let Ok(path) = std::env::var("RESPOOL_LOG_FILE") {
            if !path.is_empty() {
                config.file_path = Some(PathBuf::from(path));
            }
        }

        config
    }
}

/// A log file that can be reopened at its original path on demand.
#[derive(Clone)]
pub struct ReopenableFile {
    path: Arc<PathBuf>,
    file: Arc<Mutex<File>>,
}

impl ReopenableFile {
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let file = open_append(&path)?;
        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Reopen the path in place. Writers pick up the new descriptor on their
    /// next write.
    pub fn reopen(&self) -> io::Result<()> {
        let file = open_append(&self.path)?;
        *self.file.lock().unwrap() = file;
        Ok(())
    }
}

fn open_append(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for ReopenableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().unwrap().flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableFile {
    type Writer = ReopenableFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

static LOG_FILE: OnceLock<ReopenableFile> = OnceLock::new();

/// Initialize the global tracing subscriber.
///
/// Called once at startup; subsequent calls are silently ignored so tests can
/// initialize freely.
pub fn init(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let sink = config.file_path.as_ref().and_then(|path| {
        match ReopenableFile::open(path.clone()) {
            Ok(sink) => Some(LOG_FILE.get_or_init(|| sink).clone()),
            Err(err) => {
                eprintln!("respool: cannot open log file {}: {err}", path.display());
                None
            }
        }
    });

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .with(sink.map(|s| fmt::layer().json().with_ansi(false).with_writer(s)))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(io::stderr))
            .with(sink.map(|s| fmt::layer().compact().with_ansi(false).with_writer(s)))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stderr))
            .with(sink.map(|s| fmt::layer().with_ansi(false).with_writer(s)))
            .try_init(),
    };

    // Already initialized is fine
    let _ = result;
}

/// Reopen the file sink, if one is configured. Invoked when the master
/// handles `HUP`.
pub fn reopen() {
    if let Some(sink) = LOG_FILE.get() {
        match sink.reopen() {
            Ok(()) => tracing::info!("log file reopened"),
            Err(err) => tracing::warn!(error = %err, "failed to reopen log file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file_path.is_none());
    }

    #[test]
    fn test_reopenable_file_survives_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.log");

        let mut sink = ReopenableFile::open(path.clone()).unwrap();
        sink.write_all(b"before rotation\n").unwrap();

        // Simulate logrotate moving the file aside
        std::fs::rename(&path, dir.path().join("pool.log.1")).unwrap();
        sink.reopen().unwrap();
        sink.write_all(b"after rotation\n").unwrap();
        sink.flush().unwrap();

        let fresh = std::fs::read_to_string(&path).unwrap();
        assert_eq!(fresh, "after rotation\n");
        let rotated = std::fs::read_to_string(dir.path().join("pool.log.1")).unwrap();
        assert_eq!(rotated, "before rotation\n");
    }

    #[test]
    fn test_reopen_without_file_sink_is_a_no_op() {
        // Must not panic when no file sink was ever configured
        reopen();
    }
}
