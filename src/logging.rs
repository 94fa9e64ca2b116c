use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_LOG_FILE: &str = "BRIDGE_LOG_FILE";
pub const ENV_LOG_JSON: &str = "BRIDGE_LOG_JSON";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path, written in addition to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let file_path = lookup(ENV_LOG_FILE)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let json_format = lookup(ENV_LOG_JSON).is_some_and(|v| v == "true" || v == "1");

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }

    /// Debug mode raises the level and, when no file was given, adds a
    /// per-session file in the temp directory
    pub fn with_debug(mut self, debug: bool, workspace_id: &str) -> Self {
        if debug {
            self.level = "debug".to_string();
            if self.file_path.is_none() {
                self.file_path = Some(session_log_path(&env::temp_dir(), workspace_id));
            }
        }
        self
    }
}

/// `<dir>/<workspace_id>.log`
pub fn session_log_path(dir: &Path, workspace_id: &str) -> PathBuf {
    dir.join(format!("{workspace_id}.log"))
}

/// Owns the log file so the shutdown routine can flush it
#[derive(Debug, Default)]
pub struct LogHandle {
    file: Option<(PathBuf, Arc<File>)>,
}

impl LogHandle {
    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }

    /// Sync the log file to disk. Later events are still written.
    pub fn release(self) -> io::Result<()> {
        if let Some((_, file)) = self.file {
            file.sync_all()?;
        }
        Ok(())
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the logging system based on configuration.
///
/// Logs always go to stderr (stdout carries the protocol); a file layer is
/// added when a path is configured.
pub fn init_logging(config: LogConfig) -> Result<LogHandle, Box<dyn std::error::Error>> {
    // Create environment filter from log level
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut handle = LogHandle::default();

    let stderr_layer = if config.json_format {
        fmt::layer().json().with_writer(io::stderr).with_ansi(false).boxed()
    } else {
        fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .boxed()
    };
    layers.push(stderr_layer);

    if let Some(file_path) = &config.file_path {
        let file = Arc::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?,
        );

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(Arc::clone(&file))
                .with_ansi(false)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(Arc::clone(&file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .boxed()
        };
        layers.push(file_layer);
        handle.file = Some((file_path.clone(), file));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    Ok(handle)
}

/// Log one relayed JSON-RPC frame on a single line
#[macro_export]
macro_rules! log_bridge_message {
    ($level:expr, $direction:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = %$direction,
            bytes = $data.len(),
            data = %String::from_utf8_lossy($data).trim_end(),
            "Relayed message"
        );
    };
}

/// Helper function to log performance timing
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}
