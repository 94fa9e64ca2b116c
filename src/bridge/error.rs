//! Error types for the bridge
//!
//! Separates configuration failures (fatal before any process exists) from
//! runtime failures of the supervised process and the relay streams.

use std::path::PathBuf;

use crate::io::process::ProcessError;

// ============================================================================
// Bridge Errors
// ============================================================================

/// Direction of a relayed stream, used to label stream failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Client input → downstream process input
    Inbound,
    /// Downstream process output → client output
    Outbound,
    /// Downstream process error stream → diagnostic log
    Diagnostic,
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamDirection::Inbound => write!(f, "client→server"),
            StreamDirection::Outbound => write!(f, "server→client"),
            StreamDirection::Diagnostic => write!(f, "server stderr"),
        }
    }
}

/// Errors raised while running a bridge session
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration could not be loaded; no process was spawned
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The downstream process exited during its startup grace interval
    #[error("Server exited during startup (exit code: {exit_code:?}): {stderr}")]
    Startup {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Spawning or talking to the downstream process failed
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// A relayed stream failed at the OS level
    #[error("Stream error ({direction}): {source}")]
    Stream {
        direction: StreamDirection,
        #[source]
        source: std::io::Error,
    },

    /// The restart budget is spent
    #[error("Maximum restarts ({max_restarts}) exceeded")]
    RestartExhausted { max_restarts: u32 },

    /// Shutdown began while a server was starting; the new process was stopped
    #[error("Shutdown requested while server process {pid} was starting")]
    Cancelled { pid: u32 },

    /// Graceful termination did not complete
    #[error("Failed to terminate process {pid}: {reason}")]
    Termination { pid: u32, reason: String },
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON or a field has the wrong type
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// `mcpServers` is missing or empty
    #[error("No MCP servers declared in {path}")]
    NoServers { path: PathBuf },

    /// `--server` named an entry the document does not declare
    #[error("Server '{name}' not found in configuration (available: {available:?})")]
    UnknownServer {
        name: String,
        available: Vec<String>,
    },

    /// A field parsed but holds an unusable value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// An environment override could not be parsed
    #[error("Invalid environment variable {name}={value:?}: {reason}")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },
}

// ============================================================================
// Error Conversion and Context Helpers
// ============================================================================

impl BridgeError {
    /// Create a startup failure error with the captured stderr
    pub fn startup(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::Startup {
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a stream error for the given direction
    pub fn stream(direction: StreamDirection, source: std::io::Error) -> Self {
        Self::Stream { direction, source }
    }

    /// Create a termination error
    pub fn termination(pid: u32, reason: impl Into<String>) -> Self {
        Self::Termination {
            pid,
            reason: reason.into(),
        }
    }

    /// Short label used as the metrics error type
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config_error",
            BridgeError::Startup { .. } => "startup_error",
            BridgeError::Process(_) => "process_error",
            BridgeError::Stream { .. } => "stream_error",
            BridgeError::RestartExhausted { .. } => "restart_exhausted",
            BridgeError::Cancelled { .. } => "start_cancelled",
            BridgeError::Termination { .. } => "termination_error",
        }
    }
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid environment variable error
    pub fn invalid_env(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidEnv {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
