//! Configuration for bridge sessions
//!
//! Loads the downstream server descriptor and the bridge policy from a JSON
//! document shaped like an MCP client configuration:
//!
//! ```json
//! {
//!   "mcpServers": { "<name>": { "command": "...", "args": [], "env": {}, "cwd": "..." } },
//!   "bridge": { "debug": false, "max_restarts": 3, "restart_cooldown": 10, "translate_paths": true }
//! }
//! ```
//!
//! A missing file is not an error: built-in defaults are applied instead.
//! Environment variables override the file, and the CLI overrides both.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::bridge::error::ConfigError;
use crate::translate::TranslationMode;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default number of restarts before the bridge gives up
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Default minimum time between two restart attempts (seconds)
pub const DEFAULT_RESTART_COOLDOWN_SECS: f64 = 10.0;

/// Name given to the server entry synthesized when no file is found
pub const DEFAULT_SERVER_NAME: &str = "mcp-server";

/// Arguments of the synthesized default server entry
pub const DEFAULT_SERVER_ARGS: &[&str] = &["-m", "mcp_server"];

/// Interpreter used when none of the search candidates exists
pub const FALLBACK_INTERPRETER: &str = "python";

/// Interpreter locations checked for the default server entry, in order.
///
/// Both the foreign drive-letter form and the native mount form are listed
/// so the search succeeds from either side of the mount.
pub const INTERPRETER_CANDIDATES: &[&str] = &[
    r"C:\Python312\python.exe",
    r"C:\Python311\python.exe",
    r"C:\Python310\python.exe",
    r"C:\Python39\python.exe",
    "/mnt/c/Python312/python.exe",
    "/mnt/c/Python311/python.exe",
    "/mnt/c/Python310/python.exe",
    "/mnt/c/Python39/python.exe",
];

/// Environment variable naming an explicit config file
pub const ENV_CONFIG_PATH: &str = "BRIDGE_CONFIG";
pub const ENV_DEBUG: &str = "BRIDGE_DEBUG";
pub const ENV_MAX_RESTARTS: &str = "BRIDGE_MAX_RESTARTS";
pub const ENV_RESTART_COOLDOWN: &str = "BRIDGE_RESTART_COOLDOWN";
pub const ENV_TRANSLATE_PATHS: &str = "BRIDGE_TRANSLATE_PATHS";

// ============================================================================
// Core Configuration Types
// ============================================================================

/// How to launch the downstream server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Executable to run
    pub command: String,

    /// Command-line arguments, in order
    #[serde(default)]
    pub args: Vec<String>,

    /// Variables overlaid on the inherited environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory (defaults to the bridge's own)
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ServerDescriptor {
    /// Descriptor with no arguments, environment or working directory
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                format!("mcpServers.{name}.command"),
                "must not be empty",
            ));
        }
        Ok(())
    }
}

/// Restart and relay tuning
#[derive(Debug, Clone, PartialEq)]
pub struct BridgePolicy {
    /// Restarts allowed before the bridge shuts down
    pub max_restarts: u32,

    /// Minimum interval between restart attempts
    pub restart_cooldown: Duration,

    /// Rewrite path strings between the two syntaxes
    pub translate_paths: bool,

    /// Granularity of path rewriting
    pub translation_mode: TranslationMode,

    /// Verbose message tracing and periodic statistics
    pub debug: bool,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_cooldown: Duration::from_secs_f64(DEFAULT_RESTART_COOLDOWN_SECS),
            translate_paths: true,
            translation_mode: TranslationMode::default(),
            debug: false,
        }
    }
}

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Parsed from this file
    File(PathBuf),
    /// No file found at any of these paths; defaults applied
    Defaults {
        searched: Vec<PathBuf>,
        interpreter: String,
    },
}

/// Fully resolved configuration for one bridge session
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Name of the selected `mcpServers` entry
    pub server_name: String,

    /// Descriptor of the selected entry
    pub descriptor: ServerDescriptor,

    /// Effective policy after all overrides
    pub policy: BridgePolicy,

    /// Provenance, reported once logging is up
    pub source: ConfigSource,
}

// ============================================================================
// File Schema
// ============================================================================

/// Raw `bridge` section; every field optional
#[derive(Debug, Default, Deserialize)]
struct BridgeSection {
    debug: Option<bool>,
    max_restarts: Option<u32>,
    restart_cooldown: Option<f64>,
    translate_paths: Option<bool>,
    translation_mode: Option<TranslationMode>,
}

/// Raw document
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "mcpServers", default, deserialize_with = "ordered_servers")]
    mcp_servers: Vec<(String, ServerDescriptor)>,

    #[serde(default)]
    bridge: BridgeSection,
}

/// Keep `mcpServers` entries in document order so "first server" is stable
fn ordered_servers<'de, D>(deserializer: D) -> Result<Vec<(String, ServerDescriptor)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ServersVisitor;

    impl<'de> Visitor<'de> for ServersVisitor {
        type Value = Vec<(String, ServerDescriptor)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of server names to server descriptors")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut servers = Vec::with_capacity(map.size_hint().unwrap_or(1));
            while let Some((name, descriptor)) = map.next_entry::<String, ServerDescriptor>()? {
                servers.push((name, descriptor));
            }
            Ok(servers)
        }
    }

    deserializer.deserialize_map(ServersVisitor)
}

impl BridgeSection {
    fn apply_to(&self, policy: &mut BridgePolicy) -> Result<(), ConfigError> {
        if let Some(debug) = self.debug {
            policy.debug = debug;
        }
        if let Some(max_restarts) = self.max_restarts {
            policy.max_restarts = max_restarts;
        }
        if let Some(cooldown) = self.restart_cooldown {
            policy.restart_cooldown = cooldown_from_secs("bridge.restart_cooldown", cooldown)?;
        }
        if let Some(translate) = self.translate_paths {
            policy.translate_paths = translate;
        }
        if let Some(mode) = self.translation_mode {
            policy.translation_mode = mode;
        }
        Ok(())
    }
}

fn cooldown_from_secs(field: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| {
        ConfigError::invalid_value(
            field,
            format!("expected a non-negative number of seconds, got {secs} ({e})"),
        )
    })
}

// ============================================================================
// Loading
// ============================================================================

/// Candidate config file locations, highest priority first
pub fn config_search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }

    let mut paths = Vec::new();
    if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("server_config.json"));
    if let Ok(home) = std::env::var("HOME") {
        paths.push(
            PathBuf::from(home)
                .join(".config")
                .join("mcp-isolation-bridge")
                .join("config.json"),
        );
    }
    paths
}

/// First interpreter candidate that exists on disk
pub fn discover_interpreter(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|candidate| Path::new(candidate).exists())
        .map(|candidate| candidate.to_string())
}

impl BridgeConfig {
    /// Load configuration from the first existing search path, or defaults.
    ///
    /// Environment overrides are applied on top.
    pub fn load(explicit: Option<&Path>, server: Option<&str>) -> Result<Self, ConfigError> {
        let searched = config_search_paths(explicit);
        let mut config = match searched.iter().find(|path| path.is_file()) {
            Some(path) => Self::from_file(path, server)?,
            None => Self::defaults(searched),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse and validate one config file
    pub fn from_file(path: &Path, server: Option<&str>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents, server)
    }

    /// Parse and validate a config document; `path` is used for error context
    pub fn parse(path: &Path, contents: &str, server: Option<&str>) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if file.mcp_servers.is_empty() {
            return Err(ConfigError::NoServers {
                path: path.to_path_buf(),
            });
        }
        for (name, descriptor) in &file.mcp_servers {
            descriptor.validate(name)?;
        }

        let (server_name, descriptor) = match server {
            Some(wanted) => file
                .mcp_servers
                .iter()
                .find(|(name, _)| name == wanted)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownServer {
                    name: wanted.to_string(),
                    available: file.mcp_servers.iter().map(|(n, _)| n.clone()).collect(),
                })?,
            None => file.mcp_servers[0].clone(),
        };

        let mut policy = BridgePolicy::default();
        file.bridge.apply_to(&mut policy)?;

        debug!(
            "Parsed config {}: server '{}' ({} declared)",
            path.display(),
            server_name,
            file.mcp_servers.len()
        );

        Ok(Self {
            server_name,
            descriptor,
            policy,
            source: ConfigSource::File(path.to_path_buf()),
        })
    }

    /// Built-in configuration used when no file exists
    pub fn defaults(searched: Vec<PathBuf>) -> Self {
        let interpreter = discover_interpreter(INTERPRETER_CANDIDATES)
            .unwrap_or_else(|| FALLBACK_INTERPRETER.to_string());

        let mut descriptor = ServerDescriptor::new(interpreter.clone());
        descriptor.args = DEFAULT_SERVER_ARGS.iter().map(|a| a.to_string()).collect();

        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            descriptor,
            policy: BridgePolicy::default(),
            source: ConfigSource::Defaults {
                searched,
                interpreter,
            },
        }
    }

    /// Apply `BRIDGE_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply `BRIDGE_*` overrides from an arbitrary lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEBUG) {
            self.policy.debug = parse_bool(ENV_DEBUG, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_RESTARTS) {
            self.policy.max_restarts = value.trim().parse().map_err(|_| {
                ConfigError::invalid_env(ENV_MAX_RESTARTS, &value, "expected a non-negative integer")
            })?;
        }
        if let Some(value) = lookup(ENV_RESTART_COOLDOWN) {
            let secs: f64 = value.trim().parse().map_err(|_| {
                ConfigError::invalid_env(ENV_RESTART_COOLDOWN, &value, "expected seconds")
            })?;
            self.policy.restart_cooldown = cooldown_from_secs(ENV_RESTART_COOLDOWN, secs)
                .map_err(|e| ConfigError::invalid_env(ENV_RESTART_COOLDOWN, &value, e.to_string()))?;
        }
        if let Some(value) = lookup(ENV_TRANSLATE_PATHS) {
            self.policy.translate_paths = parse_bool(ENV_TRANSLATE_PATHS, &value)?;
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::invalid_env(name, value, "expected a boolean")),
    }
}

// ============================================================================
// Tests
// ============================================================================
