//! Configuration management for modhost
//!
//! Loads the declarative module graph document: a `global` section with
//! process-wide settings and three module sections (`hardware`, `logic`,
//! `gui`), each mapping module names to `{module.Class, options, connect}`.
//!
//! The parsed configuration is immutable. A reload builds a new
//! `RuntimeConfig` instead of mutating the current one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::module::graph::{ConnectionGraph, ConnectorResolver, GraphError, ModuleSpec, Tier};
use crate::module::value::Value;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Module '{0}' is defined in more than one tier")]
    DuplicateModule(String),

    #[error("Module '{0}' does not name a module.Class")]
    MissingClass(String),

    #[error("Startup module '{0}' is not defined")]
    UnknownStartupModule(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Remote module server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    /// Address to bind
    #[serde(default = "default_remote_address")]
    pub address: IpAddr,

    /// Port to bind (0 = ephemeral)
    pub port: u16,
}

impl RemoteServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

fn default_remote_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "modhost::module=debug"); RUST_LOG wins
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Process-wide settings (`[global]` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Modules activated at startup
    #[serde(default)]
    pub startup: Vec<String>,

    /// Remote module server; no remote server is started when absent
    #[serde(default)]
    pub remote_modules_server: Option<RemoteServerConfig>,

    /// Loopback port of the namespace server (0 = ephemeral)
    #[serde(default = "default_namespace_port")]
    pub namespace_server_port: u16,

    /// Fully serialize every remote argument and return value
    #[serde(default = "default_true")]
    pub force_remote_calls_by_value: bool,

    /// Default directory modules write data to
    #[serde(default)]
    pub default_data_dir: Option<PathBuf>,

    /// Extra search paths handed to external component catalogs
    #[serde(default)]
    pub extension_paths: Vec<PathBuf>,

    /// Idle remote sessions are closed after this many seconds
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Upper bound for a single remote call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Per-observer buffer of state-change notifications
    #[serde(default = "default_state_channel_capacity")]
    pub state_channel_capacity: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_true() -> bool {
    true
}

fn default_namespace_port() -> u16 {
    18861
}

fn default_session_idle_timeout() -> u64 {
    300
}

fn default_call_timeout() -> u64 {
    60
}

fn default_state_channel_capacity() -> usize {
    64
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            startup: Vec::new(),
            remote_modules_server: None,
            namespace_server_port: default_namespace_port(),
            force_remote_calls_by_value: true,
            default_data_dir: None,
            extension_paths: Vec::new(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            call_timeout_secs: default_call_timeout(),
            state_channel_capacity: default_state_channel_capacity(),
            logging: None,
        }
    }
}

impl GlobalConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

/// One module entry as written in the document
#[derive(Debug, Deserialize)]
struct RawModuleEntry {
    /// `"module.Class" = "..."` (quoted key, JSON)
    #[serde(rename = "module.Class", default)]
    class_flat: Option<String>,

    /// `module.Class = "..."` (dotted TOML key)
    #[serde(default)]
    module: Option<RawClassTable>,

    #[serde(default)]
    options: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    connect: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    allow_remote: bool,
}

#[derive(Debug, Deserialize)]
struct RawClassTable {
    #[serde(rename = "Class")]
    class: String,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    global: GlobalConfig,
    #[serde(default)]
    hardware: BTreeMap<String, RawModuleEntry>,
    #[serde(default)]
    logic: BTreeMap<String, RawModuleEntry>,
    #[serde(default)]
    gui: BTreeMap<String, RawModuleEntry>,
}

/// Runtime configuration: global settings plus module specs
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub global: GlobalConfig,
    /// Module specs, sorted by name
    modules: Vec<ModuleSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            modules: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration programmatically
    pub fn new(global: GlobalConfig, modules: Vec<ModuleSpec>) -> Result<Self, ConfigError> {
        let mut seen = BTreeSet::new();
        for spec in &modules {
            if !seen.insert(spec.name.clone()) {
                return Err(ConfigError::DuplicateModule(spec.name.clone()));
            }
        }
        let mut modules = modules;
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        let config = Self { global, modules };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file; the format follows the extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawDocument = toml::from_str(content)?;
        Self::from_raw(raw)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawDocument = serde_json::from_str(content)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDocument) -> Result<Self, ConfigError> {
        let mut modules = Vec::new();
        let sections = [
            (Tier::Hardware, raw.hardware),
            (Tier::Logic, raw.logic),
            (Tier::Gui, raw.gui),
        ];
        for (tier, entries) in sections {
            for (name, entry) in entries {
                let class_id = entry
                    .class_flat
                    .or(entry.module.map(|m| m.class))
                    .ok_or_else(|| ConfigError::MissingClass(name.clone()))?;
                modules.push(ModuleSpec {
                    name,
                    tier,
                    class_id,
                    options: entry
                        .options
                        .into_iter()
                        .map(|(k, v)| (k, Value::from(v)))
                        .collect(),
                    connectors: entry.connect,
                    allow_remote: entry.allow_remote,
                });
            }
        }
        Self::new(raw.global, modules)
    }

    /// Validate settings that do not depend on the connector graph
    pub fn validate(&self) -> Result<(), ConfigError> {
        for spec in &self.modules {
            if spec.class_id.trim().is_empty() {
                return Err(ConfigError::MissingClass(spec.name.clone()));
            }
        }

        for name in &self.global.startup {
            if self.module(name).is_none() {
                return Err(ConfigError::UnknownStartupModule(name.clone()));
            }
        }

        if self.global.state_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "state_channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.global.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.global.session_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session_idle_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// All module specs, sorted by name
    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&ModuleSpec> {
        self.modules
            .binary_search_by(|m| m.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.modules[i])
    }

    /// Modules declared in one tier
    pub fn tier(&self, tier: Tier) -> impl Iterator<Item = &ModuleSpec> {
        self.modules.iter().filter(move |m| m.tier == tier)
    }

    /// Resolve the connector graph for this configuration
    pub fn graph(&self) -> Result<ConnectionGraph, GraphError> {
        ConnectorResolver::build(self.modules.iter().cloned())
    }
}
