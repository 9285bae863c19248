//! Scripter Configuration
//!
//! Defines the structure of `scripter.toml`. Every field has a default, so an
//! empty file (or no file at all) is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScripterConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub modules: ModuleConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl ScripterConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "scripter=info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

/// Module resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Directories searched for native modules, in order. An empty entry
    /// hands the bare file name to the system loader.
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,
    /// Extension appended to script module names
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    /// Register the builtin `system` and `console` modules
    #[serde(default = "default_true")]
    pub builtins: bool,
}

fn default_search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./target/debug"),
        PathBuf::from("."),
        PathBuf::new(),
    ]
}

fn default_script_extension() -> String {
    "js".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
            script_extension: default_script_extension(),
            builtins: true,
        }
    }
}

/// Script runtime limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Heap limit in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<usize>,
    /// Maximum native stack usage in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stack_size: Option<usize>,
}
