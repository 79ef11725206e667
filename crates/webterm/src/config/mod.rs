use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::language::{CompileConfig, FileExtension, Language, RunConfig};
use crate::types::ExecutionLimits;

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Provides the built-in language table and can be written out as a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../webterm.example.toml");

/// Prefix of environment variables that override configuration values
pub const ENV_PREFIX: &str = "WEBTERM";

/// PATH handed to programs when the host has none
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for the webterm dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP/WebSocket listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Temp root under which per-session workspaces are created
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Default limits applied to every compile and run phase
    #[serde(default)]
    pub default_limits: ExecutionLimits,

    /// Host environment variables passed through to user programs.
    ///
    /// Everything else is dropped so server secrets never reach submitted code.
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,

    /// Language used when a request names an unknown one
    #[serde(default = "default_fallback_language")]
    pub fallback_language: String,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: BTreeMap<String, Language>,
}

/// Listener settings for `webterm serve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// First port to try
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed to open the socket (CORS)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// How many consecutive ports to try when the port is taken
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
            max_port_attempts: default_max_port_attempts(),
        }
    }
}

impl Config {
    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            server: ServerConfig::default(),
            workspace_root: default_workspace_root(),
            default_limits: ExecutionLimits::default(),
            env_allowlist: default_env_allowlist(),
            fallback_language: default_fallback_language(),
            languages: BTreeMap::new(),
        }
    }

    /// Snapshot of the allow-listed host environment.
    ///
    /// PATH is always present so toolchains can be located.
    pub fn sandbox_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        env.entry("PATH".to_owned())
            .or_insert_with(|| DEFAULT_PATH.to_owned());
        env
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("web-terminal")
}

fn default_env_allowlist() -> Vec<String> {
    ["PATH", "HOME", "LANG", "LC_ALL", "TZ"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_fallback_language() -> String {
    "javascript".to_owned()
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    3001
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_owned()]
}

fn default_max_port_attempts() -> u16 {
    10
}
