//! Configuration file loading for webterm
//!
//! Handles loading and parsing configuration files using the config crate,
//! layering `WEBTERM_`-prefixed environment variables on top.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};
use crate::types::ExecutionLimits;

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder().add_source(File::from(path.as_ref()));
        Self::build(builder)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let builder =
            ConfigBuilder::builder().add_source(File::from_str(content, FileFormat::Toml));
        Self::build(builder)
    }

    /// Load configuration for a long-running process.
    ///
    /// Reads `path` (or the embedded example when `None`) and applies
    /// environment overrides such as `WEBTERM_SERVER__PORT=8080` or
    /// `WEBTERM_SERVER__ALLOWED_ORIGINS=https://a.dev,https://b.dev`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let builder = match path {
            Some(path) => ConfigBuilder::builder().add_source(File::from(path)),
            None => ConfigBuilder::builder()
                .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml)),
        };
        Self::build(builder.add_source(env))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        validate_limits("default_limits", &self.default_limits)?;

        for (id, lang) in &self.languages {
            if id.is_empty() || id.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(ConfigError::Invalid(format!(
                    "language id '{id}' must be non-empty and lowercase"
                )));
            }
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(ref name) = lang.source_name
                && !is_plain_file_name(name)
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has invalid source name '{name}'"
                )));
            }
            if let Some(ref limits) = lang.run.limits {
                validate_limits(id, limits)?;
            }
            if let Some(ref compile) = lang.compile {
                if compile.command.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has empty compile command"
                    )));
                }
                if !is_plain_file_name(&compile.output_name) {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has invalid output name '{}'",
                        compile.output_name
                    )));
                }
                if let Some(ref limits) = compile.limits {
                    validate_limits(id, limits)?;
                }
            }
        }

        if !self.languages.contains_key(&self.fallback_language) {
            return Err(ConfigError::Invalid(format!(
                "fallback language '{}' is not configured",
                self.fallback_language
            )));
        }

        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("server.allowed_origins")
        .with_list_parse_key("env_allowlist")
        .try_parsing(true)
}

fn validate_limits(scope: &str, limits: &ExecutionLimits) -> Result<(), ConfigError> {
    if limits.timeout_ms == Some(0) {
        return Err(ConfigError::Invalid(format!("{scope}: timeout_ms must be > 0")));
    }
    if limits.max_output_bytes == Some(0) {
        return Err(ConfigError::Invalid(format!(
            "{scope}: max_output_bytes must be > 0"
        )));
    }
    Ok(())
}

/// A single path component: no separators, no traversal
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}
