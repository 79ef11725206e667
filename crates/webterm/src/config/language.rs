use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::ExecutionLimits;

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Configuration for a programming language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "C++ (GCC)")
    pub name: String,

    /// File extension of the generated source file
    pub extension: FileExtension,

    /// Further extensions that map to this language for template lookup (e.g., "jsx")
    #[serde(default)]
    pub aliases: Vec<FileExtension>,

    /// Fixed source file name, for toolchains that derive meaning from it (e.g., "Main.java")
    #[serde(default)]
    pub source_name: Option<String>,

    /// Compilation configuration (None for interpreted languages)
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    /// Execution configuration
    pub run: RunConfig,

    /// Sample program offered by the editor for a new file
    #[serde(default)]
    pub snippet: String,
}

impl Language {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Get the source file name for this language
    pub fn source_name(&self) -> String {
        match self.source_name {
            Some(ref name) => name.clone(),
            None => format!("main.{}", self.extension),
        }
    }

    /// Name of the compiled artifact, if the language is compiled
    pub fn artifact_name(&self) -> Option<&str> {
        self.compile.as_ref().map(|c| c.output_name.as_str())
    }

    /// Whether `extension` is this language's extension or one of its aliases
    pub fn handles_extension(&self, extension: &str) -> bool {
        self.extension.matches(extension) || self.aliases.iter().any(|a| a.matches(extension))
    }

    /// Expand placeholders in the given command
    ///
    /// Placeholders: `{source}`, `{output}` and `{binary}` (both the artifact), `{dir}`.
    pub fn expand_command(command: &[String], source: &str, binary: &str, dir: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{output}", binary)
                    .replace("{binary}", binary)
                    .replace("{dir}", dir)
            })
            .collect()
    }
}

/// File extension without dot (e.g., "cpp")
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison, tolerating a leading dot on `other`
    pub fn matches(&self, other: &str) -> bool {
        let other = other.strip_prefix('.').unwrap_or(other);
        !self.0.is_empty() && self.0.eq_ignore_ascii_case(other)
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compilation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments with placeholders
    pub command: Vec<String>,

    /// Artifact produced by the compiler, relative to the request directory
    #[serde(default = "default_output_name")]
    pub output_name: String,

    /// Environment variables to set during compilation
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Limits for compilation (overrides defaults)
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,

    /// Treat any compiler stderr as a failed compile, even with exit code 0
    #[serde(default = "default_warnings_are_errors")]
    pub warnings_are_errors: bool,
}

/// Configuration for the execution step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command and arguments with placeholders
    pub command: Vec<String>,

    /// Environment variables to set on top of the allow-listed host variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Limits for execution (overrides defaults)
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
}

fn default_output_name() -> String {
    "main".to_owned()
}

fn default_warnings_are_errors() -> bool {
    true
}
