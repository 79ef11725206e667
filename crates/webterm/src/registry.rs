//! Language lookup
//!
//! An immutable table of configured languages, built once at startup and
//! shared between sessions.

use std::collections::BTreeMap;

use tracing::warn;

use crate::config::{Config, ConfigError, Language};

/// Immutable language table
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, Language>,
    fallback: String,
    fallback_language: Language,
}

/// Outcome of [`LanguageRegistry::resolve`]
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    /// Canonical id of the language that will run
    pub id: &'a str,

    pub language: &'a Language,

    /// The requested id when it was unknown and the fallback was used
    pub fallback_from: Option<&'a str>,
}

impl Resolved<'_> {
    pub fn is_fallback(&self) -> bool {
        self.fallback_from.is_some()
    }
}

impl LanguageRegistry {
    /// Build the registry from a validated config
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let languages = config
            .languages
            .iter()
            .map(|(id, lang)| (id.to_ascii_lowercase(), lang.clone()))
            .collect::<BTreeMap<_, _>>();

        let fallback = config.fallback_language.to_ascii_lowercase();
        let fallback_language = languages
            .get(&fallback)
            .cloned()
            .ok_or_else(|| ConfigError::LanguageNotFound(config.fallback_language.clone()))?;

        Ok(Self {
            languages,
            fallback,
            fallback_language,
        })
    }

    /// Resolve a language id, case-insensitively.
    ///
    /// Never fails: an unknown id resolves to the fallback language.
    pub fn resolve<'a>(&'a self, requested: &'a str) -> Resolved<'a> {
        let key = requested.trim().to_ascii_lowercase();
        if let Some((id, language)) = self.languages.get_key_value(&key) {
            return Resolved {
                id,
                language,
                fallback_from: None,
            };
        }

        warn!(
            requested,
            fallback = %self.fallback,
            "unknown language, using fallback"
        );

        Resolved {
            id: &self.fallback,
            language: &self.fallback_language,
            fallback_from: Some(requested),
        }
    }

    /// Exact lookup by canonical id
    pub fn get(&self, id: &str) -> Option<&Language> {
        self.languages.get(&id.to_ascii_lowercase())
    }

    /// Supported language ids, in stable order
    pub fn list_supported(&self) -> Vec<&str> {
        self.languages.keys().map(String::as_str).collect()
    }

    /// Id of the fallback language
    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Sample snippet for the language that owns `extension`
    pub fn template_for_extension(&self, extension: &str) -> Option<&str> {
        self.languages
            .values()
            .find(|lang| lang.handles_extension(extension))
            .map(|lang| lang.snippet.as_str())
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}
