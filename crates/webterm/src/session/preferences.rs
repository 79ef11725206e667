//! Per-client preferences
//!
//! Preferences outlive a single connection: a client reconnecting with the
//! same client id gets its earlier settings back. Each session only ever
//! sees the entry for its own key.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Settings a client may send along with `execute`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    /// Stream progress notices ("Compiling...") before program output
    pub show_progress: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            show_progress: true,
        }
    }
}

type Entries = Arc<RwLock<HashMap<String, Preferences>>>;

/// Preferences of every known client, keyed by client id
#[derive(Debug, Clone, Default)]
pub struct PreferenceStore {
    entries: Entries,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle scoped to `client_id`
    pub fn handle(&self, client_id: impl Into<String>) -> PreferenceHandle {
        PreferenceHandle {
            key: client_id.into(),
            entries: Arc::clone(&self.entries),
        }
    }

    /// Number of clients with stored preferences
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read and write access to a single client's preferences
#[derive(Debug, Clone)]
pub struct PreferenceHandle {
    key: String,
    entries: Entries,
}

impl PreferenceHandle {
    pub fn client_id(&self) -> &str {
        &self.key
    }

    /// Stored preferences, or the defaults if none were set
    pub fn get(&self) -> Preferences {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, preferences: Preferences) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.key.clone(), preferences);
    }
}
