use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single update discovered by a backend.
///
/// The updater never interprets these values; ordering and contents are
/// decided by the backend that produced them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Backend specific identifier of the component (package name, app id, ...).
    pub identifier: String,
    /// Version the component would be updated to.
    pub version: semver::Version,
    /// Human readable component name.
    #[serde(default)]
    pub name: String,
    /// Opaque backend metadata (download size, release notes, ...).
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl UpdateInfo {
    /// Create an entry with an empty display name and no metadata.
    pub fn new(identifier: impl Into<String>, version: semver::Version) -> Self {
        Self {
            identifier: identifier.into(),
            version,
            name: String::new(),
            data: Map::new(),
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach a metadata value.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Display name, falling back to the identifier when none was set.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.identifier
        } else {
            &self.name
        }
    }
}
