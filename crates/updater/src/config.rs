//! Read-only views over update configuration.
//!
//! Backends receive their settings through [`ConfigReader`], which hides
//! whether the values came from an in-memory map ([`MapConfigReader`]) or a
//! file on disk ([`FileConfigReader`]). [`ConfigLocator`] implements the
//! search for the default configuration file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Reserved key naming the backend implementation to load.
pub const BACKEND_KEY: &str = "backend";
/// File name searched for in the config and data directories.
pub const CONFIG_FILE_NAME: &str = "updater.conf";
/// File name of the per-user preferences store.
pub const PREFERENCES_FILE_NAME: &str = "preferences.toml";
/// Group inside the preferences store that holds updater settings.
pub const PREFERENCES_GROUP: &str = "updater";

/// Separator between a group and its keys in flattened lookups.
const GROUP_SEPARATOR: char = '/';

/// Read-only key/value view over update configuration.
pub trait ConfigReader: Send + Sync {
    /// Identifier of the backend to load. Empty when not configured.
    fn backend(&self) -> String;

    /// Look up a key, returning `None` when it is absent.
    fn value(&self, key: &str) -> Option<Value>;

    /// Look up a key, falling back to `default` when it is absent.
    fn value_or(&self, key: &str, default: Value) -> Value {
        self.value(key).unwrap_or(default)
    }
}

impl dyn ConfigReader {
    /// Deserialize the value stored under `key`.
    ///
    /// Absent keys yield `Ok(None)`; present values of the wrong shape are an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.value(key)
            .map(|value| {
                serde_json::from_value(value).map_err(|source| ConfigError::InvalidValue {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Deserialize the value stored under `key`, or return `default` when absent.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }
}

fn backend_from(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Configuration held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MapConfigReader {
    backend: String,
    values: BTreeMap<String, Value>,
}

impl MapConfigReader {
    /// Create a reader for `backend` with the given key/value pairs.
    pub fn new<K, V>(backend: impl Into<String>, values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            backend: backend.into(),
            values: values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Add or replace a value.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigReader for MapConfigReader {
    fn backend(&self) -> String {
        self.backend.clone()
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

/// Configuration persisted in a TOML document on disk.
///
/// Nested tables are flattened into `group/key` names. A reader opened with
/// [`FileConfigReader::open_group`] resolves every key, including
/// [`BACKEND_KEY`], relative to that group.
#[derive(Debug, Clone)]
pub struct FileConfigReader {
    path: PathBuf,
    group: Option<String>,
    values: BTreeMap<String, Value>,
}

impl FileConfigReader {
    /// Open the document at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load(path.as_ref(), None)
    }

    /// Open the document at `path`, scoped to the table `group`.
    pub fn open_group(
        path: impl AsRef<Path>,
        group: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Self::load(path.as_ref(), Some(group.into()))
    }

    fn load(path: &Path, group: Option<String>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table: toml::Table = text.parse().map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut values = BTreeMap::new();
        flatten_table(None, table, &mut values);
        Ok(Self {
            path: path.to_path_buf(),
            group,
            values,
        })
    }

    /// File this reader was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Group the lookups are scoped to, if any.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        match &self.group {
            Some(group) => self
                .values
                .get(&format!("{group}{GROUP_SEPARATOR}{key}")),
            None => self.values.get(key),
        }
    }
}

impl ConfigReader for FileConfigReader {
    fn backend(&self) -> String {
        backend_from(self.lookup(BACKEND_KEY))
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.lookup(key).cloned()
    }
}

fn flatten_table(prefix: Option<&str>, table: toml::Table, out: &mut BTreeMap<String, Value>) {
    for (key, value) in table {
        let name = match prefix {
            Some(prefix) => format!("{prefix}{GROUP_SEPARATOR}{key}"),
            None => key,
        };
        match value {
            toml::Value::Table(inner) => flatten_table(Some(&name), inner, out),
            other => {
                out.insert(name, toml_to_json(other));
            }
        }
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(text) => Value::String(text),
        toml::Value::Integer(number) => Value::from(number),
        toml::Value::Float(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(flag) => Value::Bool(flag),
        toml::Value::Datetime(datetime) => Value::String(datetime.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, value)| (key, toml_to_json(value)))
                .collect(),
        ),
    }
}

/// A location that may hold the default configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCandidate {
    /// File to open.
    pub path: PathBuf,
    /// Table inside the file to scope lookups to.
    pub group: Option<String>,
}

impl ConfigCandidate {
    /// Candidate whose settings live at the top level of the file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            group: None,
        }
    }

    /// Candidate whose settings live in the table `group`.
    pub fn grouped(path: impl Into<PathBuf>, group: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            group: Some(group.into()),
        }
    }

    fn open(&self) -> Result<FileConfigReader, ConfigError> {
        match &self.group {
            Some(group) => FileConfigReader::open_group(&self.path, group.clone()),
            None => FileConfigReader::open(&self.path),
        }
    }
}

/// Search for the default updater configuration.
///
/// Candidates are tried in order: the per-user preferences store, the
/// application config directory, the application data directory and finally
/// the directory of the running executable. The first file that parses and
/// names a backend wins.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    app_name: String,
    candidates: Option<Vec<ConfigCandidate>>,
}

impl ConfigLocator {
    /// Create a locator for the application `app_name`.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            candidates: None,
        }
    }

    /// Replace the platform search order with explicit candidates.
    pub fn with_candidates(mut self, candidates: Vec<ConfigCandidate>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    /// Name used for the per-application directories.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Locations searched by [`ConfigLocator::find`], highest priority first.
    pub fn candidates(&self) -> Vec<ConfigCandidate> {
        if let Some(candidates) = &self.candidates {
            return candidates.clone();
        }

        let mut candidates = Vec::new();
        if let Some(dir) = dirs::preference_dir() {
            candidates.push(ConfigCandidate::grouped(
                dir.join(&self.app_name).join(PREFERENCES_FILE_NAME),
                PREFERENCES_GROUP,
            ));
        }

        let app_dirs = [dirs::config_dir(), dirs::data_dir()]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(&self.app_name));
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));

        let mut visited: Vec<PathBuf> = Vec::new();
        for dir in app_dirs.chain(exe_dir) {
            // config and data directories coincide on some platforms
            if visited.contains(&dir) {
                continue;
            }
            candidates.push(ConfigCandidate::file(dir.join(CONFIG_FILE_NAME)));
            visited.push(dir);
        }
        candidates
    }

    /// Open the first candidate that holds a usable configuration.
    pub fn find(&self) -> Result<FileConfigReader, ConfigError> {
        for candidate in self.candidates() {
            if !candidate.path.is_file() {
                continue;
            }
            match candidate.open() {
                Ok(reader) if !reader.backend().is_empty() => {
                    debug!(path = %candidate.path.display(), "using updater configuration");
                    return Ok(reader);
                }
                Ok(_) => {
                    debug!(
                        path = %candidate.path.display(),
                        "configuration has no backend key, skipping"
                    );
                }
                Err(err) => {
                    warn!(
                        path = %candidate.path.display(),
                        error = %err,
                        "ignoring unreadable updater configuration"
                    );
                }
            }
        }
        Err(ConfigError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn map_reader_distinguishes_absent_and_default() {
        let reader = MapConfigReader::new("dummy", [("path", json!("/opt/app"))]);
        assert_eq!(reader.backend(), "dummy");
        assert_eq!(reader.value("path"), Some(json!("/opt/app")));
        assert_eq!(reader.value("missing"), None);
        assert_eq!(reader.value_or("missing", json!(5)), json!(5));
        assert_eq!(reader.value_or("path", json!(5)), json!("/opt/app"));
    }

    #[test]
    fn typed_lookup_reports_shape_mismatch() {
        let reader: Box<dyn ConfigReader> =
            Box::new(MapConfigReader::new("dummy", [("retries", json!("three"))]));
        assert!(matches!(
            reader.get::<u32>("retries"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(reader.get::<u32>("absent").unwrap(), None);
        assert_eq!(reader.get_or("absent", 7u32).unwrap(), 7);
    }

    #[test]
    fn file_reader_flattens_tables() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            CONFIG_FILE_NAME,
            r#"
backend = "apt"
timeout = 30

[install]
silent = true
args = ["--yes", "--quiet"]
"#,
        );

        let reader = FileConfigReader::open(&path).unwrap();
        assert_eq!(reader.backend(), "apt");
        assert_eq!(reader.value("timeout"), Some(json!(30)));
        assert_eq!(reader.value("install/silent"), Some(json!(true)));
        assert_eq!(reader.value("install/args"), Some(json!(["--yes", "--quiet"])));
        assert_eq!(reader.value("silent"), None);
    }

    #[test]
    fn grouped_reader_scopes_backend_key() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            PREFERENCES_FILE_NAME,
            r#"
backend = "outer"

[updater]
backend = "store"
channel = "beta"
"#,
        );

        let reader = FileConfigReader::open_group(&path, PREFERENCES_GROUP).unwrap();
        assert_eq!(reader.backend(), "store");
        assert_eq!(reader.value("channel"), Some(json!("beta")));
        assert_eq!(reader.group(), Some(PREFERENCES_GROUP));
    }

    #[test]
    fn file_reader_reports_parse_errors() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), CONFIG_FILE_NAME, "backend = \n");
        assert!(matches!(
            FileConfigReader::open(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn locator_honours_candidate_order_and_skips_unusable_files() {
        let dir = tempdir().unwrap();
        let no_backend = write(dir.path(), "empty.conf", "channel = \"stable\"\n");
        let broken = write(dir.path(), "broken.conf", "[[[\n");
        let preferred = write(
            dir.path(),
            PREFERENCES_FILE_NAME,
            "[updater]\nbackend = \"native\"\n",
        );
        let fallback = write(dir.path(), CONFIG_FILE_NAME, "backend = \"file\"\n");

        let locator = ConfigLocator::new("demo").with_candidates(vec![
            ConfigCandidate::file(dir.path().join("missing.conf")),
            ConfigCandidate::file(no_backend),
            ConfigCandidate::file(broken),
            ConfigCandidate::grouped(preferred, PREFERENCES_GROUP),
            ConfigCandidate::file(fallback),
        ]);

        let reader = locator.find().unwrap();
        assert_eq!(reader.backend(), "native");
    }

    #[test]
    fn locator_without_usable_candidates_fails() {
        let dir = tempdir().unwrap();
        let locator = ConfigLocator::new("demo")
            .with_candidates(vec![ConfigCandidate::file(dir.path().join(CONFIG_FILE_NAME))]);
        assert!(matches!(locator.find(), Err(ConfigError::NotFound)));
    }

    #[test]
    fn default_candidates_do_not_repeat_directories() {
        let candidates = ConfigLocator::new("demo").candidates();
        for (index, candidate) in candidates.iter().enumerate() {
            assert!(
                !candidates[..index].contains(candidate),
                "duplicate candidate {candidate:?}"
            );
        }
    }
}
