use std::path::PathBuf;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors raised while constructing or driving an [`Updater`](crate::Updater).
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// No usable configuration could be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The configured backend identifier is not registered.
    #[error("no backend registered for key {0:?}")]
    UnknownBackend(String),
    /// The backend rejected its configuration during initialization.
    #[error("backend {key} failed to initialize: {source}")]
    BackendInit {
        /// Identifier of the rejecting backend.
        key: String,
        /// Reason given by the backend.
        #[source]
        source: BackendError,
    },
    /// A check or installation is already in flight.
    #[error("updater is busy")]
    Busy,
    /// The backend lacks the features the requested install path needs.
    #[error("backend {key} does not support {what}")]
    Unsupported {
        /// Identifier of the backend.
        key: String,
        /// Human readable name of the missing capability.
        what: &'static str,
    },
    /// The backend refused to trigger the installation.
    #[error("backend {0} rejected the install trigger")]
    TriggerRejected(String),
    /// The backend could not provide an installer for the current updates.
    #[error("backend {0} did not provide an installer")]
    InstallerUnavailable(String),
    /// The requested delay cannot be represented in milliseconds.
    #[error("delay of {0} seconds does not fit the scheduler resolution")]
    DelayOverflow(u64),
}

/// Errors raised while locating or reading update configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// None of the searched locations held a configuration with a backend key.
    #[error("no updater configuration found")]
    NotFound,
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not a valid document.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying decoder failure.
        #[source]
        source: toml::de::Error,
    },
    /// The configuration does not name a backend.
    #[error("configuration has no backend key")]
    MissingBackend,
    /// A value exists but does not have the requested shape.
    #[error("invalid value for {key}: {source}")]
    InvalidValue {
        /// Key that held the value.
        key: String,
        /// Deserialization failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors a backend reports when it cannot be initialized.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// A required configuration key is absent.
    #[error("missing required configuration key {0:?}")]
    MissingKey(String),
    /// A configuration value is present but unusable.
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Reading the configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Helper for wrapping validation failures.
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
