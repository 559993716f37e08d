//! Backend lookup by identifier and updater construction.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde_json::Value;
use tracing::{error, info};

use crate::backend::{AuthorizationHandle, BackendNotifier, UpdaterBackend};
use crate::config::{ConfigLocator, ConfigReader, FileConfigReader, MapConfigReader};
use crate::error::{ConfigError, Result, UpdaterError};
use crate::updater::Updater;

/// Constructor for a backend, bound to the notifier of the updater that will own it.
pub type BackendFactory = Box<dyn Fn(BackendNotifier) -> Box<dyn UpdaterBackend> + Send + Sync>;

/// Explicit map from backend identifiers to their factories.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `key`, replacing an earlier registration.
    /// Returns whether a factory was replaced.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F) -> bool
    where
        F: Fn(BackendNotifier) -> Box<dyn UpdaterBackend> + Send + Sync + 'static,
    {
        self.factories
            .insert(key.into(), Box::new(factory))
            .is_some()
    }

    /// Builder-style variant of [`BackendRegistry::register`].
    pub fn with_backend<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn(BackendNotifier) -> Box<dyn UpdaterBackend> + Send + Sync + 'static,
    {
        self.register(key, factory);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered identifiers in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub(crate) fn create(
        &self,
        key: &str,
        notifier: BackendNotifier,
    ) -> Option<Box<dyn UpdaterBackend>> {
        self.factories.get(key).map(|factory| factory(notifier))
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Updater {
    /// Resolve the backend named by `config` and build an updater around it.
    ///
    /// The reader and authorization move into the backend. Nothing is
    /// returned unless the backend was found and accepted its configuration.
    pub fn create(
        registry: &BackendRegistry,
        config: Box<dyn ConfigReader>,
        authorization: Option<AuthorizationHandle>,
    ) -> Result<Self> {
        let key = config.backend();
        if key.is_empty() {
            error!("updater configuration does not name a backend");
            return Err(ConfigError::MissingBackend.into());
        }

        let (tx, rx) = Updater::channel();
        let Some(mut backend) = registry.create(&key, Updater::notifier(&tx)) else {
            error!(backend = %key, "no updater backend registered under this key");
            return Err(UpdaterError::UnknownBackend(key));
        };

        if let Err(source) = backend.initialize(config, authorization) {
            error!(backend = %key, error = %source, "updater backend rejected its configuration");
            return Err(UpdaterError::BackendInit { key, source });
        }

        info!(backend = %key, features = ?backend.features(), "updater backend loaded");
        Ok(Updater::with_backend(backend, tx, rx))
    }

    /// Build an updater from the default configuration found by `locator`.
    pub fn create_default(
        registry: &BackendRegistry,
        locator: &ConfigLocator,
        authorization: Option<AuthorizationHandle>,
    ) -> Result<Self> {
        let config = locator.find().map_err(|err| {
            error!(
                app = locator.app_name(),
                "unable to find the default updater configuration file"
            );
            err
        })?;
        Self::create(registry, Box::new(config), authorization)
    }

    /// Build an updater from the configuration file at `path`.
    pub fn create_from_path(
        registry: &BackendRegistry,
        path: impl AsRef<Path>,
        authorization: Option<AuthorizationHandle>,
    ) -> Result<Self> {
        let config = FileConfigReader::open(path)?;
        Self::create(registry, Box::new(config), authorization)
    }

    /// Build an updater for `backend` configured with in-memory `values`.
    pub fn create_from_map<K, V>(
        registry: &BackendRegistry,
        backend: impl Into<String>,
        values: impl IntoIterator<Item = (K, V)>,
        authorization: Option<AuthorizationHandle>,
    ) -> Result<Self>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let config = MapConfigReader::new(backend, values);
        Self::create(registry, Box::new(config), authorization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Authorizer, Features, UpdateInstaller};
    use crate::config::{ConfigCandidate, CONFIG_FILE_NAME};
    use crate::error::BackendError;
    use crate::update_info::UpdateInfo;
    use crate::State;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Granted;

    impl Authorizer for Granted {
        fn has_admin_rights(&self) -> bool {
            true
        }

        fn execute_as_admin(&mut self, _program: &Path, _args: &[String]) -> bool {
            true
        }
    }

    /// Backend that requires a `source` key and answers checks immediately.
    struct EchoBackend {
        notifier: BackendNotifier,
        source: Option<String>,
        authorized: bool,
    }

    impl UpdaterBackend for EchoBackend {
        fn key(&self) -> &str {
            "echo"
        }

        fn features(&self) -> Features {
            if self.authorized {
                Features::TRIGGER_INSTALL | Features::PARALLEL_INSTALL
            } else {
                Features::TRIGGER_INSTALL
            }
        }

        fn initialize(
            &mut self,
            config: Box<dyn ConfigReader>,
            authorization: Option<AuthorizationHandle>,
        ) -> std::result::Result<(), BackendError> {
            let source: String = config
                .get("source")?
                .ok_or_else(|| BackendError::MissingKey("source".into()))?;
            if source.is_empty() {
                return Err(BackendError::invalid("source", "must not be empty"));
            }
            self.source = Some(source);
            self.authorized = authorization.is_some();
            Ok(())
        }

        fn check_for_updates(&mut self) {
            let source = self.source.clone().unwrap_or_default();
            self.notifier
                .check_succeeded(vec![UpdateInfo::new(source, semver::Version::new(2, 0, 0))]);
        }

        fn abort(&mut self, _force: bool) {}

        fn trigger_updates(&mut self, _updates: &[UpdateInfo], _install_now: bool) -> bool {
            true
        }

        fn install_updates(&mut self, _updates: &[UpdateInfo]) -> Option<Box<dyn UpdateInstaller>> {
            None
        }
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new().with_backend("echo", |notifier| {
            Box::new(EchoBackend {
                notifier,
                source: None,
                authorized: false,
            }) as Box<dyn UpdaterBackend>
        })
    }

    #[test]
    fn register_reports_replacement() {
        let mut registry = registry();
        assert!(registry.contains("echo"));
        assert!(!registry.contains("other"));
        let replaced = registry.register("echo", |notifier| {
            Box::new(EchoBackend {
                notifier,
                source: None,
                authorized: false,
            }) as Box<dyn UpdaterBackend>
        });
        assert!(replaced);
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[tokio::test]
    async fn resolves_backend_and_binds_its_notifier() {
        let mut updater = Updater::create_from_map(
            &registry(),
            "echo",
            [("source", json!("org.example.tool"))],
            Some(AuthorizationHandle::new(Granted)),
        )
        .unwrap();
        assert_eq!(updater.backend().key(), "echo");
        assert!(updater.backend().features().contains(Features::PARALLEL_INSTALL));
        assert_eq!(updater.state(), State::Idle);

        updater.check_for_updates();
        updater.process_next().await;

        assert_eq!(updater.state(), State::NewUpdates);
        assert_eq!(updater.update_info()[0].identifier, "org.example.tool");
    }

    #[test]
    fn unknown_backend_fails_resolution() {
        let result =
            Updater::create_from_map(&registry(), "winget", Vec::<(String, Value)>::new(), None);
        assert!(matches!(result, Err(UpdaterError::UnknownBackend(key)) if key == "winget"));
    }

    #[test]
    fn empty_backend_key_is_a_configuration_error() {
        let result = Updater::create_from_map(&registry(), "", [("source", json!("x"))], None);
        assert!(matches!(
            result,
            Err(UpdaterError::Config(ConfigError::MissingBackend))
        ));
    }

    #[test]
    fn rejected_initialization_discards_the_updater() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let registry = BackendRegistry::new().with_backend("echo", move |notifier| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(EchoBackend {
                notifier,
                source: None,
                authorized: false,
            }) as Box<dyn UpdaterBackend>
        });

        let missing =
            Updater::create_from_map(&registry, "echo", Vec::<(String, Value)>::new(), None);
        assert!(matches!(
            missing,
            Err(UpdaterError::BackendInit {
                source: BackendError::MissingKey(_),
                ..
            })
        ));

        let malformed = Updater::create_from_map(&registry, "echo", [("source", json!(42))], None);
        assert!(matches!(
            malformed,
            Err(UpdaterError::BackendInit {
                source: BackendError::Config(ConfigError::InvalidValue { .. }),
                ..
            })
        ));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn creates_from_configuration_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "backend = \"echo\"\nsource = \"from-file\"\n").unwrap();

        let updater = Updater::create_from_path(&registry(), &path, None).unwrap();
        assert_eq!(updater.backend().key(), "echo");
        assert!(!updater.backend().features().contains(Features::PARALLEL_INSTALL));

        let missing = Updater::create_from_path(&registry(), dir.path().join("absent.conf"), None);
        assert!(matches!(
            missing,
            Err(UpdaterError::Config(ConfigError::Io { .. }))
        ));
    }

    #[test]
    fn default_configuration_must_exist() {
        let locator = ConfigLocator::new("demo")
            .with_candidates(vec![ConfigCandidate::file(PathBuf::from(
                "/nonexistent/updater.conf",
            ))]);
        let result = Updater::create_default(&registry(), &locator, None);
        assert!(matches!(
            result,
            Err(UpdaterError::Config(ConfigError::NotFound))
        ));
    }
}
