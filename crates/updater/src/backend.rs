//! Contract implemented by every update mechanism.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use bitflags::bitflags;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ConfigReader;
use crate::error::BackendError;
use crate::update_info::UpdateInfo;
use crate::updater::Signal;

bitflags! {
    /// Capabilities a backend advertises.
    ///
    /// The set is fixed for the lifetime of a backend and decides which
    /// install strategy [`Updater::run_updater`](crate::Updater::run_updater) takes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u8 {
        /// The backend reports determinate progress while checking.
        const CHECK_PROGRESS   = 0b0000_0001;
        /// The backend can start an installation and report back when done.
        const TRIGGER_INSTALL  = 0b0000_0010;
        /// The backend hands out an installer the caller drives itself.
        const PERFORM_INSTALL  = 0b0000_0100;
        /// Installing is safe while the application keeps running.
        const PARALLEL_INSTALL = 0b0000_1000;
    }
}

/// Progress of an update check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// The backend cannot tell how far along it is.
    Indeterminate,
    /// Completed fraction in `0.0..=1.0`.
    Fraction(f64),
}

/// Privileged operations an [`AuthorizationHandle`] can perform.
pub trait Authorizer: Send {
    /// Whether the current process already runs with elevated rights.
    fn has_admin_rights(&self) -> bool;

    /// Run `program` with elevated rights. Returns whether it could be started.
    fn execute_as_admin(&mut self, program: &Path, args: &[String]) -> bool;
}

/// Single-use credential for privileged install actions.
///
/// The handle cannot be cloned; whoever receives it owns it and releases it
/// by dropping.
pub struct AuthorizationHandle {
    inner: Box<dyn Authorizer>,
}

impl AuthorizationHandle {
    pub fn new(authorizer: impl Authorizer + 'static) -> Self {
        Self {
            inner: Box::new(authorizer),
        }
    }

    pub fn authorizer(&mut self) -> &mut dyn Authorizer {
        self.inner.as_mut()
    }

    pub fn into_inner(self) -> Box<dyn Authorizer> {
        self.inner
    }
}

impl fmt::Debug for AuthorizationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationHandle").finish_non_exhaustive()
    }
}

/// Installer object returned by backends advertising [`Features::PERFORM_INSTALL`].
///
/// Ownership moves to the caller, who decides when and how to drive it.
#[async_trait]
pub trait UpdateInstaller: Send {
    /// Updates this installer was created for.
    fn updates(&self) -> &[UpdateInfo];

    /// Perform the installation.
    async fn install(&mut self) -> Result<(), BackendError>;

    /// Request that a running installation stops.
    fn cancel(&mut self);
}

/// Channel through which a backend reports asynchronous results.
///
/// Notifications are queued and applied by the owning
/// [`Updater`](crate::Updater) on its own task, so the handle may be moved
/// into worker tasks or threads freely.
#[derive(Debug, Clone)]
pub struct BackendNotifier {
    tx: mpsc::UnboundedSender<Signal>,
}

impl BackendNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self { tx }
    }

    /// Report check progress. Only meaningful for [`Features::CHECK_PROGRESS`] backends.
    pub fn check_progress(&self, progress: Progress, status: impl Into<String>) {
        self.send(Signal::CheckProgress {
            progress,
            status: status.into(),
        });
    }

    /// Finish a check successfully with the discovered updates.
    pub fn check_succeeded(&self, updates: Vec<UpdateInfo>) {
        self.send(Signal::CheckDone {
            success: true,
            updates,
        });
    }

    /// Finish a check with a failure.
    pub fn check_failed(&self) {
        self.send(Signal::CheckDone {
            success: false,
            updates: Vec::new(),
        });
    }

    /// Report the outcome of a triggered installation.
    pub fn trigger_install_done(&self, success: bool) {
        self.send(Signal::TriggerInstallDone { success });
    }

    /// Whether the owning updater is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            debug!("updater dropped before backend notification was delivered");
        }
    }
}

/// A pluggable update mechanism.
///
/// Backends are created by a [`BackendRegistry`](crate::BackendRegistry)
/// factory and initialized exactly once before the updater uses them.
pub trait UpdaterBackend: Send {
    /// Identifier the backend was registered under.
    fn key(&self) -> &str;

    /// Capabilities of this backend.
    fn features(&self) -> Features;

    /// Validate the configuration and prepare for use.
    ///
    /// Both the reader and the optional authorization move into the backend.
    fn initialize(
        &mut self,
        config: Box<dyn ConfigReader>,
        authorization: Option<AuthorizationHandle>,
    ) -> Result<(), BackendError>;

    /// Start checking for updates.
    ///
    /// Must eventually call [`BackendNotifier::check_succeeded`] or
    /// [`BackendNotifier::check_failed`].
    fn check_for_updates(&mut self);

    /// Stop a running check. With `force` set the check must end promptly
    /// and report failure; otherwise cancellation is cooperative.
    fn abort(&mut self, force: bool);

    /// Start installing `updates`.
    ///
    /// With `install_now` unset the call happens while the application exits
    /// and its completion may never be observed.
    fn trigger_updates(&mut self, updates: &[UpdateInfo], install_now: bool) -> bool;

    /// Create an installer for `updates`, or `None` if that is not possible.
    fn install_updates(&mut self, updates: &[UpdateInfo]) -> Option<Box<dyn UpdateInstaller>>;
}
