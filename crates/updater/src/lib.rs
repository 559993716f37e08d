//! Backend-agnostic orchestration of application self-updates.
//!
//! An [`Updater`] owns exactly one [`UpdaterBackend`] (a package manager,
//! installer or store integration), resolved by name from a
//! [`BackendRegistry`] using the `backend` key of a [`ConfigReader`]. The
//! updater exposes the lifecycle (check, abort, schedule, install, run on
//! exit) and turns asynchronous backend results into [`UpdaterEvent`]s.
//!
//! ```ignore
//! use autoupdater::{BackendRegistry, ConfigLocator, Updater, UpdaterEvent};
//!
//! # async fn demo(registry: BackendRegistry) -> autoupdater::Result<()> {
//! let mut updater = Updater::create_default(&registry, &ConfigLocator::new("browser"), None)?;
//! let mut events = updater.take_events().expect("fresh updater");
//!
//! updater.schedule_update(60 * 60, true)?;
//! updater.check_for_updates();
//! loop {
//!     tokio::select! {
//!         _ = updater.process_next() => {}
//!         Some(event) = events.recv() => {
//!             if let UpdaterEvent::CheckUpdatesDone(state) = event {
//!                 println!("check finished: {state:?}");
//!                 break;
//!             }
//!         }
//!     }
//! }
//! updater.run_updater(false)?;
//! updater.about_to_exit();
//! # Ok(())
//! # }
//! ```

mod backend;
mod config;
mod error;
mod registry;
mod scheduler;
mod update_info;
mod updater;

pub use backend::{
    AuthorizationHandle, Authorizer, BackendNotifier, Features, Progress, UpdateInstaller,
    UpdaterBackend,
};
pub use config::{
    ConfigCandidate, ConfigLocator, ConfigReader, FileConfigReader, MapConfigReader, BACKEND_KEY,
    CONFIG_FILE_NAME, PREFERENCES_FILE_NAME, PREFERENCES_GROUP,
};
pub use error::{BackendError, ConfigError, Result, UpdaterError};
pub use registry::{BackendFactory, BackendRegistry};
pub use scheduler::{TaskId, MAX_DELAY_MILLIS};
pub use update_info::UpdateInfo;
pub use updater::{State, Updater, UpdaterEvent, CHECKING_STATUS, DEFAULT_KILL_DELAY};
