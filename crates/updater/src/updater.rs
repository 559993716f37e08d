use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::backend::{
    AuthorizationHandle, BackendNotifier, Features, Progress, UpdateInstaller, UpdaterBackend,
};
use crate::error::{Result, UpdaterError};
use crate::scheduler::{Scheduler, TaskId, MAX_DELAY_MILLIS};
use crate::update_info::UpdateInfo;

/// Status text shown while a backend without progress reporting checks.
pub const CHECKING_STATUS: &str = "Checking for updates…";

/// Grace period between a cooperative and a forced abort when callers have no
/// preference, for use with [`Updater::abort_update_check`].
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(5);

/// Lifecycle state of an [`Updater`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Nothing happened yet.
    #[default]
    Idle,
    /// A check is running.
    Checking,
    /// The last check found nothing to install.
    NoUpdates,
    /// The last check found updates; see [`Updater::update_info`].
    NewUpdates,
    /// A triggered installation is running.
    Installing,
    /// The last check or installation failed.
    Error,
}

impl State {
    /// Whether a check or installation is in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, State::Checking | State::Installing)
    }
}

/// Notifications emitted by an [`Updater`].
///
/// Within one transition, list and progress events precede
/// [`UpdaterEvent::StateChanged`], and the terminal
/// [`UpdaterEvent::CheckUpdatesDone`] / [`UpdaterEvent::InstallDone`] events
/// always come last.
pub enum UpdaterEvent {
    StateChanged(State),
    UpdateInfoChanged(Vec<UpdateInfo>),
    ProgressChanged { progress: Progress, status: String },
    RunOnExitChanged(bool),
    CheckUpdatesDone(State),
    InstallDone(bool),
    /// The caller now owns the installer and is responsible for driving it.
    ShowInstaller(Box<dyn UpdateInstaller>),
}

impl fmt::Debug for UpdaterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            Self::UpdateInfoChanged(infos) => {
                f.debug_tuple("UpdateInfoChanged").field(infos).finish()
            }
            Self::ProgressChanged { progress, status } => f
                .debug_struct("ProgressChanged")
                .field("progress", progress)
                .field("status", status)
                .finish(),
            Self::RunOnExitChanged(armed) => {
                f.debug_tuple("RunOnExitChanged").field(armed).finish()
            }
            Self::CheckUpdatesDone(state) => {
                f.debug_tuple("CheckUpdatesDone").field(state).finish()
            }
            Self::InstallDone(success) => f.debug_tuple("InstallDone").field(success).finish(),
            Self::ShowInstaller(installer) => f
                .debug_struct("ShowInstaller")
                .field("updates", &installer.updates().len())
                .finish(),
        }
    }
}

/// Work queued for the updater's control loop.
#[derive(Debug)]
pub(crate) enum Signal {
    CheckProgress { progress: Progress, status: String },
    CheckDone { success: bool, updates: Vec<UpdateInfo> },
    TriggerInstallDone { success: bool },
    ScheduleFired(TaskId),
    /// Forced abort requested by the kill timer of check number `check`.
    ForceAbort { check: u64 },
}

/// Drives update checks and installations through a single backend.
///
/// All mutation happens on the task that owns the updater. Backend results
/// and timer firings are queued and applied by [`Updater::process_next`] or
/// [`Updater::process_pending`], so the host must keep one of them running
/// alongside its own event handling.
pub struct Updater {
    backend: Box<dyn UpdaterBackend>,
    scheduler: Scheduler,
    state: State,
    update_infos: Vec<UpdateInfo>,
    run_on_exit: bool,
    exit_authorization: Option<AuthorizationHandle>,
    check_count: u64,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signals: mpsc::UnboundedReceiver<Signal>,
    event_tx: Option<mpsc::UnboundedSender<UpdaterEvent>>,
    events_taken: bool,
}

impl Updater {
    /// Create the signal channel a backend must be bound to before it is attached.
    pub(crate) fn channel() -> (mpsc::UnboundedSender<Signal>, mpsc::UnboundedReceiver<Signal>) {
        mpsc::unbounded_channel()
    }

    /// Wrap an initialized backend whose notifier feeds `signals`.
    pub(crate) fn with_backend(
        backend: Box<dyn UpdaterBackend>,
        signal_tx: mpsc::UnboundedSender<Signal>,
        signals: mpsc::UnboundedReceiver<Signal>,
    ) -> Self {
        Self {
            backend,
            scheduler: Scheduler::new(signal_tx.clone()),
            state: State::Idle,
            update_infos: Vec::new(),
            run_on_exit: false,
            exit_authorization: None,
            check_count: 0,
            signal_tx,
            signals,
            event_tx: None,
            events_taken: false,
        }
    }

    pub(crate) fn notifier(tx: &mpsc::UnboundedSender<Signal>) -> BackendNotifier {
        BackendNotifier::new(tx.clone())
    }

    /// Subscribe to the event stream. Returns `None` once taken.
    ///
    /// Events emitted before the first call, or after the receiver is
    /// dropped, are discarded.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UpdaterEvent>> {
        if self.events_taken {
            return None;
        }
        self.events_taken = true;
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        Some(rx)
    }

    pub fn backend(&self) -> &dyn UpdaterBackend {
        self.backend.as_ref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether a check or installation is in flight.
    pub fn is_running(&self) -> bool {
        self.state.is_busy()
    }

    /// Updates found by the last successful check.
    pub fn update_info(&self) -> &[UpdateInfo] {
        &self.update_infos
    }

    /// Whether an installation is armed to run when the application exits.
    pub fn will_run_on_exit(&self) -> bool {
        self.run_on_exit
    }

    /// Start a check unless one is already running.
    pub fn check_for_updates(&mut self) {
        if self.is_running() {
            debug!(state = ?self.state, "update check requested while busy, ignoring");
            return;
        }

        self.check_count += 1;
        self.state = State::Checking;
        if !self.update_infos.is_empty() {
            self.update_infos.clear();
            self.emit(UpdaterEvent::UpdateInfoChanged(Vec::new()));
        }
        if self.backend.features().contains(Features::CHECK_PROGRESS) {
            self.emit(UpdaterEvent::ProgressChanged {
                progress: Progress::Fraction(0.0),
                status: String::new(),
            });
        } else {
            self.emit(UpdaterEvent::ProgressChanged {
                progress: Progress::Indeterminate,
                status: CHECKING_STATUS.to_string(),
            });
        }
        self.emit(UpdaterEvent::StateChanged(self.state));

        info!(backend = self.backend.key(), "checking for updates");
        self.backend.check_for_updates();
    }

    /// Abort a running check.
    ///
    /// `None` asks the backend to stop cooperatively, `Some(Duration::ZERO)`
    /// forces it to stop now, and any other delay asks cooperatively first and
    /// forces the abort once the delay has passed ([`DEFAULT_KILL_DELAY`] is a
    /// sensible choice). A delay too large to be represented never escalates.
    /// Must be called from within a tokio runtime when a non-zero delay is given.
    pub fn abort_update_check(&mut self, kill_delay: Option<Duration>) {
        if self.state != State::Checking {
            return;
        }

        match kill_delay {
            Some(delay) if delay.is_zero() => {
                warn!(backend = self.backend.key(), "forcing update check to stop");
                self.backend.abort(true);
            }
            Some(delay) => {
                debug!(
                    backend = self.backend.key(),
                    kill_delay_ms = delay.as_millis() as u64,
                    "aborting update check"
                );
                self.backend.abort(false);
                let Some(deadline) = Instant::now().checked_add(delay) else {
                    warn!(
                        backend = self.backend.key(),
                        "kill delay out of range, the check will not be forced to stop"
                    );
                    return;
                };
                let tx = self.signal_tx.clone();
                let check = self.check_count;
                tokio::spawn(async move {
                    time::sleep_until(deadline).await;
                    let _ = tx.send(Signal::ForceAbort { check });
                });
            }
            None => {
                debug!(backend = self.backend.key(), "aborting update check");
                self.backend.abort(false);
            }
        }
    }

    /// Check for updates after `delay_seconds`, and repeatedly if `repeated`.
    ///
    /// Fails with [`UpdaterError::DelayOverflow`] when the delay exceeds
    /// [`MAX_DELAY_MILLIS`]; no task is created in that case.
    pub fn schedule_update(&mut self, delay_seconds: u64, repeated: bool) -> Result<TaskId> {
        let millis = delay_seconds
            .checked_mul(1000)
            .filter(|millis| *millis <= MAX_DELAY_MILLIS)
            .ok_or_else(|| {
                warn!(delay_seconds, "delay too large to be converted to milliseconds");
                UpdaterError::DelayOverflow(delay_seconds)
            })?;
        Ok(self
            .scheduler
            .start_schedule(Duration::from_millis(millis), repeated))
    }

    /// Check for updates once at `when`.
    pub fn schedule_update_at(&mut self, when: DateTime<Utc>) -> TaskId {
        self.scheduler.start_schedule_at(when)
    }

    /// Cancel a scheduled check. Unknown, fired or cancelled ids are ignored.
    pub fn cancel_scheduled_update(&mut self, id: TaskId) -> bool {
        self.scheduler.cancel_schedule(id)
    }

    /// Whether the task `id` can still fire.
    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.scheduler.is_scheduled(id)
    }

    /// Number of tasks that can still fire.
    pub fn scheduled_count(&self) -> usize {
        self.scheduler.len()
    }

    /// Install the updates found by the last check.
    ///
    /// Backends without [`Features::PARALLEL_INSTALL`] always install on exit.
    /// Trigger-style backends then only arm [`Updater::about_to_exit`];
    /// installer-style backends cannot defer and fail with
    /// [`UpdaterError::Unsupported`].
    pub fn run_updater(&mut self, force_on_exit: bool) -> Result<()> {
        if self.is_running() {
            return Err(UpdaterError::Busy);
        }

        let features = self.backend.features();
        let key = self.backend.key().to_string();
        let force_on_exit = force_on_exit || !features.contains(Features::PARALLEL_INSTALL);

        if features.contains(Features::TRIGGER_INSTALL) {
            if force_on_exit {
                if !self.run_on_exit {
                    self.run_on_exit = true;
                    info!(backend = %key, "installation armed to run on exit");
                    self.emit(UpdaterEvent::RunOnExitChanged(true));
                }
                Ok(())
            } else if self.backend.trigger_updates(&self.update_infos, true) {
                self.state = State::Installing;
                self.emit(UpdaterEvent::StateChanged(self.state));
                Ok(())
            } else {
                Err(UpdaterError::TriggerRejected(key))
            }
        } else if features.contains(Features::PERFORM_INSTALL) {
            if force_on_exit {
                error!(backend = %key, "backend does not support installation after exiting");
                return Err(UpdaterError::Unsupported {
                    key,
                    what: "installation after exiting",
                });
            }
            match self.backend.install_updates(&self.update_infos) {
                Some(installer) => {
                    self.emit(UpdaterEvent::ShowInstaller(installer));
                    Ok(())
                }
                None => Err(UpdaterError::InstallerUnavailable(key)),
            }
        } else {
            error!(backend = %key, "backend does not support installation");
            Err(UpdaterError::Unsupported {
                key,
                what: "installation",
            })
        }
    }

    /// Hold `authorization` for the exit-time installation.
    ///
    /// The handle is consumed by [`Updater::about_to_exit`] or released by
    /// [`Updater::cancel_exit_run`]. A handle stored earlier is released and
    /// replaced.
    pub fn set_exit_authorization(&mut self, authorization: AuthorizationHandle) {
        if self.exit_authorization.replace(authorization).is_some() {
            debug!(backend = self.backend.key(), "replaced exit authorization");
        }
    }

    /// Disarm a pending exit-time installation.
    pub fn cancel_exit_run(&mut self) {
        if self.run_on_exit {
            self.run_on_exit = false;
            self.exit_authorization = None;
            info!(backend = self.backend.key(), "exit installation cancelled");
            self.emit(UpdaterEvent::RunOnExitChanged(false));
        }
    }

    /// Shutdown hook; the host must call this before the process terminates.
    ///
    /// When an exit run is armed the backend is told to install without
    /// waiting. The outcome is not observed. Returns whether an installation
    /// was handed to the backend.
    pub fn about_to_exit(&mut self) -> bool {
        if !self.run_on_exit {
            return false;
        }
        self.run_on_exit = false;

        let authorization = self.exit_authorization.take();
        let started = self.backend.trigger_updates(&self.update_infos, false);
        drop(authorization);

        if started {
            info!(
                backend = self.backend.key(),
                updates = self.update_infos.len(),
                "started exit installation"
            );
        } else {
            warn!(backend = self.backend.key(), "backend refused exit installation");
        }
        true
    }

    /// Wait for the next backend or timer notification and apply it.
    pub async fn process_next(&mut self) {
        if let Some(signal) = self.signals.recv().await {
            self.handle_signal(signal);
        }
    }

    /// Apply every notification that is already queued. Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(signal) = self.signals.try_recv() {
            self.handle_signal(signal);
            handled += 1;
        }
        handled
    }

    /// Apply notifications until the surrounding task is cancelled.
    pub async fn run(&mut self) {
        loop {
            self.process_next().await;
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::CheckProgress { progress, status } => {
                if self.state == State::Checking {
                    self.emit(UpdaterEvent::ProgressChanged { progress, status });
                }
            }
            Signal::CheckDone { success, updates } => {
                if self.state == State::Checking {
                    self.check_done(success, updates);
                } else {
                    warn!(state = ?self.state, "ignoring check result outside of a check");
                }
            }
            Signal::TriggerInstallDone { success } => {
                if self.state == State::Installing {
                    self.install_done(success);
                } else {
                    debug!(
                        state = ?self.state,
                        success,
                        "ignoring install result outside of an installation"
                    );
                }
            }
            Signal::ScheduleFired(id) => {
                if self.scheduler.fire(id) {
                    debug!(task = %id, "scheduled update check due");
                    self.check_for_updates();
                }
            }
            Signal::ForceAbort { check } => {
                if check == self.check_count {
                    self.abort_update_check(Some(Duration::ZERO));
                }
            }
        }
    }

    fn check_done(&mut self, success: bool, updates: Vec<UpdateInfo>) {
        if success {
            self.update_infos = updates;
            if self.update_infos.is_empty() {
                self.state = State::NoUpdates;
            } else {
                self.state = State::NewUpdates;
                self.emit(UpdaterEvent::UpdateInfoChanged(self.update_infos.clone()));
            }
        } else {
            self.update_infos.clear();
            self.state = State::Error;
        }
        self.debug_check_invariants();

        info!(
            backend = self.backend.key(),
            state = ?self.state,
            updates = self.update_infos.len(),
            "update check finished"
        );
        self.emit(UpdaterEvent::StateChanged(self.state));
        self.emit(UpdaterEvent::CheckUpdatesDone(self.state));
    }

    fn install_done(&mut self, success: bool) {
        if !self.update_infos.is_empty() {
            self.update_infos.clear();
            self.emit(UpdaterEvent::UpdateInfoChanged(Vec::new()));
        }
        self.state = if success {
            State::NoUpdates
        } else {
            State::Error
        };
        self.debug_check_invariants();

        info!(backend = self.backend.key(), success, "installation finished");
        self.emit(UpdaterEvent::StateChanged(self.state));
        self.emit(UpdaterEvent::InstallDone(success));
    }

    fn debug_check_invariants(&self) {
        debug_assert_eq!(
            self.state == State::NewUpdates,
            !self.update_infos.is_empty(),
            "update list out of sync with state {:?}",
            self.state
        );
    }

    fn emit(&mut self, event: UpdaterEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        if tx.send(event).is_err() {
            debug!("event receiver dropped, discarding further events");
            self.event_tx = None;
        }
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        if self.run_on_exit {
            warn!(
                backend = self.backend.key(),
                "updater dropped with run on exit armed before the application quit"
            );
        }
        if self.is_running() {
            error!(
                backend = self.backend.key(),
                state = ?self.state,
                "updater dropped while an operation was running"
            );
        }
    }
}
