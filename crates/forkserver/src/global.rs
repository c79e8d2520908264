// crates/forkserver/src/global.rs
use std::env;
use std::os::fd::BorrowedFd;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

use comms::SpawnRequest;

use crate::error::SupervisorError;
use crate::image::InstalledImage;
use crate::launch::{ForkLauncher, HelperHandle, Launcher};
use crate::start_mode::{StartMode, StartModeSet};

/// Presence of this variable (any value) unconditionally forbids starting
/// the helper. Re-read on every start attempt.
pub const DISABLE_ENV: &str = "SANDFORK_NO_FORKSERVER";

/// Start-mode configuration consulted by [`global`]. Default `"ondemand"`.
pub const START_MODE_ENV: &str = "SANDFORK_FORKSERVER_START_MODE";

/// Process-wide fork-server supervisor.
///
/// Holds at most one [`HelperHandle`] behind a single lock. The lock spans
/// whole operations, launch included: concurrent first users serialize and
/// exactly one of them launches; nobody can observe a half-constructed
/// handle. Start modes are captured at construction.
pub struct GlobalForkClient {
    state: Mutex<Option<HelperHandle>>,
    start_modes: StartModeSet,
    launcher: Box<dyn Launcher>,
}

impl GlobalForkClient {
    pub fn new(start_modes: StartModeSet, launcher: impl Launcher + 'static) -> Self {
        GlobalForkClient {
            state: Mutex::new(None),
            start_modes,
            launcher: Box::new(launcher),
        }
    }

    /// Supervisor over the production fork/exec launcher.
    pub fn with_start_modes(start_modes: StartModeSet) -> Self {
        Self::new(start_modes, ForkLauncher::new(InstalledImage))
    }

    fn lock(&self) -> MutexGuard<'_, Option<HelperHandle>> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn disabled() -> bool {
        env::var_os(DISABLE_ENV).is_some()
    }

    fn on_demand(&self) -> bool {
        self.start_modes.contains(StartMode::OnDemand)
    }

    fn ensure_started_locked(
        &self,
        state: &mut Option<HelperHandle>,
        start_if_needed: bool,
    ) -> Result<(), SupervisorError> {
        if state.is_some() || !start_if_needed {
            return Ok(());
        }
        if Self::disabled() {
            tracing::debug!(
                "start of the global fork-server prevented by the {DISABLE_ENV} \
                 environment variable"
            );
            return Ok(());
        }
        *state = Some(self.launcher.launch()?);
        Ok(())
    }

    /// Start the helper if permitted and not yet running. Returns whether a
    /// helper is running afterwards.
    pub fn ensure_started(&self, start_if_needed: bool) -> Result<bool, SupervisorError> {
        let mut state = self.lock();
        self.ensure_started_locked(&mut state, start_if_needed)?;
        Ok(state.is_some())
    }

    /// Drop the helper handle. The helper sees the channel close and exits.
    /// No-op when nothing is running; the next permitted operation starts a
    /// fresh generation.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        *state = None;
    }

    /// Forward a spawn request, starting the helper on demand per the
    /// configured start modes. The returned pid is whatever the helper
    /// answered, `-1` included; a terminated channel is logged but does not
    /// change the result or the state.
    pub fn send_request(
        &self,
        request: &SpawnRequest,
        exec_fd: Option<BorrowedFd<'_>>,
        comms_fd: Option<BorrowedFd<'_>>,
        user_ns_fd: Option<BorrowedFd<'_>>,
        init_pid: Option<&mut libc::pid_t>,
    ) -> Result<libc::pid_t, SupervisorError> {
        let mut state = self.lock();
        self.ensure_started_locked(&mut state, self.on_demand())?;
        let handle = state.as_mut().ok_or(SupervisorError::NotRunning)?;
        let pid = handle
            .client_mut()
            .send_request(request, exec_fd, comms_fd, user_ns_fd, init_pid);
        if handle.is_terminated() {
            tracing::error!("global forkserver connection terminated");
        }
        Ok(pid)
    }

    /// The running helper's pid, starting it on demand per configuration.
    pub fn pid(&self) -> Result<libc::pid_t, SupervisorError> {
        let mut state = self.lock();
        self.ensure_started_locked(&mut state, self.on_demand())?;
        let handle = state.as_ref().ok_or(SupervisorError::NotRunning)?;
        Ok(handle.pid())
    }
}

/// The process-wide supervisor, built on first use from [`START_MODE_ENV`].
pub fn global() -> &'static GlobalForkClient {
    static GLOBAL: Lazy<GlobalForkClient> = Lazy::new(|| {
        let modes = match env::var(START_MODE_ENV) {
            Ok(text) => match text.parse::<StartModeSet>() {
                Ok(set) => set,
                Err(err) => {
                    tracing::error!("{err}; falling back to ondemand");
                    StartModeSet::from(StartMode::OnDemand)
                }
            },
            Err(_) => StartModeSet::from(StartMode::OnDemand),
        };
        GlobalForkClient::with_start_modes(modes)
    });
    &GLOBAL
}
