//! Per-service lifecycle
//!
//! A [`ServiceLifecycle`] owns one managed service: its driver, its process
//! handle and its [`ServiceState`]. The driver supplies the service-specific
//! steps (initialize, upgrade, launch, probe); the lifecycle sequences them
//! and enforces the state machine.

use crate::health::{ReadinessPoller, ReadinessProbe};
use crate::marker::{MarkerStatus, VersionMarker, upgrade_with_backup};
use crate::pidfile::{PidKiller, SignalKiller, cleanup_stale_pid_file};
use crate::state::{ServiceState, StateChange};
use crate::{Error, Result};
use async_channel::Sender;
use async_trait::async_trait;
use chrono::Utc;
use command_executor::ProcessHandle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time a service gets to exit after SIGTERM
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// What `launch` left running
pub enum Launched {
    /// A process we hold a handle to
    Process(Box<dyn ProcessHandle>),
    /// A self-daemonizing service, stopped through the driver
    Daemon,
}

/// How a service's readiness is established
#[derive(Clone)]
pub struct ReadinessCheck {
    /// The probe
    pub probe: Arc<dyn ReadinessProbe>,
    /// How often and how long to run it
    pub poller: ReadinessPoller,
}

/// The service-specific half of a lifecycle
#[async_trait]
pub trait ServiceDriver: Send + Sync {
    /// Service name, unique within an orchestrator
    fn name(&self) -> &str;

    /// Services that must be ready before this one starts
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Where the version marker lives and which versions need migration
    fn marker(&self) -> VersionMarker;

    /// Runs before anything else on every start (create dirs, clear leftovers)
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// One-shot initialization, run when the marker is missing
    async fn initialize(&self) -> Result<()>;

    /// Migrate the state directory in place; a backup is taken first
    async fn upgrade(&self) -> Result<()> {
        Err(Error::Config(format!("{} has no upgrade path", self.name())))
    }

    /// PID files a crashed previous run may have left behind
    fn stale_pid_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Launch the long-running service
    async fn launch(&self) -> Result<Launched>;

    /// Readiness check; `None` means ready as soon as launched
    fn readiness(&self) -> Option<ReadinessCheck> {
        None
    }

    /// Runs once the probe reports ready, before the service counts as ready
    async fn after_ready(&self, _first_boot: bool) -> Result<()> {
        Ok(())
    }

    /// Stop a [`Launched::Daemon`] service
    async fn stop_daemon(&self) -> Result<()> {
        Ok(())
    }

    /// Forced termination by name, used when SIGTERM does not take effect
    /// or when a start was abandoned midway
    async fn force_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Owns one service and drives it through its states
pub struct ServiceLifecycle {
    driver: Arc<dyn ServiceDriver>,
    state: ServiceState,
    process: Option<Box<dyn ProcessHandle>>,
    daemon: bool,
    first_boot: bool,
    backup_root: PathBuf,
    stop_grace: Duration,
    killer: Arc<dyn PidKiller>,
    events: Option<Sender<StateChange>>,
}

impl ServiceLifecycle {
    /// Lifecycle for `driver`, backing up state directories under `backup_root`
    pub fn new(driver: Arc<dyn ServiceDriver>, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            state: ServiceState::Unstarted,
            process: None,
            daemon: false,
            first_boot: false,
            backup_root: backup_root.into(),
            stop_grace: DEFAULT_STOP_GRACE,
            killer: Arc::new(SignalKiller),
            events: None,
        }
    }

    /// Time to wait after SIGTERM before forcing
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Replace the stale-PID killer
    pub fn with_pid_killer(mut self, killer: Arc<dyn PidKiller>) -> Self {
        self.killer = killer;
        self
    }

    /// Publish every state change to `events`
    pub fn with_events(mut self, events: Sender<StateChange>) -> Self {
        self.events = Some(events);
        self
    }

    /// Service name
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Current state
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Declared predecessors
    pub fn depends_on(&self) -> Vec<String> {
        self.driver.depends_on()
    }

    fn transition(&mut self, to: ServiceState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                service: self.name().to_string(),
                from,
                to,
            });
        }
        debug!("{}: {} -> {}", self.name(), from, to);
        self.state = to;
        if let Some(events) = &self.events {
            let _ = events.try_send(StateChange {
                service: self.name().to_string(),
                from,
                to,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    fn fail(&mut self) {
        if let Err(e) = self.transition(ServiceState::Error) {
            warn!("{}", e);
        }
    }

    /// Initialize or upgrade as needed, clean stale PID files and launch
    pub async fn start(&mut self) -> Result<()> {
        if !matches!(self.state, ServiceState::Unstarted | ServiceState::Stopped) {
            return Err(Error::InvalidTransition {
                service: self.name().to_string(),
                from: self.state,
                to: ServiceState::Starting,
            });
        }
        let name = self.name().to_string();

        self.driver.prepare().await?;

        let marker = self.driver.marker();
        self.first_boot = false;
        let status = {
            let marker = marker.clone();
            smol::unblock(move || marker.status()).await?
        };
        match status {
            MarkerStatus::Missing => {
                self.transition(ServiceState::Initializing)?;
                info!("{} does not exist. Initializing...", marker.path().display());
                if let Err(e) = self.driver.initialize().await {
                    self.fail();
                    return Err(match e {
                        e @ Error::Init { .. } => e,
                        other => Error::Init {
                            service: name,
                            reason: other.to_string(),
                        },
                    });
                }
                info!("{} has been successfully initialized.", name);
                self.first_boot = true;
            }
            MarkerStatus::NeedsMigration(version) => {
                self.transition(ServiceState::Initializing)?;
                info!("{} stored version {} needs migration", name, version.trim());
                let driver = self.driver.clone();
                let result =
                    upgrade_with_backup(&name, marker.state_dir(), &self.backup_root, || async move {
                        driver.upgrade().await
                    })
                    .await;
                if let Err(e) = result {
                    self.fail();
                    return Err(e);
                }
            }
            MarkerStatus::Current(_) => {}
        }

        let pid_files = self.driver.stale_pid_files();
        if !pid_files.is_empty() {
            let killer = self.killer.clone();
            let service = name.clone();
            smol::unblock(move || {
                for pid_file in pid_files {
                    let outcome = cleanup_stale_pid_file(&pid_file, killer.as_ref());
                    debug!("{}: {} -> {:?}", service, pid_file.display(), outcome);
                }
            })
            .await;
        }

        self.transition(ServiceState::Starting)?;
        match self.driver.launch().await {
            Ok(Launched::Process(handle)) => {
                self.process = Some(handle);
                Ok(())
            }
            Ok(Launched::Daemon) => {
                self.daemon = true;
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Poll until ready and run post-ready steps
    ///
    /// On failure the service stops its own process and stays in `Error`.
    pub async fn await_ready(&mut self) -> Result<()> {
        self.transition(ServiceState::Polling)?;
        let name = self.name().to_string();

        if let Some(check) = self.driver.readiness() {
            if let Err(e) = check.poller.poll_until_ready(&name, check.probe.as_ref()).await {
                self.fail();
                self.release().await;
                return Err(e);
            }
        }

        if let Err(e) = self.driver.after_ready(self.first_boot).await {
            self.fail();
            self.release().await;
            return Err(e);
        }

        self.transition(ServiceState::Ready)
    }

    /// Whether `start` was abandoned before launch handed anything back
    fn interrupted(&self) -> bool {
        match self.state {
            ServiceState::Initializing => true,
            ServiceState::Starting => self.process.is_none() && !self.daemon,
            _ => false,
        }
    }

    /// Stop the service; a no-op if it is not running
    ///
    /// A service whose start was dropped midway has no handle to stop, so
    /// the driver's forced stop is used instead.
    pub async fn stop(&mut self) -> Result<()> {
        if matches!(
            self.state,
            ServiceState::Unstarted | ServiceState::Stopping | ServiceState::Stopped
        ) {
            return Ok(());
        }
        let interrupted = self.interrupted();
        self.transition(ServiceState::Stopping)?;
        let mut result = self.release().await;
        if interrupted {
            info!("{} was interrupted while starting, forcing", self.name());
            if let Err(e) = self.driver.force_stop().await {
                warn!("Failed to force-stop {}: {}", self.name(), e);
                result = result.and(Err(e));
            }
        }
        self.transition(ServiceState::Stopped)?;
        result
    }

    /// Bring down whatever is running, leaving the state alone
    async fn release(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(mut handle) = self.process.take() {
            result = stop_process(self.name(), handle.as_mut(), self.stop_grace, self.driver.as_ref()).await;
        }
        if std::mem::take(&mut self.daemon) {
            if let Err(e) = self.driver.stop_daemon().await {
                warn!("Failed to stop {}: {}", self.name(), e);
                result = result.and(Err(e));
            }
        }
        result
    }
}

/// Two-phase stop: SIGTERM, wait up to `grace`, then force by name and SIGKILL
pub async fn stop_process(
    name: &str,
    handle: &mut dyn ProcessHandle,
    grace: Duration,
    driver: &dyn ServiceDriver,
) -> Result<()> {
    match handle.terminate().await {
        Ok(()) => {}
        Err(command_executor::Error::NotRunning) => {
            let status = handle.wait().await?;
            info!("{} had already exited with {}", name, status);
            return Ok(());
        }
        Err(e) => warn!("Failed to stop {}: {}", name, e),
    }

    let exited = futures_lite::future::or(async { Some(handle.wait().await) }, async {
        smol::Timer::after(grace).await;
        None
    })
    .await;

    match exited {
        Some(status) => {
            info!("{} exited with {}", name, status?);
            Ok(())
        }
        None => {
            warn!("{} did not exit within {:?}, forcing", name, grace);
            if let Err(e) = driver.force_stop().await {
                warn!("Failed to force-stop {}: {}", name, e);
            }
            match handle.kill().await {
                Ok(()) | Err(command_executor::Error::NotRunning) => {}
                Err(e) => warn!("Failed to kill {}: {}", name, e),
            }
            let status = handle.wait().await?;
            info!("{} exited with {}", name, status);
            Ok(())
        }
    }
}
