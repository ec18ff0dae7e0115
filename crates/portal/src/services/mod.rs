//! One [`ServiceDriver`](service_orchestration::ServiceDriver) per managed service
//!
//! Container services run as `podman run --rm --name <svc> --replace ...`
//! with their output relayed under a one-letter tag. Any container left
//! from a crashed run is killed by name before the service starts.

pub mod buildbot;
pub mod certs;
pub mod gerrit;
pub mod httpd;
pub mod keycloak;
pub mod redmine;

pub use buildbot::BuildbotDriver;
pub use gerrit::GerritDriver;
pub use httpd::HttpdDriver;
pub use keycloak::KeycloakDriver;
pub use redmine::{RedmineDriver, RedmineEmailProbe};

use crate::config::PortalConfig;
use crate::Result;
use command_executor::{Command, Container, ContainerRuntime, Launcher, OutputRelay, ProcessHandle};
use service_orchestration::{Sleeper, TimerSleeper};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// User namespace every service container runs in
pub const KEEP_ID: &str = "keep-id:uid=1000,gid=1000";

/// Interval between readiness probes
pub const READINESS_INTERVAL: Duration = Duration::from_secs(2);

/// Pause before `podman kill`, giving a signalled container time to exit
pub const KILL_DELAY: Duration = Duration::from_secs(1);

/// What every driver shares
pub struct ServiceContext {
    /// Validated startup configuration
    pub config: Arc<PortalConfig>,
    /// Runs every external program
    pub launcher: Arc<dyn Launcher>,
    /// Container runtime
    pub runtime: ContainerRuntime,
    /// Sleeps of drivers and their readiness pollers
    pub sleeper: Arc<dyn Sleeper>,
}

impl ServiceContext {
    /// Context using podman and real timers
    pub fn new(config: Arc<PortalConfig>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            runtime: ContainerRuntime::podman(),
            sleeper: Arc::new(TimerSleeper),
        }
    }

    /// Replace the sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// State directory of `service`
    pub fn service_dir(&self, service: &str) -> PathBuf {
        self.config.service_dir(service)
    }

    /// Kill container `name`; failures (usually: no such container) are logged
    pub async fn podman_kill(&self, name: &str) {
        self.sleeper.sleep(KILL_DELAY).await;
        let command = self.runtime.kill_command(name);
        match self.launcher.output(command).await {
            Ok(result) if result.success() => debug!("podman kill {}: done", name),
            Ok(result) => info!("podman kill {}: {}\n{}", name, result.status, result.output.trim_end()),
            Err(e) => warn!("podman kill {}: {}", name, e),
        }
    }

    /// Run a one-shot command in a fresh container and wait for it
    pub async fn run_container(
        &self,
        container: &Container,
        args: &[&str],
        relay: OutputRelay,
    ) -> Result<()> {
        let command = self.runtime.run_command(container, args);
        info!("Executing {}", command);
        self.launcher.run(command, relay).await?;
        Ok(())
    }

    /// Start a long-running container
    pub async fn launch_container(
        &self,
        container: &Container,
        args: &[&str],
        relay: OutputRelay,
    ) -> Result<Box<dyn ProcessHandle>> {
        let command = self.runtime.run_command(container, args);
        info!("Executing {}", command);
        Ok(self.launcher.launch(command, relay).await?)
    }

    /// Run a command inside running container `name` and wait for it
    pub async fn exec(&self, name: &str, args: &[&str], relay: OutputRelay) -> Result<()> {
        let command = self.runtime.exec_command(name, args);
        info!("Executing {}", command);
        self.launcher.run(command, relay).await?;
        Ok(())
    }

    /// Run a local command and wait for it
    pub async fn run_local(&self, command: Command, relay: OutputRelay) -> Result<()> {
        info!("Executing {}", command);
        self.launcher.run(command, relay).await?;
        Ok(())
    }
}

/// Create `dirs` readable only by the owner
pub(crate) fn create_private_dirs<I, P>(dirs: I) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    for dir in dirs {
        crate::buildbot::create_private_dir(&dir.into())?;
    }
    Ok(())
}
