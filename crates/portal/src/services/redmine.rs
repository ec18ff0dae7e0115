//! Redmine issue tracker
//!
//! Redmine has no health endpoint. Its readiness probe is the admin email
//! update, which can only succeed once Redmine serves its API and the admin
//! account exists.

use super::{KEEP_ID, READINESS_INTERVAL, ServiceContext, create_private_dirs};
use crate::redmine::RedmineClient;
use async_trait::async_trait;
use command_executor::relay::colors;
use command_executor::{Container, OutputRelay};
use service_orchestration::{
    Launched, MigrationRule, Readiness, ReadinessCheck, ReadinessPoller, ReadinessProbe, Result,
    ServiceDriver, VersionMarker,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Container and service name
pub const NAME: &str = "redmine";

/// Stored version prefix that needs `upgrade`
pub const MIGRATE_FROM: &str = "5.0.6+nsbox.2023110601";

/// Attempts at the admin email update
pub const EMAIL_ATTEMPTS: u32 = 5;

/// Delay before the first email update attempt
pub const EMAIL_INITIAL_DELAY: Duration = Duration::from_secs(5);

const SUBDIRS: [&str; 3] = ["data", "files", "log"];

/// Client for the Redmine instance configured in `ctx`
pub fn client(ctx: &ServiceContext) -> RedmineClient {
    RedmineClient::new(
        format!("http://{}:3000", ctx.config.bind),
        ctx.service_dir(NAME).join("data").join("admin_api_key.txt"),
    )
}

/// Ready once the admin email is set to `admin@<hostname>`
pub struct RedmineEmailProbe {
    client: RedmineClient,
    hostname: String,
}

impl RedmineEmailProbe {
    /// Probe updating the admin account through `client`
    pub fn new(client: RedmineClient, hostname: impl Into<String>) -> Self {
        Self {
            client,
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for RedmineEmailProbe {
    async fn probe(&self) -> Readiness {
        match self.client.update_admin_email(&self.hostname).await {
            Ok(()) => Readiness::Ready,
            Err(crate::Error::Transport(reason)) => Readiness::TransportError(reason),
            Err(e) => Readiness::Failed(e.to_string()),
        }
    }
}

/// Drives the Redmine container
pub struct RedmineDriver {
    ctx: Arc<ServiceContext>,
}

impl RedmineDriver {
    /// Driver over `ctx`
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    fn dir(&self) -> PathBuf {
        self.ctx.service_dir(NAME)
    }

    /// Container with the data, files and log directories mounted
    pub fn container(&self) -> Container {
        let dir = self.dir();
        SUBDIRS
            .iter()
            .fold(
                Container::new(NAME, &self.ctx.config.images.redmine).with_userns(KEEP_ID),
                |container, sub| {
                    container.with_volume(dir.join(sub), &format!("/home/redmine/redmine/{}", sub))
                },
            )
            .with_host_network()
    }

    async fn run_script(&self, script: &str) -> Result<()> {
        self.ctx
            .run_container(&self.container(), &[script], OutputRelay::new("R", colors::RED))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceDriver for RedmineDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn depends_on(&self) -> Vec<String> {
        vec![super::keycloak::NAME.to_string()]
    }

    fn marker(&self) -> VersionMarker {
        VersionMarker::at(self.dir(), "data/version.txt")
            .with_migration(MigrationRule::Prefix(MIGRATE_FROM.to_string()))
    }

    async fn prepare(&self) -> Result<()> {
        let dir = self.dir();
        create_private_dirs(std::iter::once(dir.clone()).chain(SUBDIRS.iter().map(|s| dir.join(s))))?;
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        self.run_script("/home/redmine/init").await
    }

    async fn upgrade(&self) -> Result<()> {
        info!("Upgrading redmine...");
        self.run_script("/home/redmine/upgrade").await
    }

    async fn launch(&self) -> Result<Launched> {
        let config = &self.ctx.config;
        let handle = self
            .ctx
            .launch_container(
                &self.container(),
                &[
                    "/home/redmine/run",
                    "--bind",
                    config.bind.as_str(),
                    "--hostname",
                    config.hostname.as_str(),
                ],
                OutputRelay::new("R", colors::RED),
            )
            .await?;
        Ok(Launched::Process(handle))
    }

    fn readiness(&self) -> Option<ReadinessCheck> {
        let probe = RedmineEmailProbe::new(client(&self.ctx), &self.ctx.config.hostname);
        Some(ReadinessCheck {
            probe: Arc::new(probe),
            poller: ReadinessPoller::new(READINESS_INTERVAL)
                .with_initial_delay(EMAIL_INITIAL_DELAY)
                .with_max_attempts(EMAIL_ATTEMPTS)
                .with_sleeper(self.ctx.sleeper.clone()),
        })
    }

    async fn force_stop(&self) -> Result<()> {
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }
}
