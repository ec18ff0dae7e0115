//! Gerrit code-review server

use super::{KEEP_ID, READINESS_INTERVAL, ServiceContext, create_private_dirs};
use crate::gerrit::GerritClient;
use async_trait::async_trait;
use command_executor::relay::colors;
use command_executor::{Container, OutputRelay};
use service_orchestration::{
    Launched, MigrationRule, ReadinessCheck, ReadinessPoller, Result, ServiceDriver,
    VersionMarker, VersionProbe,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Container and service name
pub const NAME: &str = "gerrit";

/// Stored version prefix that needs `upgrade`
pub const MIGRATE_FROM: &str = "3.8.2";

/// Version the image ships; Gerrit is ready once it reports it
pub const EXPECTED_VERSION: &str = "3.9.5";

/// HTTP port Gerrit listens on behind the reverse proxy
pub const HTTP_PORT: u16 = 8081;

/// SSH port of the Gerrit daemon
pub const SSH_PORT: u16 = 29418;

/// Base URL of the Gerrit HTTP listener
pub fn base_url(ctx: &ServiceContext) -> String {
    format!("http://{}:{}", ctx.config.bind, HTTP_PORT)
}

/// Client acting as the Gerrit administrator
pub fn admin_client(ctx: &ServiceContext) -> GerritClient {
    GerritClient::new(base_url(ctx), "admin", "Administrator", "admin@nsbox.local")
}

/// Drives the Gerrit container
pub struct GerritDriver {
    ctx: Arc<ServiceContext>,
}

impl GerritDriver {
    /// Driver over `ctx`
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    fn dir(&self) -> PathBuf {
        self.ctx.service_dir(NAME)
    }

    /// Container with the review site mounted
    pub fn container(&self) -> Container {
        Container::new(NAME, &self.ctx.config.images.gerrit)
            .with_userns(KEEP_ID)
            .with_volume(self.dir(), "/home/gerrit/review_site")
            .with_host_network()
    }

    async fn run_script(&self, script: &str) -> Result<()> {
        self.ctx
            .run_container(&self.container(), &[script], OutputRelay::new("G", colors::GREEN))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceDriver for GerritDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn depends_on(&self) -> Vec<String> {
        vec![super::redmine::NAME.to_string()]
    }

    fn marker(&self) -> VersionMarker {
        VersionMarker::new(self.dir()).with_migration(MigrationRule::Prefix(MIGRATE_FROM.to_string()))
    }

    async fn prepare(&self) -> Result<()> {
        create_private_dirs([self.dir()])?;
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        self.run_script("/home/gerrit/init").await
    }

    async fn upgrade(&self) -> Result<()> {
        info!("Upgrading gerrit...");
        self.run_script("/home/gerrit/upgrade").await
    }

    async fn launch(&self) -> Result<Launched> {
        let config = &self.ctx.config;
        let handle = self
            .ctx
            .launch_container(
                &self.container(),
                &[
                    "/home/gerrit/run",
                    "--hostname",
                    config.hostname.as_str(),
                    "--http-bind",
                    config.bind.as_str(),
                    "--ssh-listen",
                    config.gerrit_ssh_addr.as_str(),
                ],
                OutputRelay::new("G", colors::GREEN),
            )
            .await?;
        Ok(Launched::Process(handle))
    }

    fn readiness(&self) -> Option<ReadinessCheck> {
        let url = format!("{}/config/server/version", base_url(&self.ctx));
        Some(ReadinessCheck {
            probe: Arc::new(VersionProbe::new(url, EXPECTED_VERSION)),
            poller: ReadinessPoller::new(READINESS_INTERVAL).with_sleeper(self.ctx.sleeper.clone()),
        })
    }

    async fn after_ready(&self, _first_boot: bool) -> Result<()> {
        admin_client(&self.ctx)
            .ensure_account("admin", "Administrator", "admin@nsbox.local")
            .await?;
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }
}
