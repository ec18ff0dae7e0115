//! Keycloak identity provider
//!
//! First boot extracts the distribution, lets Keycloak create its database
//! in a throwaway run, then starts it for real and runs `init` once it is
//! healthy. Later boots refresh the OIDC redirect URIs instead, since the
//! hostname may have changed.

use super::{KEEP_ID, READINESS_INTERVAL, ServiceContext, create_private_dirs};
use async_trait::async_trait;
use command_executor::relay::colors;
use command_executor::{Container, OutputRelay};
use service_orchestration::{
    HealthStatusProbe, Launched, MigrationRule, ReadinessCheck, ReadinessPoller, Result,
    ServiceDriver, VersionMarker, stop_process,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Container and service name
pub const NAME: &str = "keycloak";

/// Stored version that needs `upgrade`
pub const MIGRATE_FROM: &str = "Keycloak - Version 23.0.1";

/// Health endpoint on the management interface
pub const HEALTH_URL: &str = "https://127.0.0.1:9000/health/ready";

const KEYCLOAK_HOME: &str = "/home/keycloak/keycloak";

/// Drives the Keycloak container
pub struct KeycloakDriver {
    ctx: Arc<ServiceContext>,
}

impl KeycloakDriver {
    /// Driver over `ctx`
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    fn dir(&self) -> PathBuf {
        self.ctx.service_dir(NAME)
    }

    fn relay(&self) -> OutputRelay {
        OutputRelay::new("K", colors::YELLOW)
    }

    /// Container with only the state directory mounted
    pub fn maintenance_container(&self) -> Container {
        Container::new(NAME, &self.ctx.config.images.keycloak)
            .with_userns(KEEP_ID)
            .with_volume(self.dir(), KEYCLOAK_HOME)
    }

    /// The serving container
    pub fn run_container(&self) -> Container {
        let config = &self.ctx.config;
        Container::new(NAME, &config.images.keycloak)
            .with_userns(KEEP_ID)
            .with_volume(config.certs_dir(), "/certs")
            .with_volume(self.dir(), KEYCLOAK_HOME)
            .with_port(format!("{}:9992/tcp", config.keycloak_https_addr))
            .with_port(format!("{}:9000/tcp", config.keycloak_management_addr))
            .with_add_host(&config.hostname, "127.0.0.1")
    }

    fn run_args(&self) -> [&str; 3] {
        ["/home/keycloak/run", "--hostname", &self.ctx.config.hostname]
    }

    fn check(&self) -> ReadinessCheck {
        ReadinessCheck {
            probe: Arc::new(HealthStatusProbe::new(HEALTH_URL).accept_invalid_certs()),
            poller: ReadinessPoller::new(READINESS_INTERVAL).with_sleeper(self.ctx.sleeper.clone()),
        }
    }
}

#[async_trait]
impl ServiceDriver for KeycloakDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn marker(&self) -> VersionMarker {
        VersionMarker::new(self.dir()).with_migration(MigrationRule::Contains(MIGRATE_FROM.to_string()))
    }

    async fn prepare(&self) -> Result<()> {
        create_private_dirs([self.dir()])?;
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        self.ctx
            .run_container(&self.maintenance_container(), &["/home/keycloak/extract"], self.relay())
            .await?;

        info!("Letting Keycloak initialize its database");
        let mut first = self
            .ctx
            .launch_container(&self.run_container(), &self.run_args(), self.relay())
            .await?;
        let check = self.check();
        if let Err(e) = check.poller.poll_until_ready(NAME, check.probe.as_ref()).await {
            stop_process(NAME, first.as_mut(), self.ctx.config.stop_grace, self).await?;
            return Err(e);
        }
        stop_process(NAME, first.as_mut(), self.ctx.config.stop_grace, self).await?;
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }

    async fn upgrade(&self) -> Result<()> {
        info!("Upgrading keycloak...");
        self.ctx
            .run_container(&self.maintenance_container(), &["/home/keycloak/upgrade"], self.relay())
            .await?;
        Ok(())
    }

    async fn launch(&self) -> Result<Launched> {
        let handle = self
            .ctx
            .launch_container(&self.run_container(), &self.run_args(), self.relay())
            .await?;
        Ok(Launched::Process(handle))
    }

    fn readiness(&self) -> Option<ReadinessCheck> {
        Some(self.check())
    }

    async fn after_ready(&self, first_boot: bool) -> Result<()> {
        let hostname = self.ctx.config.hostname.as_str();
        let script = if first_boot {
            "/home/keycloak/init"
        } else {
            "/home/keycloak/update_redirect_uris"
        };
        self.ctx
            .exec(NAME, &[script, "--hostname", hostname], self.relay())
            .await?;
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        self.ctx.podman_kill(NAME).await;
        Ok(())
    }
}
