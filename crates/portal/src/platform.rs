//! The whole platform: ordered services plus the background watchers
//!
//! Startup ensures the TLS key pair, then brings up Keycloak, Redmine,
//! Gerrit, Buildbot and httpd in that order. Once everything is ready the
//! project watcher and the change-event processor start under a
//! [`TaskSupervisor`], which reports their liveness every minute.

use crate::change_events::{ChangeEventProcessor, SshEventFeed};
use crate::config::PortalConfig;
use crate::project_watcher::ProjectWatcher;
use crate::services::{
    BuildbotDriver, GerritDriver, HttpdDriver, KeycloakDriver, RedmineDriver, ServiceContext,
    certs, gerrit, redmine,
};
use crate::Result;
use command_executor::{Launcher, LocalLauncher};
use service_orchestration::{
    Orchestrator, ServiceDriver, ServiceLifecycle, ServiceState, TaskSupervisor,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often the background task summary is logged
pub const LIVENESS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Task name of the project watcher
pub const PROJECT_WATCHER: &str = "project watcher";

/// Task name of the change-event processor
pub const CHANGE_EVENTS: &str = "change events";

/// Services and watchers of one portal instance
pub struct Platform {
    ctx: Arc<ServiceContext>,
    buildbot: Arc<BuildbotDriver>,
    orchestrator: Orchestrator,
    supervisor: TaskSupervisor,
}

impl Platform {
    /// Platform running local processes
    pub fn new(config: PortalConfig) -> Result<Self> {
        let launcher: Arc<dyn Launcher> = Arc::new(LocalLauncher);
        Self::with_context(Arc::new(ServiceContext::new(Arc::new(config), launcher)))
    }

    /// Platform over an existing context
    pub fn with_context(ctx: Arc<ServiceContext>) -> Result<Self> {
        let buildbot = Arc::new(BuildbotDriver::new(ctx.clone()));
        let drivers: Vec<Arc<dyn ServiceDriver>> = vec![
            Arc::new(KeycloakDriver::new(ctx.clone())),
            Arc::new(RedmineDriver::new(ctx.clone())),
            Arc::new(GerritDriver::new(ctx.clone())),
            buildbot.clone(),
            Arc::new(HttpdDriver::new(ctx.clone())),
        ];
        let config = &ctx.config;
        let lifecycles = drivers
            .into_iter()
            .map(|driver| {
                ServiceLifecycle::new(driver, &config.backup_dir).with_stop_grace(config.stop_grace)
            })
            .collect();
        let orchestrator = Orchestrator::new(lifecycles)?;
        Ok(Self {
            ctx,
            buildbot,
            orchestrator,
            supervisor: TaskSupervisor::new(),
        })
    }

    /// Every service and its state, in start order
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.orchestrator.states()
    }

    /// The background task supervisor
    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// Start every service, then the watchers
    ///
    /// A failure stops whatever was already started before it is returned.
    pub async fn start(&mut self) -> Result<()> {
        certs::ensure_key_pair(&self.ctx).await?;
        self.orchestrator.start_all().await?;
        info!("All services are ready");
        self.spawn_watchers();
        Ok(())
    }

    fn spawn_watchers(&self) {
        let source = Arc::new(gerrit::admin_client(&self.ctx));
        let watcher = ProjectWatcher::new(source, self.buildbot.clone())
            .with_baseline(self.buildbot.initial_projects());
        self.supervisor.spawn(PROJECT_WATCHER, watcher.run());

        let feed = SshEventFeed::new(
            self.ctx.launcher.clone(),
            &self.ctx.config.bind,
            gerrit::SSH_PORT,
            self.buildbot.buildbot().identity_file(),
        );
        let sink = Arc::new(redmine::client(&self.ctx));
        let processor = ChangeEventProcessor::new(Arc::new(feed), sink);
        self.supervisor
            .spawn(CHANGE_EVENTS, async move { processor.run().await });

        self.supervisor
            .spawn_reporter(LIVENESS_REPORT_INTERVAL, self.ctx.sleeper.clone());
    }

    /// Stop every started service, newest first
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down...");
        self.orchestrator.stop_all().await?;
        info!("All services stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::context;
    use crate::testing::ScriptedLauncher;
    use tempfile::TempDir;

    #[test]
    fn test_service_order() {
        let dir = TempDir::new().unwrap();
        let platform = Platform::with_context(context(&dir, &ScriptedLauncher::new())).unwrap();
        let names: Vec<String> = platform.states().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["keycloak", "redmine", "gerrit", "buildbot", "httpd"]);
        assert!(
            platform
                .states()
                .iter()
                .all(|(_, state)| *state == ServiceState::Unstarted)
        );
    }

    #[smol_potat::test]
    async fn test_failed_start_leaves_nothing_running() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::new().fail_on("/home/keycloak/extract");
        let mut platform = Platform::with_context(context(&dir, &launcher)).unwrap();
        assert!(platform.start().await.is_err());
        assert!(platform.supervisor().snapshot().is_empty());
        assert!(
            launcher
                .commands()
                .iter()
                .any(|c| c.starts_with("openssl req -x509"))
        );
        assert!(!launcher.commands().iter().any(|c| c.contains("--name redmine")));
    }
}
