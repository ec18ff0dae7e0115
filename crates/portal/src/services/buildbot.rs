//! Buildbot CI, wired to Gerrit
//!
//! Before Buildbot starts, the `buildbot` Gerrit account is prepared: it
//! is created, allowed to vote `Verified`, given the service key, and its
//! SSH access is verified end to end. The project list fetched at that point
//! is what the first configuration is generated for, and it is the baseline
//! the project watcher starts from.

use super::gerrit::{SSH_PORT, admin_client, base_url};
use super::ServiceContext;
use crate::buildbot::{Buildbot, MasterSettings};
use crate::gerrit::{GerritClient, Project};
use crate::project_watcher::{CiReconciler, ProjectSnapshot};
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::{Command, SshConfig};
use service_orchestration::{Launched, ServiceDriver, VersionMarker};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Service name
pub const NAME: &str = "buildbot";

/// Gerrit account Buildbot acts as
pub const ACCOUNT: &str = "buildbot";

/// Port of the public Buildbot URL (behind httpd)
pub const PUBLIC_PORT: u16 = 9443;

/// Group whose members may read every ref and vote `Verified`
pub const SERVICE_USERS: &str = "Service Users";

/// Project whose access rights every project inherits
pub const ALL_PROJECTS: &str = "All-Projects";

/// Retries of the SSH connectivity test, after the first attempt
pub const SSH_RETRIES: u32 = 10;

/// Pause between SSH connectivity tests
pub const SSH_RETRY_DELAY: Duration = Duration::from_secs(5);

const SSH_GREETING: &str = "you have successfully connected over SSH";

/// Drives Buildbot and reconciles its configuration with Gerrit projects
pub struct BuildbotDriver {
    ctx: Arc<ServiceContext>,
    buildbot: Buildbot,
    projects: Mutex<Vec<Project>>,
}

impl BuildbotDriver {
    /// Driver over `ctx`
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        let dir = ctx.service_dir(NAME);
        let config = &ctx.config;
        let settings = MasterSettings {
            www_protocol: "https".to_string(),
            www_host: config.hostname.clone(),
            public_port: PUBLIC_PORT,
            identity_file: dir.join("ssh").join("id_ed25519"),
            gerrit_server: config.bind.clone(),
            gerrit_port: SSH_PORT,
            ..Default::default()
        };
        let buildbot = Buildbot::new(dir, settings, config.workers.clone(), ctx.launcher.clone());
        Self {
            ctx,
            buildbot,
            projects: Mutex::new(Vec::new()),
        }
    }

    fn dir(&self) -> PathBuf {
        self.ctx.service_dir(NAME)
    }

    /// The controlled installation
    pub fn buildbot(&self) -> &Buildbot {
        &self.buildbot
    }

    /// Projects the running configuration was generated for at start
    pub fn initial_projects(&self) -> ProjectSnapshot {
        ProjectSnapshot::new(
            self.projects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        )
    }

    fn ssh(&self) -> SshConfig {
        SshConfig::new(&self.ctx.config.bind)
            .with_identity_file(self.buildbot.identity_file())
            .with_user(ACCOUNT)
            .with_port(SSH_PORT)
    }

    /// One bare SSH session; Gerrit greets and disconnects
    pub async fn test_ssh_connection(&self) -> Result<()> {
        let command = self
            .ssh()
            .with_option("BatchMode=yes")
            .with_option("StrictHostKeyChecking=accept-new")
            .session();
        let result = self.ctx.launcher.output(command).await?;
        if !result.output.contains(SSH_GREETING) {
            info!("ssh: '{}' ({})", result.output, result.status);
            return Err(Error::Transport("unable to connect over SSH".to_string()));
        }
        info!("tested connection to {}:{}", self.ctx.config.bind, SSH_PORT);
        Ok(())
    }

    /// Retry the SSH test while Gerrit picks up the new key
    pub async fn test_ssh_connection_with_retries(&self) -> Result<()> {
        for _ in 0..SSH_RETRIES {
            if self.test_ssh_connection().await.is_ok() {
                return Ok(());
            }
            self.ctx.sleeper.sleep(SSH_RETRY_DELAY).await;
        }
        self.test_ssh_connection().await
    }

    /// The account sees `project` over SSH and can clone it
    pub async fn test_project_access(&self, project: &str) -> Result<()> {
        let mut remote = Command::new("gerrit");
        remote.args(["ls-projects", "-p", project]);
        let result = self.ctx.launcher.output(self.ssh().wrap(&remote)).await?;
        if !result.output.lines().any(|line| line == project) {
            info!("ssh: '{}' ({})", result.output, result.status);
            return Err(Error::Transport(format!("unable to find project '{}'", project)));
        }

        let checkout = tempfile::Builder::new().prefix("project-clone-").tempdir()?;
        let clone = Command::builder("git")
            .arg("clone")
            .arg("-c")
            .arg(format!(
                "core.sshCommand=ssh -i {}",
                self.buildbot.identity_file().display()
            ))
            .arg(format!(
                "ssh://{}@{}:{}/{}.git",
                ACCOUNT, self.ctx.config.bind, SSH_PORT, project
            ))
            .arg(checkout.path())
            .build();
        self.ctx
            .launcher
            .checked_output(clone)
            .await
            .map_err(|e| Error::Transport(format!("unable to clone '{}': {}", project, e)))?;
        info!("{} has access to project '{}'", ACCOUNT, project);
        Ok(())
    }

    /// Prepare the `buildbot` Gerrit account and list the projects
    pub async fn prepare_account(&self) -> Result<Vec<Project>> {
        let key = self.buildbot.public_key()?;

        let email = format!("{}@{}", ACCOUNT, self.ctx.config.hostname);
        GerritClient::new(base_url(&self.ctx), ACCOUNT, "Buildbot", email.as_str())
            .ensure_account(ACCOUNT, "Buildbot", &email)
            .await?;

        let admin = admin_client(&self.ctx);
        admin.login().await?;
        admin.create_verified_label().await?;
        let group = admin.get_group(SERVICE_USERS).await?;
        info!("{} group ID is {}", group.name, group.id);
        admin.grant_ci_permissions(ALL_PROJECTS, &group.id).await?;
        admin.add_member_to_group(SERVICE_USERS, ACCOUNT).await?;
        admin.add_ssh_key(ACCOUNT, &key).await?;

        self.test_ssh_connection_with_retries().await?;
        self.test_project_access(ALL_PROJECTS).await?;
        info!("Prepared buildbot account successfully");

        admin.list_projects().await
    }
}

#[async_trait]
impl ServiceDriver for BuildbotDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn depends_on(&self) -> Vec<String> {
        vec![super::gerrit::NAME.to_string()]
    }

    fn marker(&self) -> VersionMarker {
        VersionMarker::new(self.dir())
    }

    async fn prepare(&self) -> service_orchestration::Result<()> {
        super::create_private_dirs([self.dir()])?;
        Ok(())
    }

    async fn initialize(&self) -> service_orchestration::Result<()> {
        self.buildbot
            .init_sandbox(self.ctx.config.buildbot_wheels.as_deref())
            .await?;
        self.buildbot.generate_ssh_key().await?;
        let version = self.buildbot.version().await?;
        self.marker().write(&version)
    }

    fn stale_pid_files(&self) -> Vec<PathBuf> {
        self.buildbot.pid_files()
    }

    async fn launch(&self) -> service_orchestration::Result<Launched> {
        let projects = self.prepare_account().await?;
        self.buildbot.start(&projects).await?;
        *self.projects.lock().unwrap_or_else(|e| e.into_inner()) = projects;
        Ok(Launched::Daemon)
    }

    async fn stop_daemon(&self) -> service_orchestration::Result<()> {
        if let Err(e) = self.buildbot.stop().await {
            warn!("Failed to stop Buildbot: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn force_stop(&self) -> service_orchestration::Result<()> {
        // The master or some workers may not have been started yet
        if let Err(e) = self.buildbot.stop().await {
            warn!("Buildbot was only partly running: {}", e);
        }
        Ok(())
    }
}

#[async_trait]
impl CiReconciler for BuildbotDriver {
    async fn rewrite_config(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        self.buildbot.rewrite_config(snapshot.projects()).await
    }

    async fn restart(&self) -> Result<()> {
        self.buildbot.restart().await
    }
}
