//! Gerrit project reconciliation
//!
//! The watcher polls the project list and, whenever it differs from the
//! last reconciled one, regenerates the Buildbot configuration and restarts
//! the master. Fetch failures back off and re-authenticate. A failed
//! regeneration or restart stops the watcher for good: the returned error
//! ends its task, and the task supervisor reports it as failed.

use crate::gerrit::{GerritClient, Project};
use crate::Result;
use async_trait::async_trait;
use service_orchestration::{Sleeper, TimerSleeper};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause between polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pause after a failed login or fetch
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// The project list, ordered by id
///
/// Two snapshots are equal when they hold the same projects with the same
/// id, name and description, regardless of the order they were fetched in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSnapshot(Vec<Project>);

impl ProjectSnapshot {
    /// Normalize `projects` into a snapshot
    pub fn new(mut projects: Vec<Project>) -> Self {
        projects.sort_by(|a, b| {
            (&a.id, &a.name, &a.description).cmp(&(&b.id, &b.name, &b.description))
        });
        Self(projects)
    }

    /// Projects, ordered by id
    pub fn projects(&self) -> &[Project] {
        &self.0
    }

    /// Number of projects
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no projects
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where projects come from
#[async_trait]
pub trait ProjectSource: Send + Sync {
    /// (Re-)authenticate
    async fn login(&self) -> Result<()>;

    /// Fetch the current project list
    async fn list_projects(&self) -> Result<Vec<Project>>;
}

#[async_trait]
impl ProjectSource for GerritClient {
    async fn login(&self) -> Result<()> {
        GerritClient::login(self).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        GerritClient::list_projects(self).await
    }
}

/// The CI side of a reconciliation
#[async_trait]
pub trait CiReconciler: Send + Sync {
    /// Write and validate the configuration for `snapshot`
    async fn rewrite_config(&self, snapshot: &ProjectSnapshot) -> Result<()>;

    /// Gracefully restart the CI master
    async fn restart(&self) -> Result<()>;
}

enum Poll {
    Unchanged,
    Reconciled,
    FetchFailed(crate::Error),
}

/// Keeps the CI configuration in step with the project list
pub struct ProjectWatcher {
    source: Arc<dyn ProjectSource>,
    ci: Arc<dyn CiReconciler>,
    sleeper: Arc<dyn Sleeper>,
    interval: Duration,
    backoff: Duration,
    baseline: Option<ProjectSnapshot>,
}

impl ProjectWatcher {
    /// Watcher with no baseline; the first successful fetch becomes one
    pub fn new(source: Arc<dyn ProjectSource>, ci: Arc<dyn CiReconciler>) -> Self {
        Self {
            source,
            ci,
            sleeper: Arc::new(TimerSleeper),
            interval: POLL_INTERVAL,
            backoff: FAILURE_BACKOFF,
            baseline: None,
        }
    }

    /// Start from the snapshot the CI configuration was last generated for
    pub fn with_baseline(mut self, baseline: ProjectSnapshot) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Replace the sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Current baseline
    pub fn baseline(&self) -> Option<&ProjectSnapshot> {
        self.baseline.as_ref()
    }

    async fn poll(&mut self) -> Result<Poll> {
        let snapshot = match self.source.list_projects().await {
            Ok(projects) => ProjectSnapshot::new(projects),
            Err(e) => return Ok(Poll::FetchFailed(e)),
        };
        match self.baseline.as_ref() {
            None => {
                debug!("project watcher: baseline of {} projects", snapshot.len());
                self.baseline = Some(snapshot);
                return Ok(Poll::Unchanged);
            }
            Some(baseline) if *baseline == snapshot => return Ok(Poll::Unchanged),
            Some(baseline) => info!(
                "project watcher: projects changed ({} -> {}), reconfiguring Buildbot",
                baseline.len(),
                snapshot.len()
            ),
        }

        if let Err(e) = self.ci.rewrite_config(&snapshot).await {
            error!("project watcher: error rewriting buildbot config: {}", e);
            return Err(e);
        }
        if let Err(e) = self.ci.restart().await {
            error!("project watcher: error restarting buildbot: {}", e);
            return Err(e);
        }
        self.baseline = Some(snapshot);
        Ok(Poll::Reconciled)
    }

    /// Run until a reconciliation fails
    pub async fn run(mut self) -> Result<()> {
        loop {
            if let Err(e) = self.source.login().await {
                warn!("project watcher: error logging into gerrit: {}", e);
                self.sleeper.sleep(self.backoff).await;
                continue;
            }
            // Compared against the kept baseline, so changes made while Gerrit
            // was unreachable still reconfigure Buildbot
            if let Poll::FetchFailed(e) = self.poll().await? {
                warn!("project watcher: error listing projects: {}", e);
                self.sleeper.sleep(self.backoff).await;
                continue;
            }
            loop {
                self.sleeper.sleep(self.interval).await;
                match self.poll().await? {
                    Poll::Unchanged => {}
                    Poll::Reconciled => info!("project watcher: Buildbot reconfigured"),
                    Poll::FetchFailed(e) => {
                        warn!("project watcher: error listing projects: {}", e);
                        self.sleeper.sleep(self.backoff).await;
                        break;
                    }
                }
            }
        }
    }
}
