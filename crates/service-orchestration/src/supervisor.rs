//! Supervision of long-running background tasks
//!
//! [`TaskSupervisor`] spawns background loops and tracks whether each one is
//! still alive. A loop that ends, whether by returning, failing or
//! panicking, is recorded with its outcome, so a watcher that fail-stops is
//! visible to operators instead of silently disappearing.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::health::Sleeper;

/// Whether a supervised task is alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Liveness {
    /// Still running
    Running,
    /// Returned normally
    Stopped,
    /// Ended with an error or panic
    Failed(String),
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Running => f.write_str("running"),
            Liveness::Stopped => f.write_str("stopped"),
            Liveness::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Liveness plus when it last changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    /// Current liveness
    pub liveness: Liveness,
    /// When it last changed
    pub since: DateTime<Utc>,
}

type Registry = Arc<Mutex<BTreeMap<String, TaskStatus>>>;

fn record(registry: &Registry, name: &str, liveness: Liveness) {
    let mut tasks = registry.lock().unwrap_or_else(|e| e.into_inner());
    tasks.insert(
        name.to_string(),
        TaskStatus {
            liveness,
            since: Utc::now(),
        },
    );
}

/// Spawns background tasks and tracks their liveness
///
/// Dropping the supervisor cancels every task it spawned.
#[derive(Default)]
pub struct TaskSupervisor {
    registry: Registry,
    tasks: Mutex<Vec<smol::Task<()>>>,
}

impl TaskSupervisor {
    /// Create an empty supervisor
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` under `name`
    pub fn spawn<F, E>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = name.into();
        let registry = self.registry.clone();
        record(&registry, &name, Liveness::Running);
        info!("{}: started", name);

        let handle = smol::spawn(async move {
            let liveness = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    warn!("{}: stopped", name);
                    Liveness::Stopped
                }
                Ok(Err(e)) => {
                    error!("{}: failed: {}", name, e);
                    Liveness::Failed(e.to_string())
                }
                Err(_) => {
                    error!("{}: panicked", name);
                    Liveness::Failed("panicked".to_string())
                }
            };
            record(&registry, &name, liveness);
        });

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Liveness of one task
    pub fn liveness(&self, name: &str) -> Option<Liveness> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|status| status.liveness.clone())
    }

    /// All tasks and their status, by name
    pub fn snapshot(&self) -> BTreeMap<String, TaskStatus> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One-line summary, e.g. `change events=running, project watcher=failed: ...`
    pub fn summary(&self) -> String {
        summarize(&self.snapshot())
    }

    /// Log the summary every `interval`, at `error` level if any task failed
    pub fn spawn_reporter(&self, interval: Duration, sleeper: Arc<dyn Sleeper>) {
        let registry = self.registry.clone();
        let handle = smol::spawn(async move {
            loop {
                sleeper.sleep(interval).await;
                let snapshot = registry.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let summary = summarize(&snapshot);
                if snapshot
                    .values()
                    .any(|s| matches!(s.liveness, Liveness::Failed(_)))
                {
                    error!("background tasks: {}", summary);
                } else {
                    info!("background tasks: {}", summary);
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}

fn summarize(snapshot: &BTreeMap<String, TaskStatus>) -> String {
    snapshot
        .iter()
        .map(|(name, status)| format!("{}={}", name, status.liveness))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle(supervisor: &TaskSupervisor, name: &str) -> Liveness {
        for _ in 0..200 {
            match supervisor.liveness(name) {
                Some(Liveness::Running) | None => {
                    smol::Timer::after(Duration::from_millis(10)).await;
                }
                Some(other) => return other,
            }
        }
        supervisor.liveness(name).unwrap_or(Liveness::Running)
    }

    #[smol_potat::test]
    async fn test_outcomes_are_recorded() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("ok", async { Ok::<(), String>(()) });
        supervisor.spawn("bad", async { Err::<(), _>("config check failed".to_string()) });

        assert_eq!(settle(&supervisor, "ok").await, Liveness::Stopped);
        assert_eq!(
            settle(&supervisor, "bad").await,
            Liveness::Failed("config check failed".to_string())
        );
        assert_eq!(
            supervisor.summary(),
            "bad=failed: config check failed, ok=stopped"
        );
    }

    #[smol_potat::test]
    async fn test_panic_is_recorded_as_failure() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("boom", async {
            if true {
                panic!("unexpected");
            }
            Ok::<(), String>(())
        });
        assert_eq!(
            settle(&supervisor, "boom").await,
            Liveness::Failed("panicked".to_string())
        );
    }

    #[smol_potat::test]
    async fn test_running_task_stays_running() {
        let supervisor = TaskSupervisor::new();
        let (_tx, rx) = async_channel::bounded::<()>(1);
        supervisor.spawn("watcher", async move {
            let _ = rx.recv().await;
            Ok::<(), String>(())
        });
        smol::future::yield_now().await;
        assert_eq!(supervisor.liveness("watcher"), Some(Liveness::Running));
    }
}
