//! Watchdog that relaunches a process whenever it exits
//!
//! The reverse proxy must come back if it dies. [`RespawningHandle`] wraps
//! a spawner: a watchdog task waits on the current process and launches a
//! replacement on exit, unless the handle has been told to stop. The
//! "stopping" flag and the relaunch share one lock, so a stop request can
//! never race a respawn.

use async_trait::async_trait;
use command_executor::{Error, ExitStatus, ProcessHandle, Result, Signal};
use smol::lock::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, warn};

/// Launches one instance of the watched process
#[async_trait]
pub trait Spawn: Send + Sync {
    /// Start a fresh instance
    async fn spawn(&self) -> Result<Box<dyn ProcessHandle>>;
}

struct Shared {
    stopping: Mutex<bool>,
    pid: AtomicU32,
    restarts: AtomicU32,
}

/// Process handle whose process is relaunched on every unexpected exit
pub struct RespawningHandle {
    shared: Arc<Shared>,
    exit: async_channel::Receiver<ExitStatus>,
    finished: Option<ExitStatus>,
    _watchdog: smol::Task<()>,
}

impl RespawningHandle {
    /// Spawn the first instance and start watching it
    pub async fn start(name: impl Into<String>, spawner: Arc<dyn Spawn>) -> Result<Self> {
        let first = spawner.spawn().await?;
        let shared = Arc::new(Shared {
            stopping: Mutex::new(false),
            pid: AtomicU32::new(first.pid().unwrap_or(0)),
            restarts: AtomicU32::new(0),
        });
        let (tx, rx) = async_channel::bounded(1);
        let watchdog = smol::spawn(watch(name.into(), spawner, first, shared.clone(), tx));
        Ok(Self {
            shared,
            exit: rx,
            finished: None,
            _watchdog: watchdog,
        })
    }

    /// How many times the process has been relaunched
    pub fn restarts(&self) -> u32 {
        self.shared.restarts.load(Ordering::SeqCst)
    }
}

async fn watch(
    name: String,
    spawner: Arc<dyn Spawn>,
    mut current: Box<dyn ProcessHandle>,
    shared: Arc<Shared>,
    exit: async_channel::Sender<ExitStatus>,
) {
    loop {
        let status = match current.wait().await {
            Ok(status) => status,
            Err(e) => {
                warn!("{}: wait failed: {}", name, e);
                ExitStatus {
                    code: None,
                    signal: None,
                }
            }
        };

        let stopping = shared.stopping.lock().await;
        if *stopping {
            shared.pid.store(0, Ordering::SeqCst);
            let _ = exit.send(status).await;
            return;
        }

        warn!("{} exited with {}", name, status);
        warn!("*** RESTARTING {} ***", name.to_uppercase());
        match spawner.spawn().await {
            Ok(next) => {
                shared.pid.store(next.pid().unwrap_or(0), Ordering::SeqCst);
                shared.restarts.fetch_add(1, Ordering::SeqCst);
                current = next;
            }
            Err(e) => {
                error!("Failed to restart {}: {}", name, e);
                shared.pid.store(0, Ordering::SeqCst);
                let _ = exit.send(status).await;
                return;
            }
        }
        drop(stopping);
    }
}

#[async_trait]
impl ProcessHandle for RespawningHandle {
    fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    async fn signal(&mut self, signal: Signal) -> Result<()> {
        if self.try_status()?.is_some() {
            return Err(Error::NotRunning);
        }
        let mut stopping = self.shared.stopping.lock().await;
        if matches!(signal, Signal::Terminate | Signal::Kill | Signal::Interrupt) {
            *stopping = true;
        }
        match self.pid() {
            Some(pid) => command_executor::process::send_signal(pid as i32, signal),
            None => Err(Error::NotRunning),
        }
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.finished {
            return Ok(status);
        }
        let status = self.exit.recv().await.map_err(|_| Error::NotRunning)?;
        self.finished = Some(status);
        Ok(status)
    }

    fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.finished.is_none() {
            self.finished = self.exit.try_recv().ok();
        }
        Ok(self.finished)
    }
}
