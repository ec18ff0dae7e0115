//! Stale PID-file cleanup
//!
//! A daemon that crashed leaves its PID file behind, and the next start
//! fails with "address already in use" if the old process survived. Before
//! spawning, an empty PID file is deleted and a non-empty one has its
//! process force-killed. Nothing here ever fails the start; problems are
//! logged and reported in the outcome.

use command_executor::Signal;
use std::path::Path;
use tracing::{info, warn};

/// Sends SIGKILL to a process id
pub trait PidKiller: Send + Sync {
    /// Force-kill `pid`
    fn kill(&self, pid: i32) -> command_executor::Result<()>;
}

/// [`PidKiller`] that really signals the process
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalKiller;

impl PidKiller for SignalKiller {
    fn kill(&self, pid: i32) -> command_executor::Result<()> {
        command_executor::process::send_signal(pid, Signal::Kill)
    }
}

/// What cleanup found and did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidFileOutcome {
    /// No PID file
    Absent,
    /// Zero-length file, removed
    RemovedEmpty,
    /// The recorded process was sent SIGKILL
    Killed(i32),
    /// Sending SIGKILL failed (usually: the process is already gone)
    KillFailed {
        /// Recorded pid
        pid: i32,
        /// Why the kill failed
        reason: String,
    },
    /// Content is not a process id; kill skipped
    Unparsable(String),
    /// The file could not be inspected
    Unreadable(String),
}

/// Clean up the PID file at `path` left by a previous run
pub fn cleanup_stale_pid_file(path: &Path, killer: &dyn PidKiller) -> PidFileOutcome {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PidFileOutcome::Absent,
        Err(e) => {
            warn!("stat {}: {}", path.display(), e);
            return PidFileOutcome::Unreadable(e.to_string());
        }
    };

    if metadata.len() == 0 {
        info!("{} exists but is empty", path.display());
        if let Err(e) = std::fs::remove_file(path) {
            warn!("remove {}: {}", path.display(), e);
            return PidFileOutcome::Unreadable(e.to_string());
        }
        return PidFileOutcome::RemovedEmpty;
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("read {}: {}", path.display(), e);
            return PidFileOutcome::Unreadable(e.to_string());
        }
    };

    let pid = match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => pid,
        Ok(pid) => {
            warn!("{}: refusing to kill pid {}", path.display(), pid);
            return PidFileOutcome::Unparsable(content);
        }
        Err(e) => {
            warn!("failed to convert '{}' to a pid: {}", content, e);
            return PidFileOutcome::Unparsable(content);
        }
    };

    match killer.kill(pid) {
        Ok(()) => {
            info!("killed stale process {} from {}", pid, path.display());
            PidFileOutcome::Killed(pid)
        }
        Err(e) => {
            warn!("failed to kill {}: {}", pid, e);
            PidFileOutcome::KillFailed {
                pid,
                reason: e.to_string(),
            }
        }
    }
}
