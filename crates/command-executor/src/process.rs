//! Process management traits and types

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

/// Signals the supervisor sends to managed processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM, graceful shutdown
    Terminate,
    /// SIGKILL, forced shutdown
    Kill,
    /// SIGINT
    Interrupt,
    /// SIGHUP, reload
    Hangup,
}

impl Signal {
    /// Raw signal number, used in error reports
    pub fn number(self) -> i32 {
        match self {
            Signal::Terminate => 15,
            Signal::Kill => 9,
            Signal::Interrupt => 2,
            Signal::Hangup => 1,
        }
    }

    #[cfg(unix)]
    pub(crate) fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as Nix;
        match self {
            Signal::Terminate => Nix::SIGTERM,
            Signal::Kill => Nix::SIGKILL,
            Signal::Interrupt => Nix::SIGINT,
            Signal::Hangup => Nix::SIGHUP,
        }
    }
}

/// Send a signal to an arbitrary process id
///
/// Used both by process handles and by stale PID-file cleanup, where the
/// process was started by an earlier run and no handle exists.
#[cfg(unix)]
pub fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    use nix::unistd::Pid;
    nix::sys::signal::kill(Pid::from_raw(pid), signal.to_nix())
        .map_err(|e| crate::Error::signal_failed(signal.number(), e.to_string()))
}

/// A handle to control a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> Option<u32>;

    /// Send a signal; fails with [`crate::Error::NotRunning`] once the process has exited
    async fn signal(&mut self, signal: Signal) -> Result<()>;

    /// Wait for the process to complete and return its exit status
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Check whether the process has exited without blocking
    fn try_status(&mut self) -> Result<Option<ExitStatus>>;

    /// Send SIGTERM for graceful shutdown
    async fn terminate(&mut self) -> Result<()> {
        self.signal(Signal::Terminate).await
    }

    /// Send SIGKILL to forcefully stop the process
    async fn kill(&mut self) -> Result<()> {
        self.signal(Signal::Kill).await
    }
}

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
            #[cfg(not(unix))]
            signal: None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Result of running a command to completion
#[derive(Debug, Clone)]
pub struct ExitResult {
    /// How the process exited
    pub status: ExitStatus,
    /// Combined stdout and stderr, in arrival order per stream
    pub output: String,
}

impl ExitResult {
    /// Returns true if the process exited successfully
    pub fn success(&self) -> bool {
        self.status.success()
    }
}
