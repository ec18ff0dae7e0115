//! Launcher trait for executing commands

use crate::command::Command;
use crate::error::{Error, Result};
use crate::process::{ExitResult, ProcessHandle};
use crate::relay::OutputRelay;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of stdout lines from a launched process
pub type LineStream = BoxStream<'static, std::io::Result<String>>;

/// A launcher that can execute commands
///
/// Service drivers only ever talk to a `dyn Launcher`, which keeps every
/// external program (container runtime, CI tooling, ssh) behind one seam.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn a long-running process, relaying both output streams
    async fn launch(&self, command: Command, relay: OutputRelay) -> Result<Box<dyn ProcessHandle>>;

    /// Run a command to completion, capturing combined output
    async fn output(&self, command: Command) -> Result<ExitResult>;

    /// Spawn a process whose stdout is consumed line by line by the caller;
    /// stderr is relayed
    async fn stream_lines(
        &self,
        command: Command,
        stderr: OutputRelay,
    ) -> Result<(Box<dyn ProcessHandle>, LineStream)>;

    /// Run a command to completion while relaying its output; non-zero exit is an error
    async fn run(&self, command: Command, relay: OutputRelay) -> Result<()> {
        let display = command.to_string();
        let mut handle = self.launch(command, relay).await?;
        let status = handle.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::ProcessExited {
                command: display,
                code: status.code,
                output: String::new(),
            })
        }
    }

    /// Run a command to completion and return its output; non-zero exit is an error
    async fn checked_output(&self, command: Command) -> Result<String> {
        let display = command.to_string();
        let result = self.output(command).await?;
        if result.success() {
            Ok(result.output)
        } else {
            Err(Error::ProcessExited {
                command: display,
                code: result.status.code,
                output: result.output,
            })
        }
    }
}
