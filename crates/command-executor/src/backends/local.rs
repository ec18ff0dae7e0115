//! Local process execution backend

use async_process::{Child, Stdio};
use async_trait::async_trait;
use futures::StreamExt;
use futures_lite::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::launcher::{Launcher, LineStream};
use crate::process::{ExitResult, ExitStatus, ProcessHandle, Signal};
use crate::relay::{LogSource, OutputRelay};

/// Launcher for executing processes locally
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

/// A handle to control a local process
pub struct LocalProcessHandle {
    child: Child,
    exited: Option<ExitStatus>,
}

impl LocalProcessHandle {
    fn new(child: Child) -> Self {
        Self { child, exited: None }
    }
}

fn spawn(command: &Command, stdout: Stdio, stderr: Stdio) -> Result<Child> {
    let mut async_cmd = command.prepare();
    async_cmd.stdin(Stdio::null());
    async_cmd.stdout(stdout);
    async_cmd.stderr(stderr);
    async_cmd
        .spawn()
        .map_err(|e| Error::spawn_failed(format!("{}: {}", command, e)))
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, command: Command, relay: OutputRelay) -> Result<Box<dyn ProcessHandle>> {
        debug!("Executing {}", command);
        let mut child = spawn(&command, Stdio::piped(), Stdio::piped())?;

        if let Some(stdout) = child.stdout.take() {
            relay.spawn_reader(stdout, LogSource::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            relay.spawn_reader(stderr, LogSource::Stderr);
        }

        Ok(Box::new(LocalProcessHandle::new(child)))
    }

    async fn output(&self, command: Command) -> Result<ExitResult> {
        debug!("Executing {}", command);
        let output = command
            .prepare()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::spawn_failed(format!("{}: {}", command, e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExitResult {
            status: output.status.into(),
            output: combined,
        })
    }

    async fn stream_lines(
        &self,
        command: Command,
        stderr: OutputRelay,
    ) -> Result<(Box<dyn ProcessHandle>, LineStream)> {
        debug!("Executing {}", command);
        let mut child = spawn(&command, Stdio::piped(), Stdio::piped())?;

        if let Some(err) = child.stderr.take() {
            stderr.spawn_reader(err, LogSource::Stderr);
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn_failed(format!("{}: stdout not captured", command)))?;
        let lines = BufReader::new(stdout).lines().boxed();

        Ok((Box::new(LocalProcessHandle::new(child)), lines))
    }
}

#[async_trait]
impl ProcessHandle for LocalProcessHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    async fn signal(&mut self, signal: Signal) -> Result<()> {
        if self.try_status()?.is_some() {
            return Err(Error::NotRunning);
        }

        #[cfg(unix)]
        {
            crate::process::send_signal(self.child.id() as i32, signal)
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            self.child
                .kill()
                .map_err(|e| Error::signal_failed(-1, e.to_string()))
        }
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        let status: ExitStatus = self.child.status().await?.into();
        self.exited = Some(status);
        Ok(status)
    }

    fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.exited.is_none() {
            self.exited = self.child.try_status()?.map(Into::into);
        }
        Ok(self.exited)
    }
}

impl Drop for LocalProcessHandle {
    fn drop(&mut self) {
        if self.exited.is_none() {
            let _ = self.child.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelaySink;

    #[smol_potat::test]
    async fn test_output_captures_both_streams() {
        let cmd = Command::builder("sh")
            .arg("-c")
            .arg("echo out; echo err >&2; exit 3")
            .build();
        let result = LocalLauncher.output(cmd).await.unwrap();
        assert_eq!(result.status.code, Some(3));
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[smol_potat::test]
    async fn test_checked_output_reports_failure() {
        let cmd = Command::builder("false").build();
        let err = LocalLauncher.checked_output(cmd).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited { code: Some(1), .. }));
    }

    #[smol_potat::test]
    async fn test_spawn_failure() {
        let cmd = Command::new("/definitely/not/a/binary");
        let err = LocalLauncher
            .launch(cmd, OutputRelay::discard())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }

    #[smol_potat::test]
    async fn test_launch_relays_and_signals() {
        let (tx, rx) = async_channel::unbounded();
        let relay = OutputRelay::new("T", "").with_sink(RelaySink::Channel(tx));
        let cmd = Command::builder("sh")
            .arg("-c")
            .arg("echo started; exec sleep 30")
            .build();

        let mut handle = LocalLauncher.launch(cmd, relay).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "TO: started\x1b[0m");

        handle.terminate().await.unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.signal, Some(15));

        let err = handle.terminate().await.unwrap_err();
        assert!(matches!(err, Error::NotRunning));
    }

    #[smol_potat::test]
    async fn test_stream_lines() {
        let cmd = Command::builder("printf").arg("a\\nb\\n").build();
        let (mut handle, lines) = LocalLauncher
            .stream_lines(cmd, OutputRelay::discard())
            .await
            .unwrap();
        let lines: Vec<String> = lines.map(|l| l.unwrap()).collect().await;
        assert_eq!(lines, vec!["a", "b"]);
        assert!(handle.wait().await.unwrap().success());
    }
}
