//! Gerrit change events to Redmine notes
//!
//! A `gerrit stream-events` session runs over SSH and emits one JSON object
//! per line. Every `Bug-Id:` reference in a change's commit message becomes
//! a note on that Redmine issue. Undecodable lines are skipped, and the
//! session is reopened whenever it ends.

use crate::gerrit::events::SUBSCRIBED_EVENTS;
use crate::gerrit::{ChangeEvent, RedmineAnnotation};
use crate::redmine::RedmineClient;
use crate::{Error, Result};
use async_trait::async_trait;
use command_executor::launcher::LineStream;
use command_executor::relay::colors;
use command_executor::{Command, Launcher, OutputRelay, ProcessHandle, SshConfig};
use futures::StreamExt;
use service_orchestration::{Sleeper, TimerSleeper};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause before every (re)connect
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Attempts per annotation
pub const ANNOTATION_ATTEMPTS: u32 = 3;

/// Pause between annotation attempts
pub const ANNOTATION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// An open event stream
pub struct EventSession {
    /// One event per line
    pub lines: LineStream,
    /// The process producing the lines, if any
    pub process: Option<Box<dyn ProcessHandle>>,
}

/// Opens event streams
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Open a new session
    async fn open(&self) -> Result<EventSession>;
}

/// Receives annotations
#[async_trait]
pub trait AnnotationSink: Send + Sync {
    /// Attach `annotation` to its ticket
    async fn annotate(&self, annotation: &RedmineAnnotation) -> Result<()>;
}

#[async_trait]
impl AnnotationSink for RedmineClient {
    async fn annotate(&self, annotation: &RedmineAnnotation) -> Result<()> {
        self.update_issue_note(&annotation.ticket, &annotation.note)
            .await
    }
}

/// `gerrit stream-events` over SSH as the `buildbot` account
pub struct SshEventFeed {
    launcher: Arc<dyn Launcher>,
    ssh: SshConfig,
}

impl SshEventFeed {
    /// Feed from the Gerrit SSH daemon at `host:port`
    pub fn new(
        launcher: Arc<dyn Launcher>,
        host: impl Into<String>,
        port: u16,
        identity_file: impl Into<PathBuf>,
    ) -> Self {
        let ssh = SshConfig::new(host)
            .with_identity_file(identity_file)
            .with_user("buildbot")
            .with_port(port);
        Self { launcher, ssh }
    }

    /// The full `ssh` invocation
    pub fn command(&self) -> Command {
        let mut remote = Command::new("gerrit");
        remote.arg("stream-events");
        for kind in SUBSCRIBED_EVENTS {
            remote.arg("-s").arg(kind);
        }
        self.ssh.wrap(&remote)
    }
}

#[async_trait]
impl EventFeed for SshEventFeed {
    async fn open(&self) -> Result<EventSession> {
        let (process, lines) = self
            .launcher
            .stream_lines(self.command(), OutputRelay::new("S", colors::GREEN))
            .await?;
        Ok(EventSession {
            lines,
            process: Some(process),
        })
    }
}

/// Forwards change events to the issue tracker
pub struct ChangeEventProcessor {
    feed: Arc<dyn EventFeed>,
    sink: Arc<dyn AnnotationSink>,
    sleeper: Arc<dyn Sleeper>,
}

impl ChangeEventProcessor {
    /// Processor reading `feed` and writing to `sink`
    pub fn new(feed: Arc<dyn EventFeed>, sink: Arc<dyn AnnotationSink>) -> Self {
        Self {
            feed,
            sink,
            sleeper: Arc::new(TimerSleeper),
        }
    }

    /// Replace the sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Deliver one annotation, retrying transport failures
    pub async fn deliver(&self, annotation: &RedmineAnnotation) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.sink.annotate(annotation).await {
                Ok(()) => return Ok(()),
                Err(Error::Transport(reason)) if attempt < ANNOTATION_ATTEMPTS => {
                    warn!(
                        "change events: Bug-Id {}: attempt {} failed: {}",
                        annotation.ticket, attempt, reason
                    );
                    attempt += 1;
                    self.sleeper.sleep(ANNOTATION_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle one line of the stream; returns the number of notes delivered
    pub async fn process_line(&self, line: &str) -> usize {
        let event = match ChangeEvent::parse(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("change events: skipping line: {}", e);
                return 0;
            }
        };
        let annotations = event.annotations();
        info!("change events: {} matches", annotations.len());
        let mut delivered = 0;
        for annotation in &annotations {
            info!("change events: Bug-Id: {}", annotation.ticket);
            match self.deliver(annotation).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "change events: failed to update issue {}: {}",
                    annotation.ticket, e
                ),
            }
        }
        delivered
    }

    /// One session: open the feed and process lines until it ends
    pub async fn run_once(&self) -> Result<()> {
        let EventSession { mut lines, process } = self.feed.open().await?;
        info!("change events: started");
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    debug!("change events: {}", line);
                    self.process_line(&line).await;
                }
                Err(e) => {
                    warn!("change events: read error: {}", e);
                    break;
                }
            }
        }
        if let Some(mut process) = process {
            let status = process.wait().await?;
            info!("change events: stream ended with {}", status);
        }
        Ok(())
    }

    /// Reconnect forever
    pub async fn run(&self) -> Result<()> {
        loop {
            self.sleeper.sleep(RECONNECT_DELAY).await;
            if let Err(e) = self.run_once().await {
                warn!("change events: {}", e);
            }
        }
    }
}
