//! Line-prefixed output relaying
//!
//! Every managed service writes to its own stdout/stderr. The supervisor
//! forwards each line to its own stdout, prefixed with a short service tag,
//! the stream letter (`O` or `E`) and a color, so several services can share
//! one terminal. Each stream is drained by a dedicated task so a chatty
//! stderr never blocks a quiet stdout (or the child itself).

use async_channel::Sender;
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures_lite::StreamExt;
use std::io::Write;
use tracing::warn;

/// ANSI color codes used for service prefixes
pub mod colors {
    /// Red
    pub const RED: &str = "\x1b[0;31m";
    /// Green
    pub const GREEN: &str = "\x1b[0;32m";
    /// Yellow
    pub const YELLOW: &str = "\x1b[0;33m";
    /// Blue
    pub const BLUE: &str = "\x1b[0;34m";
    /// Magenta
    pub const MAGENTA: &str = "\x1b[0;35m";
    /// Reset
    pub const RESET: &str = "\x1b[0m";
}

/// Source of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl LogSource {
    fn letter(self) -> char {
        match self {
            LogSource::Stdout => 'O',
            LogSource::Stderr => 'E',
        }
    }
}

/// Where relayed lines end up
#[derive(Debug, Clone)]
pub enum RelaySink {
    /// The supervisor's own standard output
    Stdout,
    /// A channel, one formatted line per message
    Channel(Sender<String>),
    /// Drop everything
    Discard,
}

/// Relays child output with a per-service prefix
#[derive(Debug, Clone)]
pub struct OutputRelay {
    tag: String,
    color: String,
    sink: RelaySink,
}

impl OutputRelay {
    /// Create a relay writing to stdout with the given tag and color
    pub fn new(tag: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            color: color.into(),
            sink: RelaySink::Stdout,
        }
    }

    /// A relay that discards all output
    pub fn discard() -> Self {
        Self {
            tag: String::new(),
            color: String::new(),
            sink: RelaySink::Discard,
        }
    }

    /// Redirect relayed lines to a different sink
    pub fn with_sink(mut self, sink: RelaySink) -> Self {
        self.sink = sink;
        self
    }

    /// The tag this relay prefixes lines with
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Format one line the way it is written to the sink
    pub fn format_line(&self, source: LogSource, line: &str) -> String {
        format!(
            "{}{}{}: {}{}",
            self.color,
            self.tag,
            source.letter(),
            line,
            colors::RESET
        )
    }

    /// Emit a single line to the sink
    pub async fn emit(&self, source: LogSource, line: &str) {
        match &self.sink {
            RelaySink::Stdout => {
                let formatted = self.format_line(source, line);
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                let _ = writeln!(lock, "{}", formatted);
                let _ = lock.flush();
            }
            RelaySink::Channel(tx) => {
                let _ = tx.send(self.format_line(source, line)).await;
            }
            RelaySink::Discard => {}
        }
    }

    /// Drain a reader line by line on a background task
    pub fn spawn_reader<R>(&self, reader: R, source: LogSource)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let relay = self.clone();
        smol::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => relay.emit(source, &line).await,
                    Err(e) => {
                        warn!("output relay {}{}: {}", relay.tag, source.letter(), e);
                        break;
                    }
                }
            }
        })
        .detach();
    }
}
