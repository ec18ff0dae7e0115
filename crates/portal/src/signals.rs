//! Termination signals as an async stream

use crate::Result;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;

/// Receives SIGINT and SIGTERM
pub struct ShutdownSignals {
    rx: async_channel::Receiver<i32>,
}

impl ShutdownSignals {
    /// Register the handlers; signals are forwarded from a dedicated thread
    pub fn install() -> Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let (tx, rx) = async_channel::bounded(4);
        std::thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if tx.send_blocking(signal).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self { rx })
    }

    /// Wait for the next signal and return its number
    pub async fn recv(&self) -> Option<i32> {
        let signal = self.rx.recv().await.ok()?;
        info!("Received signal {}", signal_name(signal));
        Some(signal)
    }
}

/// Name of a termination signal
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "unknown signal",
    }
}
