//! Log output setup

use crate::{Error, Result};
use std::str::FromStr;
use tracing::Level;

/// Install the global `tracing` subscriber
///
/// Child process output does not go through here; it is relayed to stdout
/// line by line with its own tag and color.
pub fn init(level: &str, color: bool) -> Result<()> {
    let level = Level::from_str(level)
        .map_err(|_| Error::config(format!("unknown log level '{}'", level)))?;
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .with_ansi(color)
        .try_init()
        .map_err(|e| Error::config(format!("failed to install logger: {}", e)))
}
