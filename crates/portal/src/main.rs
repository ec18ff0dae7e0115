//! `portal` binary: start the platform, run until signalled, stop it

use anyhow::{Context, Result};
use clap::Parser;
use portal::config::{Cli, PortalConfig};
use portal::signals::ShutdownSignals;
use portal::{Platform, logging};
use tracing::{error, info};

enum Outcome {
    Started(portal::Result<()>),
    Signalled,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, !cli.no_color).context("Failed to set up logging")?;
    let config = PortalConfig::load(&cli).context("Invalid configuration")?;
    let signals = ShutdownSignals::install().context("Failed to install signal handlers")?;

    smol::block_on(async {
        let mut platform = Platform::new(config).context("Failed to set up services")?;

        let outcome = smol::future::or(
            async { Outcome::Started(platform.start().await) },
            async {
                signals.recv().await;
                Outcome::Signalled
            },
        )
        .await;

        match outcome {
            Outcome::Started(Ok(())) => {
                info!("Portal is up; waiting for SIGINT or SIGTERM");
                signals.recv().await;
            }
            Outcome::Started(Err(e)) => {
                error!("Startup failed: {}", e);
                return Err(e).context("Startup failed");
            }
            Outcome::Signalled => info!("Interrupted during startup"),
        }

        if let Err(e) = platform.shutdown().await {
            error!("Shutdown was incomplete: {}", e);
        }
        Ok(())
    })
}
