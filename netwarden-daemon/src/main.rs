use anyhow::Result;
use clap::Parser;

use netwarden_daemon::cli::DaemonCli;
use netwarden_daemon::logging;
use netwarden_daemon::orchestrator::Orchestrator;
use netwarden_network_guard::NetworkGuardConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();
    let config = cli.load_config().await?;

    if cli.validate {
        NetworkGuardConfig::from_core(&config)
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid network guard configuration: {}", e))?;
        println!("configuration is valid");
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "netwarden-daemon starting");

    let mut orchestrator = Orchestrator::build_from_config(config)?;
    let result = orchestrator.run().await;
    match &result {
        Ok(()) => tracing::info!("netwarden-daemon shut down"),
        Err(e) => tracing::error!(error = %e, "netwarden-daemon exited with error"),
    }
    result
}
