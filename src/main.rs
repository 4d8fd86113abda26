//! uDPU device agent
//!
//! Registers the device with the control plane and runs its jobs.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*};
use udpu_agent::config::{AgentConfig, Args};
use udpu_agent::{agent, shutdown};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(args.log_filter())
        .init();

    let config = match AgentConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("uDPU agent starting");
    info!("  Discovery: {}", config.discovery);
    info!("  Store: {}", config.store_path.display());

    let token = match shutdown::install_shutdown_handler() {
        Ok(token) => token,
        Err(e) => {
            error!("Failed to install signal handlers: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match agent::run(config, token).await {
        Ok(()) => {
            info!("uDPU agent stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("uDPU agent failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
