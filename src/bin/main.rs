//! dockhand binary entry point.

use clap::Parser;
use dockhand::{supervisor, telemetry, Config};
use tracing::{error, info};

/// Host-resident DNS resolver for Docker containers.
#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(version, about, long_about = None)]
struct Args {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _args = Args::parse();

    // All configuration comes from the environment.
    let config = Config::from_env()?;

    telemetry::init(&config).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        docker_host = %config.docker_host,
        dns_listen = %config.dns_listen,
        container_domain = %config.container_domain,
        "starting dockhand"
    );

    if let Err(e) = supervisor::run(config).await {
        error!("dockhand: {e}");
        return Err(e.into());
    }

    info!("dockhand shutdown complete");
    Ok(())
}
