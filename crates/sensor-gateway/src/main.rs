//! sensor-gateway: Sensor data gateway binary
//!
//! Serves a fixed number of sensor connections on the given TCP port, then
//! drains the pipeline and exits.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensor_gateway_lib::{run_server, Gateway, GatewayConfig, ServerState};

#[derive(Parser, Debug)]
#[command(name = "sensor-gateway")]
#[command(about = "TCP sensor gateway with running-average analysis and CSV storage")]
struct Args {
    /// TCP port sensor nodes connect to
    port: u16,

    /// Path to gateway configuration file (defaults apply when omitted)
    #[arg(short, long, env = "SENSOR_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address, e.g. 0.0.0.0:8080
    #[arg(long)]
    health_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match args.config {
        Some(ref path) => GatewayConfig::load(path).map_err(|e| {
            error!(error = %e, path = %path.display(), "Failed to load config");
            e
        })?,
        None => GatewayConfig::default(),
    };
    info!(
        port = args.port,
        max_connections = config.max_connections,
        data_file = %config.storage.data_file.display(),
        log_file = %config.log_file.display(),
        "Starting sensor gateway"
    );

    let gateway = Gateway::bind(config, args.port).map_err(|e| {
        error!(error = %e, operation = "startup", "Fatal error");
        e
    })?;

    if let Some(ref addr) = args.health_addr {
        let health_addr: SocketAddr = addr.parse()?;
        let state = ServerState::new(gateway.stats(), gateway.buffer());
        tokio::spawn(async move {
            if let Err(e) = run_server(health_addr, state).await {
                error!(error = %e, "Health server failed");
            }
        });
        info!(addr = %health_addr, "Health server started");
    }

    // Pipeline threads block; keep them off the async workers
    let summary = tokio::task::spawn_blocking(move || gateway.run())
        .await?
        .map_err(|e| {
            error!(error = %e, operation = "pipeline", "Fatal error");
            e
        })?;

    info!(
        connections = summary.connections.connections,
        readings = summary.connections.readings,
        persisted = summary.persisted,
        events = summary.events,
        "Sensor gateway stopped"
    );
    Ok(())
}
