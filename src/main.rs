//! Swarm Relay Server
//!
//! Run with: cargo run --bin swarm-relay
//!
//! Configuration is read from the first config file found (see
//! [`Config::load_default`]) and overridden by `SWARM_RELAY_*` environment
//! variables and the command-line flags below. `RUST_LOG` overrides the
//! configured log level.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use swarm_relay::api::{serve, AppState};
use swarm_relay::config::{generate_default_config, Config, LoggingConfig};
use swarm_relay::device::{DeviceTransport, SimulatedTransport};
use swarm_relay::relay::Relay;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "swarm-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket relay for a swarm of robotic cubes")]
struct Args {
    /// Config file (default: search the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Print a commented default config and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_logging(&config.logging);

    tracing::info!("Starting Swarm Relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        devices = ?config.device.simulated,
        interval_ms = config.device.notify_interval_ms,
        "Using simulated transport"
    );

    let transport: Arc<dyn DeviceTransport> = Arc::new(SimulatedTransport::new(
        config.device.simulated_cubes(),
        config.device.notify_interval(),
    ));
    let relay = Relay::new(transport, config.relay_config());

    let api_config = config.api_config();
    let state = AppState::new(Arc::clone(&relay), api_config.clone());
    let result = serve(state, &api_config).await;

    relay.shutdown().await;
    result.context("relay server failed")?;

    tracing::info!("Swarm Relay stopped");
    Ok(())
}

/// Install the tracing subscriber
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "swarm_relay={level},tower_http=info",
            level = logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
