//! Relay server binary
//!
//! Binds one public listener that serves forwarded HTTP, upgrade
//! bridging, and the tunnel clients' control-channel handshake.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_control::ClientRegistry;
use burrow_server_http::{HttpServer, HttpServerConfig};

/// Expose local services at `<name>.<your-domain>` through reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Run a reverse HTTP tunneling relay", long_about = None)]
struct Args {
    /// Bind address for the public listener
    #[arg(long, default_value = "0.0.0.0")]
    hostname: String,

    /// Bind port for the public listener
    #[arg(long, default_value = "8080", env = "PORT")]
    port: u16,

    /// Base subdomain the relay itself runs under, stripped from resolved
    /// names (empty = none)
    #[arg(long, default_value = "")]
    subdomain: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    let bind_addr = tokio::net::lookup_host((args.hostname.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| {
            anyhow::anyhow!("cannot resolve bind address {}:{}", args.hostname, args.port)
        })?;

    info!("starting burrow relay");
    if !args.subdomain.is_empty() {
        info!("running under base subdomain {}", args.subdomain);
    }

    let registry = Arc::new(ClientRegistry::new());
    let config = HttpServerConfig {
        bind_addr,
        base_subdomain: args.subdomain,
    };
    let server = HttpServer::new(config, registry);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("relay server error: {}", e);
        }
    });

    signal::ctrl_c().await?;
    info!("shutting down");
    server_handle.abort();

    Ok(())
}
