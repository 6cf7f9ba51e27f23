//! serial-mux - tunnel TCP connections over a serial link
//!
//! # Example Usage
//!
//! ```bash
//! # Client: expose local 8080 as port 9090 on the far side
//! serial-mux --port /dev/ttyUSB0 --ports 8080-9090
//!
//! # Server: dial targets on request
//! serial-mux --port /dev/ttyUSB1 --server
//!
//! # Without hardware, over TCP
//! serial-mux --port tcp-listen://127.0.0.1:7000 --server
//! serial-mux --port tcp://127.0.0.1:7000 --ports 127.0.0.1:2222-db:22
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use serial_mux::config::{parse_port_mappings, Role, TunnelConfig};
use serial_mux::utils::logging;
use serial_mux::{transport, Tunnel};

/// Multiplex TCP connections over a single serial link
#[derive(Parser, Debug)]
#[command(name = "serial-mux", version, about)]
struct Cli {
    /// Serial device, `tcp://host:port` or `tcp-listen://host:port`
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Run as server (dial targets on request)
    #[arg(long)]
    server: bool,

    /// Port mappings: local-remote[,local-remote...], each side host:port or port
    #[arg(long)]
    ports: Option<String>,

    /// TOML configuration file
    #[arg(long, env = "SERIAL_MUX_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    /// Print an example configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", TunnelConfig::example_config());
        return Ok(());
    }

    let mut config = load_config(&cli)?;
    logging::init(&logging::with_verbosity(&config.logging, cli.verbose));

    if config.role == Role::Server && !config.mappings.is_empty() {
        warn!("Port mappings are ignored in server role");
        config.mappings.clear();
    }
    config
        .validate_strict()
        .context("Invalid configuration")?;

    info!(
        role = %config.role,
        device = %config.transport.device,
        baud_rate = config.transport.baud_rate,
        mappings = config.mappings.len(),
        "Starting serial-mux"
    );
    for mapping in &config.mappings {
        info!(local = %mapping.local_addr(), remote = %mapping.remote_addr(), "Port mapping");
    }

    let tunnel = Tunnel::new(config);
    let shutdown = tunnel.shutdown_token();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C, shutting down");
                shutdown.cancel();
            }
        }
    });

    let link = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        link = transport::open(&tunnel.config().transport) => {
            link.context("Failed to open transport")?
        }
    };

    if let Err(e) = tunnel.run(link).await {
        error!(error = %e, "Tunnel stopped");
        return Err(e).context("Tunnel failed");
    }

    info!("Tunnel stopped");
    Ok(())
}

/// Defaults, then the config file, then `SERIAL_MUX_*` variables, then flags
fn load_config(cli: &Cli) -> Result<TunnelConfig> {
    let mut config = match &cli.config {
        Some(path) => TunnelConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => TunnelConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid SERIAL_MUX_* environment")?;

    if let Some(port) = &cli.port {
        config.transport.device = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.transport.baud_rate = baud;
    }
    if cli.server {
        config.role = Role::Server;
    }
    if let Some(ports) = &cli.ports {
        config.mappings = parse_port_mappings(ports).context("Invalid --ports")?;
    }

    Ok(config)
}
