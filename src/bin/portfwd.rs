//! portfwd - local TCP port forwarding
//!
//! Listens on local ports and forwards every accepted connection to its
//! configured remote endpoint over a direct TCP transport.

use anyhow::{bail, Context, Result};
use clap::Parser;
use portfwd::{
    config::{generate_example_config, Config, LoggingConfig},
    transport::{DirectTransport, TransportConfig},
    PortForwardServer, TunnelOptions, TunnelSpec, WorkerPool,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// portfwd - forward local ports to remote endpoints
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(about = "Forward local TCP ports to remote endpoints")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Tunnel to run, as LOCAL_PORT:HOST:PORT (repeatable)
    #[arg(short = 'L', long = "local", value_name = "LOCAL_PORT:HOST:PORT")]
    tunnels: Vec<TunnelSpec>,

    /// Worker threads for tunnel connections (overrides config)
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Log level (trace, debug, info, warn, error), overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        println!("{}", example);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    init_logging(&config.logging, args.log_level.as_deref());

    let mut tunnels = config
        .tunnel_specs()
        .context("Invalid tunnel in configuration")?;
    for spec in args.tunnels {
        let options = TunnelOptions::default();
        tunnels.push((spec, options));
    }
    if tunnels.is_empty() {
        bail!("No tunnels configured; pass -L LOCAL_PORT:HOST:PORT or a config file");
    }

    let worker_threads = args.worker_threads.unwrap_or(config.runtime.worker_threads);
    let pool = WorkerPool::new(worker_threads).context("Failed to start worker pool")?;

    let transport = Arc::new(DirectTransport::new(TransportConfig {
        connect_timeout_ms: config.timeouts.connect_ms,
        ..TransportConfig::default()
    }));

    info!("portfwd v{}", portfwd::VERSION);
    info!(worker_threads, tunnels = tunnels.len(), "Starting tunnels");

    let root = CancellationToken::new();
    let mut handles = Vec::with_capacity(tunnels.len());
    for (spec, options) in tunnels {
        let label = spec.to_string();
        let handle = PortForwardServer::new(spec, Arc::clone(&transport), pool.clone())
            .with_options(options)
            .start(root.clone())
            .with_context(|| format!("Failed to start tunnel {}", label));

        match handle {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // Tear down the tunnels that did start
                root.cancel();
                for handle in handles {
                    handle.wait().await.ok();
                }
                return Err(e);
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    root.cancel();

    for handle in handles {
        let addr = handle.local_addr();
        if let Err(e) = handle.wait().await {
            error!(local_addr = %addr, error = %e, "Tunnel ended with error");
        }
    }

    info!("All tunnels closed");
    Ok(())
}

fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&logging.level);
    let builder = tracing_subscriber::fmt().with_env_filter(level);

    match logging.format.as_str() {
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}
