//! VizStream Server Binary
//!
//! Serves the dashboard and the entry API in the foreground until Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vizstream::config::ServerConfig;
use vizstream::server::VizServer;

#[derive(Parser)]
#[command(name = "vizstream-server")]
#[command(about = "Live dashboard server for running processes")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Dashboard build directory
    #[arg(short, long)]
    dist: Option<PathBuf>,

    /// Do not print the dashboard URL on start
    #[arg(long)]
    no_url: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(if args.verbose {
            "vizstream=debug"
        } else {
            "vizstream=info"
        }))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Starting VizStream Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = ServerConfig::load(args.config.as_deref())?;

    // Override config with CLI arguments
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dist) = args.dist {
        config.assets.dist_path = dist;
    }
    if args.no_url {
        config.server.show_url = false;
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Bind address: {}", config.bind_addr());
    info!("Dashboard directory: {}", config.assets.dist_path.display());

    let server = Arc::new(VizServer::new(config)?);
    let running = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { running.run().await });

    // Handle shutdown gracefully
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = &mut serve => {
            match result {
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Server task failed: {}", e);
                    std::process::exit(1);
                }
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal => {
            info!("Shutting down gracefully...");
            server.shutdown();
            let _ = serve.await;
        }
    }

    info!("VizStream Server stopped");
    Ok(())
}
