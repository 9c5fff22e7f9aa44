//! chapi-server: holds HTTP requests open and pushes framed messages to
//! their clients over channels.
//!
//! Application requests are suspended and answered with a channel token.
//! Once the client opens its channel, everything written to the held
//! connection is reframed as `message:l=<len>;<payload>` and delivered there.

mod channel;
mod config;
mod gate;
mod interceptor;
mod lifecycle;
mod server;
mod suspend;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::ChapiServer;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// chapi-server: channel push bridge for held HTTP connections
#[derive(Parser, Debug)]
#[command(name = "chapi-server", version, about = "Channel push bridge for held HTTP connections")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.chapi/config.toml")]
    config: String,

    /// Seconds a request stays suspended (0 = no timeout)
    #[arg(long)]
    suspend_timeout: Option<u64>,

    /// Maximum concurrently held connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Charset of held responses (utf-8, iso-8859-1, us-ascii)
    #[arg(long)]
    charset: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting chapi-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        suspend_timeout: cli.suspend_timeout,
        max_connections: cli.max_connections,
        charset: cli.charset,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let chapi_server = match ChapiServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    if let Err(e) = chapi_server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("chapi-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
