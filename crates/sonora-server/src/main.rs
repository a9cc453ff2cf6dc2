//! Sonora Server - HTTP API for transcription, VAD and music separation

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cache;
mod db;
mod error;
mod lifespan;
mod state;
mod worker;

use lifespan::StartupOptions;
use sonora_core::config::ServerSection;

#[derive(Debug, Parser)]
#[command(
    name = "sonora-server",
    about = "HTTP API server for Sonora transcription, VAD and music separation",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Server configuration file
    #[arg(long, env = "SONORA_CONFIG")]
    config: Option<PathBuf>,

    /// Dotenv file consulted for DB_URL
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindConfig {
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sonora_server=info,sonora_core=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sonora Server");

    let mut options = StartupOptions::default();
    if let Some(path) = args.config.clone() {
        options.config_path = path;
    }
    if let Some(path) = args.env_file.clone() {
        options.env_file = path;
    }
    info!(
        config = %options.config_path.display(),
        env_file = %options.env_file.display(),
        "Loading configuration"
    );

    let lifespan = lifespan::startup(options).await?;
    let app = api::create_router(lifespan.state.clone());

    let bind = resolve_bind_config(&args, &lifespan.state.config.server);
    let addr = format!("{}:{}", bind.host, bind.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready. Press Ctrl+C to stop.");
    let served = server.await;
    lifespan.shutdown().await;
    served?;

    Ok(())
}

/// CLI flags win over `SONORA_HOST`/`SONORA_PORT`, which win over the config file.
fn resolve_bind_config(args: &ServerArgs, server: &ServerSection) -> BindConfig {
    BindConfig {
        host: args
            .host
            .clone()
            .unwrap_or_else(|| host_from_env_or(&server.host)),
        port: args.port.unwrap_or_else(|| port_from_env_or(server.port)),
    }
}

fn host_from_env_or(fallback: &str) -> String {
    match std::env::var("SONORA_HOST") {
        Ok(raw) => {
            let host = raw.trim();
            if host.is_empty() {
                warn!("Empty SONORA_HOST, falling back to {}", fallback);
                fallback.to_string()
            } else {
                host.to_string()
            }
        }
        Err(_) => fallback.to_string(),
    }
}

fn port_from_env_or(fallback: u16) -> u16 {
    match std::env::var("SONORA_PORT") {
        Ok(raw) => match raw.trim().parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid SONORA_PORT='{}', falling back to {}", raw, fallback);
                fallback
            }
        },
        Err(_) => fallback,
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

/// Serializes tests that touch process environment variables.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
