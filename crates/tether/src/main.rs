//! Binary entry point: load configuration, open the event log, wire the
//! supervisor, and serve the HTTP/WebSocket API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use tether::api::{self, AppState};
use tether::config::Settings;
use tether::gateway::Gateway;
use tether::hub::EventHub;
use tether::process::NativeProcessFactory;
use tether::store::SqliteStore;

#[derive(Parser)]
#[command(name = "tether", version, about = "Supervised agent-runtime gateway")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(short, long)]
    listen: Option<String>,
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    // Also init env_logger for compatibility with log crate users
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        settings.server.listen_addr = listen;
    }

    let store = Arc::new(SqliteStore::open(&settings.store.db_path).await?);
    let hub = Arc::new(EventHub::new());
    let gateway = Gateway::new(
        settings.runtime.clone(),
        Arc::new(NativeProcessFactory),
        Arc::clone(&store),
        Arc::clone(&hub),
    );

    // Bring the runtime up front; a failure here is not fatal since every
    // request path starts it on demand.
    if let Err(e) = gateway.start().await {
        warn!("runtime not started yet: {}", e);
    }

    let state = AppState {
        gateway: Arc::clone(&gateway),
        store,
        hub,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.server.listen_addr))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    gateway.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("shutdown signal received");
}
