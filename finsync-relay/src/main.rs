//! Finsync Relay Server
//!
//! A self-hostable mailbox for encrypted sync packages. The relay stores
//! only ciphertext, wrapped content keys and installation ids; it never
//! holds a private key or plaintext data.

mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod rate_limit;
mod server;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "finsync-relay", about = "Finsync sync relay server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::RelayConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }

    tracing::info!("Starting finsync relay on {}", cfg.listen_addr);

    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let cleanup = cleanup::spawn_cleanup_task(storage.clone(), &cfg);
    let app = server::build_router(server::AppState::new(storage, &cfg), &cfg);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    cleanup.abort();
    Ok(())
}
