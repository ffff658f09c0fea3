use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use finsync_core::sync::identity::{
    get_linked_installations, remove_linked_installation, Installation,
};
use finsync_core::sync::orchestrator::OrchestratorConfig;
use finsync_core::sync::pairing::pair_with;
use finsync_core::{Database, EventBus, RelayClient, SyncConfig, SyncEngine, SyncOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// Finsync CLI - encrypted multi-device sync for the finance store
#[derive(Parser)]
#[command(name = "finsync")]
#[command(about = "Encrypted multi-device sync for a local finance store", long_about = None)]
struct Cli {
    /// Path to the local store
    #[arg(long, global = true, default_value = "finsync.db")]
    db: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create this device's identity and register it with a relay
    Init {
        /// Relay base URL
        #[arg(long)]
        relay_url: String,

        /// Use an existing relay registration
        #[arg(long, requires = "token")]
        installation_id: Option<Uuid>,

        /// Bearer token of an existing registration
        #[arg(long, requires = "installation_id")]
        token: Option<String>,
    },

    /// Print this device's installation id and public key
    Identity,

    /// Pair with another device
    Pair {
        #[arg(long)]
        peer_id: Uuid,

        /// Peer public key (base64url)
        #[arg(long)]
        peer_key: String,
    },

    /// Run one sync cycle
    Sync,

    /// Run the orchestrator and print events until Ctrl-C
    Watch,

    /// Show sync status
    Status,

    /// Forget a linked device
    Unlink {
        #[arg(long)]
        peer_id: Uuid,
    },
}

fn open_store(path: &Path) -> Result<Database> {
    let db = Database::open(path).with_context(|| format!("opening {}", path.display()))?;
    db.initialize_schema()?;
    Ok(db)
}

/// Open the store and wire an engine to its configured relay.
fn connect(path: &Path) -> Result<(SyncEngine, SyncConfig)> {
    let db = open_store(path)?;
    let config = SyncConfig::load(&db)?;
    let installation = Installation::load(&db)?
        .ok_or_else(|| anyhow!("no identity in {}; run `finsync init` first", path.display()))?;
    let relay_url = config
        .relay_url
        .clone()
        .ok_or_else(|| anyhow!("no relay configured; run `finsync init` first"))?;
    if !config.sync_enabled {
        bail!("sync is disabled for {}", path.display());
    }

    let client =
        RelayClient::for_installation(&relay_url, &installation, config.request_timeout())?;
    let engine = SyncEngine::new(
        Arc::new(Mutex::new(db)),
        Arc::new(client),
        config.request_timeout(),
    );
    Ok((engine, config))
}

async fn init(
    path: &Path,
    relay_url: String,
    installation_id: Option<Uuid>,
    token: Option<String>,
) -> Result<()> {
    let db = open_store(path)?;
    if let Some(existing) = Installation::load(&db)? {
        bail!(
            "{} is already initialised as {}",
            path.display(),
            existing.installation_id
        );
    }

    let mut config = SyncConfig::load(&db)?;
    let (installation_id, token) = match (installation_id, token) {
        (Some(id), Some(token)) => (id, token),
        _ => {
            info!("Registering with {}", relay_url);
            let registration =
                RelayClient::register(&relay_url, None, config.request_timeout()).await?;
            (registration.installation_id, registration.token)
        }
    };

    let installation = Installation::generate(installation_id, token);
    installation.save(&db)?;
    config.sync_enabled = true;
    config.relay_url = Some(relay_url);
    config.initial_sync_pending = true;
    config.save(&db)?;

    println!("installation: {}", installation.installation_id);
    println!("public key:   {}", installation.key_pair.public_key_b64());
    Ok(())
}

fn identity(path: &Path) -> Result<()> {
    let db = open_store(path)?;
    let installation = Installation::load(&db)?
        .ok_or_else(|| anyhow!("no identity in {}; run `finsync init` first", path.display()))?;
    println!("installation: {}", installation.installation_id);
    println!("public key:   {}", installation.key_pair.public_key_b64());
    Ok(())
}

fn orchestrator(engine: SyncEngine, config: &SyncConfig) -> SyncOrchestrator {
    SyncOrchestrator::new(
        Arc::new(engine),
        Arc::new(EventBus::new()),
        OrchestratorConfig::from(config),
    )
}

async fn sync_once(path: &Path) -> Result<()> {
    let (engine, config) = connect(path)?;
    let report = orchestrator(engine, &config).run_cycle().await?;

    let imported = &report.imported;
    println!("imported:  {}", imported.total_imported());
    println!("deleted:   {}", imported.deleted);
    println!("conflicts: {}", imported.conflicts);
    for error in &imported.errors {
        println!(
            "error:     {} {} {}",
            error.entity_kind.as_deref().unwrap_or("-"),
            error.entity_id.as_deref().unwrap_or("-"),
            error.message
        );
    }
    if let Some(pairing) = &report.pairing {
        for id in &pairing.linked {
            println!("linked:    {}", id);
        }
    }
    Ok(())
}

async fn watch(path: &Path) -> Result<()> {
    let (engine, config) = connect(path)?;
    let orchestrator = orchestrator(engine, &config);
    let mut events = orchestrator.events().subscribe();
    orchestrator.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    info!("Missed {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    orchestrator.stop();
    Ok(())
}

fn status(path: &Path) -> Result<()> {
    let (engine, _) = connect(path)?;
    let status = engine.status()?;

    println!("enabled:         {}", status.enabled);
    if let Some(id) = status.installation_id {
        println!("installation:    {}", id);
    }
    println!(
        "relay:           {}",
        status.relay_url.as_deref().unwrap_or("-")
    );
    println!("last sync:       {}", format_ms(status.last_sync_at));
    println!("last push:       {}", format_ms(status.last_push_at));
    println!("pending changes: {}", status.pending_changes);
    println!("linked devices:  {}", status.linked_installations);

    let db = engine
        .db()
        .lock()
        .map_err(|_| anyhow!("store lock poisoned"))?;
    for linked in get_linked_installations(&*db)? {
        println!("  {}", linked.installation_id);
    }
    Ok(())
}

fn format_ms(ms: i64) -> String {
    if ms <= 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn unlink(path: &Path, peer_id: Uuid) -> Result<()> {
    let db = open_store(path)?;
    if remove_linked_installation(&db, peer_id)? {
        println!("unlinked {}", peer_id);
    } else {
        println!("{} was not linked", peer_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays parseable
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init {
            relay_url,
            installation_id,
            token,
        } => init(&cli.db, relay_url, installation_id, token).await,
        Commands::Identity => identity(&cli.db),
        Commands::Pair { peer_id, peer_key } => {
            let (engine, _) = connect(&cli.db)?;
            pair_with(&engine, peer_id, &peer_key).await?;
            println!("paired with {}", peer_id);
            Ok(())
        }
        Commands::Sync => sync_once(&cli.db).await,
        Commands::Watch => watch(&cli.db).await,
        Commands::Status => status(&cli.db),
        Commands::Unlink { peer_id } => unlink(&cli.db, peer_id),
    }
}
