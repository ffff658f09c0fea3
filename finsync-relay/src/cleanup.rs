//! Background cleanup: prune stale packages and expired init packages.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::storage::RelayStorage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

pub fn spawn_cleanup_task(storage: RelayStorage, config: &RelayConfig) -> JoinHandle<()> {
    let every = config.cleanup_interval();
    let retention = config.package_retention();
    let init_ttl = config.init_ttl();

    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            if let Err(e) = run_cleanup(&storage, now, retention, init_ttl) {
                tracing::error!("Cleanup error: {}", e);
            }
        }
    })
}

fn run_cleanup(
    storage: &RelayStorage,
    now_ms: i64,
    retention: Duration,
    init_ttl: Duration,
) -> Result<(), RelayError> {
    let package_cutoff = now_ms - retention.as_millis() as i64;
    let init_cutoff = now_ms - init_ttl.as_millis() as i64;

    let (packages, inits) = storage.prune(package_cutoff, init_cutoff)?;
    tracing::debug!(
        "Cleanup completed: {} packages, {} init packages removed",
        packages,
        inits
    );
    Ok(())
}
