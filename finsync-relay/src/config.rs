//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    pub max_payload_size: usize,
    pub rate_limit_per_minute: u32,
    /// Unacknowledged packages older than this are dropped.
    pub package_retention_days: u64,
    pub init_ttl_secs: u64,
    /// Per target installation.
    pub max_pending_inits: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8743".to_string(),
            storage_path: PathBuf::from("relay.db"),
            max_payload_size: 10 * 1024 * 1024,
            rate_limit_per_minute: 120,
            package_retention_days: 30,
            init_ttl_secs: 7 * 86_400,
            max_pending_inits: 100,
            cleanup_interval_secs: 3600,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }

    pub fn package_retention(&self) -> Duration {
        Duration::from_secs(self.package_retention_days * 86_400)
    }

    pub fn init_ttl(&self) -> Duration {
        Duration::from_secs(self.init_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}
