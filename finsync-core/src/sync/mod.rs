//! End-to-end encrypted multi-device sync.
//!
//! - Change capture through store triggers stamping `updated_at`
//! - Delta packages sealed per recipient (AES-256-GCM content, X25519 key wrap)
//! - Last-write-wins merge with tombstones for deletes
//! - Pairing and gossip introductions for key distribution
//! - An orchestrator running push/pull cycles on a timer

pub mod builder;
pub mod change_tracker;
#[cfg(feature = "sync")]
pub mod client;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod entities;
pub mod events;
pub mod identity;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod pairing;
pub mod relay;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "sync")]
pub use client::{Registration, RelayClient};
pub use config::SyncConfig;
pub use conflict::{ConflictResolver, Resolution};
pub use engine::{PushOutcome, SyncEngine};
pub use entities::EntityKind;
pub use events::{EventBus, SyncEvent};
pub use identity::{Installation, LinkedInstallation};
pub use models::{ImportResult, RecordError, SyncPackage, SyncStatus};
pub use orchestrator::{CycleReport, OrchestratorConfig, SyncOrchestrator};
pub use pairing::{PairingReport, PairingState};
pub use relay::Relay;
pub use state::SyncState;
