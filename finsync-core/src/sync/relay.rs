//! Transport seam between the sync engine and the relay.

use crate::sync::models::{EncryptedPackage, InitRecord, PulledPackage, PushResponse};
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// The six relay operations, authenticated as one installation.
///
/// Failures surface as [`crate::RelayFailure`] so callers can retry on the
/// next cycle.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Installation the relay authenticates this client as.
    fn installation_id(&self) -> Uuid;

    /// Submit one encrypted package.
    async fn push(&self, package: &EncryptedPackage) -> Result<PushResponse>;

    /// Packages in this installation's mailbox created after `since`.
    async fn pull(&self, since: i64) -> Result<Vec<PulledPackage>>;

    /// Remove consumed packages from the mailbox.
    async fn ack(&self, package_ids: &[String]) -> Result<()>;

    /// Post an encrypted init payload addressed to `target`.
    async fn post_init(&self, target: Uuid, encrypted_payload: &[u8]) -> Result<()>;

    /// Init packages waiting for this installation.
    async fn get_inits(&self) -> Result<Vec<InitRecord>>;

    async fn delete_inits(&self, ids: &[String]) -> Result<()>;
}
