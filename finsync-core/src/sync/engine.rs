//! Sync engine: push local changes, pull and merge remote ones.

use crate::database::Database;
use crate::sync::builder::{build_package, open_package, seal_package};
use crate::sync::change_tracker::count_pending_changes;
use crate::sync::config::SyncConfig;
use crate::sync::identity::{get_linked_installations, require_identity, LinkedInstallation};
use crate::sync::merge::import_package;
use crate::sync::models::{ImportResult, RecordError, SyncStatus};
use crate::sync::relay::Relay;
use crate::sync::state::SyncState;
use crate::{DatabaseError, RelayFailure, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// No row or tombstone changed since the last push.
    NothingToPush,
    /// No linked installation has a public key yet.
    NoRecipients,
    Pushed {
        created_at: i64,
        recipients: usize,
        package_ids: Vec<String>,
    },
}

/// Orchestrates push and pull against one relay for one local store.
///
/// The store lock is never held across a relay call.
pub struct SyncEngine {
    db: Arc<Mutex<Database>>,
    relay: Arc<dyn Relay>,
    timeout: Duration,
}

impl SyncEngine {
    pub fn new(db: Arc<Mutex<Database>>, relay: Arc<dyn Relay>, timeout: Duration) -> Self {
        Self { db, relay, timeout }
    }

    pub fn db(&self) -> &Arc<Mutex<Database>> {
        &self.db
    }

    pub fn relay(&self) -> &Arc<dyn Relay> {
        &self.relay
    }

    /// Run `f` with the store locked.
    pub(crate) fn with_db<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&Database) -> Result<T>,
    ) -> Result<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned(operation.to_string()))?;
        f(&db)
    }

    /// Await a relay call, failing with a timeout after the configured limit.
    pub(crate) async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RelayFailure::timed_out(operation))?
    }

    /// Push everything changed since `last_push_at` to every linked
    /// installation with a public key.
    ///
    /// The cursor moves to the package's `created_at` only when every
    /// submission was accepted.
    pub async fn push(&self) -> Result<PushOutcome> {
        let created_at = crate::now_ms() - 1;
        let (me, package, recipients) = self.with_db("push", |db| {
            let me = require_identity(db)?.installation_id;
            let since = SyncState::load(db, me)?.last_push_at;
            let package = build_package(db, me, since, created_at)?;
            let recipients = get_linked_installations(db)?
                .into_iter()
                .filter(|l| l.parsed_key().is_some())
                .collect::<Vec<_>>();
            Ok((me, package, recipients))
        })?;

        if package.is_empty() {
            debug!("Nothing to push since {}", package.since);
            return Ok(PushOutcome::NothingToPush);
        }
        if recipients.is_empty() {
            debug!("No linked installation to push to");
            return Ok(PushOutcome::NoRecipients);
        }

        let mut package_ids = Vec::with_capacity(recipients.len());
        let mut first_error = None;
        for recipient in &recipients {
            let sealed = seal_package(&package, std::slice::from_ref(recipient))?;
            match self.call("push", self.relay.push(&sealed)).await {
                Ok(resp) => package_ids.push(resp.package_id),
                Err(e) => {
                    warn!("Push to {} failed: {}", recipient.installation_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.with_db("push", |db| SyncState::advance_push(db, me, created_at))?;
        info!(
            "Pushed {} records to {} installations",
            package.record_count(),
            recipients.len()
        );
        Ok(PushOutcome::Pushed {
            created_at,
            recipients: recipients.len(),
            package_ids,
        })
    }

    /// Push the whole store to one installation, leaving the cursor alone.
    ///
    /// Returns the relay package id, or `None` when the store is empty.
    pub async fn push_full_to(&self, target: &LinkedInstallation) -> Result<Option<String>> {
        let created_at = crate::now_ms() - 1;
        let package = self.with_db("full push", |db| {
            let me = require_identity(db)?.installation_id;
            build_package(db, me, 0, created_at)
        })?;
        if package.is_empty() {
            return Ok(None);
        }

        let sealed = seal_package(&package, std::slice::from_ref(target))?;
        let resp = self.call("push", self.relay.push(&sealed)).await?;
        info!(
            "Full push of {} records to {}",
            package.record_count(),
            target.installation_id
        );
        Ok(Some(resp.package_id))
    }

    /// Pull, decrypt and merge every package since `last_sync_at`.
    ///
    /// A package that cannot be opened or merged is reported and left on the
    /// relay; the cursor stays below it so the next pull retries it.
    pub async fn pull(&self) -> Result<ImportResult> {
        let (me, secret, since) = self.with_db("pull", |db| {
            let installation = require_identity(db)?;
            let me = installation.installation_id;
            let since = SyncState::load(db, me)?.last_sync_at;
            Ok((me, installation.key_pair.secret().clone(), since))
        })?;

        let mut packages = self.call("pull", self.relay.pull(since)).await?;
        packages.sort_by_key(|p| p.created_at);

        let mut total = ImportResult::default();
        let mut acked = Vec::new();
        let mut merged_max = since;
        let mut failed_min: Option<i64> = None;

        for pulled in packages {
            if pulled.package.sender_id == me {
                acked.push(pulled.id);
                merged_max = merged_max.max(pulled.created_at);
                continue;
            }

            let merged = open_package(&pulled.package, me, &secret)
                .and_then(|package| self.with_db("merge", |db| import_package(db, &package)));
            match merged {
                Ok(result) => {
                    total.merge(result);
                    merged_max = merged_max.max(pulled.created_at);
                    acked.push(pulled.id);
                }
                Err(e) => {
                    warn!("Package {} from {} not applied: {}", pulled.id, pulled.package.sender_id, e);
                    failed_min = Some(failed_min.map_or(pulled.created_at, |m| m.min(pulled.created_at)));
                    total.errors.push(RecordError::package(&pulled.id, e.to_string()));
                }
            }
        }

        if !acked.is_empty() {
            self.call("ack", self.relay.ack(&acked)).await?;
        }

        let cursor = match failed_min {
            Some(failed) => merged_max.min(failed - 1),
            None => merged_max,
        };
        if cursor > since {
            self.with_db("pull", |db| SyncState::advance_sync(db, me, cursor))?;
        }

        if !acked.is_empty() {
            info!(
                "Pulled {} packages: {} imported, {} conflicts",
                acked.len(),
                total.total_imported(),
                total.conflicts
            );
        }
        Ok(total)
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.with_db("status", |db| {
            let config = SyncConfig::load(db)?;
            let installation = crate::sync::identity::Installation::load(db)?;
            let installation_id = installation.as_ref().map(|i| i.installation_id);
            let state = match installation_id {
                Some(id) => Some(SyncState::load(db, id)?),
                None => None,
            };
            let last_push_at = state.map(|s| s.last_push_at).unwrap_or(0);

            Ok(SyncStatus {
                enabled: config.sync_enabled,
                installation_id,
                relay_url: config.relay_url,
                last_sync_at: state.map(|s| s.last_sync_at).unwrap_or(0),
                last_push_at,
                linked_installations: get_linked_installations(db)?.len(),
                pending_changes: count_pending_changes(db, last_push_at)?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::sync::identity::save_linked_installation;
    use crate::sync::testing::{Device, Mailbox};
    use crate::SyncError;

    const ACCOUNT: &str = "INSERT INTO accounts (id, name, currency_id)
        VALUES ('00000000-0000-4000-8000-0000000000a1', 'Checking', 5)";

    fn engine(device: &Device) -> SyncEngine {
        SyncEngine::new(
            Arc::clone(&device.db),
            device.relay.clone(),
            Duration::from_secs(5),
        )
    }

    fn state(device: &Device) -> SyncState {
        SyncState::load(&*device.db.lock().unwrap(), device.id()).unwrap()
    }

    #[tokio::test]
    async fn push_without_recipients_stays_local() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        a.exec(ACCOUNT);

        let outcome = engine(&a).push().await.unwrap();

        assert_eq!(outcome, PushOutcome::NoRecipients);
        assert_eq!(a.relay.calls("push"), 0);
        assert_eq!(state(&a).last_push_at, 0);
    }

    #[tokio::test]
    async fn push_with_nothing_changed_makes_no_call() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        let b = Device::new(&mailbox);
        a.link(&b);

        assert_eq!(engine(&a).push().await.unwrap(), PushOutcome::NothingToPush);
        assert_eq!(a.relay.calls("push"), 0);
    }

    #[tokio::test]
    async fn push_then_pull_converges() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        let b = Device::new(&mailbox);
        a.link(&b);
        b.link(&a);
        a.exec(ACCOUNT);
        let stamp = a.count("SELECT updated_at FROM accounts");

        let outcome = engine(&a).push().await.unwrap();
        let PushOutcome::Pushed {
            created_at,
            recipients,
            package_ids,
        } = outcome
        else {
            panic!("expected a push, got {:?}", outcome);
        };
        assert_eq!(recipients, 1);
        assert_eq!(package_ids.len(), 1);
        assert_eq!(state(&a).last_push_at, created_at);

        let result = engine(&b).pull().await.unwrap();

        assert_eq!(result.total_imported(), 1);
        assert_eq!(result.new_account_currency_ids, vec![5]);
        assert_eq!(b.count("SELECT updated_at FROM accounts"), stamp);
        assert_eq!(mailbox.pending_packages(b.id()), 0);
        assert!(state(&b).last_sync_at > 0);
    }

    #[tokio::test]
    async fn failed_push_keeps_cursor() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        let b = Device::new(&mailbox);
        a.link(&b);
        a.exec(ACCOUNT);

        a.relay.fail("push");
        let err = engine(&a).push().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Sync push failed: 503 Service Unavailable");
        assert_eq!(state(&a).last_push_at, 0);

        a.relay.heal("push");
        assert!(matches!(
            engine(&a).push().await.unwrap(),
            PushOutcome::Pushed { .. }
        ));
        assert!(state(&a).last_push_at > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_pull_keeps_cursor() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        a.relay.set_delay(Some(Duration::from_secs(60)));

        let err = engine(&a).pull().await.unwrap_err();

        assert_eq!(err.to_string(), "Sync pull failed: timed out");
        assert_eq!(state(&a).last_sync_at, 0);
    }

    #[tokio::test]
    async fn undecryptable_package_is_left_for_retry() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        let b = Device::new(&mailbox);
        let c = Device::new(&mailbox);
        b.link(&a);
        // C holds a stale key for B
        save_linked_installation(
            &*c.db.lock().unwrap(),
            b.id(),
            &KeyPair::generate().public_key_b64(),
        )
        .unwrap();
        c.exec("INSERT INTO tags (id, name) VALUES ('00000000-0000-4000-8000-0000000000c1', 'x')");
        engine(&c).push().await.unwrap();

        a.link(&b);
        a.exec(ACCOUNT);
        engine(&a).push().await.unwrap();

        let result = engine(&b).pull().await.unwrap();

        assert_eq!(result.total_imported(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].package_id.is_some());
        assert_eq!(mailbox.pending_packages(b.id()), 1);

        let again = engine(&b).pull().await.unwrap();
        assert_eq!(again.errors.len(), 1);
        assert_eq!(again.total_imported(), 0);
    }

    #[tokio::test]
    async fn pull_without_identity_fails_before_network() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        a.exec("DELETE FROM installation");

        let err = engine(&a).pull().await.unwrap_err();

        assert!(matches!(err, SyncError::Identity(_)));
        assert_eq!(a.relay.calls("pull"), 0);
    }

    #[tokio::test]
    async fn full_push_ignores_cursor() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        let b = Device::new(&mailbox);
        a.link(&b);
        a.exec(ACCOUNT);
        engine(&a).push().await.unwrap();
        let cursor = state(&a).last_push_at;

        let linked = get_linked_installations(&*a.db.lock().unwrap()).unwrap();
        let id = engine(&a).push_full_to(&linked[0]).await.unwrap();

        assert!(id.is_some());
        assert_eq!(mailbox.pending_packages(b.id()), 2);
        assert_eq!(state(&a).last_push_at, cursor);
    }

    #[tokio::test]
    async fn status_reports_pending_and_links() {
        let mailbox = Mailbox::new();
        let a = Device::new(&mailbox);
        let b = Device::new(&mailbox);
        a.link(&b);
        a.exec(ACCOUNT);

        let status = engine(&a).status().unwrap();

        assert!(status.enabled);
        assert_eq!(status.installation_id, Some(a.id()));
        assert_eq!(status.linked_installations, 1);
        assert_eq!(status.pending_changes, 1);
        assert_eq!(status.last_push_at, 0);
    }
}
