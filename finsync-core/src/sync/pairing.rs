//! Pairing and introduction protocol.
//!
//! An init package is `{sender_uuid, public_key}` sealed to the recipient's
//! public key. Pairing sends one to a known peer; every installation that
//! learns of a new peer gossips introductions both ways with the peers it
//! already knows, so keys spread through the whole mesh without a directory.

use crate::crypto::keys::parse_public_key;
use crate::crypto::{decrypt_asymmetric, encrypt_asymmetric};
use crate::sync::config::SyncConfig;
use crate::sync::engine::SyncEngine;
use crate::sync::identity::{
    get_linked_installations, require_identity, save_linked_installation, LinkedInstallation,
};
use crate::sync::models::{InitPayload, InitRecord};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use x25519_dalek::StaticSecret;

/// Lifecycle of one init package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// Posted to the relay by the sender.
    Sent,
    /// Stored on the relay; not observable by the sender.
    Delivered,
    /// Fetched, applied and deleted by the recipient.
    Consumed,
}

/// Outcome of one init poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingReport {
    /// Installations newly linked, or whose key changed.
    pub linked: Vec<Uuid>,
    /// Init ids that could not be opened or saved; left on the relay.
    pub failed: Vec<String>,
    pub introductions_sent: usize,
    pub acknowledged: usize,
}

fn seal_init(payload: &InitPayload, recipient_key: &str) -> Result<Vec<u8>> {
    let key = parse_public_key(recipient_key)?;
    let plaintext = serde_json::to_vec(payload)?;
    Ok(encrypt_asymmetric(&plaintext, &key)?)
}

/// Send our own identity to `target`.
///
/// Fails with [`SyncError::Identity`] before any network call when this
/// device has no installation or key pair.
pub async fn send_init(
    engine: &SyncEngine,
    target: Uuid,
    target_public_key: &str,
) -> Result<PairingState> {
    let installation = engine.with_db("send init", |db| require_identity(db))?;
    let payload = InitPayload {
        sender_uuid: installation.installation_id,
        public_key: installation.key_pair.public_key_b64(),
    };
    let sealed = seal_init(&payload, target_public_key)?;

    engine
        .call("init post", engine.relay().post_init(target, &sealed))
        .await?;
    debug!("Sent init to {}", target);
    Ok(PairingState::Sent)
}

/// Tell `recipient` about `subject`.
pub async fn introduce(
    engine: &SyncEngine,
    recipient: &LinkedInstallation,
    subject: &LinkedInstallation,
) -> Result<()> {
    let (Some(recipient_key), Some(subject_key)) = (&recipient.public_key, &subject.public_key)
    else {
        return Err(SyncError::InvalidInput(
            "introduction needs both public keys".to_string(),
        ));
    };
    let payload = InitPayload {
        sender_uuid: subject.installation_id,
        public_key: subject_key.clone(),
    };
    let sealed = seal_init(&payload, recipient_key)?;

    engine
        .call(
            "init post",
            engine.relay().post_init(recipient.installation_id, &sealed),
        )
        .await?;
    debug!(
        "Introduced {} to {}",
        subject.installation_id, recipient.installation_id
    );
    Ok(())
}

/// Initiator side: link `target`, send it our identity, offer it our data.
pub async fn pair_with(
    engine: &SyncEngine,
    target: Uuid,
    target_public_key: &str,
) -> Result<PairingState> {
    engine.with_db("pair", |db| {
        let me = require_identity(db)?.installation_id;
        if me == target {
            return Err(SyncError::InvalidInput(
                "cannot pair an installation with itself".to_string(),
            ));
        }
        save_linked_installation(db, target, target_public_key)?;
        Ok(())
    })?;

    let state = send_init(engine, target, target_public_key).await?;

    let peer = LinkedInstallation {
        installation_id: target,
        public_key: Some(target_public_key.to_string()),
    };
    if let Err(e) = engine.push_full_to(&peer).await {
        warn!("Initial full push to {} failed: {}", target, e);
    }

    engine.with_db("pair", |db| SyncConfig::set_initial_sync_pending(db, true))?;
    info!("Paired with {}", target);
    Ok(state)
}

fn open_init(record: &InitRecord, secret: &StaticSecret) -> Result<InitPayload> {
    let plaintext = decrypt_asymmetric(&record.encrypted_payload, secret)?;
    let payload: InitPayload = serde_json::from_slice(&plaintext)?;
    parse_public_key(&payload.public_key)?;
    Ok(payload)
}

/// Recipient side: consume every init package waiting for us.
///
/// Each newly linked peer gets a full push and is introduced to, and told
/// about, every other linked peer. Push and gossip failures are logged and
/// never block acknowledgement; decrypt or save failures leave the init on
/// the relay.
pub async fn poll_inits(engine: &SyncEngine) -> Result<PairingReport> {
    let installation = engine.with_db("poll inits", |db| require_identity(db))?;
    let me = installation.installation_id;

    let records = engine
        .call("init get", engine.relay().get_inits())
        .await?;

    let mut report = PairingReport::default();
    let mut consumed = Vec::new();

    for record in records {
        let payload = match open_init(&record, installation.key_pair.secret()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Init {} from {} could not be opened: {}", record.id, record.sender_uuid, e);
                report.failed.push(record.id);
                continue;
            }
        };

        if payload.sender_uuid == me {
            debug!("Ignoring introduction to ourselves");
            consumed.push(record.id);
            continue;
        }

        let changed = match engine.with_db("poll inits", |db| {
            save_linked_installation(db, payload.sender_uuid, &payload.public_key)
        }) {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Could not link {}: {}", payload.sender_uuid, e);
                report.failed.push(record.id);
                continue;
            }
        };
        consumed.push(record.id);

        if !changed {
            debug!("{} already linked", payload.sender_uuid);
            continue;
        }
        info!("Linked installation {}", payload.sender_uuid);
        report.linked.push(payload.sender_uuid);

        let peer = LinkedInstallation {
            installation_id: payload.sender_uuid,
            public_key: Some(payload.public_key),
        };
        if let Err(e) = engine.push_full_to(&peer).await {
            warn!("Full push to {} failed: {}", peer.installation_id, e);
        }

        report.introductions_sent += gossip(engine, me, &peer).await;
    }

    if !consumed.is_empty() {
        engine
            .call("init delete", engine.relay().delete_inits(&consumed))
            .await?;
        report.acknowledged = consumed.len();
    }
    Ok(report)
}

/// Introduce `peer` and every other keyed peer to each other.
/// Returns the number of introductions the relay accepted.
async fn gossip(engine: &SyncEngine, me: Uuid, peer: &LinkedInstallation) -> usize {
    let others = match engine.with_db("gossip", |db| get_linked_installations(db)) {
        Ok(linked) => linked
            .into_iter()
            .filter(|l| {
                l.installation_id != me
                    && l.installation_id != peer.installation_id
                    && l.parsed_key().is_some()
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            warn!("Cannot list linked installations for gossip: {}", e);
            return 0;
        }
    };

    let mut sent = 0;
    for other in &others {
        for (recipient, subject) in [(other, peer), (peer, other)] {
            match introduce(engine, recipient, subject).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(
                    "Introducing {} to {} failed: {}",
                    subject.installation_id, recipient.installation_id, e
                ),
            }
        }
    }
    sent
}
