//! Package push/pull/ack handlers.

use super::require_b64url;
use crate::auth::caller;
use crate::error::RelayError;
use crate::storage::models::PackageEnvelope;
use crate::storage::RelayStorage;
use axum::extract::{Query, State};
use axum::http::Extensions;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub package: PackageEnvelope,
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub success: bool,
    pub package_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    pub installation_id: Uuid,
    #[serde(default)]
    pub since: i64,
}

/// One package as the recipient sees it: only its own wrapped key.
#[derive(Debug, Serialize)]
pub struct PulledPackage {
    pub id: String,
    pub created_at: i64,
    pub sender_id: Uuid,
    pub iv: String,
    pub ciphertext: String,
    pub recipient_keys: BTreeMap<Uuid, String>,
}

#[derive(Debug, Serialize)]
pub struct PullResponse {
    pub packages: Vec<PulledPackage>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub package_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
    pub acknowledged: usize,
}

pub async fn push(
    State(storage): State<RelayStorage>,
    extensions: Extensions,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, RelayError> {
    let installation_id = caller(&extensions)?;
    let package = req.package;

    if package.sender_id != installation_id {
        return Err(RelayError::Forbidden(
            "Sender does not match the authenticated installation".to_string(),
        ));
    }
    if package.recipient_keys.is_empty() {
        return Err(RelayError::BadRequest("Package has no recipients".to_string()));
    }
    require_b64url("iv", &package.iv)?;
    require_b64url("ciphertext", &package.ciphertext)?;
    for key in package.recipient_keys.values() {
        require_b64url("recipient key", key)?;
    }

    let (package_id, _) = storage.insert_package(&package, Utc::now().timestamp_millis())?;
    tracing::debug!(
        "Stored package {} from {} for {} recipients",
        package_id,
        installation_id,
        package.recipient_keys.len()
    );

    Ok(Json(PushResponse {
        success: true,
        package_id,
    }))
}

pub async fn pull(
    State(storage): State<RelayStorage>,
    extensions: Extensions,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, RelayError> {
    let installation_id = caller(&extensions)?;
    if query.installation_id != installation_id {
        return Err(RelayError::Forbidden(
            "Cannot read another installation's packages".to_string(),
        ));
    }

    let packages = storage
        .packages_for(installation_id, query.since)?
        .into_iter()
        .map(|p| PulledPackage {
            id: p.package_id,
            created_at: p.created_at,
            sender_id: p.sender_id,
            iv: p.iv,
            ciphertext: p.ciphertext,
            recipient_keys: BTreeMap::from([(p.recipient_id, p.wrapped_key)]),
        })
        .collect();

    Ok(Json(PullResponse { packages }))
}

pub async fn ack(
    State(storage): State<RelayStorage>,
    extensions: Extensions,
    Json(req): Json<AckRequest>,
) -> Result<Json<AckResponse>, RelayError> {
    let installation_id = caller(&extensions)?;
    let acknowledged = storage.ack_packages(installation_id, &req.package_ids)?;

    Ok(Json(AckResponse {
        success: true,
        acknowledged,
    }))
}
