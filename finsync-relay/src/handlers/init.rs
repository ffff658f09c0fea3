//! Init (pairing and introduction) package handlers.

use super::require_b64url;
use crate::auth::caller;
use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::RelayStorage;
use axum::extract::{Query, State};
use axum::http::Extensions;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct InitPostRequest {
    pub target_uuid: Uuid,
    pub encrypted_payload: String, // base64url
}

#[derive(Debug, Serialize)]
pub struct InitPostResponse {
    pub success: bool,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct InitQuery {
    pub uuid: Uuid,
}

#[derive(Debug, Serialize)]
pub struct InitRecord {
    pub id: String,
    pub sender_uuid: Uuid,
    pub encrypted_payload: String,
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct InitDeleteRequest {
    pub uuid: Uuid,
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct InitDeleteResponse {
    pub success: bool,
    pub deleted: usize,
}

fn require_own_mailbox(requested: Uuid, installation_id: Uuid) -> Result<(), RelayError> {
    if requested != installation_id {
        return Err(RelayError::Forbidden(
            "Cannot access another installation's init packages".to_string(),
        ));
    }
    Ok(())
}

pub async fn post_init(
    State(state): State<AppState>,
    extensions: Extensions,
    Json(req): Json<InitPostRequest>,
) -> Result<Json<InitPostResponse>, RelayError> {
    let sender = caller(&extensions)?;
    require_b64url("encrypted payload", &req.encrypted_payload)?;

    if state.storage.pending_init_count(req.target_uuid)? >= state.max_pending_inits {
        return Err(RelayError::Conflict(
            "Too many pending init packages".to_string(),
        ));
    }

    let id = state.storage.insert_init(
        req.target_uuid,
        sender,
        &req.encrypted_payload,
        Utc::now().timestamp_millis(),
    )?;
    tracing::debug!("Stored init {} from {} for {}", id, sender, req.target_uuid);

    Ok(Json(InitPostResponse { success: true, id }))
}

/// Unknown query parameters such as the `_t` cache buster are ignored.
pub async fn get_inits(
    State(storage): State<RelayStorage>,
    extensions: Extensions,
    Query(query): Query<InitQuery>,
) -> Result<Json<Vec<InitRecord>>, RelayError> {
    require_own_mailbox(query.uuid, caller(&extensions)?)?;

    let records = storage
        .inits_for(query.uuid)?
        .into_iter()
        .map(|init| InitRecord {
            id: init.id,
            sender_uuid: init.sender_uuid,
            encrypted_payload: init.encrypted_payload,
            created_at: init.created_at,
        })
        .collect();
    Ok(Json(records))
}

pub async fn delete_inits(
    State(storage): State<RelayStorage>,
    extensions: Extensions,
    Json(req): Json<InitDeleteRequest>,
) -> Result<Json<InitDeleteResponse>, RelayError> {
    require_own_mailbox(req.uuid, caller(&extensions)?)?;
    let deleted = storage.delete_inits(req.uuid, &req.ids)?;

    Ok(Json(InitDeleteResponse {
        success: true,
        deleted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Caller;
    use crate::rate_limit::RateLimiter;

    fn as_caller(id: Uuid) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(Caller(id));
        extensions
    }

    fn state(max_pending_inits: usize) -> AppState {
        AppState {
            storage: RelayStorage::in_memory().unwrap(),
            limiter: RateLimiter::new(60),
            max_pending_inits,
        }
    }

    async fn post(state: &AppState, sender: Uuid, target: Uuid) -> Result<String, RelayError> {
        let Json(resp) = post_init(
            State(state.clone()),
            as_caller(sender),
            Json(InitPostRequest {
                target_uuid: target,
                encrypted_payload: "c2VhbGVkLWluaXQ".to_string(),
            }),
        )
        .await?;
        Ok(resp.id)
    }

    #[tokio::test]
    async fn init_roundtrip_records_authenticated_sender() {
        let state = state(10);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let id = post(&state, a, b).await.unwrap();

        let Json(records) = get_inits(
            State(state.storage.clone()),
            as_caller(b),
            Query(InitQuery { uuid: b }),
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sender_uuid, a);
        assert_eq!(records[0].encrypted_payload, "c2VhbGVkLWluaXQ");

        let Json(deleted) = delete_inits(
            State(state.storage.clone()),
            as_caller(b),
            Json(InitDeleteRequest {
                uuid: b,
                ids: vec![id],
            }),
        )
        .await
        .unwrap();
        assert_eq!(deleted.deleted, 1);
        assert_eq!(state.storage.pending_init_count(b).unwrap(), 0);
    }

    #[tokio::test]
    async fn other_mailboxes_are_forbidden() {
        let state = state(10);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let id = post(&state, a, b).await.unwrap();

        let read = get_inits(
            State(state.storage.clone()),
            as_caller(a),
            Query(InitQuery { uuid: b }),
        )
        .await;
        assert!(matches!(read, Err(RelayError::Forbidden(_))));

        let delete = delete_inits(
            State(state.storage.clone()),
            as_caller(a),
            Json(InitDeleteRequest {
                uuid: b,
                ids: vec![id],
            }),
        )
        .await;
        assert!(matches!(delete, Err(RelayError::Forbidden(_))));
        assert_eq!(state.storage.pending_init_count(b).unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_inits_are_capped_per_target() {
        let state = state(2);
        let target = Uuid::new_v4();
        post(&state, Uuid::new_v4(), target).await.unwrap();
        post(&state, Uuid::new_v4(), target).await.unwrap();

        let err = post(&state, Uuid::new_v4(), target).await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
        post(&state, Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
    }
}
