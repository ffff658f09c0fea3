//! Installation registration.

use crate::error::RelayError;
use crate::storage::RelayStorage;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub installation_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub installation_id: Uuid,
    pub token: String,
}

pub async fn register(
    State(storage): State<RelayStorage>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, RelayError> {
    let (installation_id, token) =
        storage.register_installation(req.installation_id, Utc::now().timestamp_millis())?;
    tracing::info!("Registered installation {}", installation_id);

    Ok(Json(RegisterResponse {
        installation_id,
        token,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_returns_usable_token() {
        let storage = RelayStorage::in_memory().unwrap();
        let wanted = Uuid::new_v4();

        let Json(resp) = register(
            State(storage.clone()),
            Json(RegisterRequest {
                installation_id: Some(wanted),
            }),
        )
        .await
        .unwrap();

        assert_eq!(resp.installation_id, wanted);
        assert_eq!(storage.authenticate(&resp.token).unwrap(), Some(wanted));
    }

    #[tokio::test]
    async fn register_without_id_assigns_one() {
        let storage = RelayStorage::in_memory().unwrap();
        let Json(resp) = register(State(storage), Json(RegisterRequest::default()))
            .await
            .unwrap();
        assert!(!resp.installation_id.is_nil());
    }
}
