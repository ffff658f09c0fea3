//! HTTP relay client.

use crate::sync::identity::Installation;
use crate::sync::models::{
    AckRequest, EncryptedPackage, InitDeleteRequest, InitPostRequest, InitRecord, PullResponse,
    PulledPackage, PushRequest, PushResponse,
};
use crate::sync::relay::Relay;
use crate::{RelayFailure, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Credentials issued by the relay's registration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub installation_id: Uuid,
    pub token: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    installation_id: Option<Uuid>,
}

/// HTTP client for the finsync relay, authenticated with a bearer token.
pub struct RelayClient {
    client: reqwest::Client,
    relay_url: String,
    installation_id: Uuid,
    auth_token: String,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(
        relay_url: &str,
        installation_id: Uuid,
        auth_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayFailure::new("connect", None, e.to_string()))?;

        Ok(Self {
            client,
            relay_url: relay_url.trim_end_matches('/').to_string(),
            installation_id,
            auth_token: auth_token.into(),
            timeout,
        })
    }

    pub fn for_installation(
        relay_url: &str,
        installation: &Installation,
        timeout: Duration,
    ) -> Result<Self> {
        Self::new(
            relay_url,
            installation.installation_id,
            installation.auth_token.clone(),
            timeout,
        )
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Register with the relay and obtain a bearer token.
    pub async fn register(
        relay_url: &str,
        installation_id: Option<Uuid>,
        timeout: Duration,
    ) -> Result<Registration> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayFailure::new("register", None, e.to_string()))?;
        let url = format!("{}/installations", relay_url.trim_end_matches('/'));
        let request = client.post(url).json(&RegisterRequest { installation_id });

        let resp = check("register", request.send().await).await?;
        decode("register", resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.relay_url, path)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let request = request
            .bearer_auth(&self.auth_token)
            .timeout(self.timeout);
        check(operation, request.send().await).await
    }
}

fn transport_error(operation: &'static str, err: reqwest::Error) -> RelayFailure {
    if err.is_timeout() {
        RelayFailure::timed_out(operation)
    } else {
        RelayFailure::new(operation, err.status().map(|s| s.as_u16()), err.to_string())
    }
}

fn status_error(operation: &'static str, status: reqwest::StatusCode) -> RelayFailure {
    RelayFailure::new(
        operation,
        Some(status.as_u16()),
        status.canonical_reason().unwrap_or("Unknown Status"),
    )
}

async fn check(
    operation: &'static str,
    sent: std::result::Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response> {
    let resp = sent.map_err(|e| transport_error(operation, e))?;
    let status = resp.status();
    if !status.is_success() {
        debug!("Relay {} returned {}", operation, status);
        return Err(status_error(operation, status).into());
    }
    Ok(resp)
}

async fn decode<T: DeserializeOwned>(operation: &'static str, resp: reqwest::Response) -> Result<T> {
    resp.json::<T>()
        .await
        .map_err(|e| RelayFailure::new(operation, None, format!("invalid response: {}", e)).into())
}

#[async_trait]
impl Relay for RelayClient {
    fn installation_id(&self) -> Uuid {
        self.installation_id
    }

    async fn push(&self, package: &EncryptedPackage) -> Result<PushResponse> {
        let body = PushRequest {
            package: package.clone(),
        };
        let request = self.client.post(self.url("/sync/push")).json(&body);
        let resp = self.send("push", request).await?;
        decode("push", resp).await
    }

    async fn pull(&self, since: i64) -> Result<Vec<PulledPackage>> {
        let request = self.client.get(self.url("/sync/pull")).query(&[
            ("installation_id", self.installation_id.to_string()),
            ("since", since.to_string()),
        ]);
        let resp = self.send("pull", request).await?;
        let body: PullResponse = decode("pull", resp).await?;
        Ok(body.packages)
    }

    async fn ack(&self, package_ids: &[String]) -> Result<()> {
        let body = AckRequest {
            package_ids: package_ids.to_vec(),
        };
        let request = self.client.post(self.url("/sync/ack")).json(&body);
        self.send("ack", request).await?;
        Ok(())
    }

    async fn post_init(&self, target: Uuid, encrypted_payload: &[u8]) -> Result<()> {
        let body = InitPostRequest {
            target_uuid: target,
            encrypted_payload: encrypted_payload.to_vec(),
        };
        let request = self.client.post(self.url("/sync/init")).json(&body);
        self.send("init post", request).await?;
        Ok(())
    }

    async fn get_inits(&self) -> Result<Vec<InitRecord>> {
        let request = self.client.get(self.url("/sync/init")).query(&[
            ("uuid", self.installation_id.to_string()),
            ("_t", crate::now_ms().to_string()),
        ]);
        let resp = self.send("init get", request).await?;
        decode("init get", resp).await
    }

    async fn delete_inits(&self, ids: &[String]) -> Result<()> {
        let body = InitDeleteRequest {
            uuid: self.installation_id,
            ids: ids.to_vec(),
        };
        let request = self.client.delete(self.url("/sync/init")).json(&body);
        self.send("init delete", request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn one_shot(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{}/", addr), handle)
    }

    fn client(url: &str) -> RelayClient {
        RelayClient::new(url, Uuid::nil(), "secret-token", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let c = client("https://relay.example///");
        assert_eq!(c.relay_url(), "https://relay.example");
        assert_eq!(c.url("/sync/push"), "https://relay.example/sync/push");
    }

    #[test]
    fn status_errors_use_canonical_reason() {
        let err = status_error("ack", reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.to_string(), "Sync ack failed: 503 Service Unavailable");
    }

    #[tokio::test]
    async fn non_success_maps_to_relay_failure() {
        let (url, server) = one_shot(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        let err = client(&url).pull(42).await.unwrap_err();
        let request = server.await.unwrap();

        assert!(matches!(err, SyncError::Relay(_)));
        assert_eq!(err.to_string(), "Sync pull failed: 500 Internal Server Error");
        assert!(request.starts_with("GET /sync/pull?installation_id="));
        assert!(request.contains("since=42"));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn init_poll_decodes_records_and_busts_cache() {
        let (url, server) = one_shot(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n[]",
        )
        .await;

        let records = client(&url).get_inits().await.unwrap();
        let request = server.await.unwrap();

        assert!(records.is_empty());
        assert!(request.contains("_t="));
        assert!(request.contains(&format!("uuid={}", Uuid::nil())));
    }
}
