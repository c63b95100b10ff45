// HTTP client for a key manager running in another process

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{KeyError, KeyResult};
use crate::key_pool::{ConsumeToken, KeyAuthority, KeyId, KeyMaterial, KeyPurpose, PeerId, PoolStatus};
use crate::protocol::messages::{
    AckResponse, ConsumeResponse, ErrorResponse, KeyRequestBody, KeyResponse, ProvisionRequest,
    ProvisionResponse, RevokeResponse, StatusResponse,
};

/// [`KeyAuthority`] backed by the key manager's HTTP API.
///
/// Connection failures, timeouts and server faults come back as
/// `KeyError::Unavailable` so the tracker's retry policy can handle them.
pub struct RemoteKeyAuthority {
    client: Client,
    server_url: String,
}

impl RemoteKeyAuthority {
    pub fn new(server_url: impl Into<String>, timeout: Duration) -> KeyResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeyError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    /// Emergency wipe of a key on the server.
    pub async fn revoke(&self, key_id: KeyId) -> KeyResult<DateTime<Utc>> {
        let response = self
            .client
            .delete(self.url(&format!("/keys/{}", key_id)))
            .send()
            .await
            .map_err(transport_error)?;
        let body: RevokeResponse = handle_response(response, Some(key_id)).await?;
        Ok(body.zeroized_at)
    }

    pub async fn provision(&self, peer_id: &PeerId, purpose: KeyPurpose, amount: u64) -> KeyResult<u64> {
        let request = ProvisionRequest {
            peer_id: peer_id.clone(),
            purpose,
            amount,
        };
        let response = self
            .client
            .post(self.url("/keys/provision"))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let body: ProvisionResponse = handle_response(response, None).await?;
        Ok(body.available)
    }

    async fn post_ack(&self, key_id: KeyId, action: &str) -> KeyResult<AckResponse> {
        let response = self
            .client
            .post(self.url(&format!("/keys/{}/{}", key_id, action)))
            .send()
            .await
            .map_err(transport_error)?;
        handle_response(response, Some(key_id)).await
    }
}

#[async_trait]
impl KeyAuthority for RemoteKeyAuthority {
    async fn request(&self, peer_id: &PeerId, size: usize, purpose: KeyPurpose) -> KeyResult<KeyMaterial> {
        let body = KeyRequestBody {
            peer_id: peer_id.clone(),
            size,
            purpose,
        };
        let response = self
            .client
            .post(self.url("/keys"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let key: KeyResponse = handle_response(response, None).await?;
        key.into_material()
    }

    async fn retrieve(&self, key_id: KeyId) -> KeyResult<KeyMaterial> {
        let response = self
            .client
            .get(self.url(&format!("/keys/{}", key_id)))
            .send()
            .await
            .map_err(transport_error)?;
        let key: KeyResponse = handle_response(response, Some(key_id)).await?;
        key.into_material()
    }

    async fn consume(&self, key_id: KeyId, token: Option<ConsumeToken>) -> KeyResult<DateTime<Utc>> {
        let mut request = self.client.post(self.url(&format!("/keys/{}/consume", key_id)));
        if let Some(token) = token {
            request = request.query(&[("token", token.to_string())]);
        }
        let response = request.send().await.map_err(transport_error)?;
        let body: ConsumeResponse = handle_response(response, Some(key_id)).await?;
        Ok(body.consumed_at)
    }

    async fn release(&self, key_id: KeyId) -> KeyResult<()> {
        self.post_ack(key_id, "release").await.map(|_| ())
    }

    async fn retain(&self, key_id: KeyId) -> KeyResult<()> {
        self.post_ack(key_id, "retain").await.map(|_| ())
    }

    async fn status(&self, peer_id: Option<&PeerId>) -> KeyResult<PoolStatus> {
        let mut request = self.client.get(self.url("/keys/status"));
        if let Some(peer) = peer_id {
            request = request.query(&[("peer_id", peer.as_str())]);
        }
        let response = request.send().await.map_err(transport_error)?;
        let status: StatusResponse = handle_response(response, None).await?;
        Ok(status)
    }
}

fn transport_error(err: reqwest::Error) -> KeyError {
    KeyError::Unavailable(err.to_string())
}

/// Translate an HTTP response into the pool's error taxonomy.
async fn handle_response<T: DeserializeOwned>(response: Response, key_id: Option<KeyId>) -> KeyResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| KeyError::Unavailable(format!("invalid response body: {}", e)));
    }

    let body: Option<ErrorResponse> = response.json().await.ok();
    let exhausted = body.as_ref().is_some_and(|b| b.code == "EXHAUSTED");

    // anything 5xx that is not an exhaustion verdict is a service fault
    if status.is_server_error() && !exhausted {
        let detail = body.map(|b| b.error).unwrap_or_default();
        return Err(KeyError::Unavailable(format!("{} {}", status, detail).trim_end().to_string()));
    }

    if let Some(err) = body.and_then(ErrorResponse::into_key_error) {
        return Err(err);
    }

    Err(match (status, key_id) {
        (StatusCode::NOT_FOUND, Some(id)) => KeyError::NotFound(id),
        (StatusCode::GONE, Some(id)) => KeyError::Gone(id),
        (StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY, _) => {
            KeyError::InvalidRequest(status.to_string())
        }
        _ => KeyError::Internal(format!("unexpected status {}", status)),
    })
}
