// Типы сообщений протокола
// Тела запросов и ответов HTTP API менеджера ключей (JSON, snake_case)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{KeyError, KeyResult};
use crate::key_pool::{ConsumeToken, KeyId, KeyMaterial, KeyPurpose, KeyState, PeerId, PoolStats, PoolStatus};
use crate::utils::b64;

/// `POST /keys`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequestBody {
    pub peer_id: PeerId,
    pub size: usize,
    pub purpose: KeyPurpose,
}

/// Выданный или полученный ключ; `key_material` в base64.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyResponse {
    pub key_id: KeyId,
    pub key_material: String,
    pub peer_id: PeerId,
    pub purpose: KeyPurpose,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for KeyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResponse")
            .field("key_id", &self.key_id)
            .field("peer_id", &self.peer_id)
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl From<&KeyMaterial> for KeyResponse {
    fn from(material: &KeyMaterial) -> Self {
        Self {
            key_id: material.key_id,
            key_material: b64::encode(material.expose()),
            peer_id: material.owner_peer.clone(),
            purpose: material.purpose,
            created_at: material.created_at,
            expires_at: material.expires_at,
        }
    }
}

impl KeyResponse {
    /// Декодировать в материал, затерев копию в base64.
    pub fn into_material(mut self) -> KeyResult<KeyMaterial> {
        let decoded = b64::decode(&self.key_material);
        self.key_material.zeroize();
        let bytes = decoded.map_err(KeyError::Internal)?;
        Ok(KeyMaterial::new(
            self.key_id,
            self.peer_id.clone(),
            self.purpose,
            self.created_at,
            self.expires_at,
            bytes,
        ))
    }
}

impl Drop for KeyResponse {
    fn drop(&mut self) {
        self.key_material.zeroize();
    }
}

/// `POST /keys/{key_id}/consume?token=`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumeQuery {
    pub token: Option<ConsumeToken>,
}

/// `POST /keys/{key_id}/consume`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeResponse {
    pub key_id: KeyId,
    pub consumed_at: DateTime<Utc>,
}

/// `POST /keys/{key_id}/release` and `/retain`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub key_id: KeyId,
    pub state: KeyState,
}

/// `DELETE /keys/{key_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub key_id: KeyId,
    pub zeroized_at: DateTime<Utc>,
}

/// `GET /keys/status?peer_id=`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusQuery {
    pub peer_id: Option<PeerId>,
}

pub type StatusResponse = PoolStatus;

/// `POST /keys/provision`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub peer_id: PeerId,
    pub purpose: KeyPurpose,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub peer_id: PeerId,
    pub purpose: KeyPurpose,
    pub available: u64,
}

/// `GET /health` and `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<PoolStats>,
}

/// Тело ошибки для любого ответа не из 2xx.
///
/// Необязательных полей хватает, чтобы удалённый клиент восстановил
/// ту же `KeyError`, что вернул пул.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<KeyState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<KeyPurpose>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<u64>,
}

impl From<&KeyError> for ErrorResponse {
    fn from(err: &KeyError) -> Self {
        let mut body = ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
            key_id: None,
            state: None,
            peer_id: None,
            purpose: None,
            requested: None,
            available: None,
        };
        match err {
            KeyError::Exhausted {
                peer_id,
                purpose,
                requested,
                available,
            } => {
                body.peer_id = Some(peer_id.clone());
                body.purpose = Some(*purpose);
                body.requested = Some(*requested);
                body.available = Some(*available);
            }
            KeyError::NotFound(id) | KeyError::Gone(id) | KeyError::AlreadyConsumed(id) => {
                body.key_id = Some(*id);
            }
            KeyError::InvalidState { key_id, state } => {
                body.key_id = Some(*key_id);
                body.state = Some(*state);
            }
            KeyError::InvalidRequest(_) | KeyError::Unavailable(_) | KeyError::Internal(_) => {}
        }
        body
    }
}

impl ErrorResponse {
    /// Восстановить ошибку пула. `None`, если для кода не хватает полей.
    pub fn into_key_error(self) -> Option<KeyError> {
        let err = match self.code.as_str() {
            "EXHAUSTED" => KeyError::Exhausted {
                peer_id: self.peer_id?,
                purpose: self.purpose?,
                requested: self.requested?,
                available: self.available?,
            },
            "NOT_FOUND" => KeyError::NotFound(self.key_id?),
            "GONE" => KeyError::Gone(self.key_id?),
            "ALREADY_CONSUMED" => KeyError::AlreadyConsumed(self.key_id?),
            "INVALID_STATE" => KeyError::InvalidState {
                key_id: self.key_id?,
                state: self.state?,
            },
            "INVALID_REQUEST" => KeyError::InvalidRequest(self.error),
            "UNAVAILABLE" => KeyError::Unavailable(self.error),
            "INTERNAL_ERROR" => KeyError::Internal(self.error),
            _ => return None,
        };
        Some(err)
    }
}
