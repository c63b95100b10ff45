use thiserror::Error;

use crate::key_pool::{KeyId, KeyPurpose, KeyState, PeerId};

/// Errors at the key pool boundary (KPA and the lifecycle tracker that fronts it).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key pool exhausted for {peer_id} ({purpose}): requested {requested}, available {available}")]
    Exhausted {
        peer_id: PeerId,
        purpose: KeyPurpose,
        requested: u64,
        available: u64,
    },
    #[error("Key not found: {0}")]
    NotFound(KeyId),
    #[error("Key material is gone: {0}")]
    Gone(KeyId),
    #[error("Key already consumed: {0}")]
    AlreadyConsumed(KeyId),
    #[error("Key {key_id} is in state {state}")]
    InvalidState { key_id: KeyId, state: KeyState },
    #[error("Invalid key request: {0}")]
    InvalidRequest(String),
    #[error("Key manager unavailable: {0}")]
    Unavailable(String),
    #[error("Key manager internal error: {0}")]
    Internal(String),
}

impl KeyError {
    /// Only transport-level faults are worth retrying; everything else is a verdict.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeyError::Unavailable(_))
    }

    /// Stable machine-readable code, shared by the HTTP layer and the remote client.
    pub fn code(&self) -> &'static str {
        match self {
            KeyError::Exhausted { .. } => "EXHAUSTED",
            KeyError::NotFound(_) => "NOT_FOUND",
            KeyError::Gone(_) => "GONE",
            KeyError::AlreadyConsumed(_) => "ALREADY_CONSUMED",
            KeyError::InvalidState { .. } => "INVALID_STATE",
            KeyError::InvalidRequest(_) => "INVALID_REQUEST",
            KeyError::Unavailable(_) => "UNAVAILABLE",
            KeyError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Errors surfaced by the encryption engine and the messenger facade.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Integrity check failed")]
    IntegrityFailure,
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("Key {0} is no longer available for decryption")]
    KeyUnavailableForDecrypt(KeyId),
    #[error("No encapsulation key known for recipient {0}")]
    MissingRecipientKey(PeerId),
    #[error("Decryption key material was not supplied")]
    MissingDecryptionKey,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<rmp_serde::encode::Error> for CryptoError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CryptoError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CryptoError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CryptoError::MalformedEnvelope(err.to_string())
    }
}

impl From<hkdf::InvalidLength> for CryptoError {
    fn from(err: hkdf::InvalidLength) -> Self {
        CryptoError::KeyDerivation(err.to_string())
    }
}

pub type KeyResult<T> = std::result::Result<T, KeyError>;
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
