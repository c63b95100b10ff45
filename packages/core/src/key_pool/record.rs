//! Key material and the authoritative per-key record.
//!
//! `KeyRecord` owns the only server-side copy of the bytes. Every state change
//! goes through one of the transition methods below, which are the single place
//! the lifecycle rules are encoded:
//!
//! ```text
//!   Provisioned --reserve--> Reserved --retain--> Retained
//!        ^                      |  \                  |
//!        +------release---------+   \--consume--+     |--consume--> Consumed
//!                                                \----+
//!   any non-terminal --revoke/expire--> Zeroized
//! ```
//!
//! `Consumed` and `Zeroized` are terminal and hold no bytes. A consume carrying
//! a token can be replayed with the same token and gets the original verdict.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{KeyError, KeyResult};
use crate::utils::time::expiry_after;

pub type KeyId = Uuid;

/// Caller-chosen id that makes a retried consume replay-safe.
pub type ConsumeToken = Uuid;

/// Opaque identifier of the remote party a key is shared with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    /// One-time pad bytes, exactly as long as the message, used once.
    OtpSeed,
    /// 32-byte seed fed into HKDF for AES-256-GCM; retained for later decryption.
    AesSeed,
}

impl KeyPurpose {
    /// One-time keys are consumed on first read instead of retained.
    pub fn is_one_time(self) -> bool {
        matches!(self, KeyPurpose::OtpSeed)
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyPurpose::OtpSeed => "otp_seed",
            KeyPurpose::AesSeed => "aes_seed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Provisioned,
    Reserved,
    Retained,
    Consumed,
    Zeroized,
}

impl KeyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, KeyState::Consumed | KeyState::Zeroized)
    }

    /// Counted against a peer's live keys (issued and not yet settled back).
    pub fn is_live(self) -> bool {
        matches!(self, KeyState::Reserved | KeyState::Retained)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyState::Provisioned => "provisioned",
            KeyState::Reserved => "reserved",
            KeyState::Retained => "retained",
            KeyState::Consumed => "consumed",
            KeyState::Zeroized => "zeroized",
        })
    }
}

/// Issued key bytes plus their metadata. The bytes are wiped on drop.
#[derive(Clone)]
pub struct KeyMaterial {
    pub key_id: KeyId,
    pub owner_peer: PeerId,
    pub purpose: KeyPurpose,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    bytes: Zeroizing<Vec<u8>>,
}

impl KeyMaterial {
    pub fn new(
        key_id: KeyId,
        owner_peer: PeerId,
        purpose: KeyPurpose,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            key_id,
            owner_peer,
            purpose,
            created_at,
            expires_at,
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn byte_length(&self) -> usize {
        self.bytes.len()
    }

    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Overwrite the bytes in place. The material is useless afterwards.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("owner_peer", &self.owner_peer)
            .field("purpose", &self.purpose)
            .field("byte_length", &self.bytes.len())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// KPA-side authoritative record.
pub struct KeyRecord {
    pub key_id: KeyId,
    pub peer_id: PeerId,
    pub purpose: KeyPurpose,
    pub size: usize,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
    consume_token: Option<ConsumeToken>,
    material: Option<Zeroizing<Vec<u8>>>,
}

impl KeyRecord {
    pub fn provisioned(
        peer_id: PeerId,
        purpose: KeyPurpose,
        bytes: Vec<u8>,
        now: DateTime<Utc>,
        key_ttl: Duration,
    ) -> Self {
        Self {
            key_id: Uuid::new_v4(),
            peer_id,
            purpose,
            size: bytes.len(),
            state: KeyState::Provisioned,
            created_at: now,
            expires_at: expiry_after(now, key_ttl),
            reserved_at: None,
            reserved_until: None,
            consumed_at: None,
            consume_token: None,
            material: Some(Zeroizing::new(bytes)),
        }
    }

    fn invalid(&self) -> KeyError {
        KeyError::InvalidState {
            key_id: self.key_id,
            state: self.state,
        }
    }

    pub fn reserve(&mut self, now: DateTime<Utc>, ttl: Duration) -> KeyResult<()> {
        match self.state {
            KeyState::Provisioned => {
                self.state = KeyState::Reserved;
                self.reserved_at = Some(now);
                self.reserved_until = Some(expiry_after(now, ttl));
                Ok(())
            }
            _ => Err(self.invalid()),
        }
    }

    /// Returns `true` when the record actually moved back to `Provisioned`.
    pub fn release(&mut self) -> KeyResult<bool> {
        match self.state {
            KeyState::Reserved => {
                self.state = KeyState::Provisioned;
                self.reserved_at = None;
                self.reserved_until = None;
                Ok(true)
            }
            KeyState::Provisioned => Ok(false),
            KeyState::Consumed | KeyState::Zeroized => Err(KeyError::Gone(self.key_id)),
            KeyState::Retained => Err(self.invalid()),
        }
    }

    pub fn retain(&mut self) -> KeyResult<()> {
        match self.state {
            KeyState::Reserved => {
                self.state = KeyState::Retained;
                self.reserved_until = None;
                Ok(())
            }
            KeyState::Retained => Ok(()),
            KeyState::Consumed | KeyState::Zeroized => {
                Err(KeyError::AlreadyConsumed(self.key_id))
            }
            // the reservation lapsed and the bytes may already be re-issued
            KeyState::Provisioned => Err(self.invalid()),
        }
    }

    /// Returns the state the key was consumed from, or `None` when this is a
    /// replay of the consume that already succeeded with the same token.
    pub fn consume(&mut self, now: DateTime<Utc>, token: Option<ConsumeToken>) -> KeyResult<Option<KeyState>> {
        match self.state {
            KeyState::Reserved | KeyState::Retained => {
                let previous = self.state;
                self.state = KeyState::Consumed;
                self.consumed_at = Some(now);
                self.consume_token = token;
                self.reserved_until = None;
                // Zeroizing wipes on drop
                self.material = None;
                Ok(Some(previous))
            }
            KeyState::Consumed if token.is_some() && self.consume_token == token => Ok(None),
            KeyState::Consumed | KeyState::Zeroized => {
                Err(KeyError::AlreadyConsumed(self.key_id))
            }
            KeyState::Provisioned => Err(self.invalid()),
        }
    }

    /// Destroy the bytes regardless of state. Returns the previous state.
    pub fn zeroize(&mut self) -> KeyState {
        let previous = self.state;
        if !previous.is_terminal() {
            self.state = KeyState::Zeroized;
        }
        self.reserved_until = None;
        self.material = None;
        previous
    }

    pub fn material(&self) -> KeyResult<KeyMaterial> {
        match (self.state, &self.material) {
            (KeyState::Reserved | KeyState::Retained, Some(bytes)) => Ok(KeyMaterial::new(
                self.key_id,
                self.peer_id.clone(),
                self.purpose,
                self.created_at,
                self.expires_at,
                bytes.to_vec(),
            )),
            (KeyState::Consumed | KeyState::Zeroized, _) => Err(KeyError::Gone(self.key_id)),
            _ => Err(self.invalid()),
        }
    }

    pub fn reservation_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == KeyState::Reserved && self.reserved_until.is_some_and(|until| until <= now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(purpose: KeyPurpose) -> KeyRecord {
        KeyRecord::provisioned(
            PeerId::new("bob@example.com"),
            purpose,
            vec![7u8; 32],
            Utc::now(),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_consume_is_terminal() {
        let mut rec = record(KeyPurpose::OtpSeed);
        rec.reserve(Utc::now(), Duration::from_secs(60)).unwrap();
        assert_eq!(rec.consume(Utc::now(), None).unwrap(), Some(KeyState::Reserved));

        assert_eq!(rec.consume(Utc::now(), None), Err(KeyError::AlreadyConsumed(rec.key_id)));
        assert_eq!(rec.release(), Err(KeyError::Gone(rec.key_id)));
        assert!(matches!(rec.material(), Err(KeyError::Gone(_))));
        assert!(rec.reserve(Utc::now(), Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_consume_replay_needs_the_same_token() {
        let mut rec = record(KeyPurpose::OtpSeed);
        rec.reserve(Utc::now(), Duration::from_secs(60)).unwrap();
        rec.retain().unwrap();
        let token = Uuid::new_v4();
        let at = Utc::now();

        assert_eq!(rec.consume(at, Some(token)).unwrap(), Some(KeyState::Retained));
        assert_eq!(rec.consume(Utc::now(), Some(token)).unwrap(), None);
        assert_eq!(rec.consumed_at, Some(at));

        assert_eq!(rec.consume(Utc::now(), Some(Uuid::new_v4())), Err(KeyError::AlreadyConsumed(rec.key_id)));
        assert_eq!(rec.consume(Utc::now(), None), Err(KeyError::AlreadyConsumed(rec.key_id)));
    }

    #[test]
    fn test_release_returns_to_provisioned_and_is_idempotent() {
        let mut rec = record(KeyPurpose::AesSeed);
        rec.reserve(Utc::now(), Duration::from_secs(60)).unwrap();
        assert_eq!(rec.release(), Ok(true));
        assert_eq!(rec.state, KeyState::Provisioned);
        assert_eq!(rec.release(), Ok(false));
        // material can be reserved again
        rec.reserve(Utc::now(), Duration::from_secs(60)).unwrap();
        assert_eq!(rec.material().unwrap().expose(), &[7u8; 32]);
    }

    #[test]
    fn test_retain_requires_live_reservation() {
        let mut rec = record(KeyPurpose::AesSeed);
        assert!(matches!(rec.retain(), Err(KeyError::InvalidState { .. })));
        rec.reserve(Utc::now(), Duration::from_secs(60)).unwrap();
        rec.retain().unwrap();
        rec.retain().unwrap();
        assert!(matches!(rec.release(), Err(KeyError::InvalidState { .. })));
        assert!(rec.material().is_ok());
    }

    #[test]
    fn test_zeroize_from_any_state() {
        let mut rec = record(KeyPurpose::AesSeed);
        assert_eq!(rec.zeroize(), KeyState::Provisioned);
        assert_eq!(rec.state, KeyState::Zeroized);
        assert!(matches!(rec.material(), Err(KeyError::Gone(_))));
    }

    #[test]
    fn test_debug_does_not_leak_bytes() {
        let material = KeyMaterial::new(
            Uuid::new_v4(),
            PeerId::new("p"),
            KeyPurpose::OtpSeed,
            Utc::now(),
            Utc::now(),
            vec![0xAB; 4],
        );
        let rendered = format!("{:?}", material);
        assert!(rendered.contains("byte_length: 4"));
        assert!(!rendered.contains("171"));
    }
}
