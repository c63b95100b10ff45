use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::KeyResult;
use crate::key_pool::{ConsumeToken, KeyId, KeyMaterial, KeyPool, KeyPurpose, PeerId, PoolStatus};

/// The key pool contract as seen by the lifecycle tracker.
///
/// Implemented in-process by [`KeyPool`] and over HTTP by
/// `lifecycle::RemoteKeyAuthority`.
#[async_trait]
pub trait KeyAuthority: Send + Sync {
    async fn request(&self, peer_id: &PeerId, size: usize, purpose: KeyPurpose) -> KeyResult<KeyMaterial>;

    async fn retrieve(&self, key_id: KeyId) -> KeyResult<KeyMaterial>;

    /// Irreversible. Repeating the call with the same `token` returns the
    /// original timestamp, so a consume whose reply was lost can be retried.
    async fn consume(&self, key_id: KeyId, token: Option<ConsumeToken>) -> KeyResult<DateTime<Utc>>;

    async fn release(&self, key_id: KeyId) -> KeyResult<()>;

    async fn retain(&self, key_id: KeyId) -> KeyResult<()>;

    async fn status(&self, peer_id: Option<&PeerId>) -> KeyResult<PoolStatus>;
}

#[async_trait]
impl KeyAuthority for KeyPool {
    async fn request(&self, peer_id: &PeerId, size: usize, purpose: KeyPurpose) -> KeyResult<KeyMaterial> {
        KeyPool::request(self, peer_id, size, purpose)
    }

    async fn retrieve(&self, key_id: KeyId) -> KeyResult<KeyMaterial> {
        KeyPool::retrieve(self, key_id)
    }

    async fn consume(&self, key_id: KeyId, token: Option<ConsumeToken>) -> KeyResult<DateTime<Utc>> {
        KeyPool::consume_with_token(self, key_id, token)
    }

    async fn release(&self, key_id: KeyId) -> KeyResult<()> {
        KeyPool::release(self, key_id)
    }

    async fn retain(&self, key_id: KeyId) -> KeyResult<()> {
        KeyPool::retain(self, key_id)
    }

    async fn status(&self, peer_id: Option<&PeerId>) -> KeyResult<PoolStatus> {
        Ok(KeyPool::status(self, peer_id))
    }
}
