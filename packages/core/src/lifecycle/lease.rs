use std::fmt;
use std::sync::Arc;

use crate::error::{KeyError, KeyResult};
use crate::key_pool::{KeyId, KeyMaterial, KeyPurpose, KeyState};
use crate::lifecycle::retry::with_retry;
use crate::lifecycle::tracker::TrackerInner;

/// Exclusive hold on freshly reserved key material.
///
/// Exactly one of three things happens to a lease:
/// - [`commit`](Self::commit) after the key protected a message,
/// - [`release`](Self::release) when the send is abandoned,
/// - drop on any other exit path, which wipes the bytes and releases the
///   reservation in the background.
pub struct KeyLease {
    material: KeyMaterial,
    settled: bool,
    tracker: Arc<TrackerInner>,
}

impl KeyLease {
    pub(crate) fn new(material: KeyMaterial, tracker: Arc<TrackerInner>) -> Self {
        Self {
            material,
            settled: false,
            tracker,
        }
    }

    pub fn key_id(&self) -> KeyId {
        self.material.key_id
    }

    pub fn purpose(&self) -> KeyPurpose {
        self.material.purpose
    }

    /// Borrow the key bytes for the duration of an encryption.
    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    /// The key protected a message: keep it at the pool.
    ///
    /// Reusable keys move into the tracker cache for later decryption.
    /// One-time keys are wiped here; only the recipient reads them again,
    /// exactly once.
    pub async fn commit(mut self) -> KeyResult<()> {
        use tracing::debug;

        let key_id = self.key_id();
        if !self.tracker.take_reserved(key_id) {
            // the tracker shut down and already released this key
            self.wipe();
            return Err(KeyError::InvalidState {
                key_id,
                state: KeyState::Provisioned,
            });
        }

        let authority = Arc::clone(self.tracker.authority());
        let retained = with_retry(self.tracker.retry(), "retain", || authority.retain(key_id)).await;
        if retained.is_ok() && !self.purpose().is_one_time() {
            self.tracker.store_retained(self.material.clone());
        }
        self.wipe();
        retained?;

        debug!(target: "lifecycle", key_id = %key_id, purpose = %self.purpose(), "lease committed");
        Ok(())
    }

    /// Abandon the send and return the reservation to the pool.
    pub async fn release(mut self) -> KeyResult<()> {
        use tracing::debug;

        let key_id = self.key_id();
        self.wipe();
        if !self.tracker.take_reserved(key_id) {
            return Ok(());
        }
        let authority = Arc::clone(self.tracker.authority());
        with_retry(self.tracker.retry(), "release", || authority.release(key_id)).await?;
        debug!(target: "lifecycle", key_id = %key_id, "lease released");
        Ok(())
    }

    fn wipe(&mut self) {
        self.material.wipe();
        self.settled = true;
    }
}

impl fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLease")
            .field("key_id", &self.material.key_id)
            .field("purpose", &self.material.purpose)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        use tracing::{debug, warn};

        if self.settled {
            return;
        }
        self.wipe();
        let key_id = self.key_id();
        if !self.tracker.take_reserved(key_id) {
            return;
        }

        let authority = Arc::clone(self.tracker.authority());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = authority.release(key_id).await {
                        warn!(target: "lifecycle", key_id = %key_id, error = %err, "background release failed");
                    }
                });
                debug!(target: "lifecycle", key_id = %key_id, "abandoned lease released");
            }
            Err(_) => {
                warn!(target: "lifecycle", key_id = %key_id, "no runtime to release abandoned lease; reservation will lapse");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{PoolConfig, RetryPolicy};
    use crate::key_pool::{KeyPool, KeyPurpose, KeyState, PeerId};
    use crate::lifecycle::KeyLifecycleTracker;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_explicit_release_returns_key_to_pool() {
        let pool = Arc::new(KeyPool::new(PoolConfig::default()));
        let tracker = KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none());
        let lease = tracker.acquire(&PeerId::new("bob"), 12, KeyPurpose::OtpSeed).await.unwrap();
        let key_id = lease.key_id();

        lease.release().await.unwrap();
        assert_eq!(pool.key_state(key_id), Some(KeyState::Provisioned));
        assert_eq!(tracker.local_state(key_id), None);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released_in_background() {
        let pool = Arc::new(KeyPool::new(PoolConfig::default()));
        let tracker = KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none());
        let key_id = {
            let lease = tracker.acquire(&PeerId::new("bob"), 12, KeyPurpose::OtpSeed).await.unwrap();
            lease.key_id()
        };

        for _ in 0..50 {
            if pool.key_state(key_id) == Some(KeyState::Provisioned) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.key_state(key_id), Some(KeyState::Provisioned));
    }

    #[tokio::test]
    async fn test_commit_after_lapsed_reservation_fails() {
        let pool = Arc::new(KeyPool::new(PoolConfig::default()));
        let tracker = KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none());
        let lease = tracker.acquire(&PeerId::new("bob"), 32, KeyPurpose::AesSeed).await.unwrap();

        pool.sweep(chrono::Utc::now() + chrono::Duration::seconds(61));
        assert!(lease.commit().await.is_err());
    }
}
