//! Key lifecycle tracker (KLT): per-process cache in front of the key pool.
//!
//! The tracker mirrors the local view of every key it has touched and refuses
//! reuse without a round trip: a key consumed here is remembered as such until
//! the key itself would have expired, and expired entries are pruned on every
//! fetch. Key bytes live only in memory and are zeroized when an entry is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{KeyError, KeyResult};
use crate::key_pool::{KeyAuthority, KeyId, KeyMaterial, KeyPurpose, PeerId, PoolStatus};
use crate::lifecycle::lease::KeyLease;
use crate::lifecycle::retry::with_retry;

/// Local view of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// Held by an outstanding [`KeyLease`]
    Reserved,
    /// Reusable key kept for later decryption
    Retained,
    /// One-time key fetched for decryption, not yet consumed
    Fetched,
}

struct CacheEntry {
    state: LocalState,
    purpose: KeyPurpose,
    expires_at: DateTime<Utc>,
    material: Option<KeyMaterial>,
}

pub(crate) struct TrackerInner {
    authority: Arc<dyn KeyAuthority>,
    retry: RetryPolicy,
    cache: Mutex<HashMap<KeyId, CacheEntry>>,
    /// Consumed one-time keys and the expiry after which the pool's own answer suffices
    consumed: Mutex<HashMap<KeyId, DateTime<Utc>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct KeyLifecycleTracker {
    inner: Arc<TrackerInner>,
}

impl KeyLifecycleTracker {
    pub fn new(authority: Arc<dyn KeyAuthority>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                authority,
                retry,
                cache: Mutex::new(HashMap::new()),
                consumed: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Reserve a fresh key from the pool. The lease must be committed or
    /// released; dropping it releases the reservation in the background.
    pub async fn acquire(&self, peer_id: &PeerId, size: usize, purpose: KeyPurpose) -> KeyResult<KeyLease> {
        use tracing::debug;

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(KeyError::Internal("lifecycle tracker is shut down".to_string()));
        }

        let authority = &self.inner.authority;
        let material = with_retry(&self.inner.retry, "request", || authority.request(peer_id, size, purpose)).await?;

        lock(&self.inner.cache).insert(
            material.key_id,
            CacheEntry {
                state: LocalState::Reserved,
                purpose,
                expires_at: material.expires_at,
                material: None,
            },
        );
        debug!(target: "lifecycle", key_id = %material.key_id, peer = %peer_id, %purpose, size, "key acquired");
        Ok(KeyLease::new(material, Arc::clone(&self.inner)))
    }

    /// Mark a key fetched for decryption as used.
    ///
    /// One-time keys are consumed at the pool and wiped locally. Reusable
    /// keys stay cached so later decryptions need no round trip.
    pub async fn mark_used(&self, key_id: KeyId) -> KeyResult<()> {
        use tracing::info;

        if lock(&self.inner.consumed).contains_key(&key_id) {
            return Err(KeyError::AlreadyConsumed(key_id));
        }

        let (state, purpose, expires_at) = {
            let cache = lock(&self.inner.cache);
            let entry = cache.get(&key_id).ok_or(KeyError::NotFound(key_id))?;
            (entry.state, entry.purpose, entry.expires_at)
        };

        match (state, purpose.is_one_time()) {
            (LocalState::Reserved, _) => Err(KeyError::InvalidRequest(format!(
                "key {} is leased; commit the lease instead",
                key_id
            ))),
            (_, false) => Ok(()),
            (_, true) => {
                // one token for every attempt: a retry after a lost reply is
                // recognised by the pool as the same consume
                let token = Uuid::new_v4();
                let authority = &self.inner.authority;
                let outcome =
                    with_retry(&self.inner.retry, "consume", || authority.consume(key_id, Some(token))).await;
                match outcome {
                    Ok(_) | Err(KeyError::AlreadyConsumed(_)) | Err(KeyError::Gone(_)) => {
                        self.inner.forget_consumed(key_id, expires_at);
                        info!(target: "lifecycle", key_id = %key_id, "one-time key consumed");
                        outcome.map(|_| ())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Key material needed to decrypt a received or stored message.
    ///
    /// A one-time key can be read exactly once. Once consumed, here or at the
    /// pool, this returns `Gone` and the message stays unreadable.
    pub async fn fetch_for_decrypt(&self, key_id: KeyId) -> KeyResult<KeyMaterial> {
        use tracing::debug;

        self.inner.prune(Utc::now());
        if lock(&self.inner.consumed).contains_key(&key_id) {
            return Err(KeyError::Gone(key_id));
        }

        {
            let mut cache = lock(&self.inner.cache);
            let cached = cache
                .get(&key_id)
                .and_then(|entry| entry.material.as_ref())
                .map(|material| (material.expires_at <= Utc::now(), material.clone()));
            match cached {
                Some((true, _)) => {
                    cache.remove(&key_id);
                    debug!(target: "lifecycle", key_id = %key_id, "cached key expired");
                    return Err(KeyError::Gone(key_id));
                }
                Some((false, material)) => return Ok(material),
                None => {}
            }
        }

        let authority = &self.inner.authority;
        let material = with_retry(&self.inner.retry, "retrieve", || authority.retrieve(key_id)).await?;

        let mut cache = lock(&self.inner.cache);
        if material.purpose.is_one_time() {
            // the caller's copy is the only one; nothing is cached
            cache.entry(key_id).or_insert(CacheEntry {
                state: LocalState::Fetched,
                purpose: material.purpose,
                expires_at: material.expires_at,
                material: None,
            });
        } else {
            cache.insert(
                key_id,
                CacheEntry {
                    state: LocalState::Retained,
                    purpose: material.purpose,
                    expires_at: material.expires_at,
                    material: Some(material.clone()),
                },
            );
        }
        debug!(target: "lifecycle", key_id = %key_id, purpose = %material.purpose, "key fetched for decryption");
        Ok(material)
    }

    /// Pool status for one peer, through the retry policy.
    pub async fn status(&self, peer_id: &PeerId) -> KeyResult<PoolStatus> {
        let authority = &self.inner.authority;
        with_retry(&self.inner.retry, "status", || authority.status(Some(peer_id))).await
    }

    pub fn local_state(&self, key_id: KeyId) -> Option<LocalState> {
        lock(&self.inner.cache).get(&key_id).map(|e| e.state)
    }

    /// Forget local state of expired keys. Returns the number of entries dropped.
    pub fn prune_expired(&self) -> usize {
        self.inner.prune(Utc::now())
    }

    /// Forget a reusable key once the host message store retires it.
    pub fn evict(&self, key_id: KeyId) -> bool {
        lock(&self.inner.cache).remove(&key_id).is_some()
    }

    /// Release every outstanding reservation and wipe the cache.
    ///
    /// Leases still alive afterwards become inert: dropping or committing
    /// them does not touch the pool again. Returns the number of keys released.
    pub async fn shutdown(&self) -> usize {
        use tracing::{info, warn};

        self.inner.closed.store(true, Ordering::Release);
        let reserved: Vec<KeyId> = {
            let mut cache = lock(&self.inner.cache);
            let reserved = cache
                .iter()
                .filter(|(_, e)| e.state == LocalState::Reserved)
                .map(|(id, _)| *id)
                .collect();
            cache.clear();
            reserved
        };

        let mut released = 0;
        for key_id in reserved {
            let authority = &self.inner.authority;
            match with_retry(&self.inner.retry, "release", || authority.release(key_id)).await {
                Ok(()) => released += 1,
                Err(err) => warn!(target: "lifecycle", key_id = %key_id, error = %err, "release on shutdown failed"),
            }
        }
        info!(target: "lifecycle", released, "lifecycle tracker shut down");
        released
    }
}

impl TrackerInner {
    pub(crate) fn authority(&self) -> &Arc<dyn KeyAuthority> {
        &self.authority
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Remove a leased entry. `true` if this caller now owns the settlement.
    pub(crate) fn take_reserved(&self, key_id: KeyId) -> bool {
        let mut cache = lock(&self.cache);
        match cache.get(&key_id) {
            Some(entry) if entry.state == LocalState::Reserved => {
                cache.remove(&key_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn store_retained(&self, material: KeyMaterial) {
        lock(&self.cache).insert(
            material.key_id,
            CacheEntry {
                state: LocalState::Retained,
                purpose: material.purpose,
                expires_at: material.expires_at,
                material: Some(material),
            },
        );
    }

    fn forget_consumed(&self, key_id: KeyId, expires_at: DateTime<Utc>) {
        lock(&self.cache).remove(&key_id);
        lock(&self.consumed).insert(key_id, expires_at);
    }

    /// Drop everything past its key expiry. Leased entries stay until settled.
    fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut cache = lock(&self.cache);
        let before = cache.len();
        cache.retain(|_, entry| entry.state == LocalState::Reserved || entry.expires_at > now);
        let mut pruned = before - cache.len();
        drop(cache);

        let mut consumed = lock(&self.consumed);
        let before = consumed.len();
        consumed.retain(|_, expires_at| *expires_at > now);
        pruned += before - consumed.len();
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::key_pool::{KeyPool, KeyState};
    use std::time::Duration;

    fn setup() -> (Arc<KeyPool>, KeyLifecycleTracker) {
        let pool = Arc::new(KeyPool::new(PoolConfig::default()));
        let tracker = KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none());
        (pool, tracker)
    }

    #[tokio::test]
    async fn test_back_to_back_acquires_are_distinct() {
        let (_pool, tracker) = setup();
        let peer = PeerId::new("bob");
        let a = tracker.acquire(&peer, 16, KeyPurpose::OtpSeed).await.unwrap();
        let b = tracker.acquire(&peer, 16, KeyPurpose::OtpSeed).await.unwrap();
        assert_ne!(a.key_id(), b.key_id());
        assert_ne!(a.material().expose(), b.material().expose());
    }

    #[tokio::test]
    async fn test_one_time_key_is_consumed_once() {
        let (pool, tracker) = setup();
        let lease = tracker.acquire(&PeerId::new("bob"), 8, KeyPurpose::OtpSeed).await.unwrap();
        let key_id = lease.key_id();
        lease.commit().await.unwrap();
        assert_eq!(tracker.local_state(key_id), None);
        assert_eq!(pool.key_state(key_id), Some(KeyState::Retained));

        let fetched = tracker.fetch_for_decrypt(key_id).await.unwrap();
        assert_eq!(fetched.byte_length(), 8);
        assert_eq!(tracker.local_state(key_id), Some(LocalState::Fetched));

        tracker.mark_used(key_id).await.unwrap();
        assert_eq!(pool.key_state(key_id), Some(KeyState::Consumed));
        assert_eq!(tracker.mark_used(key_id).await, Err(KeyError::AlreadyConsumed(key_id)));
        assert_eq!(tracker.fetch_for_decrypt(key_id).await.unwrap_err(), KeyError::Gone(key_id));
    }

    #[tokio::test]
    async fn test_reusable_key_served_from_cache() {
        let (pool, tracker) = setup();
        let lease = tracker.acquire(&PeerId::new("bob"), 32, KeyPurpose::AesSeed).await.unwrap();
        let key_id = lease.key_id();
        let bytes = lease.material().expose().to_vec();
        lease.commit().await.unwrap();
        assert_eq!(tracker.local_state(key_id), Some(LocalState::Retained));

        // wiping the pool copy proves the second read is local
        pool.revoke(key_id).unwrap();
        let cached = tracker.fetch_for_decrypt(key_id).await.unwrap();
        assert_eq!(cached.expose(), bytes.as_slice());
        tracker.mark_used(key_id).await.unwrap();

        assert!(tracker.evict(key_id));
        assert!(!tracker.evict(key_id));
        assert_eq!(tracker.fetch_for_decrypt(key_id).await.unwrap_err(), KeyError::Gone(key_id));
    }

    #[tokio::test]
    async fn test_shutdown_releases_outstanding_leases() {
        let (pool, tracker) = setup();
        let lease = tracker.acquire(&PeerId::new("bob"), 8, KeyPurpose::OtpSeed).await.unwrap();
        let key_id = lease.key_id();

        assert_eq!(tracker.shutdown().await, 1);
        assert_eq!(pool.key_state(key_id), Some(KeyState::Provisioned));
        drop(lease);
        assert_eq!(pool.stats().total_released, 1);
        assert!(tracker.acquire(&PeerId::new("bob"), 8, KeyPurpose::OtpSeed).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_local_state_is_pruned() {
        let pool = Arc::new(KeyPool::new(PoolConfig {
            key_ttl: Duration::from_millis(300),
            ..PoolConfig::default()
        }));
        let tracker = KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none());
        let peer = PeerId::new("bob");

        let used = tracker.acquire(&peer, 8, KeyPurpose::OtpSeed).await.unwrap();
        let used_id = used.key_id();
        used.commit().await.unwrap();
        tracker.fetch_for_decrypt(used_id).await.unwrap();
        tracker.mark_used(used_id).await.unwrap();

        // fetched but never confirmed, as after a rejected decryption
        let left = tracker.acquire(&peer, 8, KeyPurpose::OtpSeed).await.unwrap();
        let left_id = left.key_id();
        left.commit().await.unwrap();
        tracker.fetch_for_decrypt(left_id).await.unwrap();
        assert_eq!(tracker.local_state(left_id), Some(LocalState::Fetched));
        assert_eq!(tracker.prune_expired(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(tracker.prune_expired(), 2);
        assert_eq!(tracker.local_state(left_id), None);

        // the pool still refuses the consumed key after its tombstone is pruned
        pool.sweep(Utc::now());
        assert_eq!(tracker.fetch_for_decrypt(used_id).await.unwrap_err(), KeyError::Gone(used_id));
    }

    /// Applies every consume but loses the reply to the first one.
    struct LostAckAuthority {
        pool: Arc<KeyPool>,
        consume_calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl KeyAuthority for LostAckAuthority {
        async fn request(&self, peer_id: &PeerId, size: usize, purpose: KeyPurpose) -> KeyResult<KeyMaterial> {
            self.pool.request(peer_id, size, purpose)
        }
        async fn retrieve(&self, key_id: KeyId) -> KeyResult<KeyMaterial> {
            self.pool.retrieve(key_id)
        }
        async fn consume(&self, key_id: KeyId, token: Option<crate::key_pool::ConsumeToken>) -> KeyResult<DateTime<Utc>> {
            let outcome = self.pool.consume_with_token(key_id, token);
            if self.consume_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(KeyError::Unavailable("timed out waiting for reply".to_string()));
            }
            outcome
        }
        async fn release(&self, key_id: KeyId) -> KeyResult<()> {
            self.pool.release(key_id)
        }
        async fn retain(&self, key_id: KeyId) -> KeyResult<()> {
            self.pool.retain(key_id)
        }
        async fn status(&self, peer_id: Option<&PeerId>) -> KeyResult<PoolStatus> {
            Ok(self.pool.status(peer_id))
        }
    }

    #[tokio::test]
    async fn test_mark_used_survives_lost_consume_reply() {
        let pool = Arc::new(KeyPool::new(PoolConfig::default()));
        let authority = Arc::new(LostAckAuthority {
            pool: pool.clone(),
            consume_calls: std::sync::atomic::AtomicU32::new(0),
        });
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        };
        let tracker = KeyLifecycleTracker::new(authority.clone(), retry);

        let lease = tracker.acquire(&PeerId::new("bob"), 8, KeyPurpose::OtpSeed).await.unwrap();
        let key_id = lease.key_id();
        lease.commit().await.unwrap();
        tracker.fetch_for_decrypt(key_id).await.unwrap();

        tracker.mark_used(key_id).await.unwrap();
        assert_eq!(authority.consume_calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.key_state(key_id), Some(KeyState::Consumed));
        assert_eq!(pool.stats().total_consumed, 1);
        assert_eq!(tracker.mark_used(key_id).await, Err(KeyError::AlreadyConsumed(key_id)));
    }
}
