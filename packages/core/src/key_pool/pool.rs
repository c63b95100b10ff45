//! In-memory key pool authority.
//!
//! Records live in a fixed number of lock stripes selected by `key_id`, so
//! every transition of a given key is serialised while unrelated keys proceed
//! in parallel. Per-peer budgets live behind a separate inventory lock.
//!
//! Lock order: inventory, then stripe, then the retired set. Code holding a
//! stripe lock never waits on the inventory lock.
//!
//! Sweeps prune terminal records once their key TTL has passed. Only the id
//! and final state survive, so late callers still get `AlreadyConsumed` or
//! `Gone` rather than `NotFound`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::error::{KeyError, KeyResult};
use crate::key_pool::inventory::PeerInventory;
use crate::key_pool::{ConsumeToken, KeyId, KeyMaterial, KeyPurpose, KeyRecord, KeyState, PeerId};

/// AES seeds are always this long; derivation happens on the client.
pub const AES_SEED_LEN: usize = 32;

/// Advisory aggregate returned by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// OTP bytes that can still be issued
    pub available_bytes: u64,
    /// Keys currently reserved or retained
    pub key_count: u64,
    /// AES seeds that can still be issued
    pub aes_keys_available: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_allocated: u64,
    pub total_consumed: u64,
    pub total_released: u64,
    pub total_expired: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    pub expired: usize,
    pub pruned: usize,
}

#[derive(Default)]
struct Counters {
    allocated: AtomicU64,
    consumed: AtomicU64,
    released: AtomicU64,
    expired: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicked holder cannot leave a record half-transitioned: every
    // transition is a single assignment after its checks
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct KeyPool {
    config: PoolConfig,
    stripes: Vec<Mutex<HashMap<KeyId, KeyRecord>>>,
    inventories: Mutex<HashMap<PeerId, PeerInventory>>,
    retired: Mutex<HashMap<KeyId, KeyState>>,
    counters: Counters,
}

impl KeyPool {
    pub fn new(config: PoolConfig) -> Self {
        let stripes = (0..config.lock_stripes.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            config,
            stripes,
            inventories: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn stripe(&self, key_id: &KeyId) -> &Mutex<HashMap<KeyId, KeyRecord>> {
        let idx = (key_id.as_u128() % self.stripes.len() as u128) as usize;
        &self.stripes[idx]
    }

    /// Verdict for a key without a live record.
    fn missing(&self, key_id: KeyId, retired: fn(KeyId) -> KeyError) -> KeyError {
        if lock(&self.retired).contains_key(&key_id) {
            retired(key_id)
        } else {
            KeyError::NotFound(key_id)
        }
    }

    fn validate(&self, size: usize, purpose: KeyPurpose) -> KeyResult<()> {
        if size > self.config.max_key_size {
            return Err(KeyError::InvalidRequest(format!(
                "size {} exceeds max key size {}",
                size, self.config.max_key_size
            )));
        }
        if purpose == KeyPurpose::AesSeed && size != AES_SEED_LEN {
            return Err(KeyError::InvalidRequest(format!(
                "aes_seed keys are {} bytes, got {}",
                AES_SEED_LEN, size
            )));
        }
        Ok(())
    }

    /// Issue fresh (or previously released) material and reserve it.
    pub fn request(&self, peer_id: &PeerId, size: usize, purpose: KeyPurpose) -> KeyResult<KeyMaterial> {
        use tracing::debug;

        self.validate(size, purpose)?;
        let now = Utc::now();
        let mut inventories = lock(&self.inventories);
        let inventory = inventories
            .entry(peer_id.clone())
            .or_insert_with(|| PeerInventory::new(&self.config));

        // exact-size reuse of released material first
        while let Some(key_id) = inventory.pop_free(purpose, size) {
            let mut stripe = lock(self.stripe(&key_id));
            let Some(record) = stripe.get_mut(&key_id) else {
                continue;
            };
            if record.state != KeyState::Provisioned || record.is_expired(now) {
                continue;
            }
            record.reserve(now, self.config.reservation_ttl)?;
            let material = record.material()?;
            inventory.live_keys += 1;
            self.counters.allocated.fetch_add(1, Ordering::Relaxed);
            debug!(target: "key_pool", key_id = %key_id, peer = %peer_id, %purpose, size, "re-issued released key");
            return Ok(material);
        }

        let cost = PeerInventory::cost(purpose, size);
        let available = inventory.available(purpose);
        if available < cost {
            return Err(KeyError::Exhausted {
                peer_id: peer_id.clone(),
                purpose,
                requested: cost,
                available,
            });
        }

        // not enough fresh capacity: recycle released material of other sizes
        while inventory.fresh(purpose) < cost {
            let Some((key_id, freed_size)) = inventory.pop_any_free(purpose) else {
                break;
            };
            if let Some(record) = lock(self.stripe(&key_id)).get_mut(&key_id) {
                record.zeroize();
            }
            inventory.credit(purpose, PeerInventory::cost(purpose, freed_size));
            debug!(target: "key_pool", key_id = %key_id, peer = %peer_id, "reclaimed released key");
        }
        if inventory.fresh(purpose) < cost {
            return Err(KeyError::Internal(format!(
                "inventory for {} is inconsistent",
                peer_id
            )));
        }

        let mut bytes = vec![0u8; size];
        OsRng.fill_bytes(&mut bytes);
        let mut record = KeyRecord::provisioned(peer_id.clone(), purpose, bytes, now, self.config.key_ttl);
        record.reserve(now, self.config.reservation_ttl)?;
        let material = record.material()?;
        let key_id = record.key_id;

        lock(self.stripe(&key_id)).insert(key_id, record);
        inventory.debit(purpose, size);
        inventory.live_keys += 1;
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);

        debug!(target: "key_pool", key_id = %key_id, peer = %peer_id, %purpose, size, "issued key");
        Ok(material)
    }

    /// Copy of the bytes of a live (reserved or retained) key.
    pub fn retrieve(&self, key_id: KeyId) -> KeyResult<KeyMaterial> {
        let stripe = lock(self.stripe(&key_id));
        stripe
            .get(&key_id)
            .ok_or_else(|| self.missing(key_id, KeyError::Gone))?
            .material()
    }

    /// Irreversibly consume a key and wipe the pool's copy.
    pub fn consume(&self, key_id: KeyId) -> KeyResult<DateTime<Utc>> {
        self.consume_with_token(key_id, None)
    }

    /// Consume that can be retried: repeating it with the same `token`
    /// returns the original `consumed_at` instead of `AlreadyConsumed`.
    pub fn consume_with_token(&self, key_id: KeyId, token: Option<ConsumeToken>) -> KeyResult<DateTime<Utc>> {
        use tracing::{debug, info};

        let now = Utc::now();
        let (peer_id, consumed_at) = {
            let mut stripe = lock(self.stripe(&key_id));
            let record = stripe
                .get_mut(&key_id)
                .ok_or_else(|| self.missing(key_id, KeyError::AlreadyConsumed))?;
            if record.consume(now, token)?.is_none() {
                debug!(target: "key_pool", key_id = %key_id, "consume replayed");
                return Ok(record.consumed_at.unwrap_or(now));
            }
            (record.peer_id.clone(), now)
        };

        if let Some(inventory) = lock(&self.inventories).get_mut(&peer_id) {
            inventory.live_keys = inventory.live_keys.saturating_sub(1);
        }
        self.counters.consumed.fetch_add(1, Ordering::Relaxed);
        info!(target: "key_pool", key_id = %key_id, peer = %peer_id, "key consumed");
        Ok(consumed_at)
    }

    /// Return a reservation to the pool. Releasing a provisioned key is a no-op.
    pub fn release(&self, key_id: KeyId) -> KeyResult<()> {
        use tracing::debug;

        let mut inventories = lock(&self.inventories);
        let mut stripe = lock(self.stripe(&key_id));
        let record = stripe
            .get_mut(&key_id)
            .ok_or_else(|| self.missing(key_id, KeyError::Gone))?;
        if !record.release()? {
            return Ok(());
        }

        let inventory = inventories
            .entry(record.peer_id.clone())
            .or_insert_with(|| PeerInventory::new(&self.config));
        inventory.push_free(record.purpose, record.size, key_id);
        inventory.live_keys = inventory.live_keys.saturating_sub(1);
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        debug!(target: "key_pool", key_id = %key_id, peer = %record.peer_id, "key released");
        Ok(())
    }

    /// Keep a reserved key for later decryption; it is never re-issued.
    pub fn retain(&self, key_id: KeyId) -> KeyResult<()> {
        let mut stripe = lock(self.stripe(&key_id));
        stripe
            .get_mut(&key_id)
            .ok_or_else(|| self.missing(key_id, KeyError::AlreadyConsumed))?
            .retain()
    }

    /// Emergency wipe, whatever the state. Returns when the bytes are gone.
    pub fn revoke(&self, key_id: KeyId) -> KeyResult<DateTime<Utc>> {
        use tracing::warn;

        let mut inventories = lock(&self.inventories);
        let mut stripe = lock(self.stripe(&key_id));
        let Some(record) = stripe.get_mut(&key_id) else {
            // a pruned tombstone has no bytes left to wipe
            return match self.missing(key_id, KeyError::Gone) {
                KeyError::Gone(_) => Ok(Utc::now()),
                err => Err(err),
            };
        };
        let previous = record.zeroize();

        if let Some(inventory) = inventories.get_mut(&record.peer_id) {
            Self::forget(inventory, record, previous);
        }
        warn!(target: "key_pool", key_id = %key_id, peer = %record.peer_id, from = %previous, "key revoked");
        Ok(Utc::now())
    }

    fn forget(inventory: &mut PeerInventory, record: &KeyRecord, previous: KeyState) {
        if previous == KeyState::Provisioned {
            inventory.remove_free(record.purpose, record.size, record.key_id);
        } else if previous.is_live() {
            inventory.live_keys = inventory.live_keys.saturating_sub(1);
        }
    }

    /// Add capacity to a peer. Returns the units now available for that purpose.
    pub fn provision(&self, peer_id: &PeerId, purpose: KeyPurpose, amount: u64) -> KeyResult<u64> {
        use tracing::info;

        if amount == 0 {
            return Err(KeyError::InvalidRequest("amount must be positive".to_string()));
        }
        let mut inventories = lock(&self.inventories);
        let inventory = inventories
            .entry(peer_id.clone())
            .or_insert_with(|| PeerInventory::new(&self.config));
        inventory.credit(purpose, amount);
        info!(target: "key_pool", peer = %peer_id, %purpose, amount, "capacity provisioned");
        Ok(inventory.available(purpose))
    }

    pub fn status(&self, peer_id: Option<&PeerId>) -> PoolStatus {
        let inventories = lock(&self.inventories);
        let summarise = |inv: &PeerInventory| PoolStatus {
            available_bytes: inv.available(KeyPurpose::OtpSeed),
            key_count: inv.live_keys,
            aes_keys_available: inv.available(KeyPurpose::AesSeed),
        };

        match peer_id {
            // unknown peers would be granted a fresh inventory on first request
            Some(peer) => inventories
                .get(peer)
                .map(summarise)
                .unwrap_or_else(|| summarise(&PeerInventory::new(&self.config))),
            None => inventories.values().map(summarise).fold(PoolStatus::default(), |acc, s| PoolStatus {
                available_bytes: acc.available_bytes.saturating_add(s.available_bytes),
                key_count: acc.key_count.saturating_add(s.key_count),
                aes_keys_available: acc.aes_keys_available.saturating_add(s.aes_keys_available),
            }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_allocated: self.counters.allocated.load(Ordering::Relaxed),
            total_consumed: self.counters.consumed.load(Ordering::Relaxed),
            total_released: self.counters.released.load(Ordering::Relaxed),
            total_expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Release lapsed reservations, wipe expired material and drop old tombstones.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        use tracing::{debug, info};

        let mut report = SweepReport::default();
        let mut inventories = lock(&self.inventories);

        for stripe in &self.stripes {
            let mut stripe = lock(stripe);
            stripe.retain(|key_id, record| {
                if record.state.is_terminal() {
                    if record.is_expired(now) {
                        lock(&self.retired).insert(*key_id, record.state);
                        report.pruned += 1;
                        return false;
                    }
                    return true;
                }

                if record.is_expired(now) {
                    let previous = record.zeroize();
                    if let Some(inventory) = inventories.get_mut(&record.peer_id) {
                        Self::forget(inventory, record, previous);
                    }
                    report.expired += 1;
                    debug!(target: "key_pool", key_id = %key_id, from = %previous, "key expired");
                    return true;
                }

                if record.reservation_lapsed(now) && matches!(record.release(), Ok(true)) {
                    let inventory = inventories
                        .entry(record.peer_id.clone())
                        .or_insert_with(|| PeerInventory::new(&self.config));
                    inventory.push_free(record.purpose, record.size, *key_id);
                    inventory.live_keys = inventory.live_keys.saturating_sub(1);
                    report.released += 1;
                    debug!(target: "key_pool", key_id = %key_id, "reservation lapsed");
                }
                true
            });
        }

        self.counters.released.fetch_add(report.released as u64, Ordering::Relaxed);
        self.counters.expired.fetch_add(report.expired as u64, Ordering::Relaxed);
        if report.released + report.expired > 0 {
            info!(
                target: "key_pool",
                released = report.released,
                expired = report.expired,
                pruned = report.pruned,
                "sweep finished"
            );
        }
        report
    }

    /// State of a key, for diagnostics and tests.
    pub fn key_state(&self, key_id: KeyId) -> Option<KeyState> {
        let live = lock(self.stripe(&key_id)).get(&key_id).map(|r| r.state);
        live.or_else(|| lock(&self.retired).get(&key_id).copied())
    }
}
