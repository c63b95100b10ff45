// Per-peer key budget

use std::collections::{HashMap, VecDeque};

use crate::config::PoolConfig;
use crate::key_pool::{KeyId, KeyPurpose};

/// What one peer may still draw from the pool.
///
/// Fresh capacity is debited when new material is generated. Released
/// material sits on a free list keyed by `(purpose, size)` and can be handed
/// out again on an exact size match, or reclaimed (wiped and credited back to
/// fresh capacity) when a request of a different size needs room.
#[derive(Debug, Clone)]
pub struct PeerInventory {
    pub otp_bytes_remaining: u64,
    pub aes_keys_remaining: u64,
    pub provisioned_otp_bytes: u64,
    pub provisioned_aes_keys: u64,
    pub live_keys: u64,
    free: HashMap<(KeyPurpose, usize), VecDeque<KeyId>>,
}

impl PeerInventory {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            otp_bytes_remaining: config.otp_bytes_per_peer,
            aes_keys_remaining: config.aes_keys_per_peer,
            provisioned_otp_bytes: 0,
            provisioned_aes_keys: 0,
            live_keys: 0,
            free: HashMap::new(),
        }
    }

    /// Units a key of this purpose and size costs: bytes for OTP, one key for AES.
    pub fn cost(purpose: KeyPurpose, size: usize) -> u64 {
        match purpose {
            KeyPurpose::OtpSeed => size as u64,
            KeyPurpose::AesSeed => 1,
        }
    }

    pub fn fresh(&self, purpose: KeyPurpose) -> u64 {
        match purpose {
            KeyPurpose::OtpSeed => self.otp_bytes_remaining,
            KeyPurpose::AesSeed => self.aes_keys_remaining,
        }
    }

    pub fn reclaimable(&self, purpose: KeyPurpose) -> u64 {
        match purpose {
            KeyPurpose::OtpSeed => self.provisioned_otp_bytes,
            KeyPurpose::AesSeed => self.provisioned_aes_keys,
        }
    }

    /// Fresh plus reclaimable units; the most a single request could ever get.
    pub fn available(&self, purpose: KeyPurpose) -> u64 {
        self.fresh(purpose).saturating_add(self.reclaimable(purpose))
    }

    pub fn debit(&mut self, purpose: KeyPurpose, size: usize) {
        let cost = Self::cost(purpose, size);
        match purpose {
            KeyPurpose::OtpSeed => self.otp_bytes_remaining = self.otp_bytes_remaining.saturating_sub(cost),
            KeyPurpose::AesSeed => self.aes_keys_remaining = self.aes_keys_remaining.saturating_sub(cost),
        }
    }

    pub fn credit(&mut self, purpose: KeyPurpose, units: u64) {
        match purpose {
            KeyPurpose::OtpSeed => self.otp_bytes_remaining = self.otp_bytes_remaining.saturating_add(units),
            KeyPurpose::AesSeed => self.aes_keys_remaining = self.aes_keys_remaining.saturating_add(units),
        }
    }

    /// A released key joins the free list.
    pub fn push_free(&mut self, purpose: KeyPurpose, size: usize, key_id: KeyId) {
        self.free.entry((purpose, size)).or_default().push_back(key_id);
        self.adjust_provisioned(purpose, size, true);
    }

    /// Next released key with exactly this shape, oldest first.
    pub fn pop_free(&mut self, purpose: KeyPurpose, size: usize) -> Option<KeyId> {
        let queue = self.free.get_mut(&(purpose, size))?;
        let key_id = queue.pop_front()?;
        if queue.is_empty() {
            self.free.remove(&(purpose, size));
        }
        self.adjust_provisioned(purpose, size, false);
        Some(key_id)
    }

    /// Any released key of this purpose, for reclamation.
    pub fn pop_any_free(&mut self, purpose: KeyPurpose) -> Option<(KeyId, usize)> {
        let size = self
            .free
            .keys()
            .filter(|(p, _)| *p == purpose)
            .map(|(_, size)| *size)
            .max()?;
        self.pop_free(purpose, size).map(|id| (id, size))
    }

    /// Drop a specific key from the free list (revoked or expired while provisioned).
    pub fn remove_free(&mut self, purpose: KeyPurpose, size: usize, key_id: KeyId) -> bool {
        let Some(queue) = self.free.get_mut(&(purpose, size)) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|id| *id != key_id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.free.remove(&(purpose, size));
        }
        if removed {
            self.adjust_provisioned(purpose, size, false);
        }
        removed
    }

    fn adjust_provisioned(&mut self, purpose: KeyPurpose, size: usize, add: bool) {
        let units = Self::cost(purpose, size);
        let slot = match purpose {
            KeyPurpose::OtpSeed => &mut self.provisioned_otp_bytes,
            KeyPurpose::AesSeed => &mut self.provisioned_aes_keys,
        };
        *slot = if add {
            slot.saturating_add(units)
        } else {
            slot.saturating_sub(units)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn small_config() -> PoolConfig {
        PoolConfig {
            otp_bytes_per_peer: 100,
            aes_keys_per_peer: 2,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_free_list_tracks_provisioned_units() {
        let mut inv = PeerInventory::new(&small_config());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        inv.push_free(KeyPurpose::OtpSeed, 10, a);
        inv.push_free(KeyPurpose::OtpSeed, 30, b);
        assert_eq!(inv.reclaimable(KeyPurpose::OtpSeed), 40);
        assert_eq!(inv.available(KeyPurpose::OtpSeed), 140);

        assert_eq!(inv.pop_free(KeyPurpose::OtpSeed, 10), Some(a));
        assert_eq!(inv.pop_free(KeyPurpose::OtpSeed, 10), None);
        assert_eq!(inv.pop_any_free(KeyPurpose::OtpSeed), Some((b, 30)));
        assert_eq!(inv.reclaimable(KeyPurpose::OtpSeed), 0);
    }

    #[test]
    fn test_aes_costs_one_key_each() {
        let mut inv = PeerInventory::new(&small_config());
        inv.debit(KeyPurpose::AesSeed, 32);
        assert_eq!(inv.fresh(KeyPurpose::AesSeed), 1);
        let id = Uuid::new_v4();
        inv.push_free(KeyPurpose::AesSeed, 32, id);
        assert!(inv.remove_free(KeyPurpose::AesSeed, 32, id));
        assert!(!inv.remove_free(KeyPurpose::AesSeed, 32, id));
        assert_eq!(inv.reclaimable(KeyPurpose::AesSeed), 0);
    }

    #[test]
    fn test_available_saturates() {
        let mut inv = PeerInventory::new(&small_config());
        inv.credit(KeyPurpose::OtpSeed, u64::MAX);
        inv.push_free(KeyPurpose::OtpSeed, 64, Uuid::new_v4());
        assert_eq!(inv.available(KeyPurpose::OtpSeed), u64::MAX);
    }
}
