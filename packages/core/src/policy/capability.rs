// Возможности получателя: какие уровни он поддерживает и чем шифровать уровень 3

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::{fingerprint, SecurityLevel};
use crate::key_pool::PeerId;

/// Что известно о получателе на момент отправки
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapability {
    pub peer_id: PeerId,
    pub supported_levels: BTreeSet<SecurityLevel>,
    /// SHA-256 (hex) опубликованного ключа инкапсуляции
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub kem_public_key: Option<Vec<u8>>,
}

impl PeerCapability {
    pub fn new(peer_id: PeerId, levels: impl IntoIterator<Item = SecurityLevel>) -> Self {
        Self {
            peer_id,
            supported_levels: levels.into_iter().collect(),
            public_key_fingerprint: None,
            kem_public_key: None,
        }
    }

    /// Неизвестный получатель: только уровень 4
    pub fn plain_only(peer_id: PeerId) -> Self {
        Self::new(peer_id, [SecurityLevel::Plain])
    }

    /// Прикрепить KEM-ключ получателя и запомнить его отпечаток.
    pub fn with_kem_public_key(mut self, public_key: Vec<u8>) -> Self {
        self.public_key_fingerprint = Some(fingerprint(&public_key));
        self.kem_public_key = Some(public_key);
        self
    }

    pub fn supports(&self, level: SecurityLevel) -> bool {
        self.supported_levels.contains(&level)
    }

    /// KEM-ключ, только если он совпадает с опубликованным отпечатком.
    pub fn verified_kem_key(&self) -> Option<&[u8]> {
        let key = self.kem_public_key.as_deref()?;
        match &self.public_key_fingerprint {
            Some(expected) if !expected.eq_ignore_ascii_case(&fingerprint(key)) => None,
            _ => Some(key),
        }
    }
}

/// Источник возможностей (каталог пользователей, сервер ключей и т.п.)
#[async_trait]
pub trait CapabilityDirectory: Send + Sync {
    async fn lookup(&self, peer_id: &PeerId) -> Option<PeerCapability>;
}

/// In-memory каталог для тестов и локальных сценариев
#[derive(Default)]
pub struct InMemoryDirectory {
    peers: RwLock<HashMap<PeerId, PeerCapability>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capability: PeerCapability) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(capability.peer_id.clone(), capability);
    }

    pub fn remove(&self, peer_id: &PeerId) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id)
            .is_some()
    }
}

#[async_trait]
impl CapabilityDirectory for InMemoryDirectory {
    async fn lookup(&self, peer_id: &PeerId) -> Option<PeerCapability> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }
}

/// Кэш возможностей с ограниченным сроком свежести
pub struct CapabilityCache {
    directory: std::sync::Arc<dyn CapabilityDirectory>,
    ttl: Duration,
    entries: Mutex<HashMap<PeerId, (Instant, PeerCapability)>>,
}

impl CapabilityCache {
    pub fn new(directory: std::sync::Arc<dyn CapabilityDirectory>, ttl: Duration) -> Self {
        Self {
            directory,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PeerId, (Instant, PeerCapability)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Возможности получателя; неизвестный получатель считается plain-only
    pub async fn resolve(&self, peer_id: &PeerId) -> PeerCapability {
        use tracing::debug;

        if let Some((fetched_at, capability)) = self.entries().get(peer_id) {
            if fetched_at.elapsed() < self.ttl {
                return capability.clone();
            }
        }

        let capability = match self.directory.lookup(peer_id).await {
            Some(capability) => capability,
            None => {
                debug!(target: "policy", peer = %peer_id, "unknown recipient, plain only");
                PeerCapability::plain_only(peer_id.clone())
            }
        };
        self.entries()
            .insert(peer_id.clone(), (Instant::now(), capability.clone()));
        capability
    }

    pub fn invalidate(&self, peer_id: &PeerId) -> bool {
        self.entries().remove(peer_id).is_some()
    }
}
