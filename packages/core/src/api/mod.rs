// Публичный API для отправки и приёма защищённых сообщений
// Путь отправки: PolicyEngine.evaluate → EncryptionEngine.encrypt

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::crypto::{DecryptionKeys, EncryptionEngine, SecurityEnvelope, SecurityLevel, SigningKeyPair};
use crate::error::{CryptoError, CryptoResult};
use crate::key_pool::{KeyAuthority, PeerId};
use crate::lifecycle::KeyLifecycleTracker;
use crate::policy::{AuditSink, CapabilityCache, CapabilityDirectory, PolicyDecision, PolicyEngine};

/// Готовое к отправке сообщение и решение политики по нему
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub decision: PolicyDecision,
    pub envelope: SecurityEnvelope,
}

/// Главный API: политика, шифрование и кэш возможностей получателей
pub struct SecureMessenger {
    policy: PolicyEngine,
    engine: EncryptionEngine,
    capabilities: CapabilityCache,
}

impl SecureMessenger {
    pub fn new(policy: PolicyEngine, engine: EncryptionEngine, capabilities: CapabilityCache) -> Self {
        Self {
            policy,
            engine,
            capabilities,
        }
    }

    /// Собрать мессенджер из конфигурации поверх любого менеджера ключей.
    ///
    /// Конверты уровня 3 подписываются, если задан `sign_pqc_messages`
    /// и собрана фича `post-quantum`.
    pub fn from_config(
        config: &Config,
        authority: Arc<dyn KeyAuthority>,
        directory: Arc<dyn CapabilityDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> CryptoResult<Self> {
        let tracker = KeyLifecycleTracker::new(authority, config.retry.clone());
        let mut engine = EncryptionEngine::new(tracker.clone());
        if config.policy.sign_pqc_messages {
            match SigningKeyPair::generate() {
                Ok(signer) => engine = engine.with_signer(signer),
                Err(err) => tracing::warn!(target: "crypto::engine", error = %err, "level 3 signing disabled"),
            }
        }
        let policy = PolicyEngine::new(tracker, config.policy.clone(), audit);
        let capabilities = CapabilityCache::new(directory, config.policy.capability_ttl);
        Ok(Self::new(policy, engine, capabilities))
    }

    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    pub fn tracker(&self) -> &KeyLifecycleTracker {
        self.engine.tracker()
    }

    /// Проверить уровень, при необходимости понизить, и зашифровать.
    ///
    /// Если ключ для одобренного уровня получить не удалось, решение
    /// пересматривается дальше по порядку понижения. Понижение нужно
    /// показать пользователю до отправки.
    pub async fn prepare_outgoing(
        &self,
        recipient: &PeerId,
        requested: SecurityLevel,
        plaintext: &[u8],
    ) -> CryptoResult<OutgoingMessage> {
        let capability = self.capabilities.resolve(recipient).await;
        let mut decision = self.policy.evaluate(requested, &capability, plaintext.len()).await;

        // каждый пересмотр сдвигает уровень вниз, Plain ключей не требует
        let envelope = loop {
            let failure = match self
                .engine
                .encrypt(decision.approved, recipient, plaintext, capability.verified_kem_key())
                .await
            {
                Ok(envelope) => break envelope,
                Err(CryptoError::Key(failure)) => failure,
                Err(err) => return Err(err),
            };
            decision = self
                .policy
                .reevaluate(&decision, &capability, plaintext.len(), &failure)
                .await
                .ok_or(CryptoError::Key(failure))?;
        };

        info!(
            target: "policy",
            peer = %recipient,
            requested = requested.as_u8(),
            approved = decision.approved.as_u8(),
            "outgoing message prepared"
        );
        Ok(OutgoingMessage { decision, envelope })
    }

    /// Расшифровать входящий конверт
    pub async fn open_incoming(
        &self,
        envelope: &SecurityEnvelope,
        keys: &DecryptionKeys,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        self.engine.decrypt(envelope, keys).await
    }

    /// Вернуть незавершённые резервирования перед выходом процесса.
    pub async fn shutdown(&self) -> usize {
        self.tracker().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::key_pool::KeyPool;
    use crate::policy::{DecisionReason, InMemoryDirectory, PeerCapability};
    use crate::storage::MemoryAuditLog;

    #[tokio::test]
    async fn test_downgraded_send_is_reported() {
        let mut config = Config::default();
        config.pool = PoolConfig {
            otp_bytes_per_peer: 0,
            ..PoolConfig::default()
        };
        config.policy.sign_pqc_messages = false;

        let pool = Arc::new(KeyPool::new(config.pool.clone()));
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register(PeerCapability::new(PeerId::new("bob"), SecurityLevel::ALL));
        let audit = Arc::new(MemoryAuditLog::new());

        let messenger = SecureMessenger::from_config(&config, pool, directory, audit.clone()).unwrap();
        let out = messenger
            .prepare_outgoing(&PeerId::new("bob"), SecurityLevel::Otp, b"hello bob")
            .await
            .unwrap();

        assert_eq!(out.decision.approved, SecurityLevel::Aes);
        assert_eq!(out.decision.reason, DecisionReason::OtpPoolInsufficient);
        assert_eq!(out.envelope.security_level, SecurityLevel::Aes);
        assert_eq!(audit.len(), 1);

        let pt = messenger.open_incoming(&out.envelope, &DecryptionKeys::none()).await.unwrap();
        assert_eq!(pt.as_slice(), b"hello bob");
    }
}
