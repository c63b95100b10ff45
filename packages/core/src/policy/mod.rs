//! Policy engine (PE): проверяет запрошенный уровень по возможностям
//! получателя и остатку ключей и решает, до какого уровня безопасно понизить.
//!
//! Понижение никогда не бывает молчаливым: решение всегда несёт код причины,
//! а каждое понижение уходит в [`AuditSink`].

pub mod audit;
pub mod capability;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::crypto::SecurityLevel;
use crate::error::KeyError;
use crate::key_pool::{KeyPurpose, PeerId, PoolStatus};
use crate::lifecycle::KeyLifecycleTracker;

pub use audit::{AuditSink, TracingAuditSink};
pub use capability::{CapabilityCache, CapabilityDirectory, InMemoryDirectory, PeerCapability};

/// Почему был одобрен именно этот уровень
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    /// Запрошенный уровень одобрен как есть
    Approved,
    /// Получатель не поддерживает запрошенный уровень
    CapabilityMismatch,
    /// Недостаточно OTP-байт для сообщения
    OtpPoolInsufficient,
    /// Сообщение больше предела для OTP
    OtpMessageTooLarge,
    /// AES-ключи для получателя закончились
    AesKeysExhausted,
    /// Нет (проверенного) ключа инкапсуляции получателя
    RecipientKeyMissing,
    /// Менеджер ключей не ответил после повторов
    KeyManagerUnavailable,
}

impl DecisionReason {
    pub fn code(self) -> &'static str {
        match self {
            DecisionReason::Approved => "APPROVED",
            DecisionReason::CapabilityMismatch => "CAPABILITY_MISMATCH",
            DecisionReason::OtpPoolInsufficient => "OTP_POOL_INSUFFICIENT",
            DecisionReason::OtpMessageTooLarge => "OTP_MESSAGE_TOO_LARGE",
            DecisionReason::AesKeysExhausted => "AES_KEYS_EXHAUSTED",
            DecisionReason::RecipientKeyMissing => "RECIPIENT_KEY_MISSING",
            DecisionReason::KeyManagerUnavailable => "KEY_MANAGER_UNAVAILABLE",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Результат `evaluate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub requested: SecurityLevel,
    pub approved: SecurityLevel,
    pub reason: DecisionReason,
}

impl PolicyDecision {
    pub fn is_fallback(&self) -> bool {
        self.requested != self.approved
    }

    /// Сообщение для пользователя о понижении уровня
    pub fn notice(&self) -> Option<String> {
        if !self.is_fallback() {
            return None;
        }
        Some(format!(
            "Security level changed from {} to {}. This may affect the security of your communication.",
            self.requested.name(),
            self.approved.name()
        ))
    }
}

/// Кандидаты по порядку для запрошенного уровня
pub fn fallback_order(requested: SecurityLevel) -> &'static [SecurityLevel] {
    use SecurityLevel::*;
    match requested {
        Otp => &[Otp, Aes, Pqc, Plain],
        Aes => &[Aes, Pqc, Plain],
        Pqc => &[Pqc, Aes, Plain],
        Plain => &[Plain],
    }
}

pub struct PolicyEngine {
    tracker: KeyLifecycleTracker,
    config: PolicyConfig,
    audit: Arc<dyn AuditSink>,
}

impl PolicyEngine {
    pub fn new(tracker: KeyLifecycleTracker, config: PolicyConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self { tracker, config, audit }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Решить, на каком уровне отправлять `payload_size` байт получателю.
    pub async fn evaluate(
        &self,
        requested: SecurityLevel,
        recipient: &PeerCapability,
        payload_size: usize,
    ) -> PolicyDecision {
        let decision = self
            .decide(requested, fallback_order(requested), recipient, payload_size, None)
            .await;
        self.report(recipient, &decision);
        decision
    }

    /// Пересмотреть решение, если ключ для одобренного уровня получить не удалось.
    ///
    /// Снимок остатков, по которому решал `evaluate`, к моменту запроса ключа
    /// может устареть. Поиск продолжается по порядку понижения после
    /// отказавшего уровня. `None`, если ошибка не про запас ключей или
    /// понижать уже некуда.
    pub async fn reevaluate(
        &self,
        previous: &PolicyDecision,
        recipient: &PeerCapability,
        payload_size: usize,
        failure: &KeyError,
    ) -> Option<PolicyDecision> {
        let reason = match failure {
            KeyError::Exhausted {
                purpose: KeyPurpose::OtpSeed,
                ..
            } => DecisionReason::OtpPoolInsufficient,
            KeyError::Exhausted {
                purpose: KeyPurpose::AesSeed,
                ..
            } => DecisionReason::AesKeysExhausted,
            KeyError::Unavailable(_) => DecisionReason::KeyManagerUnavailable,
            _ => return None,
        };
        if previous.approved == SecurityLevel::Plain {
            return None;
        }

        warn!(
            target: "policy",
            peer = %recipient.peer_id,
            level = previous.approved.as_u8(),
            error = %failure,
            "key acquisition failed, re-evaluating"
        );
        let requested = previous.requested;
        let decision = if reason == DecisionReason::KeyManagerUnavailable {
            PolicyDecision {
                requested,
                approved: SecurityLevel::Plain,
                reason,
            }
        } else {
            let order = fallback_order(requested);
            let next = order
                .iter()
                .position(|level| *level == previous.approved)
                .map_or(order.len(), |i| i + 1);
            self.decide(requested, &order[next..], recipient, payload_size, Some(reason))
                .await
        };
        self.report(recipient, &decision);
        Some(decision)
    }

    fn report(&self, recipient: &PeerCapability, decision: &PolicyDecision) {
        if decision.is_fallback() {
            warn!(
                target: "policy",
                peer = %recipient.peer_id,
                requested = decision.requested.as_u8(),
                approved = decision.approved.as_u8(),
                reason = decision.reason.code(),
                "security level downgraded"
            );
            self.audit
                .record_fallback(decision.requested, decision.approved, decision.reason, Utc::now());
        } else {
            debug!(target: "policy", peer = %recipient.peer_id, level = decision.requested.as_u8(), "level approved");
        }
    }

    /// Первый подходящий кандидат; `rejected` объясняет понижение, если оно уже случилось.
    async fn decide(
        &self,
        requested: SecurityLevel,
        candidates: &[SecurityLevel],
        recipient: &PeerCapability,
        payload_size: usize,
        rejected: Option<DecisionReason>,
    ) -> PolicyDecision {
        let decision = |approved, reason| PolicyDecision {
            requested,
            approved,
            reason,
        };

        let needs_keys = candidates
            .iter()
            .any(|level| *level != SecurityLevel::Plain && recipient.supports(*level));
        let status = if needs_keys {
            match self.tracker.status(&recipient.peer_id).await {
                Ok(status) => Some(status),
                Err(err) => {
                    warn!(target: "policy", peer = %recipient.peer_id, error = %err, "key manager status failed");
                    return decision(SecurityLevel::Plain, DecisionReason::KeyManagerUnavailable);
                }
            }
        } else {
            None
        };

        // первый отказ объясняет понижение
        let mut reason = rejected;
        for &candidate in candidates {
            match self.check(candidate, recipient, status.as_ref(), payload_size) {
                Ok(()) => return decision(candidate, reason.unwrap_or(DecisionReason::Approved)),
                Err(rejected) => {
                    reason.get_or_insert(rejected);
                }
            }
        }
        // на практике недостижимо: Plain проходит всегда
        decision(SecurityLevel::Plain, reason.unwrap_or(DecisionReason::CapabilityMismatch))
    }

    fn check(
        &self,
        level: SecurityLevel,
        recipient: &PeerCapability,
        status: Option<&PoolStatus>,
        payload_size: usize,
    ) -> Result<(), DecisionReason> {
        if level == SecurityLevel::Plain {
            return Ok(());
        }
        if !recipient.supports(level) {
            return Err(DecisionReason::CapabilityMismatch);
        }
        let status = status.ok_or(DecisionReason::KeyManagerUnavailable)?;

        match level {
            SecurityLevel::Otp => {
                if payload_size > self.config.otp_max_message_size {
                    Err(DecisionReason::OtpMessageTooLarge)
                } else if status.available_bytes < payload_size as u64 {
                    Err(DecisionReason::OtpPoolInsufficient)
                } else {
                    Ok(())
                }
            }
            SecurityLevel::Aes => {
                if status.aes_keys_available == 0 {
                    Err(DecisionReason::AesKeysExhausted)
                } else {
                    Ok(())
                }
            }
            SecurityLevel::Pqc => {
                if recipient.verified_kem_key().is_none() {
                    Err(DecisionReason::RecipientKeyMissing)
                } else if status.aes_keys_available == 0 {
                    Err(DecisionReason::AesKeysExhausted)
                } else {
                    Ok(())
                }
            }
            SecurityLevel::Plain => Ok(()),
        }
    }
}
