use chrono::{DateTime, Utc};

use crate::crypto::SecurityLevel;
use crate::policy::DecisionReason;

/// Приёмник аудита понижений уровня.
///
/// Запись без ответа: приёмник не блокирует отправку и не может её сорвать.
pub trait AuditSink: Send + Sync {
    fn record_fallback(
        &self,
        original: SecurityLevel,
        approved: SecurityLevel,
        reason: DecisionReason,
        at: DateTime<Utc>,
    );
}

/// Пишет понижения в журнал tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_fallback(
        &self,
        original: SecurityLevel,
        approved: SecurityLevel,
        reason: DecisionReason,
        at: DateTime<Utc>,
    ) {
        tracing::info!(
            target: "policy::audit",
            original = original.as_u8(),
            approved = approved.as_u8(),
            reason = reason.code(),
            at = %at.to_rfc3339(),
            "security level fallback"
        );
    }
}
