// In-memory журнал аудита для тестов и процессов без БД

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::crypto::SecurityLevel;
use crate::policy::{AuditSink, DecisionReason};
use crate::storage::models::FallbackRecord;

/// In-memory хранилище записей о понижениях
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<FallbackRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn records_mut(&self) -> MutexGuard<'_, Vec<FallbackRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> Vec<FallbackRecord> {
        self.records_mut().clone()
    }

    /// Записи, начиная с `since` (по времени)
    pub fn records_since(&self, since: DateTime<Utc>) -> Vec<FallbackRecord> {
        self.records_mut()
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records_mut().clear();
    }
}

impl AuditSink for MemoryAuditLog {
    fn record_fallback(
        &self,
        original: SecurityLevel,
        approved: SecurityLevel,
        reason: DecisionReason,
        at: DateTime<Utc>,
    ) {
        self.records_mut().push(FallbackRecord {
            original_level: original,
            approved_level: approved,
            reason,
            timestamp: at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order() {
        let log = MemoryAuditLog::new();
        let t0 = Utc::now();
        log.record_fallback(SecurityLevel::Otp, SecurityLevel::Aes, DecisionReason::OtpPoolInsufficient, t0);
        log.record_fallback(
            SecurityLevel::Aes,
            SecurityLevel::Plain,
            DecisionReason::AesKeysExhausted,
            t0 + chrono::Duration::seconds(1),
        );

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].approved_level, SecurityLevel::Aes);
        assert_eq!(log.records_since(t0 + chrono::Duration::milliseconds(500)).len(), 1);

        log.clear();
        assert!(log.is_empty());
    }
}
