// Модели данных для хранилища аудита

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::SecurityLevel;
use crate::policy::DecisionReason;

/// Запись о понижении уровня защиты
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub original_level: SecurityLevel,
    pub approved_level: SecurityLevel,
    pub reason: DecisionReason,
    pub timestamp: DateTime<Utc>,
}
