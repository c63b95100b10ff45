// Работа со временем

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `at + ttl` с насыщением вместо паники на абсурдных длительностях.
pub fn expiry_after(at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
