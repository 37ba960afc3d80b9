use crate::domain::tier::TierId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Member,
    SuperAdmin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAccount {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: UserRole,
    pub tier: TierId,
    /// Conversations started in the current counting window.
    pub monthly_conversation_count: i32,
    /// Start of the current counting window; the ledger rolls this forward
    /// lazily when a check lands in a later calendar month.
    pub last_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(email: String, display_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email,
            display_name,
            role: UserRole::Member,
            tier: TierId::Free,
            monthly_conversation_count: 0,
            last_reset_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `last_reset_at` belongs to a calendar month before `now`.
    pub fn needs_monthly_rollover(&self, now: DateTime<Utc>) -> bool {
        let reset = self.last_reset_at;
        (reset.format("%Y-%m").to_string()) < (now.format("%Y-%m").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_accounts_start_on_free_tier_with_zero_usage() {
        let user = UserAccount::new("a@b.test".into(), "A".into());
        assert_eq!(user.tier, TierId::Free);
        assert_eq!(user.role, UserRole::Member);
        assert_eq!(user.monthly_conversation_count, 0);
    }

    #[test]
    fn rollover_triggers_only_across_calendar_months() {
        let mut user = UserAccount::new("a@b.test".into(), "A".into());
        user.last_reset_at = Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 0).unwrap();

        // Same month, later day: no rollover.
        let same_month = Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 30).unwrap();
        assert!(!user.needs_monthly_rollover(same_month));

        // Next month, even one minute in: rollover.
        let next_month = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 30).unwrap();
        assert!(user.needs_monthly_rollover(next_month));

        // Year boundary.
        user.last_reset_at = Utc.with_ymd_and_hms(2025, 12, 15, 12, 0, 0).unwrap();
        let next_year = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        assert!(user.needs_monthly_rollover(next_year));
    }
}
