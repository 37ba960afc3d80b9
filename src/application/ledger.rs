use crate::domain::{tier, Quota, TierId, UsageLevel, UserAccount};
use crate::infrastructure::{RepositoryError, UserRepository};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("unknown user: {0}")]
    UnknownUser(Uuid),
    #[error("usage store unavailable")]
    Unavailable(#[source] RepositoryError),
}

impl LedgerError {
    fn from_repo(user_id: Uuid, err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(_) => LedgerError::UnknownUser(user_id),
            other => LedgerError::Unavailable(other),
        }
    }
}

/// Outcome of a usage check, also the payload for usage screens.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStatus {
    pub allowed: bool,
    pub used: u32,
    pub quota: Quota,
    pub tier: TierId,
    pub level: UsageLevel,
}

impl UsageStatus {
    pub fn for_user(user: &UserAccount) -> Self {
        let quota = tier(user.tier).monthly_conversation_quota;
        let used = user.monthly_conversation_count.max(0) as u32;
        Self {
            allowed: quota.allows(used),
            used,
            quota,
            tier: user.tier,
            level: UsageLevel::from_quota(quota, used),
        }
    }
}

/// Per-user monthly conversation counters. The monthly reset is lazy: it
/// happens as a side effect of `check`, exactly once per month boundary,
/// with no background job.
pub struct UsageLedger<U: UserRepository> {
    users: Arc<U>,
}

impl<U: UserRepository> UsageLedger<U> {
    pub fn new(users: Arc<U>) -> Self {
        Self { users }
    }

    /// Roll the window over if needed, then evaluate the allow decision.
    /// Storage failures surface as `Unavailable` — never a silent allow.
    pub async fn check(&self, user_id: Uuid) -> Result<UsageStatus, LedgerError> {
        let now = Utc::now();
        let rolled = self
            .users
            .rollover_if_stale(user_id, now)
            .await
            .map_err(|e| LedgerError::from_repo(user_id, e))?;
        if rolled {
            info!(user_id = %user_id, "Monthly usage window rolled over");
        }

        let user = self
            .users
            .get_by_id(user_id)
            .await
            .map_err(|e| LedgerError::from_repo(user_id, e))?;

        Ok(UsageStatus::for_user(&user))
    }

    /// Count one accepted conversation. No-op on unlimited tiers; otherwise a
    /// single atomic storage-side increment. Call at most once per turn.
    pub async fn increment(&self, user_id: Uuid) -> Result<(), LedgerError> {
        let user = self
            .users
            .get_by_id(user_id)
            .await
            .map_err(|e| LedgerError::from_repo(user_id, e))?;

        if tier(user.tier).monthly_conversation_quota.is_unlimited() {
            return Ok(());
        }

        let count = self
            .users
            .increment_usage(user_id)
            .await
            .map_err(|e| LedgerError::from_repo(user_id, e))?;
        debug!(user_id = %user_id, count, "Usage counter incremented");
        Ok(())
    }

    /// Administrative override: zero the counter and restart the window now.
    pub async fn reset(&self, user_id: Uuid) -> Result<(), LedgerError> {
        self.users
            .reset_usage(user_id, Utc::now())
            .await
            .map_err(|e| LedgerError::from_repo(user_id, e))?;
        info!(user_id = %user_id, "Usage counter reset by admin");
        Ok(())
    }
}
