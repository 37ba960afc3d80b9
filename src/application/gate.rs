use crate::application::ledger::{LedgerError, UsageLedger, UsageStatus};
use crate::domain::{Quota, TierId};
use crate::infrastructure::UserRepository;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GateError {
    /// Real quota exhaustion: recoverable by upgrading or waiting for the
    /// monthly reset. Carries what the upgrade prompt needs.
    #[error("monthly conversation limit reached ({used}/{quota})")]
    QuotaExceeded { used: u32, quota: u32, tier: TierId },
    /// The ledger could not be consulted. Deliberately distinct from
    /// `QuotaExceeded` so the UI can say "try again" instead of "upgrade".
    #[error("usage service unavailable, try again")]
    Unavailable(#[source] LedgerError),
    #[error("unknown user: {0}")]
    UnknownUser(Uuid),
}

/// Consults the tier policy and usage ledger before a new conversation is
/// allowed. Advisory for UI purposes only — the storage layer's atomic
/// counter is the actual backstop, and this gate is not a security boundary.
pub struct TierGate<U: UserRepository> {
    ledger: Arc<UsageLedger<U>>,
}

impl<U: UserRepository> TierGate<U> {
    pub fn new(ledger: Arc<UsageLedger<U>>) -> Self {
        Self { ledger }
    }

    /// Allow or block a "start new conversation" intent. A ledger failure
    /// fails closed: the turn is blocked before any provider is called.
    pub async fn authorize(&self, user_id: Uuid) -> Result<UsageStatus, GateError> {
        let status = self.ledger.check(user_id).await.map_err(|e| match e {
            LedgerError::UnknownUser(id) => GateError::UnknownUser(id),
            other => GateError::Unavailable(other),
        })?;

        if !status.allowed {
            let quota = match status.quota {
                Quota::Limited(cap) => cap,
                // An unlimited quota always allows; this arm is unreachable.
                Quota::Unlimited => u32::MAX,
            };
            info!(
                user_id = %user_id,
                used = status.used,
                quota,
                "Conversation blocked: monthly quota exhausted"
            );
            return Err(GateError::QuotaExceeded {
                used: status.used,
                quota,
                tier: status.tier,
            });
        }

        Ok(status)
    }
}
