use crate::domain::{TierId, UserAccount};
use crate::infrastructure::{RepositoryError, UserRepository};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("user not found: {0}")]
    NotFound(Uuid),
    #[error("email already registered")]
    EmailInUse,
    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl From<RepositoryError> for AccountError {
    fn from(err: RepositoryError) -> Self {
        if let RepositoryError::Database(sqlx::Error::Database(db)) = &err {
            if db.code().as_deref() == Some("23505") {
                return AccountError::EmailInUse;
            }
        }
        AccountError::Repository(err)
    }
}

/// Account lifecycle: sign-up, lookup, tier changes.
pub struct Accounts<U: UserRepository> {
    users: Arc<U>,
}

impl<U: UserRepository> Accounts<U> {
    pub fn new(users: Arc<U>) -> Self {
        Self { users }
    }

    pub async fn sign_up(
        &self,
        email: String,
        display_name: String,
    ) -> Result<UserAccount, AccountError> {
        let user = UserAccount::new(email, display_name);
        self.users.create(&user).await?;
        info!(user_id = %user.id, "Account created");
        Ok(user)
    }

    pub async fn get(&self, user_id: Uuid) -> Result<UserAccount, AccountError> {
        self.users.get_by_id(user_id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => AccountError::NotFound(user_id),
            other => other.into(),
        })
    }

    /// Move an account to another tier. Transient storage failures (dropped
    /// connection, pool timeout) get exactly one retry; anything permanent
    /// propagates immediately.
    pub async fn change_tier(
        &self,
        user_id: Uuid,
        tier: TierId,
    ) -> Result<UserAccount, AccountError> {
        match self.users.update_tier(user_id, tier).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(user_id = %user_id, error = %e,
                    "Transient storage error during tier change, retrying once");
                self.users
                    .update_tier(user_id, tier)
                    .await
                    .map_err(AccountError::from)?;
            }
            Err(RepositoryError::NotFound(_)) => return Err(AccountError::NotFound(user_id)),
            Err(e) => return Err(e.into()),
        }

        info!(user_id = %user_id, tier = %tier, "Tier changed");
        self.get(user_id).await
    }
}
