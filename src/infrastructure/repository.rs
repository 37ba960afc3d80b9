use crate::domain::{
    ConversationTurn, ProviderId, ProviderResponse, ProviderStatistic, ResponseState, TierId,
    UserAccount, UserRole,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl RepositoryError {
    /// Connection-class failures worth one retry at the call site. Missing
    /// rows, constraint violations, and decode errors are permanent and are
    /// never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            RepositoryError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &UserAccount) -> Result<(), RepositoryError>;
    async fn get_by_id(&self, id: Uuid) -> Result<UserAccount, RepositoryError>;
    async fn get_by_email(&self, email: &str) -> Result<UserAccount, RepositoryError>;
    async fn update_tier(&self, id: Uuid, tier: TierId) -> Result<(), RepositoryError>;
    /// Atomic single-statement increment; returns the new count. The counter
    /// is never read-modify-written in application code.
    async fn increment_usage(&self, id: Uuid) -> Result<i32, RepositoryError>;
    /// Unconditional administrative reset.
    async fn reset_usage(&self, id: Uuid, reset_at: DateTime<Utc>) -> Result<(), RepositoryError>;
    /// Zero the counter only if `last_reset_at` falls in a calendar month
    /// before `now`. The condition lives in the statement so concurrent
    /// checks reset at most once. Returns whether a reset happened.
    async fn rollover_if_stale(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait TurnRepository: Send + Sync {
    async fn create(&self, turn: &ConversationTurn) -> Result<(), RepositoryError>;
    async fn get_by_id(&self, id: Uuid) -> Result<ConversationTurn, RepositoryError>;
    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ConversationTurn>, RepositoryError>;
    /// Persist a settlement. The `state = 'pending'` predicate keeps the
    /// settle-once invariant at the storage layer too.
    async fn update_response(
        &self,
        turn_id: Uuid,
        response: &ProviderResponse,
    ) -> Result<(), RepositoryError>;
    async fn set_selection(
        &self,
        turn_id: Uuid,
        provider: ProviderId,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn record_settlement(
        &self,
        provider: ProviderId,
        is_error: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
    async fn increment_selection(&self, provider: ProviderId) -> Result<(), RepositoryError>;
    async fn get(&self, provider: ProviderId) -> Result<ProviderStatistic, RepositoryError>;
    async fn list(&self) -> Result<Vec<ProviderStatistic>, RepositoryError>;
}

#[async_trait]
pub trait ProviderKeyRepository: Send + Sync {
    async fn upsert(
        &self,
        user_id: Uuid,
        provider: ProviderId,
        encrypted_key: &[u8],
    ) -> Result<(), RepositoryError>;
    async fn get(
        &self,
        user_id: Uuid,
        provider: ProviderId,
    ) -> Result<Option<Vec<u8>>, RepositoryError>;
    async fn delete(&self, user_id: Uuid, provider: ProviderId) -> Result<(), RepositoryError>;
}

pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create(&self, user: &UserAccount) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO user_accounts
                (id, email, display_name, role, tier, monthly_conversation_count,
                 last_reset_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.role.to_string())
        .bind(user.tier.to_string())
        .bind(user.monthly_conversation_count)
        .bind(user.last_reset_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<UserAccount, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, email, display_name, role, tier, monthly_conversation_count,
                   last_reset_at, created_at, updated_at
            FROM user_accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("User {}", id)),
            _ => RepositoryError::Database(e),
        })?;

        row_to_user(&row)
    }

    async fn get_by_email(&self, email: &str) -> Result<UserAccount, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, email, display_name, role, tier, monthly_conversation_count,
                   last_reset_at, created_at, updated_at
            FROM user_accounts
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("User {}", email)),
            _ => RepositoryError::Database(e),
        })?;

        row_to_user(&row)
    }

    async fn update_tier(&self, id: Uuid, tier: TierId) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE user_accounts
            SET tier = $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(tier.to_string())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("User {}", id)));
        }
        Ok(())
    }

    async fn increment_usage(&self, id: Uuid) -> Result<i32, RepositoryError> {
        let row = sqlx::query(
            r#"
            UPDATE user_accounts
            SET monthly_conversation_count = monthly_conversation_count + 1,
                updated_at = now()
            WHERE id = $1
            RETURNING monthly_conversation_count
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("User {}", id)),
            _ => RepositoryError::Database(e),
        })?;

        Ok(row.try_get("monthly_conversation_count")?)
    }

    async fn reset_usage(&self, id: Uuid, reset_at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE user_accounts
            SET monthly_conversation_count = 0, last_reset_at = $1, updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(reset_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("User {}", id)));
        }
        Ok(())
    }

    async fn rollover_if_stale(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE user_accounts
            SET monthly_conversation_count = 0, last_reset_at = $1, updated_at = $1
            WHERE id = $2
              AND date_trunc('month', last_reset_at) < date_trunc('month', $1::timestamptz)
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> Result<UserAccount, RepositoryError> {
    let role_str: String = row.try_get("role")?;
    let tier_str: String = row.try_get("tier")?;

    Ok(UserAccount {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        role: UserRole::from_str(&role_str)
            .map_err(|_| RepositoryError::InvalidData(format!("Unknown role: {}", role_str)))?,
        tier: TierId::from_str(&tier_str)
            .map_err(|_| RepositoryError::InvalidData(format!("Unknown tier: {}", tier_str)))?,
        monthly_conversation_count: row.try_get("monthly_conversation_count")?,
        last_reset_at: row.try_get("last_reset_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct PostgresTurnRepository {
    pool: PgPool,
}

impl PostgresTurnRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_responses(
        &self,
        turn_id: Uuid,
    ) -> Result<Vec<ProviderResponse>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT provider, model, state, content, error_message, selected, settled_at
            FROM turn_responses
            WHERE turn_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(turn_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_response).collect()
    }
}

#[async_trait]
impl TurnRepository for PostgresTurnRepository {
    async fn create(&self, turn: &ConversationTurn) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversation_turns
                (id, session_id, user_id, user_message, image_urls, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(turn.id)
        .bind(turn.session_id)
        .bind(turn.user_id)
        .bind(&turn.user_message)
        .bind(&turn.image_urls)
        .bind(turn.created_at)
        .execute(&mut *tx)
        .await?;

        for (position, response) in turn.responses.iter().enumerate() {
            let (content, error_message) = response_columns(&response.state);
            sqlx::query(
                r#"
                INSERT INTO turn_responses
                    (turn_id, provider, model, state, content, error_message,
                     selected, settled_at, position)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(turn.id)
            .bind(response.provider.to_string())
            .bind(&response.model)
            .bind(response.state.as_str())
            .bind(content)
            .bind(error_message)
            .bind(response.selected)
            .bind(response.settled_at)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<ConversationTurn, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, user_id, user_message, image_urls, created_at
            FROM conversation_turns
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("Turn {}", id)),
            _ => RepositoryError::Database(e),
        })?;

        let responses = self.load_responses(id).await?;
        row_to_turn(&row, responses)
    }

    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, user_id, user_message, image_urls, created_at
            FROM conversation_turns
            WHERE session_id = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let responses = self.load_responses(id).await?;
            turns.push(row_to_turn(row, responses)?);
        }
        Ok(turns)
    }

    async fn update_response(
        &self,
        turn_id: Uuid,
        response: &ProviderResponse,
    ) -> Result<(), RepositoryError> {
        let (content, error_message) = response_columns(&response.state);
        let result = sqlx::query(
            r#"
            UPDATE turn_responses
            SET state = $1, content = $2, error_message = $3, settled_at = $4
            WHERE turn_id = $5 AND provider = $6 AND state = 'pending'
            "#,
        )
        .bind(response.state.as_str())
        .bind(content)
        .bind(error_message)
        .bind(response.settled_at)
        .bind(turn_id)
        .bind(response.provider.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!(
                "Pending response for {} in turn {}",
                response.provider, turn_id
            )));
        }
        Ok(())
    }

    async fn set_selection(
        &self,
        turn_id: Uuid,
        provider: ProviderId,
    ) -> Result<(), RepositoryError> {
        // One statement flips the chosen row on and every sibling off.
        let result = sqlx::query(
            r#"
            UPDATE turn_responses
            SET selected = (provider = $1)
            WHERE turn_id = $2
            "#,
        )
        .bind(provider.to_string())
        .bind(turn_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("Turn {}", turn_id)));
        }
        Ok(())
    }
}

fn response_columns(state: &ResponseState) -> (Option<&str>, Option<&str>) {
    match state {
        ResponseState::Pending => (None, None),
        ResponseState::Success { content } => (Some(content.as_str()), None),
        ResponseState::Error { message } => (None, Some(message.as_str())),
    }
}

fn row_to_response(row: &sqlx::postgres::PgRow) -> Result<ProviderResponse, RepositoryError> {
    let provider_str: String = row.try_get("provider")?;
    let state_str: String = row.try_get("state")?;
    let content: Option<String> = row.try_get("content")?;
    let error_message: Option<String> = row.try_get("error_message")?;

    let state = match state_str.as_str() {
        "pending" => ResponseState::Pending,
        "success" => ResponseState::Success {
            content: content.unwrap_or_default(),
        },
        "error" => ResponseState::Error {
            message: error_message.unwrap_or_default(),
        },
        other => {
            return Err(RepositoryError::InvalidData(format!(
                "Unknown response state: {}",
                other
            )))
        }
    };

    Ok(ProviderResponse {
        provider: ProviderId::from_str(&provider_str).map_err(|_| {
            RepositoryError::InvalidData(format!("Unknown provider: {}", provider_str))
        })?,
        model: row.try_get("model")?,
        state,
        selected: row.try_get("selected")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn row_to_turn(
    row: &sqlx::postgres::PgRow,
    responses: Vec<ProviderResponse>,
) -> Result<ConversationTurn, RepositoryError> {
    Ok(ConversationTurn {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        user_message: row.try_get("user_message")?,
        image_urls: row.try_get("image_urls")?,
        responses,
        created_at: row.try_get("created_at")?,
    })
}

pub struct PostgresStatsRepository {
    pool: PgPool,
}

impl PostgresStatsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatsRepository for PostgresStatsRepository {
    async fn record_settlement(
        &self,
        provider: ProviderId,
        is_error: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO provider_stats
                (provider, total_responses, total_selections, error_count, last_used_at)
            VALUES ($1, 1, 0, $2, $3)
            ON CONFLICT (provider) DO UPDATE
            SET total_responses = provider_stats.total_responses + 1,
                error_count = provider_stats.error_count + $2,
                last_used_at = $3
            "#,
        )
        .bind(provider.to_string())
        .bind(if is_error { 1i64 } else { 0i64 })
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_selection(&self, provider: ProviderId) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO provider_stats
                (provider, total_responses, total_selections, error_count)
            VALUES ($1, 0, 1, 0)
            ON CONFLICT (provider) DO UPDATE
            SET total_selections = provider_stats.total_selections + 1
            "#,
        )
        .bind(provider.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, provider: ProviderId) -> Result<ProviderStatistic, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT provider, total_responses, total_selections, error_count, last_used_at
            FROM provider_stats
            WHERE provider = $1
            "#,
        )
        .bind(provider.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_statistic(&row),
            None => Ok(ProviderStatistic::empty(provider)),
        }
    }

    async fn list(&self) -> Result<Vec<ProviderStatistic>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT provider, total_responses, total_selections, error_count, last_used_at
            FROM provider_stats
            ORDER BY provider ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_statistic).collect()
    }
}

fn row_to_statistic(row: &sqlx::postgres::PgRow) -> Result<ProviderStatistic, RepositoryError> {
    let provider_str: String = row.try_get("provider")?;

    Ok(ProviderStatistic {
        provider: ProviderId::from_str(&provider_str).map_err(|_| {
            RepositoryError::InvalidData(format!("Unknown provider: {}", provider_str))
        })?,
        total_responses: row.try_get("total_responses")?,
        total_selections: row.try_get("total_selections")?,
        error_count: row.try_get("error_count")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

pub struct PostgresProviderKeyRepository {
    pool: PgPool,
}

impl PostgresProviderKeyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderKeyRepository for PostgresProviderKeyRepository {
    async fn upsert(
        &self,
        user_id: Uuid,
        provider: ProviderId,
        encrypted_key: &[u8],
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO provider_keys (user_id, provider, api_key_encrypted, created_at, updated_at)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (user_id, provider) DO UPDATE
            SET api_key_encrypted = $3, updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(provider.to_string())
        .bind(encrypted_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(
        &self,
        user_id: Uuid,
        provider: ProviderId,
    ) -> Result<Option<Vec<u8>>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT api_key_encrypted
            FROM provider_keys
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("api_key_encrypted")?),
            None => None,
        })
    }

    async fn delete(&self, user_id: Uuid, provider: ProviderId) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            DELETE FROM provider_keys
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
