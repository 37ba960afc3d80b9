use crate::domain::{
    ConversationTurn, ProviderId, ResponseOutcome, SelectionChange, TurnError,
};
use crate::infrastructure::{RepositoryError, StatsRepository, TurnRepository};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("turn not found: {0}")]
    TurnNotFound(Uuid),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

/// Records which response the user picked and keeps the rolling per-provider
/// tallies. Selection counts are cumulative history: moving a pick to a
/// different provider never decrements the previous one.
pub struct SelectionRecorder<T: TurnRepository, S: StatsRepository> {
    turns: Arc<T>,
    stats: Arc<S>,
}

impl<T: TurnRepository, S: StatsRepository> SelectionRecorder<T, S> {
    pub fn new(turns: Arc<T>, stats: Arc<S>) -> Self {
        Self { turns, stats }
    }

    /// Mark exactly one response within the turn as selected. Re-selecting
    /// the same provider is idempotent: neither the turn nor any counter
    /// changes.
    pub async fn record_selection(
        &self,
        turn_id: Uuid,
        provider: ProviderId,
    ) -> Result<ConversationTurn, SelectionError> {
        let mut turn = self.turns.get_by_id(turn_id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => SelectionError::TurnNotFound(turn_id),
            other => SelectionError::Repository(other),
        })?;

        match turn.select(provider)? {
            SelectionChange::Unchanged => Ok(turn),
            SelectionChange::Switched { previous } => {
                self.turns
                    .set_selection(turn_id, provider)
                    .await
                    .map_err(SelectionError::Repository)?;
                self.stats
                    .increment_selection(provider)
                    .await
                    .map_err(SelectionError::Repository)?;
                info!(
                    turn_id = %turn_id,
                    provider = %provider,
                    previous = ?previous,
                    "Response selected"
                );
                Ok(turn)
            }
        }
    }

    /// Tally one settled provider response. Called exactly once per response,
    /// whether or not it is later selected.
    pub async fn record_response_settled(
        &self,
        provider: ProviderId,
        outcome: ResponseOutcome,
    ) -> Result<(), SelectionError> {
        self.stats
            .record_settlement(provider, outcome == ResponseOutcome::Error, Utc::now())
            .await
            .map_err(SelectionError::Repository)
    }
}
