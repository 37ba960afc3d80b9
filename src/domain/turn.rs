use crate::domain::provider::ProviderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum TurnError {
    #[error("response for {0} already settled")]
    AlreadySettled(ProviderId),
    #[error("a response cannot settle back to pending")]
    SettleToPending,
    #[error("no response slot for provider {0} in this turn")]
    UnknownProvider(ProviderId),
    #[error("turn is still collecting responses")]
    StillCollecting,
    #[error("response from {0} is not selectable")]
    NotSelectable(ProviderId),
    #[error("invalid turn transition: {from} + {event}")]
    InvalidTransition { from: TurnPhase, event: &'static str },
}

/// Lifecycle of one provider response slot. Advances pending -> settled
/// exactly once and never reverts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResponseState {
    Pending,
    Success { content: String },
    Error { message: String },
}

impl ResponseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ResponseState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseState::Pending => "pending",
            ResponseState::Success { .. } => "success",
            ResponseState::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderResponse {
    pub provider: ProviderId,
    pub model: String,
    pub state: ResponseState,
    pub selected: bool,
    pub settled_at: Option<DateTime<Utc>>,
}

impl ProviderResponse {
    pub fn pending(provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            state: ResponseState::Pending,
            selected: false,
            settled_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !self.state.is_pending()
    }

    /// One-shot transition out of `Pending`.
    pub fn settle(&mut self, state: ResponseState, now: DateTime<Utc>) -> Result<(), TurnError> {
        if state.is_pending() {
            return Err(TurnError::SettleToPending);
        }
        if self.is_settled() {
            return Err(TurnError::AlreadySettled(self.provider));
        }
        self.state = state;
        self.settled_at = Some(now);
        Ok(())
    }
}

/// Per-turn state machine: collecting -> complete -> optionally resolved.
/// No transition ever goes back to collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Collecting,
    Complete,
    Resolved,
}

impl TurnPhase {
    /// Explicit transition function, independent of storage or rendering.
    pub fn apply(self, event: TurnPhaseEvent) -> Result<TurnPhase, TurnError> {
        match (self, event) {
            (TurnPhase::Collecting, TurnPhaseEvent::ResponseSettled { pending_left: 0 }) => {
                Ok(TurnPhase::Complete)
            }
            (TurnPhase::Collecting, TurnPhaseEvent::ResponseSettled { .. }) => {
                Ok(TurnPhase::Collecting)
            }
            (TurnPhase::Complete, TurnPhaseEvent::ResponseSelected)
            | (TurnPhase::Resolved, TurnPhaseEvent::ResponseSelected) => Ok(TurnPhase::Resolved),
            (from, event) => Err(TurnError::InvalidTransition {
                from,
                event: event.name(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhaseEvent {
    ResponseSettled { pending_left: usize },
    ResponseSelected,
}

impl TurnPhaseEvent {
    fn name(self) -> &'static str {
        match self {
            TurnPhaseEvent::ResponseSettled { .. } => "response_settled",
            TurnPhaseEvent::ResponseSelected => "response_selected",
        }
    }
}

/// Result of a selection attempt, used by the recorder to decide whether the
/// provider's selection tally should move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    /// Re-selecting the already-selected provider: counters untouched.
    Unchanged,
    /// The selected flag moved; the previous pick (if any) keeps its tally.
    Switched { previous: Option<ProviderId> },
}

/// One user prompt plus all provider responses gathered for it. The prompt
/// and response roster are immutable once persisted; settlement and
/// selection mutate individual slots afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub user_message: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Insertion order is provider invocation order.
    pub responses: Vec<ProviderResponse>,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    /// Build a turn with one pending slot per distinct provider. Duplicate
    /// provider entries keep the first occurrence.
    pub fn new(
        user_id: Uuid,
        session_id: Uuid,
        user_message: String,
        image_urls: Vec<String>,
        providers: impl IntoIterator<Item = (ProviderId, String)>,
    ) -> Self {
        let mut responses: Vec<ProviderResponse> = Vec::new();
        for (provider, model) in providers {
            if responses.iter().all(|r| r.provider != provider) {
                responses.push(ProviderResponse::pending(provider, model));
            }
        }
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id,
            user_message,
            image_urls,
            responses,
            created_at: Utc::now(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.responses.iter().filter(|r| !r.is_settled()).count()
    }

    pub fn selected_provider(&self) -> Option<ProviderId> {
        self.responses.iter().find(|r| r.selected).map(|r| r.provider)
    }

    /// Phase derived from slot state: any pending slot means collecting, a
    /// selection means resolved, otherwise complete.
    pub fn phase(&self) -> TurnPhase {
        if self.pending_count() > 0 {
            TurnPhase::Collecting
        } else if self.selected_provider().is_some() {
            TurnPhase::Resolved
        } else {
            TurnPhase::Complete
        }
    }

    /// Settle one provider slot and report the phase the turn lands in.
    pub fn settle_response(
        &mut self,
        provider: ProviderId,
        state: ResponseState,
        now: DateTime<Utc>,
    ) -> Result<TurnPhase, TurnError> {
        let phase = self.phase();
        let slot = self
            .responses
            .iter_mut()
            .find(|r| r.provider == provider)
            .ok_or(TurnError::UnknownProvider(provider))?;
        slot.settle(state, now)?;
        phase.apply(TurnPhaseEvent::ResponseSettled {
            pending_left: self.pending_count(),
        })
    }

    /// Mark exactly one response as selected. Only successful responses of a
    /// fully-settled turn are selectable; re-selecting the current pick is a
    /// no-op on the counters.
    pub fn select(&mut self, provider: ProviderId) -> Result<SelectionChange, TurnError> {
        let phase = self.phase();
        if phase == TurnPhase::Collecting {
            return Err(TurnError::StillCollecting);
        }

        let slot = self
            .responses
            .iter()
            .find(|r| r.provider == provider)
            .ok_or(TurnError::UnknownProvider(provider))?;
        if !matches!(slot.state, ResponseState::Success { .. }) {
            return Err(TurnError::NotSelectable(provider));
        }

        let previous = self.selected_provider();
        if previous == Some(provider) {
            return Ok(SelectionChange::Unchanged);
        }

        phase.apply(TurnPhaseEvent::ResponseSelected)?;
        for response in &mut self.responses {
            response.selected = response.provider == provider;
        }
        Ok(SelectionChange::Switched { previous })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_provider_turn() -> ConversationTurn {
        ConversationTurn::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "compare yourselves".to_string(),
            vec![],
            [
                (ProviderId::OpenAi, "gpt-4o".to_string()),
                (ProviderId::Gemini, "gemini-2.0-flash".to_string()),
            ],
        )
    }

    #[test]
    fn duplicate_providers_collapse_to_first_slot() {
        let turn = ConversationTurn::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "hi".to_string(),
            vec![],
            [
                (ProviderId::OpenAi, "gpt-4o".to_string()),
                (ProviderId::OpenAi, "gpt-4o-mini".to_string()),
            ],
        );
        assert_eq!(turn.responses.len(), 1);
        assert_eq!(turn.responses[0].model, "gpt-4o");
    }

    #[test]
    fn responses_settle_exactly_once() {
        let mut turn = two_provider_turn();
        let now = Utc::now();
        turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Success { content: "hello".into() },
            now,
        )
        .unwrap();

        let again = turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Error { message: "late".into() },
            now,
        );
        assert_eq!(again, Err(TurnError::AlreadySettled(ProviderId::OpenAi)));
        // The original success is untouched.
        assert!(matches!(
            turn.responses[0].state,
            ResponseState::Success { .. }
        ));
    }

    #[test]
    fn phase_advances_collecting_complete_resolved() {
        let mut turn = two_provider_turn();
        let now = Utc::now();
        assert_eq!(turn.phase(), TurnPhase::Collecting);

        let phase = turn
            .settle_response(
                ProviderId::OpenAi,
                ResponseState::Success { content: "a".into() },
                now,
            )
            .unwrap();
        assert_eq!(phase, TurnPhase::Collecting);

        let phase = turn
            .settle_response(
                ProviderId::Gemini,
                ResponseState::Error { message: "boom".into() },
                now,
            )
            .unwrap();
        assert_eq!(phase, TurnPhase::Complete);

        turn.select(ProviderId::OpenAi).unwrap();
        assert_eq!(turn.phase(), TurnPhase::Resolved);
    }

    #[test]
    fn selection_rejected_while_collecting() {
        let mut turn = two_provider_turn();
        let now = Utc::now();
        turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Success { content: "a".into() },
            now,
        )
        .unwrap();

        assert_eq!(turn.select(ProviderId::OpenAi), Err(TurnError::StillCollecting));
    }

    #[test]
    fn errored_responses_are_not_selectable() {
        let mut turn = two_provider_turn();
        let now = Utc::now();
        turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Success { content: "a".into() },
            now,
        )
        .unwrap();
        turn.settle_response(
            ProviderId::Gemini,
            ResponseState::Error { message: "down".into() },
            now,
        )
        .unwrap();

        assert_eq!(
            turn.select(ProviderId::Gemini),
            Err(TurnError::NotSelectable(ProviderId::Gemini))
        );
    }

    #[test]
    fn reselect_same_provider_is_unchanged_switch_keeps_single_selection() {
        let mut turn = two_provider_turn();
        let now = Utc::now();
        turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Success { content: "a".into() },
            now,
        )
        .unwrap();
        turn.settle_response(
            ProviderId::Gemini,
            ResponseState::Success { content: "b".into() },
            now,
        )
        .unwrap();

        assert_eq!(
            turn.select(ProviderId::OpenAi).unwrap(),
            SelectionChange::Switched { previous: None }
        );
        assert_eq!(
            turn.select(ProviderId::OpenAi).unwrap(),
            SelectionChange::Unchanged
        );
        assert_eq!(
            turn.select(ProviderId::Gemini).unwrap(),
            SelectionChange::Switched {
                previous: Some(ProviderId::OpenAi)
            }
        );

        let selected: Vec<_> = turn.responses.iter().filter(|r| r.selected).collect();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].provider, ProviderId::Gemini);
    }

    #[test]
    fn phase_transition_function_rejects_invalid_moves() {
        // Selecting before all slots settle is not a legal transition.
        let err = TurnPhase::Collecting.apply(TurnPhaseEvent::ResponseSelected);
        assert!(err.is_err());

        // A settled turn never goes back to collecting.
        let err = TurnPhase::Complete.apply(TurnPhaseEvent::ResponseSettled { pending_left: 1 });
        assert!(err.is_err());
    }
}
