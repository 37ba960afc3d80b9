use crate::application::gate::{GateError, TierGate};
use crate::application::keys::ApiKeyResolver;
use crate::application::ledger::{LedgerError, UsageLedger};
use crate::application::selection::SelectionRecorder;
use crate::domain::{
    tier, ChatMessage, ConversationTurn, ProviderId, ProviderResponse, ResponseOutcome,
    ResponseState, TurnPhase,
};
use crate::infrastructure::{
    CompletionRequest, ProviderError, ProviderKeyRepository, ProviderRegistry, RepositoryError,
    StatsRepository, TurnRepository, UserRepository,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How many prior turns are replayed to each provider as context.
const HISTORY_TURN_LIMIT: i64 = 20;

const UPDATE_CHANNEL_CAPACITY: usize = 32;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("no providers requested")]
    NoProviders,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// One provider the caller wants in the comparison; `model` falls back to
/// the provider's configured default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderChoice {
    pub provider: ProviderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub message: String,
    pub image_urls: Vec<String>,
    pub providers: Vec<ProviderChoice>,
}

/// Incremental updates published as provider calls settle. There is no
/// cross-provider ordering: first settled, first emitted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnUpdate {
    TurnCreated {
        turn_id: Uuid,
        providers: Vec<ProviderId>,
    },
    ResponseSettled {
        turn_id: Uuid,
        response: ProviderResponse,
    },
    TurnCompleted {
        turn_id: Uuid,
        phase: TurnPhase,
    },
}

pub struct TurnStream {
    pub turn_id: Uuid,
    pub updates: mpsc::Receiver<TurnUpdate>,
}

/// Fans a prompt out to every requested provider concurrently. Each spawned
/// task owns exactly one response slot; a supervising drainer merges
/// settlements back into the turn, persists them, updates statistics, and
/// publishes them to the caller. A failed provider never blocks or cancels
/// its siblings, and nothing is retried.
pub struct Aggregator<U, T, S, K>
where
    U: UserRepository + 'static,
    T: TurnRepository + 'static,
    S: StatsRepository + 'static,
    K: ProviderKeyRepository + 'static,
{
    registry: Arc<ProviderRegistry>,
    gate: Arc<TierGate<U>>,
    ledger: Arc<UsageLedger<U>>,
    turns: Arc<T>,
    recorder: Arc<SelectionRecorder<T, S>>,
    keys: Arc<ApiKeyResolver<K>>,
    call_timeout: Duration,
    /// One in-flight turn per session; submitting a newer prompt cancels the
    /// previous turn so stale settlements cannot leak into the new one.
    in_flight: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl<U, T, S, K> Aggregator<U, T, S, K>
where
    U: UserRepository + 'static,
    T: TurnRepository + 'static,
    S: StatsRepository + 'static,
    K: ProviderKeyRepository + 'static,
{
    pub fn new(
        registry: Arc<ProviderRegistry>,
        gate: Arc<TierGate<U>>,
        ledger: Arc<UsageLedger<U>>,
        turns: Arc<T>,
        recorder: Arc<SelectionRecorder<T, S>>,
        keys: Arc<ApiKeyResolver<K>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            gate,
            ledger,
            turns,
            recorder,
            keys,
            call_timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Gate, persist, count, then fan out. Returns as soon as the turn exists
    /// so the caller can render responses as they arrive.
    pub async fn submit(&self, request: PromptRequest) -> Result<TurnStream, AggregateError> {
        let status = self.gate.authorize(request.user_id).await?;

        // Dedup (first occurrence wins), then silently truncate to the
        // tier's providers-per-comparison cap.
        let mut choices: Vec<ProviderChoice> = Vec::new();
        for choice in request.providers {
            if choices.iter().all(|c| c.provider != choice.provider) {
                choices.push(choice);
            }
        }
        let cap = tier(status.tier).max_providers_per_comparison;
        if choices.len() > cap.cap(choices.len()) {
            debug!(
                requested = choices.len(),
                kept = cap.cap(choices.len()),
                "Provider list truncated to tier cap"
            );
        }
        choices.truncate(cap.cap(choices.len()));
        if choices.is_empty() {
            return Err(AggregateError::NoProviders);
        }

        let roster: Vec<(ProviderId, String)> = choices
            .iter()
            .map(|c| {
                let model = c.model.clone().unwrap_or_else(|| {
                    self.registry
                        .get(c.provider)
                        .map(|client| client.default_model().to_string())
                        .unwrap_or_default()
                });
                (c.provider, model)
            })
            .collect();

        let history = Arc::new(self.session_history(request.session_id).await?);

        let turn = ConversationTurn::new(
            request.user_id,
            request.session_id,
            request.message.clone(),
            request.image_urls.clone(),
            roster,
        );
        self.turns.create(&turn).await?;
        self.ledger.increment(request.user_id).await?;
        info!(
            turn_id = %turn.id,
            session_id = %request.session_id,
            providers = turn.responses.len(),
            "Turn created, fanning out"
        );

        let token = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(previous) = in_flight.insert(request.session_id, token.clone()) {
                previous.cancel();
            }
        }

        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let _ = tx
            .send(TurnUpdate::TurnCreated {
                turn_id: turn.id,
                providers: turn.responses.iter().map(|r| r.provider).collect(),
            })
            .await;

        let prompt = Arc::new(request.message);
        let images = Arc::new(request.image_urls);

        let mut calls: JoinSet<Option<(ProviderId, ResponseState)>> = JoinSet::new();
        for response in &turn.responses {
            calls.spawn(Self::call_provider(
                self.registry.get(response.provider),
                self.keys.clone(),
                request.user_id,
                response.provider,
                response.model.clone(),
                prompt.clone(),
                images.clone(),
                history.clone(),
                self.call_timeout,
                token.clone(),
            ));
        }

        let turn_id = turn.id;
        tokio::spawn(Self::drain_settlements(
            calls,
            turn,
            self.turns.clone(),
            self.recorder.clone(),
            tx,
            token,
            self.in_flight.clone(),
        ));

        Ok(TurnStream {
            turn_id,
            updates: rx,
        })
    }

    /// Cancel the in-flight turn for a session, e.g. when the user leaves
    /// the chat view. Already-settled responses keep their state; pending
    /// slots simply never settle.
    pub fn cancel_session(&self, session_id: Uuid) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap();
        match in_flight.remove(&session_id) {
            Some(token) => {
                token.cancel();
                info!(session_id = %session_id, "In-flight turn cancelled");
                true
            }
            None => false,
        }
    }

    async fn session_history(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let turns = self
            .turns
            .list_by_session(session_id, HISTORY_TURN_LIMIT)
            .await?;

        let mut messages = Vec::new();
        for turn in &turns {
            messages.push(ChatMessage::user(turn.user_message.clone()));
            if let Some(content) = best_answer(turn) {
                messages.push(ChatMessage::assistant(content));
            }
        }
        Ok(messages)
    }

    /// One provider call owning one response slot. Returns `None` when the
    /// turn was cancelled before the call settled.
    #[allow(clippy::too_many_arguments)]
    async fn call_provider(
        client: Option<Arc<dyn crate::infrastructure::ProviderClient>>,
        keys: Arc<ApiKeyResolver<K>>,
        user_id: Uuid,
        provider: ProviderId,
        model: String,
        prompt: Arc<String>,
        images: Arc<Vec<String>>,
        history: Arc<Vec<ChatMessage>>,
        call_timeout: Duration,
        token: CancellationToken,
    ) -> Option<(ProviderId, ResponseState)> {
        let client = match client {
            Some(client) => client,
            None => {
                return Some((
                    provider,
                    ResponseState::Error {
                        message: ProviderError::NotConfigured.user_message(),
                    },
                ))
            }
        };

        let api_key = match keys.resolve(user_id, provider).await {
            Some(key) => key,
            None => {
                return Some((
                    provider,
                    ResponseState::Error {
                        message: ProviderError::NotConfigured.user_message(),
                    },
                ))
            }
        };

        let call = client.complete(
            &api_key,
            CompletionRequest {
                model: &model,
                history: &history,
                prompt: &prompt,
                image_urls: &images,
            },
        );

        let state = tokio::select! {
            _ = token.cancelled() => return None,
            outcome = tokio::time::timeout(call_timeout, call) => match outcome {
                Err(_) => ResponseState::Error {
                    message: ProviderError::Timeout.user_message(),
                },
                Ok(Ok(content)) => ResponseState::Success { content },
                Ok(Err(e)) => {
                    warn!(provider = %provider, error = %e, "Provider call failed");
                    ResponseState::Error {
                        message: e.user_message(),
                    }
                }
            },
        };

        Some((provider, state))
    }

    /// Merge settlements into the turn as they arrive: persist, tally,
    /// publish. Stops emitting and persisting the moment the turn is
    /// cancelled.
    async fn drain_settlements(
        mut calls: JoinSet<Option<(ProviderId, ResponseState)>>,
        mut turn: ConversationTurn,
        turns: Arc<T>,
        recorder: Arc<SelectionRecorder<T, S>>,
        tx: mpsc::Sender<TurnUpdate>,
        token: CancellationToken,
        in_flight: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    ) {
        while let Some(joined) = calls.join_next().await {
            if token.is_cancelled() {
                break;
            }

            let (provider, state) = match joined {
                Ok(Some(settled)) => settled,
                Ok(None) => continue,
                Err(e) => {
                    error!(turn_id = %turn.id, error = %e, "Provider task panicked");
                    continue;
                }
            };

            let outcome = match state {
                ResponseState::Success { .. } => ResponseOutcome::Success,
                _ => ResponseOutcome::Error,
            };

            let phase = match turn.settle_response(provider, state, Utc::now()) {
                Ok(phase) => phase,
                Err(e) => {
                    warn!(turn_id = %turn.id, provider = %provider, error = %e,
                        "Dropping invalid settlement");
                    continue;
                }
            };

            let Some(response) = turn
                .responses
                .iter()
                .find(|r| r.provider == provider)
                .cloned()
            else {
                continue;
            };

            if let Err(e) = turns.update_response(turn.id, &response).await {
                error!(turn_id = %turn.id, provider = %provider, error = %e,
                    "Failed to persist settlement");
            }
            if let Err(e) = recorder.record_response_settled(provider, outcome).await {
                warn!(provider = %provider, error = %e, "Failed to update provider stats");
            }

            let _ = tx
                .send(TurnUpdate::ResponseSettled {
                    turn_id: turn.id,
                    response,
                })
                .await;

            if phase == TurnPhase::Complete {
                debug!(turn_id = %turn.id, "All providers settled");
                let _ = tx
                    .send(TurnUpdate::TurnCompleted {
                        turn_id: turn.id,
                        phase,
                    })
                    .await;
            }
        }

        if token.is_cancelled() {
            calls.abort_all();
            debug!(turn_id = %turn.id, "Turn cancelled, remaining calls aborted");
        }

        // Deregister unless a newer turn already replaced this one (its
        // submit cancels our token under the same lock, so the check is
        // race-free).
        let mut in_flight = in_flight.lock().unwrap();
        if !token.is_cancelled() {
            in_flight.remove(&turn.session_id);
        }
    }
}

/// The assistant message replayed as context for a past turn: the selected
/// response if there is one, otherwise the first successful response.
fn best_answer(turn: &ConversationTurn) -> Option<String> {
    let pick = turn
        .responses
        .iter()
        .find(|r| r.selected)
        .or_else(|| {
            turn.responses
                .iter()
                .find(|r| matches!(r.state, ResponseState::Success { .. }))
        })?;

    match &pick.state {
        ResponseState::Success { content } => Some(content.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled_turn() -> ConversationTurn {
        let mut turn = ConversationTurn::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "which is best?".to_string(),
            vec![],
            [
                (ProviderId::OpenAi, "gpt-4o".to_string()),
                (ProviderId::Gemini, "gemini-2.0-flash".to_string()),
            ],
        );
        let now = Utc::now();
        turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Error { message: "down".into() },
            now,
        )
        .unwrap();
        turn.settle_response(
            ProviderId::Gemini,
            ResponseState::Success { content: "answer".into() },
            now,
        )
        .unwrap();
        turn
    }

    #[test]
    fn best_answer_prefers_selection_then_first_success() {
        let mut turn = settled_turn();
        assert_eq!(best_answer(&turn), Some("answer".to_string()));

        turn.select(ProviderId::Gemini).unwrap();
        assert_eq!(best_answer(&turn), Some("answer".to_string()));
    }

    #[test]
    fn best_answer_is_none_when_everything_failed() {
        let mut turn = ConversationTurn::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "hi".to_string(),
            vec![],
            [(ProviderId::OpenAi, "gpt-4o".to_string())],
        );
        turn.settle_response(
            ProviderId::OpenAi,
            ResponseState::Error { message: "down".into() },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(best_answer(&turn), None);
    }
}
