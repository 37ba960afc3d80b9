use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The chat providers a prompt can be fanned out to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Gemini,
    DeepSeek,
    OpenRouter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message of prior conversation context sent along with a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// How a provider call ended, for the statistics ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Success,
    Error,
}

/// Rolling per-provider tallies. Selection counts are cumulative historical
/// tallies, never decremented when a user changes their pick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatistic {
    pub provider: ProviderId,
    pub total_responses: i64,
    pub total_selections: i64,
    pub error_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ProviderStatistic {
    pub fn empty(provider: ProviderId) -> Self {
        Self {
            provider,
            total_responses: 0,
            total_selections: 0,
            error_count: 0,
            last_used_at: None,
        }
    }

    pub fn selection_rate(&self) -> f64 {
        if self.total_responses == 0 {
            0.0
        } else {
            self.total_selections as f64 / self.total_responses as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_responses == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_responses as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn provider_id_text_round_trip() {
        assert_eq!(ProviderId::OpenAi.to_string(), "openai");
        assert_eq!(ProviderId::DeepSeek.to_string(), "deepseek");
        assert_eq!(ProviderId::from_str("openrouter").unwrap(), ProviderId::OpenRouter);
        assert!(ProviderId::from_str("tavus").is_err());
    }

    #[test]
    fn rates_are_zero_on_empty_stats() {
        let stats = ProviderStatistic::empty(ProviderId::Gemini);
        assert_eq!(stats.selection_rate(), 0.0);
        assert_eq!(stats.error_rate(), 0.0);
    }

    #[test]
    fn rates_derive_from_tallies() {
        let stats = ProviderStatistic {
            provider: ProviderId::OpenAi,
            total_responses: 8,
            total_selections: 2,
            error_count: 4,
            last_used_at: None,
        };
        assert_eq!(stats.selection_rate(), 0.25);
        assert_eq!(stats.error_rate(), 0.5);
    }
}
