use crate::domain::{ChatMessage, ProviderId};
use crate::infrastructure::AppConfig;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("provider is not configured: no API key available")]
    NotConfigured,
    #[error("provider call timed out")]
    Timeout,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("provider returned {status}: {message}")]
    Vendor { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Message shown inline on the errored response card.
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::NotConfigured => {
                "This provider is not configured. Add an API key to enable it.".to_string()
            }
            ProviderError::Timeout => "The provider did not respond in time.".to_string(),
            ProviderError::Vendor { message, .. } => message.clone(),
            ProviderError::RequestFailed(_) | ProviderError::InvalidResponse(_) => {
                "The provider request failed. Please try again.".to_string()
            }
        }
    }
}

/// What a provider call needs, normalized across vendors.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub history: &'a [ChatMessage],
    pub prompt: &'a str,
    pub image_urls: &'a [String],
}

/// Normalized boundary to one AI vendor: prompt + history + key in, text (or
/// generated-media URL) or a typed failure out. No retries here — a failed
/// call is terminal for the turn.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> ProviderId;
    fn default_model(&self) -> &str;
    async fn complete(
        &self,
        api_key: &str,
        request: CompletionRequest<'_>,
    ) -> Result<String, ProviderError>;
}

// OpenAI-style chat completions wire types. Gemini, DeepSeek, and OpenRouter
// all expose this shape on their compatibility endpoints.
#[derive(Serialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<WireMessage>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct VendorErrorBody {
    error: Option<VendorErrorDetail>,
}

#[derive(Deserialize)]
struct VendorErrorDetail {
    message: Option<String>,
}

/// HTTP client for one OpenAI-compatible chat completions endpoint. The API
/// key is supplied per call because it resolves per user.
pub struct ChatCompletionsClient {
    id: ProviderId,
    client: Client,
    base_url: String,
    default_model: String,
}

impl ChatCompletionsClient {
    pub fn new(
        id: ProviderId,
        base_url: String,
        default_model: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProviderError::RequestFailed(format!("HTTP client init: {}", e)))?;

        Ok(Self {
            id,
            client,
            base_url,
            default_model,
        })
    }

    fn build_messages(&self, request: &CompletionRequest<'_>) -> Vec<WireMessage> {
        let mut messages: Vec<WireMessage> = request
            .history
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    crate::domain::ChatRole::User => "user",
                    crate::domain::ChatRole::Assistant => "assistant",
                },
                content: WireContent::Text(m.content.clone()),
            })
            .collect();

        let content = if request.image_urls.is_empty() {
            WireContent::Text(request.prompt.to_string())
        } else {
            let mut parts = vec![WirePart::Text {
                text: request.prompt.to_string(),
            }];
            parts.extend(request.image_urls.iter().map(|url| WirePart::ImageUrl {
                image_url: WireImageUrl { url: url.clone() },
            }));
            WireContent::Parts(parts)
        };

        messages.push(WireMessage {
            role: "user",
            content,
        });
        messages
    }
}

#[async_trait]
impl ProviderClient for ChatCompletionsClient {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(
        &self,
        api_key: &str,
        request: CompletionRequest<'_>,
    ) -> Result<String, ProviderError> {
        let body = ChatCompletionBody {
            model: request.model.to_string(),
            messages: self.build_messages(&request),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = extract_vendor_message(status, &response.text().await.unwrap_or_default());
            return Err(ProviderError::Vendor {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("empty completion".to_string()))
    }
}

fn extract_vendor_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<VendorErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| format!("request rejected with status {}", status.as_u16()))
}

/// All configured provider clients, keyed by id.
pub struct ProviderRegistry {
    clients: HashMap<ProviderId, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.provider_timeout_secs);
        let mut clients: HashMap<ProviderId, Arc<dyn ProviderClient>> = HashMap::new();

        let endpoints = [
            (
                ProviderId::OpenAi,
                config.openai_base_url.clone(),
                config.openai_default_model.clone(),
            ),
            (
                ProviderId::Gemini,
                config.gemini_base_url.clone(),
                config.gemini_default_model.clone(),
            ),
            (
                ProviderId::DeepSeek,
                config.deepseek_base_url.clone(),
                config.deepseek_default_model.clone(),
            ),
            (
                ProviderId::OpenRouter,
                config.openrouter_base_url.clone(),
                config.openrouter_default_model.clone(),
            ),
        ];

        for (id, base_url, default_model) in endpoints {
            clients.insert(
                id,
                Arc::new(ChatCompletionsClient::new(id, base_url, default_model, timeout)?),
            );
        }

        Ok(Self { clients })
    }

    /// Test/injection constructor.
    pub fn from_clients(clients: Vec<Arc<dyn ProviderClient>>) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.id(), c)).collect(),
        }
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.clients.keys().copied().collect()
    }
}
