use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub encryption_key: String,
    pub server_host: String,
    pub server_port: u16,

    /// Per-provider call deadline, seconds.
    pub provider_timeout_secs: u64,

    // Shared (platform) provider keys; a provider with neither a personal
    // nor a shared key is reported "not configured" for that turn.
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,

    // OpenAI-compatible endpoint roots, overridable for staging/tests.
    pub openai_base_url: String,
    pub gemini_base_url: String,
    pub deepseek_base_url: String,
    pub openrouter_base_url: String,

    // Model used when a request does not name one.
    pub openai_default_model: String,
    pub gemini_default_model: String,
    pub deepseek_default_model: String,
    pub openrouter_default_model: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("CHORUS"))
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 8080)?
            .set_default("provider_timeout_secs", 45)?
            .set_default("openai_base_url", "https://api.openai.com/v1")?
            .set_default(
                "gemini_base_url",
                "https://generativelanguage.googleapis.com/v1beta/openai",
            )?
            .set_default("deepseek_base_url", "https://api.deepseek.com/v1")?
            .set_default("openrouter_base_url", "https://openrouter.ai/api/v1")?
            .set_default("openai_default_model", "gpt-4o")?
            .set_default("gemini_default_model", "gemini-2.0-flash")?
            .set_default("deepseek_default_model", "deepseek-chat")?
            .set_default("openrouter_default_model", "meta-llama/llama-3.1-70b-instruct")?
            .build()?;

        config.try_deserialize()
    }
}
