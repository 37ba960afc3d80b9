use crate::domain::ProviderId;
use crate::infrastructure::{
    ApiKeyCipher, AppConfig, CipherError, ProviderKeyRepository, RepositoryError,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key store error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("key encryption error: {0}")]
    Cipher(#[from] CipherError),
}

/// Resolves the API key used for a provider call: the user's personal key if
/// one is stored, else the platform's shared key, else `None` (the provider
/// is reported "not configured" for that turn).
pub struct ApiKeyResolver<K: ProviderKeyRepository> {
    keys: Arc<K>,
    cipher: Arc<ApiKeyCipher>,
    shared: HashMap<ProviderId, String>,
}

impl<K: ProviderKeyRepository> ApiKeyResolver<K> {
    pub fn new(keys: Arc<K>, cipher: Arc<ApiKeyCipher>, shared: HashMap<ProviderId, String>) -> Self {
        Self { keys, cipher, shared }
    }

    pub fn shared_keys_from_config(config: &AppConfig) -> HashMap<ProviderId, String> {
        let mut shared = HashMap::new();
        let entries = [
            (ProviderId::OpenAi, config.openai_api_key.clone()),
            (ProviderId::Gemini, config.gemini_api_key.clone()),
            (ProviderId::DeepSeek, config.deepseek_api_key.clone()),
            (ProviderId::OpenRouter, config.openrouter_api_key.clone()),
        ];
        for (provider, key) in entries {
            if let Some(key) = key.filter(|k| !k.is_empty()) {
                shared.insert(provider, key);
            }
        }
        shared
    }

    /// Personal key first, shared key second. A broken personal key (store
    /// error or undecryptable blob) degrades to the shared key rather than
    /// failing the whole provider call chain.
    pub async fn resolve(&self, user_id: Uuid, provider: ProviderId) -> Option<String> {
        match self.keys.get(user_id, provider).await {
            Ok(Some(encrypted)) => match self.cipher.decrypt(&encrypted) {
                Ok(key) => return Some(key),
                Err(e) => {
                    warn!(user_id = %user_id, provider = %provider, error = %e,
                        "Stored personal key failed to decrypt, falling back to shared key");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(user_id = %user_id, provider = %provider, error = %e,
                    "Personal key lookup failed, falling back to shared key");
            }
        }

        self.shared.get(&provider).cloned()
    }

    /// Encrypt and store a personal key, replacing any previous one.
    pub async fn store_personal_key(
        &self,
        user_id: Uuid,
        provider: ProviderId,
        plaintext_key: &str,
    ) -> Result<(), KeyError> {
        let encrypted = self.cipher.encrypt(plaintext_key)?;
        self.keys.upsert(user_id, provider, &encrypted).await?;
        Ok(())
    }

    pub async fn delete_personal_key(
        &self,
        user_id: Uuid,
        provider: ProviderId,
    ) -> Result<(), KeyError> {
        self.keys.delete(user_id, provider).await?;
        Ok(())
    }
}
