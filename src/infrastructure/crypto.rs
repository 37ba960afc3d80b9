use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid key length, expected 32 base64-encoded bytes")]
    InvalidKeyLength,
}

/// AES-256-GCM cipher for personal provider API keys stored at rest.
/// Ciphertext layout: 12-byte random nonce followed by the sealed bytes.
pub struct ApiKeyCipher {
    cipher: Aes256Gcm,
}

impl ApiKeyCipher {
    pub fn new(key_base64: &str) -> Result<Self, CipherError> {
        let key_bytes = BASE64
            .decode(key_base64)
            .map_err(|_| CipherError::InvalidKeyLength)?;

        if key_bytes.len() != 32 {
            return Err(CipherError::InvalidKeyLength);
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| CipherError::EncryptionFailed(e.to_string()))?;

        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(12 + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CipherError> {
        if ciphertext.len() < 12 {
            return Err(CipherError::DecryptionFailed("ciphertext too short".to_string()));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, sealed)
            .map_err(|e| CipherError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CipherError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXoxMjM0NTY=";

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = ApiKeyCipher::new(TEST_KEY).unwrap();
        let encrypted = cipher.encrypt("sk-test-provider-key").unwrap();
        assert_ne!(encrypted.as_slice(), b"sk-test-provider-key".as_slice());
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "sk-test-provider-key");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let cipher = ApiKeyCipher::new(TEST_KEY).unwrap();
        let a = cipher.encrypt("same-key").unwrap();
        let b = cipher.encrypt("same-key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_short_or_garbled_input() {
        let cipher = ApiKeyCipher::new(TEST_KEY).unwrap();
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
        assert!(ApiKeyCipher::new("dG9vLXNob3J0").is_err());
    }
}
