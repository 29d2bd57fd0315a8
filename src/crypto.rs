//! Credential encryption for mirror passwords at rest.
//!
//! Upstream Basic credentials are stored AES-256-GCM encrypted in the
//! mirrors table; the key is derived from the operator-supplied
//! `SECRET_KEY` passphrase. Ciphertext layout: nonce (12 bytes) ||
//! ciphertext+tag, base64-encoded at the storage boundary.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::{ProxyError, ProxyResult};

pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Derive a 256-bit key from an operator passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt a plaintext password into a base64 string.
    pub fn encrypt(&self, plaintext: &str) -> ProxyResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| ProxyError::crypto(format!("cipher init: {}", e)))?;

        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ProxyError::crypto(format!("encrypt: {}", e)))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(out))
    }

    /// Decrypt a base64 string produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> ProxyResult<String> {
        let data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ProxyError::crypto(format!("base64: {}", e)))?;
        if data.len() < 13 {
            return Err(ProxyError::crypto("ciphertext too short"));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| ProxyError::crypto(format!("cipher init: {}", e)))?;
        let nonce = Nonce::from_slice(&data[..12]);

        let plaintext = cipher
            .decrypt(nonce, &data[12..])
            .map_err(|_| ProxyError::crypto("decryption failed (wrong key or corrupted data)"))?;

        String::from_utf8(plaintext).map_err(|e| ProxyError::crypto(format!("utf8: {}", e)))
    }
}
