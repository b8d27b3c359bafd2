//! AES-256-GCM sealing for persisted secret bundles.
//!
//! Each credential's secrets are serialized to one JSON blob and sealed with
//! a fresh random nonce. Ciphertext and nonce are base64-encoded for storage
//! as text columns.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Master key size in bytes (256 bits).
const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Cipher bound to one master key.
///
/// The key lives in memory only - it arrives base64-encoded from the
/// process environment and is never written to disk.
pub struct SecretCipher {
    key: Vec<u8>,
}

impl SecretCipher {
    /// Decodes and validates a base64-encoded 32-byte master key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_base64)
            .context("Failed to decode base64 master key")?;
        if key.len() != KEY_SIZE {
            return Err(anyhow!(
                "Master key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            ));
        }
        Ok(Self { key })
    }

    /// Encrypts a plaintext blob under a fresh random nonce.
    ///
    /// Returns `(ciphertext, nonce)`, both base64-encoded.
    pub fn seal(&self, plaintext: &str) -> Result<(String, String)> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;
        Ok((BASE64.encode(&ciphertext), BASE64.encode(nonce)))
    }

    /// Decrypts a sealed blob. Fails on a wrong key, wrong nonce, or any
    /// tampering (GCM is authenticated).
    pub fn open(&self, ciphertext: &str, nonce: &str) -> Result<String> {
        let ciphertext = BASE64
            .decode(ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce_bytes = BASE64.decode(nonce).context("Failed to decode nonce")?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;
        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }
}
