//! Process-wide master key used for provider credentials at rest.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE as BASE64};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{BitorError, Result};
use crate::ports::RecordStore;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Plaintext stored encrypted to detect a changed master key at startup.
pub const SENTINEL_PLAINTEXT: &str = "orbit";

#[derive(Clone)]
pub struct MasterKeyCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl fmt::Debug for MasterKeyCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyCipher").finish_non_exhaustive()
    }
}

impl MasterKeyCipher {
    /// Keys shorter than 32 bytes are zero padded, longer keys truncated.
    pub fn new(master_key: &str) -> Result<Self> {
        if master_key.is_empty() {
            return Err(BitorError::Crypto(
                "encryption key cannot be empty".to_string(),
            ));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        let bytes = master_key.as_bytes();
        let len = bytes.len().min(KEY_SIZE);
        key[..len].copy_from_slice(&bytes[..len]);
        Ok(Self { key })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()))
    }

    /// Seals `plaintext`; output is `nonce || ciphertext` in URL-safe base64.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|_| BitorError::Crypto("failed to encrypt".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
        let data = BASE64.decode(encoded.trim()).map_err(|err| {
            BitorError::Crypto(format!("failed to decode base64: {err}"))
        })?;
        if data.len() < NONCE_SIZE {
            return Err(BitorError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| BitorError::Crypto("failed to decrypt".to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }

    pub fn decrypt_string(&self, encoded: &str) -> Result<Zeroizing<String>> {
        let bytes = self.decrypt(encoded)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| {
            BitorError::Crypto("decrypted value is not UTF-8".to_string())
        })?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

/// Checks the master key against the stored sentinel, recording one on
/// first start.
pub async fn verify_master_key(
    cipher: &MasterKeyCipher,
    records: &dyn RecordStore,
) -> Result<()> {
    match records.encryption_sentinel().await? {
        None => {
            let sentinel = cipher.encrypt(SENTINEL_PLAINTEXT.as_bytes())?;
            records.store_encryption_sentinel(&sentinel).await?;
            tracing::info!("recorded master key sentinel");
            Ok(())
        }
        Some(stored) => {
            let plaintext = cipher.decrypt(&stored).map_err(|_| {
                BitorError::Crypto(
                    "master key does not match the stored sentinel".to_string(),
                )
            })?;
            if plaintext.as_slice() != SENTINEL_PLAINTEXT.as_bytes() {
                return Err(BitorError::Crypto(
                    "master key does not match the stored sentinel".to_string(),
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_values_open_with_the_same_key() {
        let cipher = MasterKeyCipher::new("short-key").unwrap();
        let sealed = cipher.encrypt(b"dop_v1_token").unwrap();
        assert_ne!(sealed, "dop_v1_token");
        assert_eq!(
            cipher.decrypt_string(&sealed).unwrap().as_str(),
            "dop_v1_token"
        );
    }

    #[test]
    fn a_different_key_cannot_open_values() {
        let sealed = MasterKeyCipher::new("key-one")
            .unwrap()
            .encrypt(b"secret")
            .unwrap();
        let other = MasterKeyCipher::new("key-two").unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(BitorError::Crypto(_))));
    }

    #[test]
    fn keys_are_padded_and_truncated_to_32_bytes() {
        let long = "a".repeat(40);
        let truncated = "a".repeat(32);
        let sealed = MasterKeyCipher::new(&long)
            .unwrap()
            .encrypt(b"value")
            .unwrap();
        let opened = MasterKeyCipher::new(&truncated)
            .unwrap()
            .decrypt(&sealed)
            .unwrap();
        assert_eq!(opened.as_slice(), b"value");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(MasterKeyCipher::new("").is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let cipher = MasterKeyCipher::new("key").unwrap();
        let short = BASE64.encode([0u8; 4]);
        assert!(cipher.decrypt(&short).is_err());
    }
}
