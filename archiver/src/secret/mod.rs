//! Secret store: encrypt/decrypt OAuth token payloads at rest, supporting
//! plaintext, direct-AEAD, and envelope-encrypted rows side by side during
//! key rotation.

pub mod kms;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::RngCore;

pub use self::kms::{EncryptionContext, Kms};
use crate::db::types::EncryptionVersion;

/// Errors the secret store can raise. All are treated as loud failures by
/// callers — none of them silently return an empty payload.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SecretError {
    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("no direct-AEAD key configured")]
    NoAeadKeyConfigured,

    #[error("no KMS adapter configured")]
    NoKmsConfigured,

    #[error("invalid ciphertext encoding: {0}")]
    Encoding(String),
}

const DEK_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Which scheme new writes should use. Resolved once at startup:
/// KMS takes precedence over a configured direct-AEAD key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WriteMode {
    DirectAead,
    Envelope,
}

/// Encrypts/decrypts OAuth token payloads, dispatching on the stored
/// [`EncryptionVersion`] so legacy rows keep reading correctly across a
/// rotation to a newer scheme.
#[derive(Debug)]
pub struct SecretStore {
    aead_key: Option<[u8; DEK_LEN]>,
    kms: Option<(Arc<dyn Kms>, String)>,
    write_mode: Option<WriteMode>,
    dek_cache: Mutex<HashMap<Vec<u8>, (Vec<u8>, Instant)>>,
    dek_cache_ttl: Duration,
}

impl SecretStore {
    /// Builds a store from configuration. `aead_key` is the 32-byte
    /// direct-AEAD key (version 1); `kms` is the optional KMS adapter plus
    /// key id (version 2, takes precedence for new writes when present).
    #[must_use]
    pub fn new(aead_key: Option<[u8; DEK_LEN]>, kms: Option<(Arc<dyn Kms>, String)>) -> Self {
        let write_mode = if kms.is_some() {
            Some(WriteMode::Envelope)
        } else if aead_key.is_some() {
            Some(WriteMode::DirectAead)
        } else {
            None
        };
        Self {
            aead_key,
            kms,
            write_mode,
            dek_cache: Mutex::new(HashMap::new()),
            dek_cache_ttl: Duration::from_secs(5 * 60),
        }
    }

    /// Overrides the DEK cache TTL (default 5 minutes). Exposed for tests.
    #[must_use]
    pub fn with_dek_cache_ttl(mut self, ttl: Duration) -> Self {
        self.dek_cache_ttl = ttl;
        self
    }

    /// Encrypts `plaintext` under whichever scheme is configured for new
    /// writes, returning `(ciphertext, encryption_version, key_id)` ready
    /// to persist on an `oauth_tokens` row.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NoAeadKeyConfigured`] or
    /// [`SecretError::NoKmsConfigured`] if neither scheme is usable.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        purpose: &str,
    ) -> Result<(String, EncryptionVersion, String), SecretError> {
        match self.write_mode {
            Some(WriteMode::Envelope) => {
                let (ciphertext, key_id) = self.encrypt_envelope(plaintext, purpose).await?;
                Ok((ciphertext, EncryptionVersion::Envelope, key_id))
            }
            Some(WriteMode::DirectAead) => {
                let ciphertext = self.encrypt_direct_aead(plaintext)?;
                Ok((ciphertext, EncryptionVersion::DirectAead, String::new()))
            }
            None => Err(SecretError::NoAeadKeyConfigured),
        }
    }

    /// Decrypts `ciphertext` stored at `version` under `key_id`, bound to
    /// `purpose`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Decrypt`] on a wrong key, tampered
    /// ciphertext, or mismatched context — never silently returns empty.
    pub async fn decrypt(
        &self,
        ciphertext: &str,
        version: EncryptionVersion,
        purpose: &str,
    ) -> Result<Vec<u8>, SecretError> {
        match version {
            EncryptionVersion::Plaintext => Ok(ciphertext.as_bytes().to_vec()),
            EncryptionVersion::DirectAead => self.decrypt_direct_aead(ciphertext),
            EncryptionVersion::Envelope => self.decrypt_envelope(ciphertext, purpose).await,
        }
    }

    fn encrypt_direct_aead(&self, plaintext: &[u8]) -> Result<String, SecretError> {
        let key = self.aead_key.ok_or(SecretError::NoAeadKeyConfigured)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretError::Decrypt(format!("bad AEAD key: {e}")))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretError::Decrypt(format!("encrypt failed: {e}")))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ct.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ct);
        Ok(BASE64.encode(blob))
    }

    fn decrypt_direct_aead(&self, ciphertext: &str) -> Result<Vec<u8>, SecretError> {
        let key = self.aead_key.ok_or(SecretError::NoAeadKeyConfigured)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretError::Decrypt(format!("bad AEAD key: {e}")))?;
        decrypt_with_cipher(&cipher, ciphertext)
    }

    async fn encrypt_envelope(
        &self,
        plaintext: &[u8],
        purpose: &str,
    ) -> Result<(String, String), SecretError> {
        let (kms, key_id) = self.kms.as_ref().ok_or(SecretError::NoKmsConfigured)?;
        let mut dek = [0_u8; DEK_LEN];
        OsRng.fill_bytes(&mut dek);

        let context = EncryptionContext::new(purpose);
        let encrypted_dek = kms.encrypt_dek(key_id, &dek, &context).await?;

        let cipher = Aes256Gcm::new_from_slice(&dek)
            .map_err(|e| SecretError::Decrypt(format!("bad DEK: {e}")))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretError::Decrypt(format!("encrypt failed: {e}")))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ct.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ct);

        self.cache_dek(&encrypted_dek, dek.to_vec());

        Ok((
            format!(
                "kms:v2:{}:{}",
                BASE64.encode(&encrypted_dek),
                BASE64.encode(&payload)
            ),
            key_id.clone(),
        ))
    }

    async fn decrypt_envelope(&self, ciphertext: &str, purpose: &str) -> Result<Vec<u8>, SecretError> {
        let mut parts = ciphertext.splitn(4, ':');
        let (scheme, version, enc_dek_b64, payload_b64) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        );
        if scheme != Some("kms") || version != Some("v2") {
            return Err(SecretError::Encoding(
                "envelope ciphertext missing kms:v2 prefix".into(),
            ));
        }
        let encrypted_dek = BASE64
            .decode(enc_dek_b64.unwrap_or_default())
            .map_err(|e| SecretError::Encoding(e.to_string()))?;
        let payload = BASE64
            .decode(payload_b64.unwrap_or_default())
            .map_err(|e| SecretError::Encoding(e.to_string()))?;

        let dek = if let Some(cached) = self.cached_dek(&encrypted_dek) {
            cached
        } else {
            let (kms, _key_id) = self.kms.as_ref().ok_or(SecretError::NoKmsConfigured)?;
            let context = EncryptionContext::new(purpose);
            let dek = kms.decrypt_dek(&encrypted_dek, &context).await?;
            self.cache_dek(&encrypted_dek, dek.clone());
            dek
        };

        let cipher = Aes256Gcm::new_from_slice(&dek)
            .map_err(|e| SecretError::Decrypt(format!("bad DEK: {e}")))?;
        decrypt_with_cipher(&cipher, &BASE64.encode(&payload))
    }

    fn cache_dek(&self, encrypted_dek: &[u8], dek: Vec<u8>) {
        let mut cache = self.dek_cache.lock();
        let _ = cache.insert(encrypted_dek.to_vec(), (dek, Instant::now()));
    }

    fn cached_dek(&self, encrypted_dek: &[u8]) -> Option<Vec<u8>> {
        let mut cache = self.dek_cache.lock();
        match cache.get(encrypted_dek) {
            Some((dek, cached_at)) if cached_at.elapsed() < self.dek_cache_ttl => {
                Some(dek.clone())
            }
            Some(_) => {
                let _ = cache.remove(encrypted_dek);
                None
            }
            None => None,
        }
    }
}

fn decrypt_with_cipher(cipher: &Aes256Gcm, ciphertext_b64: &str) -> Result<Vec<u8>, SecretError> {
    let blob = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| SecretError::Encoding(e.to_string()))?;
    if blob.len() < NONCE_LEN {
        return Err(SecretError::Encoding("ciphertext too short".into()));
    }
    let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ct)
        .map_err(|e| SecretError::Decrypt(format!("authentication failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; DEK_LEN] {
        [7_u8; DEK_LEN]
    }

    #[tokio::test]
    async fn direct_aead_round_trips() {
        let store = SecretStore::new(Some(test_key()), None);
        let (ct, version, _key_id) = store.encrypt(b"hello world", "oauth").await.unwrap();
        assert_eq!(version, EncryptionVersion::DirectAead);
        let pt = store.decrypt(&ct, version, "oauth").await.unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[tokio::test]
    async fn direct_aead_fails_loudly_on_wrong_key() {
        let store = SecretStore::new(Some(test_key()), None);
        let (ct, version, _) = store.encrypt(b"secret", "oauth").await.unwrap();

        let other = SecretStore::new(Some([9_u8; DEK_LEN]), None);
        let result = other.decrypt(&ct, version, "oauth").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn plaintext_round_trips_identity() {
        let store = SecretStore::new(None, None);
        let pt = store
            .decrypt("raw-legacy-value", EncryptionVersion::Plaintext, "oauth")
            .await
            .unwrap();
        assert_eq!(pt, b"raw-legacy-value");
    }

    #[tokio::test]
    async fn encrypting_without_any_scheme_configured_errors() {
        let store = SecretStore::new(None, None);
        let result = store.encrypt(b"x", "oauth").await;
        assert!(matches!(result, Err(SecretError::NoAeadKeyConfigured)));
    }

    #[derive(Debug, Default)]
    struct FakeKms {
        keys: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Kms for FakeKms {
        async fn encrypt_dek(
            &self,
            _key_id: &str,
            plaintext_dek: &[u8],
            _context: &EncryptionContext,
        ) -> Result<Vec<u8>, SecretError> {
            let wrapped = [b"wrapped:".as_slice(), plaintext_dek].concat();
            let _ = self
                .keys
                .lock()
                .insert(wrapped.clone(), plaintext_dek.to_vec());
            Ok(wrapped)
        }

        async fn decrypt_dek(
            &self,
            ciphertext: &[u8],
            _context: &EncryptionContext,
        ) -> Result<Vec<u8>, SecretError> {
            self.keys
                .lock()
                .get(ciphertext)
                .cloned()
                .ok_or_else(|| SecretError::Decrypt("unknown DEK ciphertext".into()))
        }
    }

    #[tokio::test]
    async fn envelope_round_trips_and_caches_dek() {
        let kms: Arc<dyn Kms> = Arc::new(FakeKms::default());
        let store = SecretStore::new(None, Some((kms, "key-1".into())));
        let (ct, version, key_id) = store.encrypt(b"access-token", "oauth").await.unwrap();
        assert_eq!(version, EncryptionVersion::Envelope);
        assert_eq!(key_id, "key-1");

        let pt = store.decrypt(&ct, version, "oauth").await.unwrap();
        assert_eq!(pt, b"access-token");

        // Second decrypt should hit the DEK cache rather than call the KMS
        // again; correctness is observable regardless, but exercising the
        // path twice guards against a cache bug silently returning stale
        // bytes.
        let pt2 = store.decrypt(&ct, version, "oauth").await.unwrap();
        assert_eq!(pt2, b"access-token");
    }
}
